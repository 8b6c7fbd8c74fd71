// A TCP-listening stand-in for a real TPM simulator, used to drive the
// daemon's full wiring (`Server::new` + `reference_io`) end to end over the
// actual `TcpTransport`, rather than through the in-process `ScriptedTransport`
// the resource-manager-level tests use.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

use tabrmd_protocol::HEADER_SIZE;

/// Accept exactly one connection on an ephemeral port and answer each
/// incoming framed command with the next entry in `responses`, in order.
/// Returns the address to connect to and a join handle for the server
/// thread.
pub fn spawn(responses: Vec<Vec<u8>>) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding fake simulator socket");
    let addr = listener.local_addr().unwrap().to_string();

    let handle = thread::spawn(move || {
        let (mut stream, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(_) => return,
        };
        for resp in responses {
            if read_one_request(&mut stream).is_none() {
                return;
            }
            if stream.write_all(&resp).is_err() {
                return;
            }
        }
    });

    (addr, handle)
}

fn read_one_request(stream: &mut TcpStream) -> Option<()> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).ok()?;
    let declared_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    let mut rest = vec![0u8; (declared_size as usize).saturating_sub(HEADER_SIZE)];
    stream.read_exact(&mut rest).ok()?;
    Some(())
}
