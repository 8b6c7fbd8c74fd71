// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A reference `Transport` talking to a TPM command simulator over a plain
//! TCP socket. Grounded in `tcti-socket.c`'s `address`/`port`-addressed
//! `TctiSocket`, simplified to the one data socket the broker's `Transport`
//! trait describes (the original also opens a second "platform" socket for
//! power-cycle commands, which is out of scope here).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tabrmd_protocol::HEADER_SIZE;
use tracing::instrument;

use crate::transport::{validate_received_len, Transport, TransportRc, TransportState};

pub struct TcpTransport {
    stream: TcpStream,
    state: TransportState,
}

impl TcpTransport {
    /// Connect to a simulator listening on `address` (`host:port`).
    #[instrument]
    pub fn connect(address: &str) -> Result<TcpTransport, TransportRc> {
        let stream = TcpStream::connect(address).map_err(|_| TransportRc::Io)?;
        stream.set_nodelay(true).map_err(|_| TransportRc::Io)?;
        Ok(TcpTransport { stream, state: TransportState::Ready })
    }
}

impl Transport for TcpTransport {
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TransportRc> {
        if self.state == TransportState::Sent {
            return Err(TransportRc::BadSequence);
        }
        self.stream.write_all(buf).map_err(|_| TransportRc::Io)?;
        self.state = TransportState::Sent;
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, TransportRc> {
        if self.state != TransportState::Sent {
            return Err(TransportRc::BadSequence);
        }
        self.stream.set_read_timeout(timeout).map_err(|_| TransportRc::Io)?;

        let mut header_buf = [0u8; HEADER_SIZE];
        self.stream.read_exact(&mut header_buf).map_err(|e| to_rc(&e))?;
        let declared_size = u32::from_be_bytes([header_buf[2], header_buf[3], header_buf[4], header_buf[5]]);
        if (declared_size as usize) < HEADER_SIZE {
            return Err(TransportRc::Io);
        }

        let mut buf = header_buf.to_vec();
        buf.resize(declared_size as usize, 0);
        self.stream.read_exact(&mut buf[HEADER_SIZE..]).map_err(|e| to_rc(&e))?;
        validate_received_len(declared_size, buf.len())?;

        self.state = TransportState::Ready;
        Ok(buf)
    }

    fn set_locality(&mut self, _locality: u8) -> Result<(), TransportRc> {
        // The simulator wire protocol this reference transport speaks has
        // no locality-setting command distinct from the command stream
        // itself; real platform TCTIs multiplex this over a second socket.
        Err(TransportRc::NotImplemented)
    }
}

fn to_rc(e: &std::io::Error) -> TransportRc {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => TransportRc::Timeout,
        _ => TransportRc::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    use tabrmd_protocol::Header;

    #[test]
    fn receive_reads_exactly_the_declared_length() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut req = [0u8; HEADER_SIZE];
            sock.read_exact(&mut req).unwrap();

            let mut resp = vec![0u8; HEADER_SIZE + 4];
            Header { tag: 0x8001, size: resp.len() as u32, code: 0 }.write_to(&mut resp);
            sock.write_all(&resp).unwrap();
        });

        let mut transport = TcpTransport::connect(&addr.to_string()).unwrap();
        let cmd = {
            let mut buf = vec![0u8; HEADER_SIZE];
            Header { tag: 0x8001, size: HEADER_SIZE as u32, code: 0x144 }.write_to(&mut buf);
            buf
        };
        transport.transmit(&cmd).unwrap();
        let resp = transport.receive(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(resp.len(), HEADER_SIZE + 4);

        server.join().unwrap();
    }

    #[test]
    fn transmit_while_sent_is_bad_sequence() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let _ = listener.accept().unwrap();
        });
        let mut transport = TcpTransport::connect(&addr.to_string()).unwrap();
        transport.transmit(&[0u8; HEADER_SIZE]).unwrap();
        assert_eq!(transport.transmit(&[0u8; HEADER_SIZE]), Err(TransportRc::BadSequence));
        server.join().unwrap();
    }
}
