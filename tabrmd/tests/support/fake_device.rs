// A scripted device transport for driving `libtabrmd`'s broker end to end
// without a real TPM or TPM simulator. Responses are queued up front in
// the order the test expects the resource manager to send commands.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use libtabrmd::transport::{Transport, TransportRc};
use tabrmd_protocol::{Header, HANDLE_SIZE, HEADER_SIZE};

pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Vec<u8>>>,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Vec<u8>>) -> ScriptedTransport {
        ScriptedTransport { responses: Mutex::new(responses.into_iter().collect()), sent: Mutex::new(Vec::new()) }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn transmit(&mut self, buf: &[u8]) -> Result<(), TransportRc> {
        self.sent.lock().unwrap().push(buf.to_vec());
        Ok(())
    }

    fn receive(&mut self, _timeout: Option<Duration>) -> Result<Vec<u8>, TransportRc> {
        self.responses.lock().unwrap().pop_front().ok_or(TransportRc::Io)
    }

    fn set_locality(&mut self, _locality: u8) -> Result<(), TransportRc> {
        Ok(())
    }
}

pub fn success_response(tag: u16, extra: &[u8]) -> Vec<u8> {
    response(tag, 0, extra)
}

pub fn error_response(tag: u16, code: u32) -> Vec<u8> {
    response(tag, code, &[])
}

pub fn response(tag: u16, code: u32, extra: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + extra.len()];
    Header { tag, size: buf.len() as u32, code }.write_to(&mut buf);
    buf[HEADER_SIZE..].copy_from_slice(extra);
    buf
}

pub fn command_with_handles(tag: u16, code: u32, handles: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + handles.len() * HANDLE_SIZE];
    Header { tag, size: buf.len() as u32, code }.write_to(&mut buf);
    for (i, h) in handles.iter().enumerate() {
        tabrmd_protocol::write_handle(&mut buf, i, *h).unwrap();
    }
    buf
}
