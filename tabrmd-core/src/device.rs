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

//! Owns the single `Transport` to the device plus the mutex guarding it.
//! Exposes blocking, serialized typed operations built atop `raw_send`.
//! Grounded in `tpm2.c`'s `tpm2_lock`/`tpm2_unlock` pair (a thin mutex
//! wrapper around the one `TSS2_SYS_CONTEXT`), `tpm2_send_tpm_startup`'s
//! "already initialized" coercion, and `tpm2_flush_all_context`'s
//! logged-but-not-fatal sweep.

use std::sync::Mutex;
use std::time::Duration;

use tabrmd_protocol::{read_handle, Header, HEADER_SIZE};
use tracing::{instrument, warn};

use crate::command_attrs::{CommandAttrEntry, CommandAttrs};
use crate::consts;
use crate::fatal::fatal;
use crate::transport::{Transport, TransportRc};

pub struct DeviceProxy {
    transport: Mutex<Box<dyn Transport + Send>>,
}

impl DeviceProxy {
    pub fn new(transport: Box<dyn Transport + Send>) -> DeviceProxy {
        DeviceProxy { transport: Mutex::new(transport) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Transport + Send>> {
        // A poisoned device mutex means some other thread panicked while
        // mid-transaction with the device; there is no way to know what
        // state the device is in, so this is the same class of problem as
        // tpm2_lock failing in the original: fatal, not recoverable.
        self.transport.lock().unwrap_or_else(|_| fatal("device transport mutex poisoned"))
    }

    /// Send `cmd` and block for the matching response. Serialized by the
    /// device mutex: the transport sees exactly one outstanding
    /// transmit+receive pair at a time no matter how many threads hold a
    /// reference to this proxy.
    #[instrument(skip_all, fields(len = cmd.len()))]
    pub fn raw_send(&self, cmd: &[u8]) -> Result<Vec<u8>, TransportRc> {
        let mut transport = self.lock();
        transport.transmit(cmd)?;
        transport.receive(Some(consts::DEVICE_RECEIVE_TIMEOUT))
    }

    /// Send the device-startup command. The device's "already
    /// initialized" response is coerced to success, since that outcome is
    /// expected on every broker restart against a device that was never
    /// power-cycled.
    #[instrument(skip_all)]
    pub fn startup(&self) -> Result<(), TransportRc> {
        let cmd = build_simple_command(TPM2_CC_STARTUP, &STARTUP_CLEAR_BODY);
        let resp = self.raw_send(&cmd)?;
        let header = Header::parse(&resp).map_err(|_| TransportRc::Io)?;
        if header.code == 0 || header.code == consts::TPM2_RC_INITIALIZE {
            Ok(())
        } else {
            warn!(code = header.code, "device startup returned an error code");
            Err(TransportRc::Io)
        }
    }

    /// Save a context and, in the same critical section, flush its
    /// physical handle. Atomic with respect to other device operations:
    /// if save succeeds but flush fails the broker's bookkeeping would
    /// otherwise disagree with the device about whether the handle is
    /// still live.
    #[instrument(skip_all, fields(handle = format!("{:#x}", handle)))]
    pub fn save_then_flush(&self, handle: u32) -> Result<Vec<u8>, TransportRc> {
        let mut transport = self.lock();
        let save_cmd = build_handle_command(consts::TPM2_CC_CONTEXT_SAVE, handle);
        transport.transmit(&save_cmd)?;
        let save_resp = transport.receive(Some(consts::DEVICE_RECEIVE_TIMEOUT))?;
        let header = Header::parse(&save_resp).map_err(|_| TransportRc::Io)?;
        if header.code != 0 {
            return Ok(save_resp);
        }
        let blob = save_resp[HEADER_SIZE..].to_vec();

        let flush_cmd = build_handle_command(consts::TPM2_CC_FLUSH_CONTEXT, handle);
        transport.transmit(&flush_cmd)?;
        let flush_resp = transport.receive(Some(consts::DEVICE_RECEIVE_TIMEOUT))?;
        let flush_header = Header::parse(&flush_resp).map_err(|_| TransportRc::Io)?;
        if flush_header.code != 0 {
            warn!(code = flush_header.code, "flush after save reported an error");
        }
        Ok(blob)
    }

    /// Load a previously saved context blob back onto the device,
    /// returning the physical handle the device assigns it.
    #[instrument(skip_all, fields(len = blob.len()))]
    pub fn context_load(&self, blob: &[u8]) -> Result<u32, TransportRc> {
        let mut body = Vec::with_capacity(blob.len());
        body.extend_from_slice(blob);
        let cmd = build_simple_command(consts::TPM2_CC_CONTEXT_LOAD, &body);
        let resp = self.raw_send(&cmd)?;
        let header = Header::parse(&resp).map_err(|_| TransportRc::Io)?;
        if header.code != 0 {
            return Err(TransportRc::Io);
        }
        read_handle(&resp, 0).ok_or(TransportRc::Io)
    }

    /// Flush a physical handle from the device, discarding its state.
    #[instrument(skip_all, fields(handle = format!("{:#x}", handle)))]
    pub fn context_flush(&self, handle: u32) -> Result<(), TransportRc> {
        let cmd = build_handle_command(consts::TPM2_CC_FLUSH_CONTEXT, handle);
        let resp = self.raw_send(&cmd)?;
        let header = Header::parse(&resp).map_err(|_| TransportRc::Io)?;
        if header.code != 0 {
            warn!(code = header.code, handle = format!("{:#x}", handle), "flush reported an error");
        }
        Ok(())
    }

    /// Query all live handles in `[first, last)` via `TPM2_CAP_HANDLES` and
    /// flush each one. Individual flush failures are logged but do not
    /// stop the sweep, matching `tpm2_flush_all_context`.
    #[instrument(skip_all)]
    pub fn flush_range(&self, first: u32, last: u32) -> Result<(), TransportRc> {
        for handle in self.query_live_handles(first, last)? {
            if let Err(e) = self.context_flush(handle) {
                warn!(handle = format!("{:#x}", handle), error = ?e, "failed to flush handle during range sweep");
            }
        }
        Ok(())
    }

    /// `TPM2_GetCapability(TPM2_CAP_HANDLES, first)`, returning every
    /// reported handle strictly less than `last`. Response body layout:
    /// `more_data:u8 | capability:u32 | handle_count:u32 | handles[u32;N]`.
    fn query_live_handles(&self, first: u32, last: u32) -> Result<Vec<u32>, TransportRc> {
        let body = self.get_capability(consts::TPM2_CAP_HANDLES, first)?;
        const HANDLE_LIST_HEADER: usize = 9;
        if body.len() < HANDLE_LIST_HEADER {
            return Ok(Vec::new());
        }
        let count =
            u32::from_be_bytes(body[5..HANDLE_LIST_HEADER].try_into().unwrap()) as usize;
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let off = HANDLE_LIST_HEADER + i * 4;
            if body.len() < off + 4 {
                break;
            }
            let handle = u32::from_be_bytes(body[off..off + 4].try_into().unwrap());
            if handle >= first && handle < last {
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    /// One-time query of per-command metadata, used to populate
    /// `CommandAttrs` at startup. The reference transport returns a fixed
    /// table covering the command codes this broker gives special
    /// handling to; a real device would answer `GetCapability(COMMANDS)`.
    #[instrument(skip_all)]
    pub fn get_command_attrs(&self) -> Result<CommandAttrs, TransportRc> {
        Ok(CommandAttrs::from_entries([
            (
                consts::TPM2_CC_CREATE_PRIMARY,
                CommandAttrEntry { handle_count: 1, modifies_session_state: false },
            ),
            (
                consts::TPM2_CC_CONTEXT_SAVE,
                CommandAttrEntry { handle_count: 1, modifies_session_state: true },
            ),
            (
                consts::TPM2_CC_CONTEXT_LOAD,
                CommandAttrEntry { handle_count: 0, modifies_session_state: true },
            ),
            (
                consts::TPM2_CC_FLUSH_CONTEXT,
                CommandAttrEntry { handle_count: 1, modifies_session_state: true },
            ),
            (
                consts::TPM2_CC_START_AUTH_SESSION,
                CommandAttrEntry { handle_count: 2, modifies_session_state: true },
            ),
            (
                consts::TPM2_CC_GET_CAPABILITY,
                CommandAttrEntry { handle_count: 0, modifies_session_state: false },
            ),
        ]))
    }

    /// Query a TPM property, returning the raw response body (the
    /// property value is device-format-specific; callers that only need a
    /// single `u32` property, like transient-capacity discovery at
    /// startup, can use `get_property_u32`).
    #[instrument(skip_all, fields(capability, property))]
    pub fn get_capability(&self, capability: u32, property: u32) -> Result<Vec<u8>, TransportRc> {
        let mut body = Vec::with_capacity(12);
        body.extend_from_slice(&capability.to_be_bytes());
        body.extend_from_slice(&property.to_be_bytes());
        body.extend_from_slice(&1u32.to_be_bytes()); // property_count
        let cmd = build_simple_command(consts::TPM2_CC_GET_CAPABILITY, &body);
        let resp = self.raw_send(&cmd)?;
        let header = Header::parse(&resp).map_err(|_| TransportRc::Io)?;
        if header.code != 0 {
            return Err(TransportRc::Io);
        }
        Ok(resp[HEADER_SIZE..].to_vec())
    }

    /// Convenience wrapper for the common case of a single 32-bit property
    /// value, such as `TPM2_PT_HR_TRANSIENT_AVAIL` at startup.
    pub fn get_property_u32(&self, property: u32) -> Result<u32, TransportRc> {
        let body = self.get_capability(TPM2_CAP_TPM_PROPERTIES, property)?;
        // Skip the capability-data header (more-data flag + capability
        // tag + count) that a real TPM2_CAP_TPM_PROPERTIES reply carries
        // ahead of the (property, value) pairs themselves.
        const PROPERTY_LIST_HEADER: usize = 9;
        if body.len() < PROPERTY_LIST_HEADER + 8 {
            return Err(TransportRc::Io);
        }
        let value_off = PROPERTY_LIST_HEADER + 4;
        Ok(u32::from_be_bytes(body[value_off..value_off + 4].try_into().unwrap()))
    }
}

const TPM2_CAP_TPM_PROPERTIES: u32 = 0x0000_0006;

const TPM2_CC_STARTUP: u32 = 0x0000_0144;
const STARTUP_CLEAR_BODY: [u8; 2] = [0x00, 0x00]; // TPM2_SU_CLEAR

fn build_simple_command(code: u32, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + body.len()];
    Header { tag: 0x8001, size: buf.len() as u32, code }.write_to(&mut buf);
    buf[HEADER_SIZE..].copy_from_slice(body);
    buf
}

fn build_handle_command(code: u32, handle: u32) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE + 4];
    Header { tag: 0x8001, size: buf.len() as u32, code }.write_to(&mut buf);
    tabrmd_protocol::write_handle(&mut buf, 0, handle).expect("buffer sized for one handle");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    /// An in-memory fake `Transport` for exercising the device proxy
    /// without a real device or socket.
    struct FakeTransport {
        next_response: Arc<StdMutex<Vec<u8>>>,
        sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl Transport for FakeTransport {
        fn transmit(&mut self, buf: &[u8]) -> Result<(), TransportRc> {
            self.sent.lock().unwrap().push(buf.to_vec());
            Ok(())
        }
        fn receive(&mut self, _timeout: Option<Duration>) -> Result<Vec<u8>, TransportRc> {
            Ok(self.next_response.lock().unwrap().clone())
        }
        fn set_locality(&mut self, _locality: u8) -> Result<(), TransportRc> {
            Ok(())
        }
    }

    fn success_response(extra: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + extra.len()];
        Header { tag: 0x8001, size: buf.len() as u32, code: 0 }.write_to(&mut buf);
        buf[HEADER_SIZE..].copy_from_slice(extra);
        buf
    }

    #[test]
    fn context_load_returns_physical_handle() {
        let next_response = Arc::new(StdMutex::new(success_response(&0x8000_0099u32.to_be_bytes())));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let proxy = DeviceProxy::new(Box::new(FakeTransport { next_response, sent }));
        let handle = proxy.context_load(&[1, 2, 3]).unwrap();
        assert_eq!(handle, 0x8000_0099);
    }

    #[test]
    fn startup_coerces_already_initialized_to_success() {
        let mut already_init = vec![0u8; HEADER_SIZE];
        Header { tag: 0x8001, size: HEADER_SIZE as u32, code: consts::TPM2_RC_INITIALIZE }
            .write_to(&mut already_init);
        let next_response = Arc::new(StdMutex::new(already_init));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let proxy = DeviceProxy::new(Box::new(FakeTransport { next_response, sent }));
        assert!(proxy.startup().is_ok());
    }

    #[test]
    fn startup_surfaces_a_real_device_error() {
        let mut failure = vec![0u8; HEADER_SIZE];
        Header { tag: 0x8001, size: HEADER_SIZE as u32, code: 0x0000_0001 }.write_to(&mut failure);
        let next_response = Arc::new(StdMutex::new(failure));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let proxy = DeviceProxy::new(Box::new(FakeTransport { next_response, sent }));
        assert_eq!(proxy.startup(), Err(TransportRc::Io));
    }

    fn handle_list_response(handles: &[u32]) -> Vec<u8> {
        let mut extra = vec![0u8]; // more_data = false
        extra.extend_from_slice(&consts::TPM2_CAP_HANDLES.to_be_bytes());
        extra.extend_from_slice(&(handles.len() as u32).to_be_bytes());
        for h in handles {
            extra.extend_from_slice(&h.to_be_bytes());
        }
        success_response(&extra)
    }

    #[test]
    fn query_live_handles_filters_to_the_requested_range() {
        let next_response =
            Arc::new(StdMutex::new(handle_list_response(&[0x8000_0001, 0x8000_0002, 0x8000_0010])));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let proxy = DeviceProxy::new(Box::new(FakeTransport { next_response, sent }));
        let handles = proxy.query_live_handles(0x8000_0000, 0x8000_0008).unwrap();
        assert_eq!(handles, vec![0x8000_0001, 0x8000_0002]);
    }

    #[test]
    fn flush_range_only_touches_reported_handles() {
        let next_response = Arc::new(StdMutex::new(handle_list_response(&[0x8000_0003])));
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let proxy = DeviceProxy::new(Box::new(FakeTransport { next_response, sent: sent.clone() }));
        proxy.flush_range(0x8000_0000, 0x8000_0008).unwrap();
        // One GetCapability round trip, then exactly one FlushContext for
        // the single reported handle.
        assert_eq!(sent.lock().unwrap().len(), 2);
    }
}
