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

//! The heart of the broker: a single serial worker that dequeues
//! commands, performs virtual↔physical handle substitution, loads and
//! evicts device contexts under the global device budget, calls the
//! device proxy, and hands the resulting response to the sink. Grounded
//! in `tpm2.c`'s command-processing shape and in
//! `session-entry-state-enum.h` for the session lifecycle this drives.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tabrmd_protocol::{BrokerError, Header, HandleFamily, ResponseCode, TransportError};
use tracing::{error, info, instrument, warn};

use crate::command::{Command, Response, ResponseItem, WorkItem};
use crate::command_attrs::CommandAttrs;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::consts;
use crate::device::DeviceProxy;
use crate::fatal::fatal;
use crate::handle::{EntryKind, HandleMapEntry, SessionState};
use crate::session_registry::SessionRegistry;
use crate::transport::TransportRc;

/// One thing `evict_one` could choose to evict: a transient object owned
/// by a particular connection, or a session sitting in the process-wide
/// registry. Both are backed by the same physical handle and the same
/// `save_then_flush` call; only where the resulting blob gets written back
/// differs.
enum EvictionCandidate {
    Transient { conn: Arc<Connection>, virtual_handle: u32, physical: u32 },
    Session { handle: u32, physical: u32 },
}

pub struct ResourceManager {
    device: Arc<DeviceProxy>,
    attrs: CommandAttrs,
    connections: Arc<ConnectionManager>,
    sessions: Arc<SessionRegistry>,
    device_transient_capacity: usize,
    active_slots: AtomicUsize,
    /// See `Config::fail_on_loaded_transients`: whether a connection that
    /// closes with a transient object still resident (rather than saved or
    /// already evicted) is logged as a client error.
    fail_on_loaded_transients: bool,
}

impl ResourceManager {
    pub fn new(
        device: Arc<DeviceProxy>,
        attrs: CommandAttrs,
        connections: Arc<ConnectionManager>,
        sessions: Arc<SessionRegistry>,
        device_transient_capacity: usize,
        fail_on_loaded_transients: bool,
    ) -> ResourceManager {
        ResourceManager {
            device,
            attrs,
            connections,
            sessions,
            device_transient_capacity,
            active_slots: AtomicUsize::new(0),
            fail_on_loaded_transients,
        }
    }

    /// The worker loop: `loop { cmd = input.blocking_pop(); resp =
    /// process(cmd); sink.push(resp) }`, extended with the
    /// connection-teardown and shutdown-sentinel handling spec §4.9 and
    /// §5 require. Intended to run on its own dedicated thread.
    #[instrument(skip_all)]
    pub fn run(&self, input: Receiver<WorkItem>, output: Sender<ResponseItem>) {
        loop {
            match input.recv() {
                Ok(WorkItem::Command(cmd)) => {
                    let resp = self.process(cmd);
                    if output.send(ResponseItem::Response(resp)).is_err() {
                        warn!("response sink disconnected, worker exiting");
                        return;
                    }
                }
                Ok(WorkItem::ConnectionClosed(conn)) => {
                    self.teardown_connection(&conn);
                }
                Ok(WorkItem::Shutdown) | Err(_) => {
                    info!("resource manager worker shutting down");
                    let _ = output.send(ResponseItem::Shutdown);
                    return;
                }
            }
        }
    }

    /// Process exactly one command to completion. Never fails to produce
    /// a `Response`: every recoverable error is synthesized into one.
    #[instrument(skip_all)]
    pub fn process(&self, mut cmd: Command) -> Response {
        let conn = cmd.originating_connection.clone();

        let header = match cmd.header() {
            Ok(h) => h,
            Err(_) => return self.malformed(&cmd, conn),
        };

        if header.code == consts::TPM2_CC_CONTEXT_LOAD {
            return self.process_context_load(header, cmd, conn);
        }

        let entry = self.attrs.lookup(header.code);
        let n = entry.handle_count as usize;
        if cmd.len() < tabrmd_protocol::HEADER_SIZE + 4 * n {
            return self.malformed(&cmd, conn);
        }

        let mut required: HashSet<u32> = HashSet::new();
        for i in 0..n {
            if let Some(h) = cmd.handle(i) {
                required.insert(h);
            }
        }

        // Captured before translation rewrites the buffer in place: the
        // virtual handle the command actually referenced, for the
        // single-handle commands (`ContextSave`, `FlushContext`) whose
        // post-processing must act on that specific entry rather than
        // guessing at whichever entry happens to be loaded.
        let referenced_handle = if n > 0 { cmd.handle(0) } else { None };

        for i in 0..n {
            let handle = match cmd.handle(i) {
                Some(h) => h,
                None => return self.malformed(&cmd, conn),
            };
            let family = HandleFamily::of(handle);
            if !family.is_virtualized() {
                continue;
            }
            if family.is_session() {
                if let Err(code) = self.translate_session_handle(&conn, handle, &required) {
                    return Response::synthesize(header.tag, code, conn);
                }
                // Sessions are never renumbered: the physical value is
                // already the value sitting in the buffer.
            } else {
                match self.translate_transient_handle(&conn, handle, &required) {
                    Ok(physical) => {
                        if cmd.set_handle(i, physical).is_err() {
                            return self.malformed(&cmd, conn);
                        }
                    }
                    Err(code) => return Response::synthesize(header.tag, code, conn),
                }
            }
        }

        let wire_resp = match self.device.raw_send(&cmd.into_buf()) {
            Ok(buf) => buf,
            Err(e) => {
                return Response::synthesize(header.tag, ResponseCode::Transport(to_transport_error(e)), conn)
            }
        };

        let mut resp = Response::from_device_buf(wire_resp, conn);
        let resp_header = match resp.header() {
            Ok(h) => h,
            Err(_) => return resp,
        };

        if resp_header.code != 0 {
            // Device error: returned verbatim. Any claims taken during
            // translation above stand; the eviction-exemption hold
            // implied by `required` never outlives this call in this
            // design, so there is nothing further to release.
            return resp;
        }

        self.postprocess_response(header.code, &mut resp, referenced_handle);
        resp
    }

    fn malformed(&self, cmd: &Command, conn: Arc<Connection>) -> Response {
        let tag = cmd.header().map(|h| h.tag).unwrap_or(0x8001);
        Response::synthesize(tag, ResponseCode::Broker(BrokerError::Malformed), conn)
    }

    /// Translate a transient-object virtual handle to its physical
    /// handle, loading it from its context blob (after making room, if
    /// necessary) when it is currently evicted.
    fn translate_transient_handle(
        &self,
        conn: &Arc<Connection>,
        virtual_handle: u32,
        required: &HashSet<u32>,
    ) -> Result<u32, ResponseCode> {
        let present = conn.handle_map().with_entry(virtual_handle, |e| e.is_physical_valid());
        match present {
            None => Err(ResponseCode::Broker(BrokerError::BadValue)),
            Some(true) => {
                let physical = conn
                    .handle_map()
                    .with_entry(virtual_handle, |e| e.physical())
                    .flatten()
                    .unwrap_or_else(|| fatal("transient entry marked physical-valid but has no physical handle"));
                Ok(physical)
            }
            Some(false) => {
                let blob = conn
                    .handle_map()
                    .with_entry(virtual_handle, |e| e.blob().map(|b| b.to_vec()))
                    .flatten()
                    .unwrap_or_else(|| fatal("transient entry has neither physical handle nor blob"));
                if self.make_room(required).is_err() {
                    return Err(ResponseCode::Broker(BrokerError::ObjectMemory));
                }
                match self.device.context_load(&blob) {
                    Ok(physical) => {
                        conn.handle_map().with_entry(virtual_handle, |e| e.set_loaded(physical));
                        self.active_slots.fetch_add(1, Ordering::SeqCst);
                        Ok(physical)
                    }
                    Err(_) => Err(ResponseCode::Broker(BrokerError::ObjectMemory)),
                }
            }
        }
    }

    /// Translate (and if needed, reload or adopt) a session-family
    /// handle. Sessions aren't renumbered, so there is no value to
    /// rewrite in the buffer; this only ensures the session is resident
    /// and owned by `conn`.
    fn translate_session_handle(
        &self,
        conn: &Arc<Connection>,
        handle: u32,
        required: &HashSet<u32>,
    ) -> Result<(), ResponseCode> {
        if conn.claimed_session_handles().contains(&handle) {
            match self.sessions.with_entry(handle, |e| e.is_physical_valid()) {
                None => fatal("connection claims a session handle absent from the registry"),
                Some(true) => Ok(()),
                Some(false) => self.reload_session(handle, required),
            }
        } else if self.sessions.claim(handle) {
            conn.claim_session(handle);
            let physical_valid = self
                .sessions
                .with_entry(handle, |e| e.is_physical_valid())
                .unwrap_or_else(|| fatal("session entry vanished from the registry immediately after claim"));
            if physical_valid {
                Ok(())
            } else {
                self.reload_session(handle, required)
            }
        } else {
            Err(ResponseCode::Broker(BrokerError::BadValue))
        }
    }

    fn reload_session(&self, handle: u32, required: &HashSet<u32>) -> Result<(), ResponseCode> {
        let blob = self
            .sessions
            .with_entry(handle, |e| e.blob().map(|b| b.to_vec()))
            .flatten()
            .unwrap_or_else(|| fatal("session entry has neither physical handle nor blob"));
        if self.make_room(required).is_err() {
            return Err(ResponseCode::Broker(BrokerError::SessionMemory));
        }
        match self.device.context_load(&blob) {
            Ok(physical) => {
                self.sessions.with_entry(handle, |e| e.claim(physical));
                self.active_slots.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => Err(ResponseCode::Broker(BrokerError::SessionMemory)),
        }
    }

    /// `ContextLoad` is special: it carries no input handles, only a blob
    /// in its body. If the blob matches a session the registry is
    /// holding `SavedByClientClosed`, this is the "claim" scenario from
    /// spec §8's end-to-end example. Otherwise it is a fresh load and the
    /// device-assigned handle becomes a brand new session entry (since
    /// session handles are never renumbered, the physical value the
    /// device hands back doubles as the virtual one).
    fn process_context_load(&self, header: Header, cmd: Command, conn: Arc<Connection>) -> Response {
        let blob = cmd.body().to_vec();

        if let Some(existing) = self.sessions.find_handle_by_blob(&blob) {
            if !self.sessions.claim(existing) {
                return Response::synthesize(header.tag, ResponseCode::Broker(BrokerError::BadValue), conn);
            }
            if self.make_room(&HashSet::new()).is_err() {
                return Response::synthesize(header.tag, ResponseCode::Broker(BrokerError::SessionMemory), conn);
            }
            return match self.device.context_load(&blob) {
                Ok(physical) => {
                    self.sessions.with_entry(existing, |e| e.claim(physical));
                    self.active_slots.fetch_add(1, Ordering::SeqCst);
                    conn.claim_session(existing);
                    build_context_load_response(header.tag, existing, conn)
                }
                Err(e) => Response::synthesize(header.tag, ResponseCode::Transport(to_transport_error(e)), conn),
            };
        }

        let wire_cmd = build_context_load_command(header.tag, &blob);
        match self.device.raw_send(&wire_cmd) {
            Ok(buf) => {
                let resp = Response::from_device_buf(buf, conn.clone());
                if let Ok(h) = resp.header() {
                    if h.code == 0 {
                        if let Some(physical) = resp.handle(0) {
                            let entry = HandleMapEntry::new_loaded(physical, physical, EntryKind::Session);
                            if self.sessions.insert(entry).is_ok() {
                                conn.claim_session(physical);
                                self.active_slots.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
                resp
            }
            Err(e) => Response::synthesize(header.tag, ResponseCode::Transport(to_transport_error(e)), conn),
        }
    }

    /// Command-specific post-processing on a successful response, per
    /// spec §4.8 step 7. `referenced_handle` is the virtual handle the
    /// command itself named (captured in `process` before translation
    /// rewrote the buffer), needed by the single-handle commands below to
    /// act on the entry the client actually meant rather than an
    /// arbitrary loaded one.
    fn postprocess_response(&self, code: u32, resp: &mut Response, referenced_handle: Option<u32>) {
        if code == consts::TPM2_CC_CREATE_PRIMARY {
            if let Some(physical) = resp.handle(0) {
                let conn = resp.originating_connection.clone();
                let virtual_handle = conn.handle_map().next_virtual();
                let entry = HandleMapEntry::new_loaded(virtual_handle, physical, EntryKind::TransientObject);
                if conn.handle_map().insert(entry).is_ok() {
                    self.active_slots.fetch_add(1, Ordering::SeqCst);
                    let _ = resp.set_handle(0, virtual_handle);
                }
            }
        } else if code == consts::TPM2_CC_START_AUTH_SESSION {
            if let Some(physical) = resp.handle(0) {
                let conn = resp.originating_connection.clone();
                let entry = HandleMapEntry::new_loaded(physical, physical, EntryKind::Session);
                if self.sessions.insert(entry).is_ok() {
                    conn.claim_session(physical);
                    self.active_slots.fetch_add(1, Ordering::SeqCst);
                }
            }
        } else if code == consts::TPM2_CC_CONTEXT_SAVE {
            if let Some(handle) = referenced_handle {
                self.save_loaded_entry(resp, handle);
            }
        } else if code == consts::TPM2_CC_FLUSH_CONTEXT {
            if let Some(handle) = referenced_handle {
                self.flush_loaded_entry(resp, handle);
            }
        } else if code == consts::TPM2_CC_GET_CAPABILITY {
            rewrite_gap_max_if_present(resp);
        }
    }

    /// `ContextSave`'s response body *is* the blob, and it belongs to the
    /// one virtual handle the command referenced. That handle is either a
    /// session the connection claims (looked up in the registry, keyed by
    /// its unrenumbered value) or a transient object in the connection's
    /// own handle map; it can't be both, so whichever lookup finds the
    /// handle is the one updated.
    fn save_loaded_entry(&self, resp: &mut Response, handle: u32) {
        let conn = resp.originating_connection.clone();
        let blob = resp.buf()[tabrmd_protocol::HEADER_SIZE..].to_vec();

        if conn.claimed_session_handles().contains(&handle) {
            self.sessions.with_entry(handle, |e| e.set_saved_by_client(blob));
        } else {
            conn.handle_map().with_entry(handle, |e| e.set_saved_by_client(blob));
        }
    }

    /// `FlushContext` on the handle the command referenced: drop the
    /// entry entirely (flush of a transient object or session is
    /// destructive) and release the device slot it held, if it was
    /// actually resident rather than already evicted.
    fn flush_loaded_entry(&self, resp: &Response, handle: u32) {
        let conn = resp.originating_connection.clone();
        if conn.claimed_session_handles().contains(&handle) {
            let was_loaded = self.sessions.with_entry(handle, |e| e.is_physical_valid()).unwrap_or(false);
            if self.sessions.remove(handle).is_some() {
                conn.release_session(handle);
                if was_loaded {
                    self.active_slots.fetch_sub(1, Ordering::SeqCst);
                }
            }
        } else {
            let was_loaded = conn.handle_map().with_entry(handle, |e| e.is_physical_valid()).unwrap_or(false);
            if conn.handle_map().remove(handle).is_some() && was_loaded {
                self.active_slots.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    /// Evict entries until the device has room for one more resident
    /// object, or report failure if nothing evictable remains.
    fn make_room(&self, required: &HashSet<u32>) -> Result<(), BrokerError> {
        while self.active_slots.load(Ordering::SeqCst) >= self.device_transient_capacity {
            if !self.evict_one(required) {
                return Err(BrokerError::ObjectMemory);
            }
        }
        Ok(())
    }

    /// Pick one non-referenced, currently-resident entry — a transient
    /// object in any connection's handle map, or a loaded session in the
    /// process-wide registry — and evict it via `save_then_flush`. Both
    /// pools draw on the same `active_slots`/`device_transient_capacity`
    /// budget, so both must be candidates. Deterministic: the lowest
    /// handle value among eligible candidates across both pools loses.
    fn evict_one(&self, required: &HashSet<u32>) -> bool {
        let mut best: Option<(u32, EvictionCandidate)> = None; // (key, candidate)

        for conn in self.connections.snapshot() {
            for entry in conn.handle_map().snapshot() {
                if !entry.is_physical_valid() || required.contains(&entry.virtual_handle()) {
                    continue;
                }
                let physical = match entry.physical() {
                    Some(p) => p,
                    None => continue,
                };
                let key = entry.virtual_handle();
                if best.as_ref().map(|(k, _)| key < *k).unwrap_or(true) {
                    best = Some((key, EvictionCandidate::Transient { conn: conn.clone(), virtual_handle: key, physical }));
                }
            }
        }

        for entry in self.sessions.snapshot() {
            if !entry.is_physical_valid() || required.contains(&entry.virtual_handle()) {
                continue;
            }
            let physical = match entry.physical() {
                Some(p) => p,
                None => continue,
            };
            let key = entry.virtual_handle();
            if best.as_ref().map(|(k, _)| key < *k).unwrap_or(true) {
                best = Some((key, EvictionCandidate::Session { handle: key, physical }));
            }
        }

        let (key, candidate) = match best {
            Some(b) => b,
            None => return false,
        };

        let outcome = match candidate {
            EvictionCandidate::Transient { conn, virtual_handle, physical } => {
                self.device.save_then_flush(physical).map(|blob| {
                    conn.handle_map().with_entry(virtual_handle, |e| e.set_evicted(blob));
                })
            }
            EvictionCandidate::Session { handle, physical } => self.device.save_then_flush(physical).map(|blob| {
                self.sessions.with_entry(handle, |e| e.set_evicted(blob));
            }),
        };

        match outcome {
            Ok(()) => {
                self.active_slots.fetch_sub(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!(error = ?e, handle = format!("{:#x}", key), "eviction save_then_flush failed");
                false
            }
        }
    }

    /// Connection teardown, per spec §4.9. Run from inside the worker so
    /// it is serialized with command processing.
    #[instrument(skip_all, fields(conn_id = conn.id()))]
    pub fn teardown_connection(&self, conn: &Arc<Connection>) {
        for entry in conn.handle_map().drain() {
            if let Some(physical) = entry.physical() {
                if self.fail_on_loaded_transients {
                    error!(
                        virtual_handle = format!("{:#x}", entry.virtual_handle()),
                        "connection closed with a transient object still loaded rather than saved"
                    );
                }
                if let Err(e) = self.device.context_flush(physical) {
                    warn!(error = ?e, "failed to flush transient handle on teardown");
                }
                self.active_slots.fetch_sub(1, Ordering::SeqCst);
            }
        }

        for handle in conn.claimed_session_handles() {
            let last_saved_by_client = self
                .sessions
                .with_entry(handle, |e| e.session_state() == Some(SessionState::SavedByClient))
                .unwrap_or(false);

            if last_saved_by_client {
                if let Some(evicted) = self.sessions.abandon(handle) {
                    if let Some(physical) = evicted.0.physical() {
                        if let Err(e) = self.device.context_flush(physical) {
                            warn!(error = ?e, "failed to flush LRU-evicted session on teardown");
                        }
                        self.active_slots.fetch_sub(1, Ordering::SeqCst);
                    }
                }
            } else if let Some(entry) = self.sessions.remove(handle) {
                if let Some(physical) = entry.physical() {
                    if let Err(e) = self.device.context_flush(physical) {
                        warn!(error = ?e, "failed to flush session on teardown");
                    }
                    self.active_slots.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

fn to_transport_error(rc: TransportRc) -> TransportError {
    match rc {
        TransportRc::BadSequence => TransportError::BadSequence,
        TransportRc::Timeout => TransportError::Timeout,
        TransportRc::Io => TransportError::Io,
        TransportRc::NotImplemented => TransportError::NotImplemented,
    }
}

fn build_context_load_command(tag: u16, blob: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; tabrmd_protocol::HEADER_SIZE + blob.len()];
    Header { tag, size: buf.len() as u32, code: consts::TPM2_CC_CONTEXT_LOAD }.write_to(&mut buf);
    buf[tabrmd_protocol::HEADER_SIZE..].copy_from_slice(blob);
    buf
}

/// Build the response to a claimed `ContextLoad`: a bare success header
/// followed by the one handle word, carrying the original (unrenumbered)
/// session handle rather than whatever physical value the reload
/// produced.
fn build_context_load_response(tag: u16, handle: u32, conn: Arc<Connection>) -> Response {
    let mut buf = vec![0u8; tabrmd_protocol::HEADER_SIZE + tabrmd_protocol::HANDLE_SIZE];
    Header { tag, size: buf.len() as u32, code: 0 }.write_to(&mut buf);
    tabrmd_protocol::write_handle(&mut buf, 0, handle).expect("buffer sized for one handle");
    Response::from_device_buf(buf, conn)
}

/// Rewrite the returned value of a `TPM2_PT_CONTEXT_GAP_MAX` capability
/// query to `UINT32_MAX`, hiding the device's internal gap-tracking limit
/// from clients, per spec §4.8 step 7 and §9's resolved design note.
fn rewrite_gap_max_if_present(resp: &mut Response) {
    const PROPERTY_LIST_HEADER: usize = 9;
    let header_size = tabrmd_protocol::HEADER_SIZE;
    let buf = resp.buf_mut();
    if buf.len() < header_size + PROPERTY_LIST_HEADER + 8 {
        return;
    }
    let property_off = header_size + PROPERTY_LIST_HEADER;
    let property = u32::from_be_bytes(buf[property_off..property_off + 4].try_into().unwrap());
    if property != consts::TPM2_PT_CONTEXT_GAP_MAX {
        return;
    }
    let value_off = property_off + 4;
    buf[value_off..value_off + 4].copy_from_slice(&u32::MAX.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_attrs::CommandAttrEntry;
    use crate::transport::Transport;
    use std::io::Cursor;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct FakeTransport {
        responses: StdMutex<Vec<Vec<u8>>>,
    }

    impl Transport for FakeTransport {
        fn transmit(&mut self, _buf: &[u8]) -> Result<(), TransportRc> {
            Ok(())
        }
        fn receive(&mut self, _timeout: Option<Duration>) -> Result<Vec<u8>, TransportRc> {
            self.responses.lock().unwrap().pop().ok_or(TransportRc::Io)
        }
        fn set_locality(&mut self, _locality: u8) -> Result<(), TransportRc> {
            Ok(())
        }
    }

    fn success_response(tag: u16, code: u32, extra: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; tabrmd_protocol::HEADER_SIZE + extra.len()];
        Header { tag, size: buf.len() as u32, code }.write_to(&mut buf);
        buf[tabrmd_protocol::HEADER_SIZE..].copy_from_slice(extra);
        buf
    }

    fn fake_connection() -> Arc<Connection> {
        Arc::new(Connection::new(1, Box::new(Cursor::new(vec![])), Box::new(Vec::new()), 8, 0x8000_0000))
    }

    fn rm_with_responses(responses: Vec<Vec<u8>>, capacity: usize) -> ResourceManager {
        let device = Arc::new(DeviceProxy::new(Box::new(FakeTransport { responses: StdMutex::new(responses) })));
        let attrs = CommandAttrs::from_entries([(
            consts::TPM2_CC_CREATE_PRIMARY,
            CommandAttrEntry { handle_count: 1, modifies_session_state: false },
        )]);
        ResourceManager::new(
            device,
            attrs,
            Arc::new(ConnectionManager::new(8)),
            Arc::new(SessionRegistry::new(8, 8)),
            capacity,
            false,
        )
    }

    #[test]
    fn malformed_command_synthesizes_broker_error() {
        let rm = rm_with_responses(vec![], 4);
        let conn = fake_connection();
        let cmd = Command::new(vec![0u8; 2], conn);
        let resp = rm.process(cmd);
        assert_eq!(resp.header().unwrap().code, ResponseCode::Broker(BrokerError::Malformed).as_wire());
    }

    #[test]
    fn create_primary_response_handle_is_virtualized() {
        let device_resp = success_response(0x8001, 0, &0x8000_0055u32.to_be_bytes());
        let rm = rm_with_responses(vec![device_resp], 4);
        let conn = fake_connection();
        let mut buf = vec![0u8; tabrmd_protocol::HEADER_SIZE];
        Header { tag: 0x8001, size: buf.len() as u32, code: consts::TPM2_CC_CREATE_PRIMARY }.write_to(&mut buf);
        let cmd = Command::new(buf, conn.clone());
        let resp = rm.process(cmd);
        let h = resp.handle(0).unwrap();
        assert_ne!(h, 0x8000_0055, "virtual handle must not be the raw device handle");
        assert_eq!(conn.handle_map().with_entry(h, |e| e.physical()).flatten(), Some(0x8000_0055));
    }

    #[test]
    fn teardown_flushes_resident_transient_objects() {
        let flush_resp = success_response(0x8001, 0, &[]);
        let rm = rm_with_responses(vec![flush_resp], 4);
        let conn = fake_connection();
        conn.handle_map()
            .insert(HandleMapEntry::new_loaded(0x8000_0001, 0x8000_0055, EntryKind::TransientObject))
            .unwrap();
        rm.teardown_connection(&conn);
        assert!(conn.handle_map().is_empty());
    }
}
