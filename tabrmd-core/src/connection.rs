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

//! `Connection` is the ownership root of all per-client virtualization
//! state: its byte streams, its transient-object `HandleMap`, and the set
//! of sessions it currently claims. `ConnectionManager` is the
//! process-wide set of live connections, keyed the way the original
//! tpm2-abrmd's (confusingly named) `SessionManager` keys its
//! `SessionData` records: by both stream/fd identity and by an opaque id.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::handle_map::HandleMap;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One client's I/O streams, identity, and transient-object handle map.
/// Immutable after construction except for its `HandleMap` and session
/// set.
pub struct Connection {
    id: u64,
    /// Identity of the underlying receive stream (e.g. a raw fd), used by
    /// the connection manager's second index so the command source thread
    /// can map a readable stream back to its `Connection` without knowing
    /// about ids at all.
    stream_id: u64,
    recv: Mutex<Box<dyn Read + Send>>,
    send: Mutex<Box<dyn Write + Send>>,
    handle_map: HandleMap,
    /// Session handles this connection currently claims. Membership here,
    /// not physical residency, is what "owns" a session entry in the
    /// session-continuation registry.
    claimed_sessions: Mutex<HashSet<u32>>,
}

impl Connection {
    pub fn new(
        stream_id: u64,
        recv: Box<dyn Read + Send>,
        send: Box<dyn Write + Send>,
        max_transient: usize,
        transient_base: u32,
    ) -> Connection {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream_id,
            recv: Mutex::new(recv),
            send: Mutex::new(send),
            handle_map: HandleMap::new(transient_base, max_transient),
            claimed_sessions: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn handle_map(&self) -> &HandleMap {
        &self.handle_map
    }

    /// Read one raw framed command from the client. Held by the command
    /// source thread only; never called from the resource-manager worker.
    pub fn recv_lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Read + Send>> {
        self.recv.lock().expect("connection recv lock poisoned")
    }

    /// Write one raw framed response to the client. Held by the response
    /// sink thread only.
    pub fn send_lock(&self) -> std::sync::MutexGuard<'_, Box<dyn Write + Send>> {
        self.send.lock().expect("connection send lock poisoned")
    }

    pub fn claim_session(&self, handle: u32) {
        self.claimed_sessions.lock().expect("session set lock poisoned").insert(handle);
    }

    pub fn release_session(&self, handle: u32) {
        self.claimed_sessions.lock().expect("session set lock poisoned").remove(&handle);
    }

    pub fn claimed_session_handles(&self) -> Vec<u32> {
        self.claimed_sessions.lock().expect("session set lock poisoned").iter().copied().collect()
    }
}
