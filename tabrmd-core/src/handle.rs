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

//! The handle map's unit of bookkeeping: the virtual↔physical mapping for
//! one device object or session, plus the state machine a session entry
//! walks through as it is saved, abandoned, and reclaimed.

/// What family of device resource a `HandleMapEntry` tracks. Only the two
/// kinds the broker virtualizes show up here; everything else is addressed
/// directly and never gets an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    TransientObject,
    Session,
}

/// The lifecycle state of a session entry. Transient-object entries don't
/// carry one of these; they are simply present (loaded or evicted) or
/// gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Currently resident on the device; `physical` is valid.
    Loaded,
    /// Evicted by the resource manager itself to make room, not by client
    /// request. Transparent to the owning connection: the broker will
    /// reload it the next time the connection references it.
    SavedByDaemon,
    /// The client issued `ContextSave` explicitly. The connection still
    /// owns the entry; `physical` may or may not still be valid depending
    /// on whether a flush followed.
    SavedByClient,
    /// The owning connection closed with the entry last saved by the
    /// client. Lives only in the session-continuation registry's LRU,
    /// awaiting `claim` by some other connection.
    SavedByClientClosed,
}

/// One row of a `HandleMap`: the virtual identity, the entry's kind, and
/// exactly one of a live physical handle or a detached context blob.
///
/// Invariant: for a `TransientObject` entry, exactly one of `physical` and
/// `blob` is `Some` at any time. For a `Session` entry the same holds
/// except while `state == Loaded`, where `blob` may additionally be
/// `Some` (a loaded session can still carry its last-saved blob around;
/// the broker never relies on that, but clearing it on every load is not
/// required either).
#[derive(Debug, Clone)]
pub struct HandleMapEntry {
    virtual_handle: u32,
    kind: EntryKind,
    physical: Option<u32>,
    blob: Option<Vec<u8>>,
    session_state: Option<SessionState>,
}

impl HandleMapEntry {
    /// Construct a freshly created entry backed by a live physical handle,
    /// as happens the moment the broker first observes a device-allocated
    /// handle in a response the connection is entitled to.
    pub fn new_loaded(virtual_handle: u32, physical: u32, kind: EntryKind) -> HandleMapEntry {
        let session_state = match kind {
            EntryKind::TransientObject => None,
            EntryKind::Session => Some(SessionState::Loaded),
        };
        HandleMapEntry {
            virtual_handle,
            kind,
            physical: Some(physical),
            blob: None,
            session_state,
        }
    }

    pub fn virtual_handle(&self) -> u32 {
        self.virtual_handle
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn physical(&self) -> Option<u32> {
        self.physical
    }

    pub fn blob(&self) -> Option<&[u8]> {
        self.blob.as_deref()
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.session_state
    }

    /// Whether this entry currently has a live physical handle. Checked at
    /// rest by the "exactly one of physical/blob valid" invariant the
    /// resource manager enforces.
    pub fn is_physical_valid(&self) -> bool {
        self.physical.is_some()
    }

    pub fn is_blob_valid(&self) -> bool {
        self.blob.is_some()
    }

    /// Record that the device evicted this entry: the context blob
    /// returned by `save_then_flush` replaces the physical handle.
    pub fn set_evicted(&mut self, blob: Vec<u8>) {
        self.physical = None;
        self.blob = Some(blob);
        if self.kind == EntryKind::Session {
            self.session_state = Some(SessionState::SavedByDaemon);
        }
    }

    /// Record that the broker reloaded this entry's context onto the
    /// device, obtaining a (possibly new) physical handle.
    pub fn set_loaded(&mut self, physical: u32) {
        self.physical = Some(physical);
        if self.kind == EntryKind::Session {
            self.session_state = Some(SessionState::Loaded);
        }
    }

    /// Record a client-initiated `ContextSave`: the blob is retained, the
    /// physical handle is left alone unless the caller also flushes.
    pub fn set_saved_by_client(&mut self, blob: Vec<u8>) {
        self.blob = Some(blob);
        if self.kind == EntryKind::Session {
            self.session_state = Some(SessionState::SavedByClient);
        }
    }

    /// Record that the physical handle was flushed from the device; for a
    /// transient object this makes the entry ready for removal, for a
    /// session it is only valid if a blob already exists.
    pub fn clear_physical(&mut self) {
        self.physical = None;
    }

    /// Transition an owned session entry to `SavedByClientClosed` as its
    /// connection tears down, per spec §4.9.
    pub fn abandon(&mut self) {
        debug_assert_eq!(self.kind, EntryKind::Session);
        self.session_state = Some(SessionState::SavedByClientClosed);
    }

    /// Transition a `SavedByClientClosed` entry back into `Loaded`
    /// ownership as a new connection claims it from the registry.
    pub fn claim(&mut self, physical: u32) {
        debug_assert_eq!(self.kind, EntryKind::Session);
        self.physical = Some(physical);
        self.session_state = Some(SessionState::Loaded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_loaded_transient_has_no_blob() {
        let e = HandleMapEntry::new_loaded(0x8000_0001, 0x8000_0042, EntryKind::TransientObject);
        assert!(e.is_physical_valid());
        assert!(!e.is_blob_valid());
        assert_eq!(e.session_state(), None);
    }

    #[test]
    fn eviction_flips_physical_and_blob_validity() {
        let mut e = HandleMapEntry::new_loaded(0x8000_0001, 0x8000_0042, EntryKind::TransientObject);
        e.set_evicted(vec![1, 2, 3]);
        assert!(!e.is_physical_valid());
        assert!(e.is_blob_valid());
    }

    #[test]
    fn session_lifecycle_transitions() {
        let mut e = HandleMapEntry::new_loaded(0x0200_0001, 0x0200_0001, EntryKind::Session);
        assert_eq!(e.session_state(), Some(SessionState::Loaded));
        e.set_saved_by_client(vec![9, 9]);
        assert_eq!(e.session_state(), Some(SessionState::SavedByClient));
        e.abandon();
        assert_eq!(e.session_state(), Some(SessionState::SavedByClientClosed));
        e.claim(0x0200_0002);
        assert_eq!(e.session_state(), Some(SessionState::Loaded));
        assert_eq!(e.physical(), Some(0x0200_0002));
    }
}
