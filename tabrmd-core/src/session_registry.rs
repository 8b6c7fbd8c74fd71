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

//! Process-wide registry of sessions whose owning connection has closed,
//! with bounded LRU eviction over the abandoned pool. Touched only from
//! the resource-manager worker thread, so the lock here is about making
//! the type `Send + Sync`-friendly to store in an `Arc`, not about real
//! contention.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::handle::{HandleMapEntry, SessionState};

#[derive(Debug)]
pub struct SessionMemoryError;

pub struct SessionRegistry {
    max_active: usize,
    max_abandoned: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    /// Every session known to the registry, keyed by its (unrenumbered)
    /// handle, regardless of whether it is currently claimed by a
    /// connection or sitting abandoned.
    entries: HashMap<u32, HandleMapEntry>,
    /// Handles in `SavedByClientClosed` state, oldest at the front.
    abandoned: VecDeque<u32>,
}

/// An abandoned entry evicted by the LRU to make room for a new one. The
/// caller (the resource manager) is responsible for flushing it from the
/// device if it still has a live physical handle.
pub struct Evicted(pub HandleMapEntry);

impl SessionRegistry {
    pub fn new(max_active: usize, max_abandoned: usize) -> SessionRegistry {
        SessionRegistry {
            max_active,
            max_abandoned,
            inner: Mutex::new(Inner { entries: HashMap::new(), abandoned: VecDeque::new() }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("session registry lock poisoned")
    }

    pub fn active_count(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn abandoned_count(&self) -> usize {
        self.lock().abandoned.len()
    }

    /// Register a newly created session. Fails with `SessionMemoryError`
    /// if `max_active_sessions` (sessions known to the device plus in the
    /// registry) has already been reached.
    pub fn insert(&self, entry: HandleMapEntry) -> Result<(), SessionMemoryError> {
        let mut inner = self.lock();
        if !inner.entries.contains_key(&entry.virtual_handle()) && inner.entries.len() >= self.max_active {
            return Err(SessionMemoryError);
        }
        inner.entries.insert(entry.virtual_handle(), entry);
        Ok(())
    }

    /// Run `f` against the entry for `handle`, if present.
    pub fn with_entry<F, R>(&self, handle: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut HandleMapEntry) -> R,
    {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(&handle)?;
        Some(f(entry))
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.lock().entries.contains_key(&handle)
    }

    /// Snapshot every entry currently known to the registry, claimed or
    /// abandoned. Lets eviction consider resident sessions as candidates
    /// alongside per-connection transient objects, since both draw on the
    /// same device-wide slot budget. Like `HandleMap::snapshot`, this is a
    /// point-in-time copy taken under the lock and released immediately.
    pub fn snapshot(&self) -> Vec<HandleMapEntry> {
        self.lock().entries.values().cloned().collect()
    }

    /// The connection owning `handle` has closed with the session last
    /// saved by the client: transition it to `SavedByClientClosed` and
    /// push it to the LRU tail. If the abandoned pool is now over
    /// `max_abandoned`, the head (oldest) entry is popped and returned so
    /// the caller can flush it from the device and discard it.
    pub fn abandon(&self, handle: u32) -> Option<Evicted> {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&handle) {
            entry.abandon();
        } else {
            return None;
        }
        inner.abandoned.push_back(handle);

        if inner.abandoned.len() > self.max_abandoned {
            if let Some(victim) = inner.abandoned.pop_front() {
                if let Some(entry) = inner.entries.remove(&victim) {
                    return Some(Evicted(entry));
                }
            }
        }
        None
    }

    /// A connection presents a saved context blob matching `handle` and
    /// claims ownership of it. Only entries in `SavedByClientClosed` are
    /// eligible. The entry stays in the registry under `handle` (only
    /// pulled off the abandoned LRU) so the caller can still reach its
    /// blob and update its physical handle via `with_entry` once it has
    /// reloaded it onto the device.
    pub fn claim(&self, handle: u32) -> bool {
        let mut inner = self.lock();
        let is_abandoned = matches!(
            inner.entries.get(&handle).and_then(|e| e.session_state()),
            Some(SessionState::SavedByClientClosed)
        );
        if !is_abandoned {
            return false;
        }
        inner.abandoned.retain(|h| *h != handle);
        true
    }

    /// Drop a session entirely (e.g. after `FlushContext`), wherever it
    /// currently lives.
    pub fn remove(&self, handle: u32) -> Option<HandleMapEntry> {
        let mut inner = self.lock();
        inner.abandoned.retain(|h| *h != handle);
        inner.entries.remove(&handle)
    }

    /// Find the handle of an abandoned entry whose last-saved context blob
    /// matches `blob` exactly. Used when a client issues `ContextLoad`
    /// directly with a blob it received from an earlier `ContextSave`,
    /// rather than the broker reloading a blob it evicted itself.
    pub fn find_handle_by_blob(&self, blob: &[u8]) -> Option<u32> {
        let inner = self.lock();
        inner
            .abandoned
            .iter()
            .find(|h| inner.entries.get(h).and_then(|e| e.blob()) == Some(blob))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::EntryKind;

    fn saved_by_client(handle: u32) -> HandleMapEntry {
        let mut e = HandleMapEntry::new_loaded(handle, handle, EntryKind::Session);
        e.set_saved_by_client(vec![0xaa]);
        e
    }

    #[test]
    fn insert_enforces_max_active() {
        let reg = SessionRegistry::new(1, 10);
        reg.insert(saved_by_client(1)).unwrap();
        assert!(reg.insert(saved_by_client(2)).is_err());
    }

    #[test]
    fn abandon_then_claim_round_trips() {
        let reg = SessionRegistry::new(10, 10);
        reg.insert(saved_by_client(1)).unwrap();
        assert!(reg.abandon(1).is_none());
        assert!(reg.claim(1), "claim should succeed on an abandoned entry");
        assert!(reg.contains(1), "claimed entry stays in the registry so it can be reloaded");
        assert!(!reg.claim(1), "an entry that is no longer abandoned can't be claimed again");
    }

    #[test]
    fn lru_evicts_oldest_abandoned_over_cap() {
        let reg = SessionRegistry::new(10, 2);
        reg.insert(saved_by_client(1)).unwrap();
        reg.insert(saved_by_client(2)).unwrap();
        reg.insert(saved_by_client(3)).unwrap();

        assert!(reg.abandon(1).is_none());
        assert!(reg.abandon(2).is_none());
        let evicted = reg.abandon(3).expect("third abandon should evict the oldest (1)");
        assert_eq!(evicted.0.virtual_handle(), 1);

        assert!(!reg.claim(1), "evicted session should not be claimable");
        assert!(reg.claim(2));
        assert!(reg.claim(3));
    }
}
