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

//! A per-connection, thread-safe association from virtual handles to
//! `HandleMapEntry` records, bounded by a per-connection entry cap. Stores
//! only the transient-object family; session entries live in the
//! connection's own session list (see `connection.rs`).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::handle::HandleMapEntry;

/// Returned when `insert` would exceed the per-connection cap.
#[derive(Debug)]
pub struct CapacityError;

pub struct HandleMap {
    base: u32,
    cap: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<u32, HandleMapEntry>,
    next_offset: u32,
}

impl HandleMap {
    /// `base` is the first virtual handle value this map will ever hand
    /// out; `cap` is the maximum number of live entries.
    pub fn new(base: u32, cap: usize) -> HandleMap {
        HandleMap {
            base,
            cap,
            inner: Mutex::new(Inner { entries: HashMap::new(), next_offset: 1 }),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("handle map lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocate the next unused virtual handle in this map's range,
    /// starting from `base + 1` and wrapping back to `base + 1` once
    /// `base + cap` has been assigned. Does not insert an entry; callers
    /// must follow up with `insert`.
    pub fn next_virtual(&self) -> u32 {
        let mut inner = self.inner.lock().expect("handle map lock poisoned");
        loop {
            let candidate = inner.next_offset;
            inner.next_offset =
                if (candidate as usize) >= self.cap { 1 } else { candidate + 1 };
            let handle = self.base + candidate;
            if !inner.entries.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Place `entry` under its own virtual-handle key. Fails if the cap is
    /// already reached and `entry`'s handle is not already present (an
    /// update of an existing entry never counts against the cap).
    pub fn insert(&self, entry: HandleMapEntry) -> Result<(), CapacityError> {
        let mut inner = self.inner.lock().expect("handle map lock poisoned");
        let key = entry.virtual_handle();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.cap {
            return Err(CapacityError);
        }
        inner.entries.insert(key, entry);
        Ok(())
    }

    /// Remove and return the entry for `virtual_handle`, if present.
    pub fn remove(&self, virtual_handle: u32) -> Option<HandleMapEntry> {
        self.inner.lock().expect("handle map lock poisoned").entries.remove(&virtual_handle)
    }

    /// Run `f` against a clone of the entry for `virtual_handle`, if
    /// present, and write the (possibly modified) clone back. Kept
    /// intentionally narrow so callers never hold the map's lock for
    /// longer than a single field read or mutation.
    pub fn with_entry<F, R>(&self, virtual_handle: u32, f: F) -> Option<R>
    where
        F: FnOnce(&mut HandleMapEntry) -> R,
    {
        let mut inner = self.inner.lock().expect("handle map lock poisoned");
        let entry = inner.entries.get_mut(&virtual_handle)?;
        Some(f(entry))
    }

    /// Snapshot every entry currently in the map. Callers must not assume
    /// the snapshot reflects concurrent mutation; it is a copy taken under
    /// the lock and released immediately, matching the "iteration is
    /// snapshot-based" contract.
    pub fn snapshot(&self) -> Vec<HandleMapEntry> {
        self.inner.lock().expect("handle map lock poisoned").entries.values().cloned().collect()
    }

    /// Drain every entry out of the map, for connection teardown.
    pub fn drain(&self) -> Vec<HandleMapEntry> {
        let mut inner = self.inner.lock().expect("handle map lock poisoned");
        inner.entries.drain().map(|(_, v)| v).collect()
    }
}
