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

//! Process-wide set of live connections, keyed both by opaque id (for
//! management operations) and by stream identity (for the command source
//! to map incoming bytes to a `Connection`). Bounded by `max_connections`,
//! grounded in `session-manager.h`'s dual-`GHashTable` `SessionManager`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::connection::Connection;

#[derive(Debug)]
pub struct ConnectionLimitError;

pub struct ConnectionManager {
    max_connections: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    by_id: HashMap<u64, Arc<Connection>>,
    by_stream: HashMap<u64, Arc<Connection>>,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> ConnectionManager {
        ConnectionManager {
            max_connections,
            inner: Mutex::new(Inner { by_id: HashMap::new(), by_stream: HashMap::new() }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("connection manager lock poisoned")
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a newly accepted connection. Fails with
    /// `ConnectionLimitError` if `max_connections` is already reached.
    pub fn insert(&self, conn: Arc<Connection>) -> Result<(), ConnectionLimitError> {
        let mut inner = self.lock();
        if inner.by_id.len() >= self.max_connections {
            return Err(ConnectionLimitError);
        }
        inner.by_id.insert(conn.id(), conn.clone());
        inner.by_stream.insert(conn.stream_id(), conn);
        Ok(())
    }

    /// Unregister and return the connection with the given id, if present.
    /// Callers are expected to run the teardown pass of spec §4.9 on the
    /// result before dropping it.
    pub fn remove_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        let mut inner = self.lock();
        let conn = inner.by_id.remove(&id)?;
        inner.by_stream.remove(&conn.stream_id());
        Some(conn)
    }

    pub fn remove_by_stream_id(&self, stream_id: u64) -> Option<Arc<Connection>> {
        let mut inner = self.lock();
        let conn = inner.by_stream.remove(&stream_id)?;
        inner.by_id.remove(&conn.id());
        Some(conn)
    }

    pub fn lookup_by_id(&self, id: u64) -> Option<Arc<Connection>> {
        self.lock().by_id.get(&id).cloned()
    }

    pub fn lookup_by_stream_id(&self, stream_id: u64) -> Option<Arc<Connection>> {
        self.lock().by_stream.get(&stream_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fake_connection(stream_id: u64) -> Arc<Connection> {
        Arc::new(Connection::new(
            stream_id,
            Box::new(Cursor::new(vec![])),
            Box::new(Vec::new()),
            8,
            0x8000_0000,
        ))
    }

    #[test]
    fn insert_enforces_max_connections() {
        let mgr = ConnectionManager::new(1);
        mgr.insert(fake_connection(1)).unwrap();
        assert!(mgr.insert(fake_connection(2)).is_err());
    }

    #[test]
    fn lookup_by_both_keys() {
        let mgr = ConnectionManager::new(4);
        let conn = fake_connection(42);
        let id = conn.id();
        mgr.insert(conn).unwrap();
        assert!(mgr.lookup_by_id(id).is_some());
        assert!(mgr.lookup_by_stream_id(42).is_some());
    }

    #[test]
    fn remove_clears_both_indices() {
        let mgr = ConnectionManager::new(4);
        let conn = fake_connection(7);
        let id = conn.id();
        mgr.insert(conn).unwrap();
        let removed = mgr.remove_by_id(id).unwrap();
        assert_eq!(removed.stream_id(), 7);
        assert!(mgr.lookup_by_stream_id(7).is_none());
        assert!(mgr.is_empty());
    }
}
