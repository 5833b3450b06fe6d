//! Registry of live transfers, keyed by client TID.
//!
//! The listener admits a session here before spawning its task; the task
//! holds the returned [`Registration`], and dropping it removes the entry.
//! Session tasks never touch the map otherwise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::types::{Role, TransferId};

/// What the registry knows about a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: Role,
    pub filename: String,
    /// The session's own endpoint
    pub local_addr: SocketAddr,
}

/// Shared handle to the registry. Clones refer to the same map.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sessions: Arc<Mutex<HashMap<TransferId, SessionInfo>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless `tid` already has one.
    ///
    /// Returns `None` for a duplicate, leaving the existing entry alone.
    pub fn admit(&self, tid: TransferId, info: SessionInfo) -> Option<Registration> {
        let mut sessions = self.lock();
        if sessions.contains_key(&tid) {
            return None;
        }
        sessions.insert(tid, info);
        Some(Registration {
            registry: self.clone(),
            tid,
        })
    }

    pub fn contains(&self, tid: &TransferId) -> bool {
        self.lock().contains_key(tid)
    }

    pub fn get(&self, tid: &TransferId) -> Option<SessionInfo> {
        self.lock().get(tid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of every live entry, in no particular order.
    pub fn snapshot(&self) -> Vec<(TransferId, SessionInfo)> {
        self.lock()
            .iter()
            .map(|(tid, info)| (*tid, info.clone()))
            .collect()
    }

    fn remove(&self, tid: &TransferId) {
        self.lock().remove(tid);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TransferId, SessionInfo>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof of admission. The entry lives exactly as long as this value.
#[derive(Debug)]
pub struct Registration {
    registry: Registry,
    tid: TransferId,
}

impl Registration {
    pub fn tid(&self) -> TransferId {
        self.tid
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.tid);
    }
}
