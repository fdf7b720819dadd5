//! Per-session chat input lock.
//!
//! One streaming turn per session at a time; the permit is held by the SSE
//! response and auto-releases when the stream ends (including disconnects).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// A turn is already streaming on this session.
#[derive(Debug)]
pub struct SessionBusy;

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the input lock without waiting; a second concurrent turn is
    /// rejected rather than queued.
    pub fn try_acquire(&self, session_id: &str) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.try_acquire_owned().map_err(|_: TryAcquireError| SessionBusy)
    }

    /// Drop lock entries for sessions with no holder (periodic cleanup).
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, sem| sem.available_permits() == 0);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_turn_is_rejected_until_release() {
        let locks = SessionLockMap::new();

        let permit = locks.try_acquire("s1").unwrap();
        assert!(locks.try_acquire("s1").is_err());
        // Other sessions are unaffected.
        assert!(locks.try_acquire("s2").is_ok());

        drop(permit);
        assert!(locks.try_acquire("s1").is_ok());
    }

    #[tokio::test]
    async fn prune_drops_unheld_entries() {
        let locks = SessionLockMap::new();
        let permit = locks.try_acquire("held").unwrap();
        drop(locks.try_acquire("released").unwrap());

        locks.prune_idle();
        assert_eq!(locks.len(), 1);
        drop(permit);
    }
}
