//! Session write locks.
//!
//! At most one writer per session key. A second acquirer from a different
//! client fails and the route reports `{ holder, acquiredAt }` with a 409.
//! Locks release on explicit release, client disconnect, session eviction,
//! or TTL expiry.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// How long a lock survives without renewal before it is considered stale.
const LOCK_TTL_MINUTES: i64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

pub struct SessionLockManager {
    locks: Mutex<HashMap<String, LockInfo>>,
}

impl SessionLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive acquire. Re-acquiring by the current holder refreshes the
    /// timestamp; a different client gets the holder info back as the error.
    pub fn acquire(&self, session_key: &str, client_id: &str) -> Result<(), LockInfo> {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(session_key) {
            Some(info) if info.holder != client_id && !is_expired(info) => Err(info.clone()),
            _ => {
                locks.insert(
                    session_key.to_string(),
                    LockInfo {
                        holder: client_id.to_string(),
                        acquired_at: Utc::now(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Release by the holder. Returns whether a lock was actually removed.
    pub fn release(&self, session_key: &str, client_id: &str) -> bool {
        let mut locks = self.locks.lock().unwrap();
        match locks.get(session_key) {
            Some(info) if info.holder == client_id => {
                locks.remove(session_key);
                true
            }
            _ => false,
        }
    }

    /// Is the session locked by someone other than `client_id`?
    pub fn is_locked_by_other(&self, session_key: &str, client_id: &str) -> Option<LockInfo> {
        let locks = self.locks.lock().unwrap();
        locks
            .get(session_key)
            .filter(|info| info.holder != client_id && !is_expired(info))
            .cloned()
    }

    pub fn get(&self, session_key: &str) -> Option<LockInfo> {
        let locks = self.locks.lock().unwrap();
        locks.get(session_key).filter(|info| !is_expired(info)).cloned()
    }

    /// Release every lock held for evicted sessions.
    pub fn cleanup(&self, evicted_keys: &[String]) {
        let mut locks = self.locks.lock().unwrap();
        for key in evicted_keys {
            locks.remove(key);
        }
    }
}

impl Default for SessionLockManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(info: &LockInfo) -> bool {
    Utc::now() - info.acquired_at > Duration::minutes(LOCK_TTL_MINUTES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_client_is_rejected_with_holder_info() {
        let locks = SessionLockManager::new();
        locks.acquire("s1", "client-a").unwrap();

        let err = locks.acquire("s1", "client-b").unwrap_err();
        assert_eq!(err.holder, "client-a");
    }

    #[test]
    fn holder_can_reacquire_and_release() {
        let locks = SessionLockManager::new();
        locks.acquire("s1", "client-a").unwrap();
        locks.acquire("s1", "client-a").unwrap();

        assert!(locks.release("s1", "client-a"));
        assert!(!locks.release("s1", "client-a"));
        locks.acquire("s1", "client-b").unwrap();
    }

    #[test]
    fn release_by_non_holder_is_a_no_op() {
        let locks = SessionLockManager::new();
        locks.acquire("s1", "client-a").unwrap();
        assert!(!locks.release("s1", "client-b"));
        assert!(locks.get("s1").is_some());
    }

    #[test]
    fn cleanup_releases_evicted_sessions() {
        let locks = SessionLockManager::new();
        locks.acquire("s1", "a").unwrap();
        locks.acquire("s2", "b").unwrap();

        locks.cleanup(&["s1".to_string()]);
        assert!(locks.get("s1").is_none());
        assert!(locks.get("s2").is_some());
    }

    #[test]
    fn is_locked_by_other_ignores_own_lock() {
        let locks = SessionLockManager::new();
        locks.acquire("s1", "a").unwrap();
        assert!(locks.is_locked_by_other("s1", "a").is_none());
        assert!(locks.is_locked_by_other("s1", "b").is_some());
    }
}
