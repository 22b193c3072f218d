//! Poison-tolerant access to the few `std::sync` locks the node keeps.
//!
//! Most shared state lives behind `tokio::sync` locks. The exceptions are
//! structures touched from synchronous call sites: the certificate map (read
//! from the rustls SNI callback), the bus subscriber tables, the snowflake
//! sequence and the peer public-key cache. A poisoned guard is recovered and
//! logged at ERROR.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::error;

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// `context` names the protected data in the log line.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("Mutex poisoned for '{}', continuing with recovered state", context);
        poisoned.into_inner()
    })
}

/// Read-lock `rwlock`, recovering the guard if a writer panicked.
pub fn read_lock_or_recover<'a, T>(rwlock: &'a RwLock<T>, context: &str) -> RwLockReadGuard<'a, T> {
    rwlock.read().unwrap_or_else(|poisoned| {
        error!("RwLock (read) poisoned for '{}', continuing with recovered state", context);
        poisoned.into_inner()
    })
}

/// Write-lock `rwlock`, recovering the guard if a writer panicked.
pub fn write_lock_or_recover<'a, T>(
    rwlock: &'a RwLock<T>,
    context: &str,
) -> RwLockWriteGuard<'a, T> {
    rwlock.write().unwrap_or_else(|poisoned| {
        error!("RwLock (write) poisoned for '{}', continuing with recovered state", context);
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_then_read() {
        let certs: RwLock<HashMap<String, u32>> = RwLock::new(HashMap::new());
        write_lock_or_recover(&certs, "cert map").insert("a.test".to_string(), 1);
        assert_eq!(read_lock_or_recover(&certs, "cert map").get("a.test"), Some(&1));
    }

    #[test]
    fn test_mutex_recovers_after_panic() {
        let sequence = Arc::new(Mutex::new((0u64, 0u16)));
        let clone = Arc::clone(&sequence);

        let _ = thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison the snowflake state");
        })
        .join();

        let guard = lock_or_recover(&sequence, "snowflake state");
        assert_eq!(*guard, (0, 0));
    }

    #[test]
    fn test_rwlock_recovers_after_panic() {
        let peers = Arc::new(RwLock::new(vec!["master".to_string()]));
        let clone = Arc::clone(&peers);

        let _ = thread::spawn(move || {
            let _guard = clone.write().unwrap();
            panic!("poison the peer key cache");
        })
        .join();

        assert_eq!(read_lock_or_recover(&peers, "peer keys").len(), 1);
        write_lock_or_recover(&peers, "peer keys").push("edge-a".to_string());
        assert_eq!(read_lock_or_recover(&peers, "peer keys").len(), 2);
    }
}
