//! Recovery from poisoned locks.
//!
//! A task that panics while holding one of the store's locks poisons it.
//! Every write to the store's maps is a single insert or a batch validated
//! before anything is applied, so the data behind a poisoned lock is still
//! consistent and the guard can be taken back.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

/// Poison-tolerant access to an `RwLock`.
pub(crate) trait RwLockRecovery<T> {
    /// Takes a read guard, recovering it if the lock is poisoned.
    fn read_recover(&self) -> RwLockReadGuard<'_, T>;

    /// Takes a write guard, recovering it if the lock is poisoned.
    fn write_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockRecovery<T> for RwLock<T> {
    fn read_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            warn!("store lock poisoned by a panicking task; recovering");
            poisoned.into_inner()
        })
    }

    fn write_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            warn!("store lock poisoned by a panicking task; recovering");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
#[allow(clippy::significant_drop_tightening)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guards_survive_a_panicking_writer() {
        let lock = Arc::new(RwLock::new(vec![1, 2, 3]));
        let poisoner = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let mut guard = poisoner.write().unwrap();
            guard.push(4);
            panic!("poison the lock");
        });
        let _ = handle.join();
        assert!(lock.is_poisoned());

        assert_eq!(*lock.read_recover(), vec![1, 2, 3, 4]);
        lock.write_recover().push(5);
        assert_eq!(lock.read_recover().len(), 5);
    }

    #[test]
    fn healthy_locks_behave_normally() {
        let lock = RwLock::new(0);
        *lock.write_recover() += 1;
        assert_eq!(*lock.read_recover(), 1);
    }
}
