use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn_poisoned(target, op, "rwlock.read");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn rw_write<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn_poisoned(target, op, "rwlock.write");
            poisoned.into_inner()
        }
    }
}

pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn_poisoned(target, op, "mutex.lock");
            poisoned.into_inner()
        }
    }
}

fn warn_poisoned(target: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        hint = "aggregate may be stale after panic in another thread",
        "Recovered from poisoned cache lock"
    );
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn rwlock_write_recovers_after_poison() {
        let lock = RwLock::new(1_u32);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison rwlock");
        }));

        *rw_write(&lock, "util::lock", "test") += 1;
        assert_eq!(*rw_read(&lock, "util::lock", "test"), 2);
    }

    #[test]
    fn mutex_recovers_after_poison() {
        let lock = Mutex::new(Vec::<u8>::new());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison mutex");
        }));

        mutex_lock(&lock, "util::lock", "test").push(7);
        assert_eq!(mutex_lock(&lock, "util::lock", "test").as_slice(), &[7]);
    }
}
