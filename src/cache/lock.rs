use std::sync::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::warn;

fn report_poisoned(target: &'static str, op: &'static str, lock_kind: &'static str) {
    warn!(
        op,
        target_module = target,
        lock_kind,
        result = "poisoned_recovered",
        hint = "state may be stale after panic in another thread",
        "Recovered from poisoned cache lock"
    );
}

pub(crate) fn rw_read<'a, T>(
    lock: &'a RwLock<T>,
    target: &'static str,
    op: &'static str,
) -> RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            report_poisoned(target, op, "rwlock.read");
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
            report_poisoned(target, op, "rwlock.write");
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
            report_poisoned(target, op, "mutex.lock");
            poisoned.into_inner()
        }
    }
}

/// Park on `condvar` until notified, or until `timeout` elapses when given.
///
/// Returns the reacquired guard and whether the wait timed out.
pub(crate) fn condvar_wait<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Option<Duration>,
    target: &'static str,
    op: &'static str,
) -> (MutexGuard<'a, T>, bool) {
    match timeout {
        None => match condvar.wait(guard) {
            Ok(guard) => (guard, false),
            Err(poisoned) => {
                report_poisoned(target, op, "condvar.wait");
                (poisoned.into_inner(), false)
            }
        },
        Some(timeout) => match condvar.wait_timeout(guard, timeout) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(poisoned) => {
                report_poisoned(target, op, "condvar.wait_timeout");
                let (guard, result) = poisoned.into_inner();
                (guard, result.timed_out())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn mutex_lock_recovers_from_poison() {
        let lock = Mutex::new(1);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison mutex");
        }));

        *mutex_lock(&lock, "cache::lock", "test") += 1;
        assert_eq!(*mutex_lock(&lock, "cache::lock", "test"), 2);
    }

    #[test]
    fn rw_write_recovers_from_poison() {
        let lock = RwLock::new(Vec::<u8>::new());
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.write().expect("lock should be acquired");
            panic!("poison rwlock");
        }));

        rw_write(&lock, "cache::lock", "test").push(7);
        assert_eq!(rw_read(&lock, "cache::lock", "test").as_slice(), &[7]);
    }

    #[test]
    fn condvar_wait_reports_timeout() {
        let lock = Mutex::new(());
        let condvar = Condvar::new();
        let mut guard = mutex_lock(&lock, "cache::lock", "test");
        let mut timed_out = false;
        // Nobody notifies, so only spurious wakeups can end a wait early.
        for _ in 0..100 {
            let (next, result) = condvar_wait(
                &condvar,
                guard,
                Some(Duration::from_millis(5)),
                "cache::lock",
                "test",
            );
            guard = next;
            if result {
                timed_out = true;
                break;
            }
        }
        assert!(timed_out);
    }
}
