use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

/// A mutex that tracks how many callers are currently blocked trying to
/// acquire it.
///
/// The background dedup sweeper holds this lock only opportunistically
/// (`try_lock`) and, once in, checks [`WaitCountMutex::wait_count`] between
/// entries so it backs off the moment a connection thread starts waiting on
/// real work instead of starving it.
#[derive(Debug, Default)]
pub struct WaitCountMutex<T> {
    waiters: AtomicUsize,
    inner: Mutex<T>,
}

impl<T> WaitCountMutex<T> {
    pub fn new(value: T) -> Self {
        Self { waiters: AtomicUsize::new(0), inner: Mutex::new(value) }
    }

    /// Blocking lock, incrementing the waiter count for its duration.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.lock();
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        guard
    }

    /// Non-blocking lock attempt; never increments the waiter count since a
    /// failed `try_lock` never actually waits.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// Number of callers currently blocked in [`WaitCountMutex::lock`].
    pub fn wait_count(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_count_reflects_blocked_callers() {
        let m = Arc::new(WaitCountMutex::new(0u32));
        let guard = m.lock();
        assert_eq!(m.wait_count(), 0);

        let m2 = m.clone();
        let handle = thread::spawn(move || {
            let _g = m2.lock();
        });

        // Give the spawned thread time to block on the held lock.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(m.wait_count(), 1);

        drop(guard);
        handle.join().unwrap();
        assert_eq!(m.wait_count(), 0);
    }
}
