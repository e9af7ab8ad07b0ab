use crate::sync::{AtomicU64, AtomicUsize, Condvar, Mutex, Ordering, lock, wait};

/// Event count used to park idle workers without losing wake-ups.
///
/// A waiter announces itself with [`prepare_wait`](Self::prepare_wait),
/// re-checks every queue, and then either backs out with
/// [`cancel_wait`](Self::cancel_wait) or sleeps with
/// [`commit_wait`](Self::commit_wait). A notification issued at any point after
/// `prepare_wait` makes `commit_wait` return.
#[derive(Debug)]
pub(crate) struct Notifier {
    epoch: AtomicU64,
    waiters: AtomicUsize,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
            waiters: AtomicUsize::new(0),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Register as a waiter. The returned ticket is handed to `commit_wait`.
    pub(crate) fn prepare_wait(&self) -> u64 {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_wait(&self) {
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Sleep until a notification newer than `ticket`.
    pub(crate) fn commit_wait(&self, ticket: u64) {
        let mut guard = lock(&self.lock);
        while self.epoch.load(Ordering::SeqCst) == ticket {
            guard = wait(&self.wakeup, guard);
        }
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Wake one sleeping waiter, or all of them.
    pub(crate) fn notify(&self, all: bool) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        // Taking the lock orders the epoch bump before a waiter's check.
        let _guard = lock(&self.lock);
        if all {
            self.wakeup.notify_all();
        } else {
            self.wakeup.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn num_waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}
