//! `CommutexLink`: a two-half cooperative lock used to pair a primary
//! connection with a secondary one running on another thread.
//!
//! `CommutexLocker` blocks to take the lock for a normal cross-thread
//! call; `CommutexUnlinker` offers a non-blocking "would this succeed"
//! probe plus an unconditional unlink, used when tearing down several
//! secondary links without letting one blocked link hold up the others.

use std::sync::{Arc, Condvar, Mutex};

struct Shared {
    in_use: bool,
    unlinked: bool,
}

/// One half of a cooperative link between a primary connection and a
/// secondary one. Either half can unlink the pair; once unlinked,
/// neither half can lock again.
#[derive(Clone)]
pub struct CommutexLink {
    shared: Arc<(Mutex<Shared>, Condvar)>,
}

impl CommutexLink {
    pub fn create_pair() -> (CommutexLink, CommutexLink) {
        let shared = Arc::new((Mutex::new(Shared { in_use: false, unlinked: false }), Condvar::new()));
        (CommutexLink { shared: shared.clone() }, CommutexLink { shared })
    }

    pub fn is_unlinked(&self) -> bool {
        self.shared.0.lock().unwrap().unlinked
    }
}

/// Blocks until the link is free and not unlinked, or returns without
/// the lock if the peer already unlinked it.
pub struct CommutexLocker<'a> {
    link: &'a CommutexLink,
    acquired: bool,
}

impl<'a> CommutexLocker<'a> {
    pub fn new(link: &'a CommutexLink) -> Self {
        let (mutex, cvar) = &*link.shared;
        let mut guard = mutex.lock().unwrap();
        loop {
            if guard.unlinked {
                return CommutexLocker { link, acquired: false };
            }
            if !guard.in_use {
                guard.in_use = true;
                return CommutexLocker { link, acquired: true };
            }
            guard = cvar.wait(guard).unwrap();
        }
    }

    pub fn has_lock(&self) -> bool {
        self.acquired
    }
}

impl<'a> Drop for CommutexLocker<'a> {
    fn drop(&mut self) {
        if self.acquired {
            let (mutex, cvar) = &*self.link.shared;
            mutex.lock().unwrap().in_use = false;
            cvar.notify_one();
        }
    }
}

/// Either blocks for the link (like `CommutexLocker`) or, non-blocking,
/// only proceeds if the link is immediately free — used to tear down a
/// batch of secondary links without one blocked link holding up the
/// rest. Dropping without calling `unlink_now()` still unlinks if the
/// lock was acquired, mirroring the C++ RAII unlinker.
pub struct CommutexUnlinker<'a> {
    link: &'a CommutexLink,
    acquired: bool,
    pending: bool,
}

impl<'a> CommutexUnlinker<'a> {
    pub fn new(link: &'a CommutexLink, block: bool) -> Self {
        let (mutex, cvar) = &*link.shared;
        let mut guard = mutex.lock().unwrap();
        if guard.unlinked {
            return CommutexUnlinker { link, acquired: false, pending: false };
        }
        if block {
            while guard.in_use {
                guard = cvar.wait(guard).unwrap();
                if guard.unlinked {
                    return CommutexUnlinker { link, acquired: false, pending: false };
                }
            }
        } else if guard.in_use {
            return CommutexUnlinker { link, acquired: false, pending: false };
        }
        guard.in_use = true;
        CommutexUnlinker { link, acquired: true, pending: true }
    }

    pub fn has_lock(&self) -> bool {
        self.acquired
    }

    /// True iff a non-blocking `new(link, false)` call acquired the lock
    /// (so the caller knows teardown can proceed right now).
    pub fn will_succeed(&self) -> bool {
        self.acquired
    }

    pub fn unlink_now(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.pending {
            let (mutex, cvar) = &*self.link.shared;
            let mut guard = mutex.lock().unwrap();
            guard.unlinked = true;
            guard.in_use = false;
            cvar.notify_all();
            self.pending = false;
        }
    }
}

impl<'a> Drop for CommutexUnlinker<'a> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn locker_acquires_when_free() {
        let (a, _b) = CommutexLink::create_pair();
        let locker = CommutexLocker::new(&a);
        assert!(locker.has_lock());
    }

    #[test]
    fn locker_fails_after_unlink() {
        let (a, b) = CommutexLink::create_pair();
        CommutexUnlinker::new(&a, true).unlink_now();
        assert!(b.is_unlinked());
        let locker = CommutexLocker::new(&b);
        assert!(!locker.has_lock());
    }

    #[test]
    fn non_blocking_unlinker_probe_fails_while_locked() {
        let (a, b) = CommutexLink::create_pair();
        let locker = CommutexLocker::new(&a);
        assert!(locker.has_lock());

        let probe = CommutexUnlinker::new(&b, false);
        assert!(!probe.will_succeed());
        drop(probe);
        assert!(!b.is_unlinked());

        drop(locker);
        let probe2 = CommutexUnlinker::new(&b, false);
        assert!(probe2.will_succeed());
        probe2.unlink_now();
        assert!(a.is_unlinked());
    }

    #[test]
    fn cross_thread_lock_blocks_until_released() {
        let (a, b) = CommutexLink::create_pair();
        let locker = CommutexLocker::new(&a);
        assert!(locker.has_lock());

        let handle = std::thread::spawn(move || {
            let other_locker = CommutexLocker::new(&b);
            assert!(other_locker.has_lock());
        });

        std::thread::sleep(Duration::from_millis(20));
        drop(locker);
        handle.join().unwrap();
    }
}
