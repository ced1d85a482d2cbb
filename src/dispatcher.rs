//! `EventDispatcher`: the fd-to-handler routing table on top of a
//! `Poller`, plus deadline-ordered, millisecond-granularity one-shot and
//! repeating timers (`TimerId`, `add_timer`/`cancel_timer`) drained
//! before every readiness delivery.
//!
//! Handler lookup misses are logged rather than treated as errors, since
//! a handler can legitimately have removed itself from a *previous*
//! event earlier in the same batch. Timers live in one flat
//! deadline-ordered collection rather than per-connection sub-dispatchers.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::poller::{Interest, Poller};

pub trait IoHandler: Send {
    fn handle_readable(&mut self) {}
    fn handle_writable(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    deadline: Instant,
    id: TimerId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

struct TimerState {
    callback: Box<dyn FnMut() + Send>,
    period: Option<Duration>,
    cancelled: bool,
}

pub struct EventDispatcher {
    poller: Box<dyn Poller>,
    handlers: HashMap<RawFd, Box<dyn IoHandler>>,
    timer_heap: BinaryHeap<Reverse<TimerEntry>>,
    timers: HashMap<TimerId, TimerState>,
    next_timer_id: u64,
}

impl EventDispatcher {
    pub fn new(poller: Box<dyn Poller>) -> Self {
        EventDispatcher {
            poller,
            handlers: HashMap::new(),
            timer_heap: BinaryHeap::new(),
            timers: HashMap::new(),
            next_timer_id: 1,
        }
    }

    pub fn register(&mut self, fd: RawFd, interest: Interest, handler: Box<dyn IoHandler>) -> Result<()> {
        self.poller.add(fd, interest)?;
        self.handlers.insert(fd, handler);
        Ok(())
    }

    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.handlers.remove(&fd);
        self.poller.remove(fd)
    }

    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.poller.set_interest(fd, interest)
    }

    pub fn interrupt(&self) {
        self.poller.interrupt();
    }

    /// Schedule `callback` to run after `delay`; if `period` is `Some`,
    /// it reschedules itself after firing.
    pub fn add_timer(&mut self, delay: Duration, period: Option<Duration>, callback: Box<dyn FnMut() + Send>) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.timers.insert(id, TimerState { callback, period, cancelled: false });
        self.timer_heap.push(Reverse(TimerEntry { deadline: Instant::now() + delay, id }));
        id
    }

    pub fn cancel_timer(&mut self, id: TimerId) {
        if let Some(t) = self.timers.get_mut(&id) {
            t.cancelled = true;
        }
        self.timers.remove(&id);
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timer_heap.peek().map(|Reverse(e)| e.deadline)
    }

    fn drain_due_timers(&mut self) {
        loop {
            let now = Instant::now();
            let Some(deadline) = self.next_deadline() else { break };
            if deadline > now {
                break;
            }
            let Reverse(entry) = self.timer_heap.pop().unwrap();
            let Some(state) = self.timers.get_mut(&entry.id) else { continue };
            if state.cancelled {
                self.timers.remove(&entry.id);
                continue;
            }
            (state.callback)();
            match state.period {
                Some(period) => {
                    self.timer_heap.push(Reverse(TimerEntry { deadline: now + period, id: entry.id }));
                }
                None => {
                    self.timers.remove(&entry.id);
                }
            }
        }
    }

    fn clamp_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        let until_next_timer = self.next_deadline().map(|d| d.saturating_duration_since(Instant::now()));
        match (timeout, until_next_timer) {
            (Some(t), Some(n)) => Some(t.min(n)),
            (Some(t), None) => Some(t),
            (None, Some(n)) => Some(n),
            (None, None) => None,
        }
    }

    /// Wait for readiness or a due timer, then deliver both. Returns
    /// `Ok(false)` iff interrupted by `interrupt()`.
    pub fn dispatch(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.drain_due_timers();
        let effective_timeout = self.clamp_timeout(timeout);
        let readiness = match self.poller.poll(effective_timeout)? {
            None => return Ok(false),
            Some(r) => r,
        };

        // Snapshot first: a handler invoked here may remove itself (or
        // another fd in this same batch) from `self.handlers`, so every
        // dispatch re-checks existence immediately before the call.
        for r in readiness {
            if r.readable {
                if !self.handlers.contains_key(&r.fd) {
                    log::trace!("dispatcher: readable event for unregistered fd {}", r.fd);
                } else if let Some(h) = self.handlers.get_mut(&r.fd) {
                    h.handle_readable();
                }
            }
            if r.writable && self.handlers.contains_key(&r.fd) {
                if let Some(h) = self.handlers.get_mut(&r.fd) {
                    h.handle_writable();
                }
            }
        }

        self.drain_due_timers();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Readiness;
    use std::sync::{Arc, Mutex};

    struct FakePoller {
        queue: Vec<Option<Vec<Readiness>>>,
        interrupted: Arc<Mutex<u32>>,
    }

    impl Poller for FakePoller {
        fn poll(&mut self, _timeout: Option<Duration>) -> Result<Option<Vec<Readiness>>> {
            Ok(self.queue.pop().unwrap_or(Some(Vec::new())))
        }
        fn interrupt(&self) {
            *self.interrupted.lock().unwrap() += 1;
        }
        fn add(&mut self, _fd: RawFd, _interest: Interest) -> Result<()> {
            Ok(())
        }
        fn remove(&mut self, _fd: RawFd) -> Result<()> {
            Ok(())
        }
        fn set_interest(&mut self, _fd: RawFd, _interest: Interest) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn timer_fires_once() {
        let poller = FakePoller { queue: vec![Some(Vec::new())], interrupted: Arc::new(Mutex::new(0)) };
        let mut dispatcher = EventDispatcher::new(Box::new(poller));
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();
        dispatcher.add_timer(Duration::from_millis(0), None, Box::new(move || *fired2.lock().unwrap() += 1));
        dispatcher.dispatch(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
        dispatcher.dispatch(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn cancel_timer_prevents_firing() {
        let poller = FakePoller { queue: vec![Some(Vec::new())], interrupted: Arc::new(Mutex::new(0)) };
        let mut dispatcher = EventDispatcher::new(Box::new(poller));
        let fired = Arc::new(Mutex::new(0));
        let fired2 = fired.clone();
        let id = dispatcher.add_timer(Duration::from_millis(0), None, Box::new(move || *fired2.lock().unwrap() += 1));
        dispatcher.cancel_timer(id);
        dispatcher.dispatch(Some(Duration::from_millis(1))).unwrap();
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn interrupted_poll_returns_false() {
        let poller = FakePoller { queue: vec![None], interrupted: Arc::new(Mutex::new(0)) };
        let mut dispatcher = EventDispatcher::new(Box::new(poller));
        assert!(!dispatcher.dispatch(None).unwrap());
    }
}
