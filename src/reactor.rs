//! Single-threaded readiness reactor.
//!
//! Multiplexes socket readiness, one-shot timers and a cross-thread
//! pending queue over one `poll(2)` call per pass.
//!
//! # Architecture
//!
//! ```text
//!  other threads ── ReactorHandle::schedule_pending ──► pending queue ─┐
//!                          │ (wake byte)                               │
//!                          ▼                                           ▼
//!  run_once: poll(fds + wake pipe, nearest deadline) ─► readable ─► writable ─► timers ─► pending
//! ```
//!
//! Each socket has at most one readable and one writable callback;
//! registering again replaces the previous one, registering `None` removes
//! it. Callbacks receive the reactor so they can re-register, arm timers or
//! withdraw themselves.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use buswire::Reactor;
//!
//! let mut reactor = Reactor::new().unwrap();
//! reactor.add_timer(1, Instant::now() + Duration::from_millis(1), |_| println!("tick"));
//! while reactor.has_work() {
//!     reactor.run_once(None).unwrap();
//! }
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::Result;
use crate::transport::{poll_timeout, Interest};

/// Socket readiness callback. Stays registered until replaced or removed.
pub type Callback = Box<dyn FnMut(&mut Reactor)>;

type TimerCallback = Box<dyn FnOnce(&mut Reactor)>;

type PendingCallback = Box<dyn FnOnce(&mut Reactor) + Send>;

struct Registration {
    generation: u64,
    callback: Option<Callback>,
}

struct Timer {
    deadline: Instant,
    generation: u64,
    callback: TimerCallback,
}

#[derive(Default)]
struct PendingQueue {
    entries: Vec<(u64, PendingCallback)>,
}

impl PendingQueue {
    fn insert(&mut self, key: u64, callback: PendingCallback) {
        self.remove(key);
        self.entries.push((key, callback));
    }

    fn remove(&mut self, key: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != key);
        self.entries.len() != before
    }
}

struct Shared {
    pending: Mutex<PendingQueue>,
    waker: UnixStream,
}

impl Shared {
    fn wake(&self) {
        // A full pipe already guarantees a wakeup.
        if let Err(e) = (&self.waker).write(&[1]) {
            if e.kind() != io::ErrorKind::WouldBlock {
                warn!(error = %e, "reactor wakeup failed");
            }
        }
    }
}

/// Thread-safe handle for scheduling work on a [`Reactor`].
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ReactorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}

impl ReactorHandle {
    /// Run `callback` on the reactor's thread during its next pass. A
    /// callback already queued under `key` is replaced.
    pub fn schedule_pending<F>(&self, key: u64, callback: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.shared.pending.lock().insert(key, Box::new(callback));
        self.shared.wake();
    }

    /// Drop the callback queued under `key`. Returns whether one was queued.
    pub fn cancel_pending(&self, key: u64) -> bool {
        self.shared.pending.lock().remove(key)
    }
}

/// Readiness-based scheduler.
pub struct Reactor {
    interests: HashMap<(RawFd, Interest), Registration>,
    timers: HashMap<u64, Timer>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    generation: u64,
    shared: Arc<Shared>,
    wake_rx: UnixStream,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("interests", &self.interests.len())
            .field("timers", &self.timers.len())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    pub fn new() -> Result<Self> {
        let (wake_rx, waker) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        waker.set_nonblocking(true)?;
        Ok(Self {
            interests: HashMap::new(),
            timers: HashMap::new(),
            deadlines: BinaryHeap::new(),
            generation: 0,
            shared: Arc::new(Shared {
                pending: Mutex::new(PendingQueue::default()),
                waker,
            }),
            wake_rx,
        })
    }

    /// Handle for other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: self.shared.clone(),
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Set or clear the readable callback for `fd`.
    ///
    /// The descriptor must stay open while registered; a descriptor the
    /// kernel reports as invalid is unregistered.
    pub fn on_readable(&mut self, fd: RawFd, callback: Option<Callback>) {
        self.set_interest(fd, Interest::Readable, callback);
    }

    /// Set or clear the writable callback for `fd`.
    pub fn on_writable(&mut self, fd: RawFd, callback: Option<Callback>) {
        self.set_interest(fd, Interest::Writable, callback);
    }

    fn set_interest(&mut self, fd: RawFd, interest: Interest, callback: Option<Callback>) {
        match callback {
            Some(callback) => {
                let generation = self.next_generation();
                self.interests.insert(
                    (fd, interest),
                    Registration {
                        generation,
                        callback: Some(callback),
                    },
                );
            }
            None => {
                self.interests.remove(&(fd, interest));
            }
        }
    }

    /// Whether `fd` has a callback for `interest`.
    pub fn is_registered(&self, fd: RawFd, interest: Interest) -> bool {
        self.interests.contains_key(&(fd, interest))
    }

    /// Arm a one-shot timer. A timer already armed under `key` is replaced.
    pub fn add_timer<F>(&mut self, key: u64, deadline: Instant, callback: F)
    where
        F: FnOnce(&mut Reactor) + 'static,
    {
        let generation = self.next_generation();
        self.timers.insert(
            key,
            Timer {
                deadline,
                generation,
                callback: Box::new(callback),
            },
        );
        self.deadlines.push(Reverse((deadline, generation, key)));
    }

    /// Disarm the timer under `key`. Returns whether one was armed.
    pub fn cancel_timer(&mut self, key: u64) -> bool {
        self.timers.remove(&key).is_some()
    }

    /// Same as [`ReactorHandle::schedule_pending`], from the reactor thread.
    pub fn schedule_pending<F>(&self, key: u64, callback: F)
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.shared.pending.lock().insert(key, Box::new(callback));
    }

    pub fn cancel_pending(&self, key: u64) -> bool {
        self.shared.pending.lock().remove(key)
    }

    /// Whether anything is registered, armed or queued.
    pub fn has_work(&self) -> bool {
        !self.interests.is_empty()
            || !self.timers.is_empty()
            || !self.shared.pending.lock().entries.is_empty()
    }

    /// Earliest live deadline, discarding cancelled or replaced heap entries.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, generation, key))) = self.deadlines.peek().copied() {
            match self.timers.get(&key) {
                Some(t) if t.generation == generation => return Some(deadline),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// One pass: wait for readiness bounded by `timeout_hint` (`None` waits
    /// indefinitely) and the nearest timer, then fire ready readable
    /// callbacks, ready writable callbacks, expired timers and queued pending
    /// callbacks, in that order.
    ///
    /// Returns the number of callbacks fired.
    pub fn run_once(&mut self, timeout_hint: Option<Duration>) -> Result<usize> {
        let mut timeout = timeout_hint;
        if let Some(deadline) = self.next_deadline() {
            let until = deadline.saturating_duration_since(Instant::now());
            timeout = Some(timeout.map_or(until, |t| t.min(until)));
        }
        if !self.shared.pending.lock().entries.is_empty() {
            timeout = Some(Duration::ZERO);
        }

        let (readable, writable) = self.wait(timeout)?;
        trace!(
            readable = readable.len(),
            writable = writable.len(),
            "reactor pass"
        );

        let mut fired = 0;
        for fd in readable {
            fired += usize::from(self.fire(fd, Interest::Readable));
        }
        for fd in writable {
            fired += usize::from(self.fire(fd, Interest::Writable));
        }
        fired += self.fire_timers();
        fired += self.fire_pending();
        Ok(fired)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<(Vec<RawFd>, Vec<RawFd>)> {
        let mut fds: Vec<RawFd> = Vec::new();
        let mut flags: Vec<PollFlags> = Vec::new();
        for &(fd, interest) in self.interests.keys() {
            match fds.iter().position(|&f| f == fd) {
                Some(i) => flags[i] |= interest.poll_flags(),
                None => {
                    fds.push(fd);
                    flags.push(interest.poll_flags());
                }
            }
        }

        let revents: Vec<PollFlags> = {
            let mut pollfds = Vec::with_capacity(fds.len() + 1);
            pollfds.push(PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN));
            for (&fd, &f) in fds.iter().zip(&flags) {
                // SAFETY: registered descriptors are required to stay open
                // while registered; the borrow ends with this block.
                let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                pollfds.push(PollFd::new(borrowed, f));
            }
            match poll(&mut pollfds, poll_timeout(timeout)) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok((Vec::new(), Vec::new())),
                Err(e) => return Err(io::Error::from(e).into()),
            }
            pollfds
                .iter()
                .map(|p| p.revents().unwrap_or(PollFlags::empty()))
                .collect()
        };

        if !revents[0].is_empty() {
            self.drain_wakeups();
        }

        let mut readable = Vec::new();
        let mut writable = Vec::new();
        let failed = PollFlags::POLLERR | PollFlags::POLLHUP;
        for (i, &fd) in fds.iter().enumerate() {
            let ev = revents[i + 1];
            if ev.contains(PollFlags::POLLNVAL) {
                warn!(fd, "dropping registrations for invalid descriptor");
                self.interests.remove(&(fd, Interest::Readable));
                self.interests.remove(&(fd, Interest::Writable));
                continue;
            }
            if ev.intersects(PollFlags::POLLIN | failed) && flags[i].contains(PollFlags::POLLIN) {
                readable.push(fd);
            }
            if ev.intersects(PollFlags::POLLOUT | failed) && flags[i].contains(PollFlags::POLLOUT) {
                writable.push(fd);
            }
        }
        Ok((readable, writable))
    }

    fn drain_wakeups(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.wake_rx.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// Run the callback for `(fd, interest)` if still registered, putting it
    /// back unless it replaced or removed itself.
    fn fire(&mut self, fd: RawFd, interest: Interest) -> bool {
        let key = (fd, interest);
        let Some(reg) = self.interests.get_mut(&key) else {
            return false;
        };
        let generation = reg.generation;
        let Some(mut callback) = reg.callback.take() else {
            return false;
        };
        callback(self);
        if let Some(reg) = self.interests.get_mut(&key) {
            if reg.generation == generation {
                reg.callback = Some(callback);
            }
        }
        true
    }

    /// Fire timers expired at entry. Timers armed by a callback wait for
    /// the next pass, even when already due.
    fn fire_timers(&mut self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            if let Some(Reverse((_, generation, key))) = self.deadlines.pop() {
                expired.push((generation, key));
            }
        }

        let mut fired = 0;
        for (generation, key) in expired {
            // an earlier callback may have cancelled or replaced this one
            if self.timers.get(&key).map(|t| t.generation) != Some(generation) {
                continue;
            }
            if let Some(timer) = self.timers.remove(&key) {
                (timer.callback)(self);
                fired += 1;
            }
        }
        fired
    }

    fn fire_pending(&mut self) -> usize {
        let entries = std::mem::take(&mut self.shared.pending.lock().entries);
        let fired = entries.len();
        for (_, callback) in entries {
            callback(self);
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::fd::AsRawFd;
    use std::rc::Rc;

    #[test]
    fn test_timer_ordering() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let now = Instant::now();
        for (key, ms) in [(2u64, 20u64), (1, 5)] {
            let order = order.clone();
            reactor.add_timer(key, now + Duration::from_millis(ms), move |_| {
                order.borrow_mut().push(key)
            });
        }
        while reactor.has_work() {
            reactor.run_once(None).unwrap();
        }
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_cancel_and_replace_timer() {
        let mut reactor = Reactor::new().unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let soon = Instant::now();
        let h = hits.clone();
        reactor.add_timer(1, soon, move |_| h.borrow_mut().push("first"));
        let h = hits.clone();
        reactor.add_timer(1, soon, move |_| h.borrow_mut().push("second"));
        let h = hits.clone();
        reactor.add_timer(2, soon, move |_| h.borrow_mut().push("cancelled"));
        assert!(reactor.cancel_timer(2));
        assert!(!reactor.cancel_timer(2));

        reactor.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), vec!["second"]);
        assert!(!reactor.has_work());
    }

    #[test]
    fn test_timer_can_rearm() {
        let mut reactor = Reactor::new().unwrap();
        let count = Rc::new(RefCell::new(0));
        fn tick(count: Rc<RefCell<u32>>) -> impl FnOnce(&mut Reactor) {
            move |r| {
                *count.borrow_mut() += 1;
                if *count.borrow() < 3 {
                    r.add_timer(7, Instant::now(), tick(count.clone()));
                }
            }
        }
        reactor.add_timer(7, Instant::now(), tick(count.clone()));
        while reactor.has_work() {
            reactor.run_once(None).unwrap();
        }
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn test_rearmed_timer_waits_for_next_pass() {
        let mut reactor = Reactor::new().unwrap();
        let count = Rc::new(RefCell::new(0u32));
        let past = Instant::now() - Duration::from_secs(1);
        fn again(count: Rc<RefCell<u32>>, at: Instant) -> impl FnOnce(&mut Reactor) {
            move |r| {
                *count.borrow_mut() += 1;
                r.add_timer(3, at, again(count.clone(), at));
            }
        }
        reactor.add_timer(3, past, again(count.clone(), past));

        for pass in 1..=3 {
            assert_eq!(reactor.run_once(Some(Duration::ZERO)).unwrap(), 1);
            assert_eq!(*count.borrow(), pass);
        }
        assert!(reactor.cancel_timer(3));
    }

    #[test]
    fn test_timer_cancelled_by_earlier_callback() {
        let mut reactor = Reactor::new().unwrap();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let due = Instant::now();
        let h = hits.clone();
        reactor.add_timer(1, due, move |r| {
            h.borrow_mut().push(1);
            r.cancel_timer(2);
        });
        let h = hits.clone();
        reactor.add_timer(2, due + Duration::from_nanos(1), move |_| h.borrow_mut().push(2));
        std::thread::sleep(Duration::from_millis(1));

        assert_eq!(reactor.run_once(Some(Duration::ZERO)).unwrap(), 1);
        assert_eq!(*hits.borrow(), vec![1]);
        assert!(!reactor.has_work());
    }

    #[test]
    fn test_readable_fires_and_replaces() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let hits = Rc::new(RefCell::new(Vec::new()));

        let h = hits.clone();
        reactor.on_readable(fd, Some(Box::new(move |_| h.borrow_mut().push("old"))));
        let h = hits.clone();
        reactor.on_readable(fd, Some(Box::new(move |_| h.borrow_mut().push("new"))));
        assert!(reactor.is_registered(fd, Interest::Readable));

        b.write_all(b"x").unwrap();
        assert_eq!(reactor.run_once(Some(Duration::from_secs(1))).unwrap(), 1);
        assert_eq!(*hits.borrow(), vec!["new"]);

        // level-triggered: still readable, still registered
        reactor.run_once(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(hits.borrow().len(), 2);

        reactor.on_readable(fd, None);
        assert!(!reactor.has_work());
    }

    #[test]
    fn test_callback_can_remove_itself() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let hits = Rc::new(RefCell::new(0));
        let h = hits.clone();
        reactor.on_readable(
            fd,
            Some(Box::new(move |r| {
                *h.borrow_mut() += 1;
                r.on_readable(fd, None);
            })),
        );
        b.write_all(b"x").unwrap();
        reactor.run_once(Some(Duration::from_secs(1))).unwrap();
        reactor.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(*hits.borrow(), 1);
        assert!(!reactor.is_registered(fd, Interest::Readable));
    }

    #[test]
    fn test_readable_before_writable() {
        let mut reactor = Reactor::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let order = Rc::new(RefCell::new(Vec::new()));
        let o = order.clone();
        reactor.on_writable(fd, Some(Box::new(move |_| o.borrow_mut().push("w"))));
        let o = order.clone();
        reactor.on_readable(fd, Some(Box::new(move |_| o.borrow_mut().push("r"))));
        b.write_all(b"x").unwrap();
        reactor.run_once(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(*order.borrow(), vec!["r", "w"]);
    }

    #[test]
    fn test_pending_from_other_thread_wakes_wait() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let (tx, rx) = std::sync::mpsc::channel();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.schedule_pending(1, move |_| tx.send("ran").unwrap());
        });
        let started = Instant::now();
        let mut fired = 0;
        while fired == 0 {
            fired = reactor.run_once(Some(Duration::from_secs(10))).unwrap();
        }
        worker.join().unwrap();
        assert_eq!(rx.try_recv().unwrap(), "ran");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel_pending() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        handle.schedule_pending(3, |_| panic!("cancelled callback ran"));
        assert!(handle.cancel_pending(3));
        assert!(!handle.cancel_pending(3));
        assert_eq!(reactor.run_once(Some(Duration::ZERO)).unwrap(), 0);
    }
}
