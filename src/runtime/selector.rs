//! Readiness multiplexer.
//!
//! Tracks, per file descriptor, the continuations waiting for read or write
//! readiness and resumes them when the OS reports the fd ready. The OS query
//! goes through mio (epoll on Linux, kqueue on macOS). Registrations with the
//! poller are brought in line with the waiter lists right before each query,
//! so a query covers exactly the fds somebody is waiting on plus the optional
//! extra fd passed to [`Selector::tick`].
//!
//! Every resumed waiter is told why it was resumed (see [`Wakeup`]), which is
//! how suspended sessions learn about cancellation and shutdown.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{self, Context, Waker};
use std::time::Duration;
use tracing::{debug, trace, warn};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Why a waiter was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The OS reported the fd ready in the awaited direction.
    Ready,
    /// The fd's registrations were cancelled.
    Cancelled,
    /// The selector was shut down.
    Shutdown,
}

/// Shared cell through which a waiter learns its [`Wakeup`].
pub type WaitSlot = Rc<Cell<Option<Wakeup>>>;

struct Waiter {
    waker: Waker,
    slot: WaitSlot,
}

impl Waiter {
    fn fire(self, wakeup: Wakeup) {
        self.slot.set(Some(wakeup));
        self.waker.wake();
    }
}

pub struct Selector {
    poll: Poll,
    events: Events,
    readers: HashMap<RawFd, Vec<Waiter>>,
    writers: HashMap<RawFd, Vec<Waiter>>,
    /// Interest currently registered with the OS poller, per fd.
    registered: HashMap<RawFd, Interest>,
    timeout: Duration,
    queries: u64,
    shut_down: bool,
}

impl Selector {
    /// Create a selector whose readiness queries block for at most `timeout`.
    pub fn new(timeout: Duration) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            readers: HashMap::new(),
            writers: HashMap::new(),
            registered: HashMap::new(),
            timeout,
            queries: 0,
            shut_down: false,
        })
    }

    /// Append a waiter to the (fd, direction) list.
    ///
    /// After shutdown the waiter is resumed immediately with
    /// [`Wakeup::Shutdown`] instead of being queued.
    pub fn register(&mut self, fd: RawFd, direction: Direction, waker: Waker) -> WaitSlot {
        let slot: WaitSlot = Rc::new(Cell::new(None));
        let waiter = Waiter {
            waker,
            slot: Rc::clone(&slot),
        };

        if self.shut_down {
            waiter.fire(Wakeup::Shutdown);
            return slot;
        }

        trace!(fd, ?direction, "waiter registered");
        self.waiters_mut(direction)
            .entry(fd)
            .or_default()
            .push(waiter);
        slot
    }

    /// Remove a waiter that no longer wants to be resumed.
    pub fn withdraw(&mut self, fd: RawFd, direction: Direction, slot: &WaitSlot) {
        let waiters = self.waiters_mut(direction);
        if let Some(list) = waiters.get_mut(&fd) {
            list.retain(|waiter| !Rc::ptr_eq(&waiter.slot, slot));
            if list.is_empty() {
                waiters.remove(&fd);
            }
        }
    }

    /// Run one readiness query and resume every waiter whose fd became ready.
    ///
    /// `extra` is included in the read set even when nobody waits on it.
    /// Returns the number of waiters resumed. A timeout or a failed query
    /// resumes nothing.
    pub fn tick(&mut self, extra: Option<RawFd>) -> usize {
        if self.shut_down {
            return 0;
        }

        // Fds the poller refused are handed back to their waiters so the
        // next syscall on them reports the real error.
        let mut ready: Vec<(RawFd, bool, bool)> = self
            .sync_registrations(extra)
            .into_iter()
            .map(|fd| (fd, true, true))
            .collect();

        self.queries += 1;
        if let Err(e) = self.poll.poll(&mut self.events, Some(self.timeout)) {
            if e.kind() == io::ErrorKind::Interrupted {
                trace!("readiness query interrupted");
            } else {
                warn!(error = %e, "readiness query failed");
            }
            self.events.clear();
        }

        for event in self.events.iter() {
            let fd = event.token().0 as RawFd;
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            ready.push((fd, readable, writable));
        }

        let mut woken = Vec::new();
        for (fd, readable, writable) in ready {
            if readable {
                if let Some(list) = self.readers.remove(&fd) {
                    woken.extend(list);
                }
            }
            if writable {
                if let Some(list) = self.writers.remove(&fd) {
                    woken.extend(list);
                }
            }
        }

        let count = woken.len();
        if count > 0 {
            trace!(count, "resuming ready waiters");
        }
        for waiter in woken {
            waiter.fire(Wakeup::Ready);
        }
        count
    }

    /// Drop the fd from the poller and resume its waiters with
    /// [`Wakeup::Cancelled`], in both directions.
    pub fn cancel(&mut self, fd: RawFd) -> usize {
        let mut cancelled = self.readers.remove(&fd).unwrap_or_default();
        cancelled.extend(self.writers.remove(&fd).unwrap_or_default());

        if self.registered.remove(&fd).is_some() {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(fd, error = %e, "deregister failed");
            }
        }

        let count = cancelled.len();
        if count > 0 {
            debug!(fd, count, "cancelling waiters");
        }
        for waiter in cancelled {
            waiter.fire(Wakeup::Cancelled);
        }
        count
    }

    /// Resume every waiter with [`Wakeup::Shutdown`] without querying the OS.
    ///
    /// The selector stays shut down: later ticks do nothing and later
    /// registrations resolve immediately.
    pub fn shutdown(&mut self) -> usize {
        self.shut_down = true;

        let mut waiters = Vec::new();
        for (_, list) in self.readers.drain() {
            waiters.extend(list);
        }
        for (_, list) in self.writers.drain() {
            waiters.extend(list);
        }

        let registry = self.poll.registry();
        for (fd, _) in self.registered.drain() {
            if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                debug!(fd, error = %e, "deregister failed");
            }
        }

        let count = waiters.len();
        debug!(count, "selector shutting down");
        for waiter in waiters {
            waiter.fire(Wakeup::Shutdown);
        }
        count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Number of waiters currently queued.
    pub fn pending(&self) -> usize {
        self.readers.values().map(Vec::len).sum::<usize>()
            + self.writers.values().map(Vec::len).sum::<usize>()
    }

    /// Number of OS readiness queries issued so far.
    pub fn queries(&self) -> u64 {
        self.queries
    }

    fn waiters_mut(&mut self, direction: Direction) -> &mut HashMap<RawFd, Vec<Waiter>> {
        match direction {
            Direction::Read => &mut self.readers,
            Direction::Write => &mut self.writers,
        }
    }

    /// Register, re-register or deregister fds so the poller's interest set
    /// matches the waiter lists. Returns the fds that could not be registered.
    fn sync_registrations(&mut self, extra: Option<RawFd>) -> Vec<RawFd> {
        let mut desired: HashMap<RawFd, Interest> = HashMap::new();
        for &fd in self.readers.keys().chain(extra.iter()) {
            desired.insert(fd, Interest::READABLE);
        }
        for &fd in self.writers.keys() {
            desired
                .entry(fd)
                .and_modify(|interest| *interest = *interest | Interest::WRITABLE)
                .or_insert(Interest::WRITABLE);
        }

        let registry = self.poll.registry();

        let stale: Vec<RawFd> = self
            .registered
            .keys()
            .filter(|fd| !desired.contains_key(fd))
            .copied()
            .collect();
        for fd in stale {
            self.registered.remove(&fd);
            if let Err(e) = registry.deregister(&mut SourceFd(&fd)) {
                debug!(fd, error = %e, "deregister failed");
            }
        }

        let mut failed = Vec::new();
        for (fd, interest) in desired {
            let result = match self.registered.get(&fd) {
                Some(current) if *current == interest => continue,
                Some(_) => registry.reregister(&mut SourceFd(&fd), Token(fd as usize), interest),
                None => registry.register(&mut SourceFd(&fd), Token(fd as usize), interest),
            };
            match result {
                Ok(()) => {
                    self.registered.insert(fd, interest);
                }
                Err(e) => {
                    warn!(fd, error = %e, "failed to register fd for readiness");
                    self.registered.remove(&fd);
                    failed.push(fd);
                }
            }
        }
        failed
    }
}

/// Suspension point: resolves once the fd is ready in `direction`, or with the
/// reason the wait was cut short.
pub struct WaitReady {
    selector: Rc<RefCell<Selector>>,
    fd: RawFd,
    direction: Direction,
    slot: Option<WaitSlot>,
}

impl WaitReady {
    pub fn new(selector: Rc<RefCell<Selector>>, fd: RawFd, direction: Direction) -> Self {
        Self {
            selector,
            fd,
            direction,
            slot: None,
        }
    }
}

impl Future for WaitReady {
    type Output = Wakeup;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> task::Poll<Wakeup> {
        let this = self.get_mut();
        match this.slot.as_ref().map(|slot| slot.get()) {
            Some(Some(wakeup)) => {
                this.slot = None;
                task::Poll::Ready(wakeup)
            }
            Some(None) => task::Poll::Pending,
            None => {
                let mut selector = this.selector.borrow_mut();
                if selector.is_shut_down() {
                    return task::Poll::Ready(Wakeup::Shutdown);
                }
                let slot = selector.register(this.fd, this.direction, cx.waker().clone());
                drop(selector);
                this.slot = Some(slot);
                task::Poll::Pending
            }
        }
    }
}

impl Drop for WaitReady {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if slot.get().is_none() {
                if let Ok(mut selector) = self.selector.try_borrow_mut() {
                    selector.withdraw(self.fd, self.direction, &slot);
                }
            }
        }
    }
}
