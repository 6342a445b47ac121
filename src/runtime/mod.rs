//! Cooperative single-threaded runtime.
//!
//! - `Scheduler` / `Task`: eager, single-owner resumable computations with
//!   continuation chaining
//! - `Selector`: per-fd waiter registry over mio readiness polling
//! - `RecvBuffer` / `Connection`: per-connection socket state
//!
//! `Runtime` ties the scheduler and selector together. One `tick` runs a
//! single readiness query and then resumes everything that became ready,
//! including continuations of computations that completed along the way.

mod buffer;
mod connection;
mod selector;
mod task;

pub(crate) use connection::Connection;
pub(crate) use selector::Wakeup;
pub(crate) use task::{Task, TaskError};

use selector::{Direction, Selector, WaitReady};
use task::Scheduler;

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use tracing::trace;

/// Handle to the scheduler and selector. Clones share the same state.
#[derive(Clone)]
pub struct Runtime {
    scheduler: Scheduler,
    selector: Rc<RefCell<Selector>>,
}

impl Runtime {
    /// `poll_interval` bounds how long one tick waits for readiness.
    pub fn new(poll_interval: Duration) -> io::Result<Self> {
        Ok(Self {
            scheduler: Scheduler::new(),
            selector: Rc::new(RefCell::new(Selector::new(poll_interval)?)),
        })
    }

    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.scheduler.spawn(future)
    }

    /// Suspend until `fd` is readable.
    pub fn readable(&self, fd: RawFd) -> WaitReady {
        WaitReady::new(Rc::clone(&self.selector), fd, Direction::Read)
    }

    /// Suspend until `fd` is writable.
    pub fn writable(&self, fd: RawFd) -> WaitReady {
        WaitReady::new(Rc::clone(&self.selector), fd, Direction::Write)
    }

    /// One readiness query, then resume everything it made ready.
    /// Returns the number of waiters the query resumed.
    pub fn tick(&self, extra: Option<RawFd>) -> usize {
        let woken = self.selector.borrow_mut().tick(extra);
        let resumed = self.scheduler.run_ready();
        if resumed > 0 {
            let waiting = self.selector.borrow().pending();
            trace!(woken, resumed, waiting, "tick");
        }
        woken
    }

    /// Cancel every wait on `fd`; the waiters observe `Wakeup::Cancelled`.
    pub fn cancel(&self, fd: RawFd) -> usize {
        let cancelled = self.selector.borrow_mut().cancel(fd);
        self.scheduler.run_ready();
        cancelled
    }

    /// Resume every waiter with `Wakeup::Shutdown` and let them run.
    pub fn shutdown(&self) -> usize {
        let woken = self.selector.borrow_mut().shutdown();
        self.scheduler.run_ready();
        woken
    }

    /// Drive the runtime until `task` completes and return its result.
    ///
    /// Bridges ordinary code into the cooperative world; never call it from
    /// inside a task.
    pub fn block_on<T>(&self, mut task: Task<T>) -> Result<T, TaskError> {
        loop {
            if let Some(result) = task.try_take() {
                return result;
            }
            if self.scheduler.run_ready() == 0 && !task.is_done() {
                self.tick(None);
            }
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn selector(&self) -> &Rc<RefCell<Selector>> {
        &self.selector
    }
}
