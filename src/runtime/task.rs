//! Resumable computations and the scheduler that drives them.
//!
//! A [`Task`] is a single-owner handle to a boxed future stored in the
//! [`Scheduler`]'s slab. Tasks start eagerly: `spawn` polls the future once
//! before returning, so it runs until its first suspension point.
//!
//! Suspension is expressed with ordinary wakers. Each task owns one waker that
//! pushes its key onto a FIFO ready queue; `run_ready` pops keys and resumes the
//! matching futures. When a task completes it wakes its stored continuation
//! (the task awaiting it), which is queued and resumed in the same drain.
//!
//! Panics raised while polling a task body are caught at the poll boundary and
//! stored as [`TaskError::Panicked`]. They surface only when the owner awaits or
//! drains the task.

use slab::Slab;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tracing::trace;

/// Type-erased future stored by the scheduler. The typed result is written to
/// a slot shared with the owning [`Task`].
type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Slab index plus generation, so a stale waker never resumes a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskKey {
    index: usize,
    generation: u64,
}

/// Failure captured inside a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task body panicked.
    Panicked(String),
    /// The result was already taken from this handle.
    Consumed,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Panicked(msg) => write!(f, "task panicked: {}", msg),
            TaskError::Consumed => write!(f, "task result already consumed"),
        }
    }
}

impl std::error::Error for TaskError {}

struct TaskSlot {
    generation: u64,
    /// `None` while the future is being polled.
    future: Option<LocalFuture>,
    /// The computation to resume when this one completes.
    continuation: Option<Waker>,
    waker: Waker,
}

struct Shared {
    slots: RefCell<Slab<TaskSlot>>,
    next_generation: Cell<u64>,
    ready_tx: mpsc::Sender<TaskKey>,
    ready_rx: mpsc::Receiver<TaskKey>,
}

/// Waker that re-enqueues a task with its scheduler.
struct TaskWaker {
    key: TaskKey,
    ready: mpsc::Sender<TaskKey>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        // The receiver lives as long as the scheduler; a send error only means
        // the scheduler is gone and there is nothing left to resume.
        let _ = self.ready.send(self.key);
    }
}

/// Single-threaded cooperative scheduler.
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = mpsc::channel();
        Self {
            shared: Rc::new(Shared {
                slots: RefCell::new(Slab::new()),
                next_generation: Cell::new(0),
                ready_tx,
                ready_rx,
            }),
        }
    }

    /// Create a task and run it until its first suspension.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let output = Rc::new(RefCell::new(None));
        let guarded = Guarded {
            inner: Box::pin(future),
            output: Rc::clone(&output),
        };

        let key = {
            let mut slots = self.shared.slots.borrow_mut();
            let generation = self.shared.next_generation.get();
            self.shared.next_generation.set(generation + 1);

            let entry = slots.vacant_entry();
            let key = TaskKey {
                index: entry.key(),
                generation,
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                key,
                ready: self.shared.ready_tx.clone(),
            }));
            entry.insert(TaskSlot {
                generation,
                future: Some(Box::pin(guarded)),
                continuation: None,
                waker,
            });
            key
        };

        trace!(task = key.index, "task spawned");
        self.resume(key);

        Task {
            key: Some(key),
            scheduler: self.clone(),
            output,
        }
    }

    /// Resume every task whose waker fired, including tasks woken while
    /// draining. Returns the number of resumptions.
    pub fn run_ready(&self) -> usize {
        let mut resumed = 0;
        while let Ok(key) = self.shared.ready_rx.try_recv() {
            if self.resume(key) {
                resumed += 1;
            }
        }
        resumed
    }

    /// Number of tasks that have not completed or been abandoned.
    pub fn len(&self) -> usize {
        self.shared.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poll one task. A completed, abandoned or already-running task is a no-op.
    fn resume(&self, key: TaskKey) -> bool {
        let (mut future, waker) = {
            let mut slots = self.shared.slots.borrow_mut();
            let slot = match slots.get_mut(key.index) {
                Some(slot) if slot.generation == key.generation => slot,
                _ => return false,
            };
            match slot.future.take() {
                Some(future) => (future, slot.waker.clone()),
                None => return false,
            }
        };

        // No borrow is held here: the future may spawn, await or drop tasks.
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Pending => {
                let abandoned = {
                    let mut slots = self.shared.slots.borrow_mut();
                    match slots.get_mut(key.index) {
                        Some(slot) if slot.generation == key.generation => {
                            slot.future = Some(future);
                            None
                        }
                        _ => Some(future),
                    }
                };
                drop(abandoned);
            }
            Poll::Ready(()) => {
                trace!(task = key.index, "task completed");
                let continuation = self.remove(key).and_then(|slot| slot.continuation);
                drop(future);
                if let Some(continuation) = continuation {
                    continuation.wake();
                }
            }
        }
        true
    }

    fn set_continuation(&self, key: TaskKey, waker: &Waker) {
        let mut slots = self.shared.slots.borrow_mut();
        if let Some(slot) = slots.get_mut(key.index) {
            if slot.generation != key.generation {
                return;
            }
            match &slot.continuation {
                Some(existing) if existing.will_wake(waker) => {}
                _ => slot.continuation = Some(waker.clone()),
            }
        }
    }

    /// Detach a slot. The caller drops it after the borrow is released, since
    /// dropping a future can drop other task handles.
    fn remove(&self, key: TaskKey) -> Option<TaskSlot> {
        let mut slots = self.shared.slots.borrow_mut();
        match slots.get(key.index) {
            Some(slot) if slot.generation == key.generation => Some(slots.remove(key.index)),
            _ => None,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Owning handle to a computation producing `T`.
///
/// Awaiting a task suspends the caller until the task completes and yields its
/// result, or the failure captured inside it. Dropping an unfinished task
/// abandons it: its future is dropped without being resumed again.
pub struct Task<T> {
    key: Option<TaskKey>,
    scheduler: Scheduler,
    output: Rc<RefCell<Option<Result<T, TaskError>>>>,
}

impl<T> Task<T> {
    /// Whether the computation has finished. A handle whose result was already
    /// taken counts as done.
    pub fn is_done(&self) -> bool {
        self.key.is_none() || self.output.borrow().is_some()
    }

    /// Take the result if the computation has finished.
    pub fn try_take(&mut self) -> Option<Result<T, TaskError>> {
        if self.key.is_none() {
            return Some(Err(TaskError::Consumed));
        }
        let result = self.output.borrow_mut().take()?;
        self.key = None;
        Some(result)
    }
}

impl<T> Future for Task<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.try_take() {
            return Poll::Ready(result);
        }
        if let Some(key) = this.key {
            this.scheduler.set_continuation(key, cx.waker());
        }
        Poll::Pending
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            if let Some(slot) = self.scheduler.remove(key) {
                trace!(task = key.index, "task abandoned");
                drop(slot);
            }
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Wraps a task body: stores its output (or the panic it raised) in the slot
/// shared with the handle.
struct Guarded<F: Future> {
    inner: Pin<Box<F>>,
    output: Rc<RefCell<Option<Result<F::Output, TaskError>>>>,
}

impl<F: Future> Future for Guarded<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let polled = panic::catch_unwind(AssertUnwindSafe(|| this.inner.as_mut().poll(cx)));
        let result = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(value)) => Ok(value),
            Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
        };
        *this.output.borrow_mut() = Some(result);
        Poll::Ready(())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
