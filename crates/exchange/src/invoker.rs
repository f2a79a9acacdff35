//! Serialized callback execution.
//!
//! Every callback the engine hands to application code goes through a [`SerializedInvoker`].
//! Offering a task appends it to a queue; whoever finds the queue idle becomes its drainer and
//! runs tasks until the queue is empty again. A task that offers another task from inside its own
//! body therefore only enqueues it, so callback chains of any length run at constant stack depth
//! and never overlap.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::protocol::{ExchangeError, Failure};

/// A deferred unit of work.
pub struct Task {
    name: &'static str,
    f: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { name, f: Box::new(f) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn run(self) {
        (self.f)();
    }

    /// Runs the task on tokio's blocking thread pool.
    ///
    /// Meant for the dispatch task returned by `HttpChannel::on_request`, the only task that may
    /// block. Must be called from within a tokio runtime.
    pub fn spawn_blocking(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Task").field(&self.name).finish()
    }
}

type ErrorHook = Box<dyn Fn(&'static str, Failure) + Send + Sync>;

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    draining: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    on_error: ErrorHook,
}

/// Runs offered tasks one at a time, in offer order.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SerializedInvoker {
    inner: Arc<Inner>,
}

impl Default for SerializedInvoker {
    fn default() -> Self {
        Self::with_error_hook(|task, failure| {
            warn!(task, cause = %failure, "serialized task failed");
        })
    }
}

impl SerializedInvoker {
    /// Creates an invoker that hands failed (panicking) tasks to `on_error`.
    ///
    /// The hook runs on the draining thread, outside the queue lock; tasks it offers are queued
    /// behind the remaining ones.
    pub fn with_error_hook<F>(on_error: F) -> Self
    where
        F: Fn(&'static str, Failure) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(Inner { queue: Mutex::new(Queue::default()), on_error: Box::new(on_error) }) }
    }

    /// Queues `tasks`, skipping `None`s.
    ///
    /// Returns a drainer task if the queue was idle: the caller must run it, it executes the
    /// queued tasks and anything offered meanwhile. Returns `None` if another drainer is active
    /// or pending; that drainer picks the tasks up.
    pub fn offer<I>(&self, tasks: I) -> Option<Task>
    where
        I: IntoIterator<Item = Option<Task>>,
    {
        let mut queue = self.inner.queue.lock();
        let before = queue.tasks.len();
        queue.tasks.extend(tasks.into_iter().flatten());
        if queue.tasks.len() == before || queue.draining {
            return None;
        }
        queue.draining = true;
        drop(queue);

        let invoker = self.clone();
        Some(Task::new("serialized", move || invoker.drain()))
    }

    /// Queues a single task.
    pub fn offer_one(&self, task: Task) -> Option<Task> {
        self.offer([Some(task)])
    }

    /// Queues `task` and, if nobody is draining, drains on the calling thread.
    pub fn run(&self, task: Task) {
        if let Some(drainer) = self.offer_one(task) {
            drainer.run();
        }
    }

    /// Returns true while a drainer owns the queue.
    pub fn is_draining(&self) -> bool {
        self.inner.queue.lock().draining
    }

    fn drain(&self) {
        loop {
            let task = {
                let mut queue = self.inner.queue.lock();
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };

            let name = task.name();
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                (self.inner.on_error)(name, panic_failure(panic.as_ref()));
            }
        }
    }
}

impl fmt::Debug for SerializedInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.inner.queue.lock();
        f.debug_struct("SerializedInvoker").field("queued", &queue.tasks.len()).field("draining", &queue.draining).finish()
    }
}

/// Converts a caught panic payload into an application failure.
pub(crate) fn panic_failure(payload: &(dyn Any + Send)) -> Failure {
    let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked".to_string()
    };
    Failure::from(ExchangeError::application(message))
}
