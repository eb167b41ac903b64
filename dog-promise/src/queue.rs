//! Deferred reaction queue.
//!
//! Promise reactions never run on the stack that settled the promise or
//! registered the reaction. They are appended to a [`TaskQueue`] and run when
//! the queue is drained, either explicitly through [`TaskQueue::run`] or as
//! part of waiting on a promise.
//!
//! Each thread has its own default queue ([`TaskQueue::current`]), so one
//! logical thread of control drives its own promises. Code that needs a
//! different arrangement injects a queue explicitly when creating promises.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// A unit of deferred work
pub type QueueTask = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: Arc<TaskQueue> = Arc::new(TaskQueue::new());
}

/// FIFO of deferred reactions
#[derive(Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<QueueTask>>,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// The calling thread's default queue
    pub fn current() -> Arc<TaskQueue> {
        CURRENT.with(Arc::clone)
    }

    /// Schedule a task to run on the next drain
    pub fn add<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.lock().push_back(Box::new(task));
    }

    /// Run tasks until the queue is empty.
    ///
    /// Tasks added while draining are run by the same drain. The lock is
    /// released before each task runs, so a task may add to the queue or
    /// drain it again.
    pub fn run(&self) {
        let mut ran = 0usize;
        loop {
            let task = self.tasks.lock().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        if ran > 0 {
            trace!(tasks = ran, "Drained task queue");
        }
    }

    /// Number of tasks waiting to run
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending_tasks", &self.len())
            .finish()
    }
}
