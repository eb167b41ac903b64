//! # Tokio task backend
//!
//! Runs futures on a tokio runtime and exposes each one as a [`Promise`]
//! that synchronous code can wait on. The spawned task settles the promise
//! from a runtime thread; reactions still run on the caller's
//! [`TaskQueue`], so an [`EachPromise`](crate::EachPromise) fed from this
//! backend keeps its single-threaded scheduling.
//!
//! ```rust
//! use dog_promise::{Promise, PromiseError, TokioBackend};
//!
//! let backend = TokioBackend::new().unwrap();
//! let promise: Promise<u32> = backend.spawn(async { Ok::<_, PromiseError>(7) });
//!
//! assert_eq!(promise.wait(), Ok(7));
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::error::{PromiseError, PromiseResult};
use crate::promise::Promise;
use crate::queue::TaskQueue;

/// Spawns futures onto a tokio runtime and hands back promises
#[derive(Debug)]
pub struct TokioBackend {
    handle: Handle,
    /// Present when the backend built its own runtime
    runtime: Option<Runtime>,
    queue: Option<Arc<TaskQueue>>,
}

impl TokioBackend {
    /// Build a multi-threaded runtime owned by the backend
    pub fn new() -> PromiseResult<Self> {
        Self::build(Builder::new_multi_thread())
    }

    /// Build an owned runtime with a fixed number of worker threads
    pub fn with_worker_threads(threads: usize) -> PromiseResult<Self> {
        if threads == 0 {
            return Err(PromiseError::backend("worker thread count must be at least 1"));
        }
        let mut builder = Builder::new_multi_thread();
        builder.worker_threads(threads);
        Self::build(builder)
    }

    fn build(mut builder: Builder) -> PromiseResult<Self> {
        let runtime = builder
            .enable_all()
            .thread_name("dog-promise-worker")
            .build()
            .map_err(|e| PromiseError::backend(format!("Failed to build runtime: {}", e)))?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            queue: None,
        })
    }

    /// Spawn onto an existing runtime. Waiting on the returned promises must
    /// happen outside that runtime's async context.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
            queue: None,
        }
    }

    /// Queue for the reactions of spawned promises. Defaults to the queue of
    /// the thread calling `spawn`.
    pub fn with_queue(mut self, queue: Arc<TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn owns_runtime(&self) -> bool {
        self.runtime.is_some()
    }

    /// Run `future` on the runtime.
    ///
    /// The returned promise settles with the future's output. Waiting on it
    /// blocks the calling thread until the task finishes; a task that panics
    /// or is cancelled rejects with [`PromiseError::Backend`].
    pub fn spawn<T, E, F>(&self, future: F) -> Promise<T, E>
    where
        T: Clone + Send + 'static,
        E: From<PromiseError> + Clone + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let queue = self.queue.clone().unwrap_or_else(TaskQueue::current);
        let join_slot: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));

        let handle = self.handle.clone();
        let slot = join_slot.clone();
        let promise = Promise::with_wait_in(queue, move |promise: &Promise<T, E>| {
            let Some(join) = slot.lock().take() else {
                return;
            };
            if let Err(e) = handle.block_on(join) {
                warn!("Backend task did not complete: {}", e);
                promise.reject(PromiseError::backend(e.to_string()).into());
            }
        });

        let target = promise.clone();
        let task = self.handle.spawn(future);
        let supervisor = self.handle.spawn(async move {
            match task.await {
                Ok(Ok(value)) => {
                    target.fulfill(value);
                }
                Ok(Err(reason)) => {
                    target.reject(reason);
                }
                Err(e) => {
                    warn!("Backend task failed: {}", e);
                    target.reject(PromiseError::backend(e.to_string()).into());
                }
            }
        });
        *join_slot.lock() = Some(supervisor);

        debug!("Spawned backend task");
        promise
    }

    /// Like [`spawn`](Self::spawn), rejecting with [`PromiseError::Timeout`]
    /// when `duration` elapses before the future completes
    #[instrument(level = "debug", skip(self, future))]
    pub fn spawn_with_timeout<T, E, F>(&self, future: F, duration: Duration) -> Promise<T, E>
    where
        T: Clone + Send + 'static,
        E: From<PromiseError> + Clone + Send + 'static,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn(async move {
            match tokio::time::timeout(duration, future).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Task timed out after {:?}", duration);
                    Err(PromiseError::Timeout(duration).into())
                }
            }
        })
    }
}
