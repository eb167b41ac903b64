//! Lazy task sources.
//!
//! An [`EachPromise`](crate::EachPromise) consumes a [`Source`]: a lazily
//! evaluated, possibly infinite sequence of keyed [`Task`]s. Keys are opaque
//! and are handed back to the item callbacks unchanged, so sparse or
//! associative keys survive. Advancing a source may fail; the failure
//! rejects the whole pipeline.

use std::fmt;
use std::sync::Arc;

use crate::error::PromiseError;
use crate::promise::Promise;
use crate::queue::TaskQueue;

/// One unit of work in a source: a bare value, or a promise still in flight
pub enum Task<T, E = PromiseError> {
    /// Already settled; admitted as a fulfilled promise
    Ready(T),
    /// Settles whenever its owner settles it
    Pending(Promise<T, E>),
}

impl<T, E> Task<T, E>
where
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    pub fn ready(value: T) -> Self {
        Task::Ready(value)
    }

    /// Wrap as a promise, creating fulfilled promises on `queue`
    pub fn into_promise_in(self, queue: &Arc<TaskQueue>) -> Promise<T, E> {
        match self {
            Task::Ready(value) => Promise::fulfilled_in(queue.clone(), value),
            Task::Pending(promise) => promise,
        }
    }
}

impl<T, E> From<Promise<T, E>> for Task<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Task::Pending(promise)
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Task<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Task::Pending(promise) => f.debug_tuple("Pending").field(promise).finish(),
        }
    }
}

/// Item produced by advancing a source
pub type SourceItem<K, T, E> = Result<(K, Task<T, E>), E>;

type BoxIter<K, T, E> = Box<dyn Iterator<Item = SourceItem<K, T, E>> + Send + 'static>;

/// Lazily produced sequence of keyed tasks
pub struct Source<K, T, E = PromiseError> {
    iter: BoxIter<K, T, E>,
}

impl<K, T, E> Source<K, T, E>
where
    K: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Fallible keyed items; an `Err` is a producer failure
    pub fn fallible<I>(items: I) -> Self
    where
        I: IntoIterator<Item = SourceItem<K, T, E>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            iter: Box::new(items.into_iter()),
        }
    }

    /// Keyed items that cannot fail
    pub fn keyed<I, X>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, X)>,
        I::IntoIter: Send + 'static,
        X: Into<Task<T, E>>,
    {
        Self::fallible(items.into_iter().map(|(key, task)| Ok((key, task.into()))))
    }

    /// Generator-style producer, pulled only when the pipeline needs the
    /// next task. Returning `None` ends the source.
    pub fn from_fn<F>(producer: F) -> Self
    where
        F: FnMut() -> Option<SourceItem<K, T, E>> + Send + 'static,
    {
        Self::fallible(std::iter::from_fn(producer))
    }
}

impl<T, E> Source<usize, T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Tasks keyed by position
    pub fn from_tasks<I, X>(tasks: I) -> Self
    where
        I: IntoIterator<Item = X>,
        I::IntoIter: Send + 'static,
        X: Into<Task<T, E>>,
    {
        Self::keyed(tasks.into_iter().enumerate())
    }

    /// Bare values keyed by position, each admitted as already fulfilled
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::keyed(values.into_iter().map(Task::Ready).enumerate())
    }
}

impl<K, T, E> Iterator for Source<K, T, E> {
    type Item = SourceItem<K, T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

impl<K, T, E> fmt::Debug for Source<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").finish_non_exhaustive()
    }
}
