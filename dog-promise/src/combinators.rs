//! Convenience pipelines built on [`EachPromise`].

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::each::{Concurrency, EachOptions, EachPromise};
use crate::error::PromiseError;
use crate::promise::{Promise, Settlement};
use crate::source::Source;

/// Run every task with no concurrency limit
pub fn each<K, T, E, F, G>(source: Source<K, T, E>, on_fulfilled: F, on_rejected: G) -> Promise<(), E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
    F: Fn(T, K, &Promise<(), E>) + Send + Sync + 'static,
    G: Fn(E, K, &Promise<(), E>) + Send + Sync + 'static,
{
    each_limit(source, Concurrency::Unlimited, on_fulfilled, on_rejected)
}

/// Run tasks with at most `concurrency` in flight
pub fn each_limit<K, T, E, F, G>(
    source: Source<K, T, E>,
    concurrency: Concurrency,
    on_fulfilled: F,
    on_rejected: G,
) -> Promise<(), E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
    F: Fn(T, K, &Promise<(), E>) + Send + Sync + 'static,
    G: Fn(E, K, &Promise<(), E>) + Send + Sync + 'static,
{
    let options = EachOptions::new()
        .with_concurrency(concurrency)
        .on_fulfilled(on_fulfilled)
        .on_rejected(on_rejected);
    EachPromise::new(source, options).promise()
}

/// Like [`each_limit`], but the first rejected task rejects the aggregate
pub fn each_limit_all<K, T, E, F>(source: Source<K, T, E>, concurrency: Concurrency, on_fulfilled: F) -> Promise<(), E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
    F: Fn(T, K, &Promise<(), E>) + Send + Sync + 'static,
{
    each_limit(
        source,
        concurrency,
        on_fulfilled,
        |reason: E, _key: K, aggregate: &Promise<(), E>| {
            aggregate.reject(reason);
        },
    )
}

/// Every value ordered by key, or the first rejection
pub fn all<K, T, E>(source: Source<K, T, E>) -> Promise<Vec<(K, T)>, E>
where
    K: Ord + Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    let results: Arc<Mutex<Vec<(K, T)>>> = Arc::new(Mutex::new(Vec::new()));
    let collected = results.clone();

    let aggregate = each(
        source,
        move |value: T, key: K, _: &Promise<(), E>| collected.lock().push((key, value)),
        |reason: E, _key: K, aggregate: &Promise<(), E>| {
            aggregate.reject(reason);
        },
    );

    aggregate.and_then(move |()| {
        let mut values = mem::take(&mut *results.lock());
        values.sort_by(|a, b| a.0.cmp(&b.0));
        Ok::<_, E>(values)
    })
}

/// The outcome of every task ordered by key. Item rejections are reported,
/// never propagated; only a producer failure rejects.
pub fn settle<K, T, E>(source: Source<K, T, E>) -> Promise<Vec<(K, Settlement<T, E>)>, E>
where
    K: Ord + Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    let outcomes: Arc<Mutex<Vec<(K, Settlement<T, E>)>>> = Arc::new(Mutex::new(Vec::new()));
    let fulfilled = outcomes.clone();
    let rejected = outcomes.clone();

    let aggregate = each(
        source,
        move |value: T, key: K, _: &Promise<(), E>| {
            fulfilled.lock().push((key, Settlement::Fulfilled(value)));
        },
        move |reason: E, key: K, _: &Promise<(), E>| {
            rejected.lock().push((key, Settlement::Rejected(reason)));
        },
    );

    aggregate.and_then(move |()| {
        let mut settled = mem::take(&mut *outcomes.lock());
        settled.sort_by(|a, b| a.0.cmp(&b.0));
        Ok::<_, E>(settled)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::PromiseState;
    use crate::queue::TaskQueue;
    use crate::source::Task;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_each_visits_every_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        let source: Source<usize, u32> = Source::from_values(vec![1, 2, 3]);
        let aggregate = each(
            source,
            move |v, _, _| {
                s.fetch_add(v as usize, Ordering::SeqCst);
            },
            |_, _, _| {},
        );

        assert_eq!(aggregate.wait(), Ok(()));
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_each_limit_all_rejects_on_first_failure() {
        let source: Source<usize, u32> = Source::from_tasks(vec![
            Task::Ready(1),
            Task::Pending(Promise::rejected(PromiseError::rejected("second failed"))),
            Task::Ready(3),
        ]);
        let aggregate = each_limit_all(source, Concurrency::Fixed(1), |_, _, _| {});

        assert_eq!(aggregate.wait(), Err(PromiseError::rejected("second failed")));
    }

    #[test]
    fn test_all_orders_by_key() {
        let queue = TaskQueue::current();
        let first: Promise<&'static str> = Promise::pending_in(queue.clone());
        let second: Promise<&'static str> = Promise::pending_in(queue.clone());
        let source: Source<u32, &'static str> = Source::keyed(vec![(1, first.clone()), (2, second.clone())]);

        let combined = all(source);
        second.fulfill("b");
        queue.run();
        first.fulfill("a");

        assert_eq!(combined.wait(), Ok(vec![(1, "a"), (2, "b")]));
    }

    #[test]
    fn test_all_rejects_with_first_rejection() {
        let source: Source<usize, u32> = Source::from_tasks(vec![
            Task::Ready(1),
            Task::Pending(Promise::rejected(PromiseError::rejected("nope"))),
        ]);
        let combined = all(source);

        assert_eq!(combined.wait(), Err(PromiseError::rejected("nope")));
        assert_eq!(combined.state(), PromiseState::Rejected);
    }

    #[test]
    fn test_settle_reports_every_outcome() {
        let source: Source<usize, u32> = Source::from_tasks(vec![
            Task::Ready(1),
            Task::Pending(Promise::rejected(PromiseError::rejected("bad"))),
        ]);
        let outcomes = settle(source).wait().unwrap();

        assert_eq!(
            outcomes,
            vec![
                (0, Settlement::Fulfilled(1)),
                (1, Settlement::Rejected(PromiseError::rejected("bad"))),
            ]
        );
    }
}
