use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;

use dog_promise::{EachOptions, EachPromise, Promise, PromiseError, PromiseState, Source, TaskQueue};

/// Task count, concurrency limit and the order in which tasks settle
fn scenario() -> impl Strategy<Value = (usize, usize, Vec<usize>, Vec<bool>)> {
    (0usize..24, 1usize..6).prop_flat_map(|(n, limit)| {
        (
            Just(n),
            Just(limit),
            Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
            proptest::collection::vec(any::<bool>(), n),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Bounded in-flight set and exactly one callback per item, whatever
    /// order the tasks settle in
    #[test]
    fn prop_bounded_and_exactly_once((n, limit, order, outcomes) in scenario()) {
        let queue = Arc::new(TaskQueue::new());
        let tasks: Vec<Promise<usize>> = (0..n).map(|_| Promise::pending_in(queue.clone())).collect();
        let calls: Arc<Vec<AtomicUsize>> = Arc::new((0..n).map(|_| AtomicUsize::new(0)).collect());
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let handle: Arc<Mutex<Option<EachPromise<usize, usize>>>> = Arc::new(Mutex::new(None));

        let on_value = (calls.clone(), max_in_flight.clone(), handle.clone());
        let on_reason = (calls.clone(), max_in_flight.clone(), handle.clone());
        let source: Source<usize, usize> = Source::from_tasks(tasks.clone());
        let each = EachPromise::new_in(
            queue.clone(),
            source,
            EachOptions::new()
                .concurrency(limit)
                .on_fulfilled(move |_, key: usize, _| {
                    let (calls, max, handle) = &on_value;
                    calls[key].fetch_add(1, Ordering::SeqCst);
                    if let Some(each) = handle.lock().as_ref() {
                        max.fetch_max(each.in_flight(), Ordering::SeqCst);
                    }
                })
                .on_rejected(move |_, key: usize, _| {
                    let (calls, max, handle) = &on_reason;
                    calls[key].fetch_add(1, Ordering::SeqCst);
                    if let Some(each) = handle.lock().as_ref() {
                        max.fetch_max(each.in_flight(), Ordering::SeqCst);
                    }
                }),
        );
        *handle.lock() = Some(each.clone());

        let aggregate = each.promise();
        prop_assert!(each.in_flight() <= limit);

        for i in order {
            if outcomes[i] {
                tasks[i].fulfill(i);
            } else {
                tasks[i].reject(PromiseError::rejected(format!("task {}", i)));
            }
            queue.run();
            prop_assert!(each.in_flight() <= limit);
        }

        prop_assert_eq!(aggregate.state(), PromiseState::Fulfilled);
        prop_assert!(max_in_flight.load(Ordering::SeqCst) <= limit);
        for count in calls.iter() {
            prop_assert_eq!(count.load(Ordering::SeqCst), 1);
        }
        *handle.lock() = None;
    }

    /// Ready values never exceed the limit and each reports once
    #[test]
    fn prop_ready_values_report_once(values in proptest::collection::vec(any::<u16>(), 0..40), limit in 1usize..8) {
        let expected: usize = values.iter().map(|v| *v as usize).sum();
        let total = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let count = values.len();

        let sum = total.clone();
        let seen = fired.clone();
        let each = EachPromise::new(
            Source::<usize, u16>::from_values(values),
            EachOptions::new().concurrency(limit).on_fulfilled(move |value: u16, _, _| {
                sum.fetch_add(value as usize, Ordering::SeqCst);
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        prop_assert_eq!(each.promise().wait(), Ok(()));
        prop_assert_eq!(fired.load(Ordering::SeqCst), count);
        prop_assert_eq!(total.load(Ordering::SeqCst), expected);
    }
}
