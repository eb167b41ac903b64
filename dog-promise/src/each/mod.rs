//! # EachPromise: bounded fan-out over a lazy source
//!
//! Consumes a [`Source`] of keyed tasks, keeps at most `concurrency` of them
//! in flight, invokes the item callbacks as each one settles and exposes one
//! aggregate promise for the whole pipeline.
//!
//! ## Scheduling rules
//! - Nothing is pulled from the source until [`EachPromise::promise`] is
//!   first called.
//! - A refill admits the current element *before* advancing the source, so a
//!   producer never has to describe the next task before the previous one
//!   has been admitted. With a limit of one, the source is advanced only
//!   when an admitted task settles.
//! - Every settled task advances the source once, then the in-flight set is
//!   topped up again. The aggregate fulfills when the source is exhausted
//!   and nothing is left in flight.
//! - An item callback may settle the aggregate to short-circuit. Later
//!   settlements are ignored and no new task is admitted.
//! - A producer failure stops admission at once. With nothing in flight the
//!   aggregate is rejected on the spot. Otherwise it is sealed: tasks already
//!   admitted still reach their callbacks, any attempt by a callback to
//!   settle the aggregate is ignored, and the rejection lands on the next
//!   queue drain behind those reactions.
//!
//! ## Re-entrancy
//! Producer code and concurrency functions run without any lock held and may
//! wait on other promises. A task that settles while the scheduler is in the
//! middle of advancing or refilling only removes itself from the in-flight
//! set and marks the pass dirty; the running pass replays the step before
//! returning. Nesting is therefore one level deep and the bookkeeping is
//! never observed half-updated.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use dog_promise::{EachOptions, EachPromise, Source};
//!
//! let total = Arc::new(AtomicUsize::new(0));
//! let sum = total.clone();
//! let each = EachPromise::new(
//!     Source::<usize, usize>::from_values(1..=4usize),
//!     EachOptions::new()
//!         .concurrency(2)
//!         .on_fulfilled(move |value: usize, _key, _aggregate| {
//!             sum.fetch_add(value, Ordering::SeqCst);
//!         }),
//! );
//!
//! each.promise().wait().unwrap();
//! assert_eq!(total.load(Ordering::SeqCst), 10);
//! ```

pub mod options;

pub use options::{Concurrency, EachOptions, LimitFn, OnFulfilled, OnRejected};

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::ops::Bound;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::error::PromiseError;
use crate::promise::{Promise, Settlement};
use crate::queue::TaskQueue;
use crate::source::{Source, Task};

/// Position of the source cursor
enum Current<K, T, E> {
    /// Produced but not yet admitted
    Ready(K, Task<T, E>),
    /// Admitted (or not started); the next advance pulls from the producer
    Consumed,
    /// The producer has nothing more to give
    Exhausted,
    /// The producer failed; nothing more will be admitted
    Failed,
}

/// A task admitted to the in-flight set
struct InFlight<K, E> {
    key: K,
    /// Settles once the item callback and its step have run
    promise: Promise<(), E>,
}

struct Scheduler<K, T, E> {
    queue: Arc<TaskQueue>,
    aggregate: Option<Promise<(), E>>,
    source: Option<Source<K, T, E>>,
    current: Current<K, T, E>,
    concurrency: Concurrency,
    on_fulfilled: Option<OnFulfilled<K, T, E>>,
    on_rejected: Option<OnRejected<K, E>>,
    /// Keyed by admission sequence, so iteration order is admission order
    in_flight: BTreeMap<u64, InFlight<K, E>>,
    next_seq: u64,
    /// Steps taken while the aggregate was pending
    completed: usize,
    pumping: bool,
    dirty: bool,
    released: bool,
}

type Spent<K, T, E> = (
    Option<Source<K, T, E>>,
    Current<K, T, E>,
    Concurrency,
    Option<OnFulfilled<K, T, E>>,
    Option<OnRejected<K, E>>,
    BTreeMap<u64, InFlight<K, E>>,
);

impl<K, T, E> Scheduler<K, T, E>
where
    E: From<PromiseError> + Clone + Send + 'static,
{
    fn is_pending(&self) -> bool {
        self.aggregate.as_ref().map_or(true, Promise::is_pending)
    }

    /// Detach everything a spent pipeline holds on to. The caller drops the
    /// returned values after unlocking.
    fn release(&mut self) -> Spent<K, T, E> {
        if !self.released {
            debug!(in_flight = self.in_flight.len(), "Releasing settled pipeline");
        }
        self.released = true;
        (
            self.source.take(),
            mem::replace(&mut self.current, Current::Exhausted),
            mem::take(&mut self.concurrency),
            self.on_fulfilled.take(),
            self.on_rejected.take(),
            mem::take(&mut self.in_flight),
        )
    }
}

/// Shared handle to the scheduler state, captured by reactions
struct Pipeline<K, T, E> {
    scheduler: Arc<Mutex<Scheduler<K, T, E>>>,
}

impl<K, T, E> Clone for Pipeline<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<K, T, E> Pipeline<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Scheduler<K, T, E>> {
        self.scheduler.lock()
    }

    fn downgrade(&self) -> Weak<Mutex<Scheduler<K, T, E>>> {
        Arc::downgrade(&self.scheduler)
    }

    fn upgrade(weak: &Weak<Mutex<Scheduler<K, T, E>>>) -> Option<Self> {
        weak.upgrade().map(|scheduler| Self { scheduler })
    }

    /// Release a settled pipeline, if anything still refers to it
    fn release_weak(weak: &Weak<Mutex<Scheduler<K, T, E>>>) {
        if let Some(pipeline) = Self::upgrade(weak) {
            let spent = pipeline.lock().release();
            drop(spent);
        }
    }

    fn start(&self) -> Promise<(), E> {
        let aggregate = {
            let mut s = self.lock();
            if let Some(aggregate) = &s.aggregate {
                return aggregate.clone();
            }
            // The aggregate only refers back weakly; in-flight reactions and
            // user handles keep the scheduler alive.
            let driver = self.downgrade();
            let aggregate = Promise::with_wait_in(s.queue.clone(), move |aggregate: &Promise<(), E>| {
                if let Some(pipeline) = Self::upgrade(&driver) {
                    pipeline.drive(aggregate);
                }
            });
            s.aggregate = Some(aggregate.clone());
            s.pumping = true;
            aggregate
        };

        let on_fulfilled = self.downgrade();
        let on_rejected = self.downgrade();
        let _: Promise<(), E> = aggregate.then(
            move |_| {
                Self::release_weak(&on_fulfilled);
                Ok::<(), E>(())
            },
            move |_| {
                Self::release_weak(&on_rejected);
                Ok::<(), E>(())
            },
        );

        debug!("Starting pipeline");
        if self.advance() {
            self.pump(false);
        } else {
            self.finish_pass();
        }
        aggregate
    }

    /// Wait function of the aggregate: drive every in-flight task in
    /// admission order, including tasks admitted while driving, until the
    /// aggregate settles or nothing is left.
    fn drive(&self, aggregate: &Promise<(), E>) {
        let mut after: Option<u64> = None;
        loop {
            let next = {
                let s = self.lock();
                let mut range = match after {
                    None => s.in_flight.range::<u64, _>(..),
                    Some(seq) => s.in_flight.range((Bound::Excluded(seq), Bound::Unbounded)),
                };
                range.next().map(|(seq, task)| (*seq, task.promise.clone()))
            };
            let Some((seq, promise)) = next else {
                break;
            };
            after = Some(seq);

            trace!(seq, "Driving in-flight task");
            promise.force_settle();
            if !aggregate.is_pending() {
                return;
            }
        }
    }

    /// Move the cursor past a consumed element. Never skips an element that
    /// has not been admitted yet. Returns false if the producer failed or
    /// the pipeline was released.
    fn advance(&self) -> bool {
        let mut source = {
            let mut s = self.lock();
            match s.current {
                Current::Ready(..) | Current::Exhausted => return true,
                Current::Failed => return false,
                Current::Consumed => {}
            }
            match s.source.take() {
                Some(source) => source,
                None => return false,
            }
        };

        // Producer code runs unlocked and may itself wait on promises.
        let next = source.next();

        let mut s = self.lock();
        if s.released {
            drop(s);
            drop(source);
            return false;
        }
        match next {
            Some(Ok((key, task))) => {
                s.current = Current::Ready(key, task);
                s.source = Some(source);
                true
            }
            None => {
                trace!("Source exhausted");
                s.current = Current::Exhausted;
                drop(s);
                drop(source);
                true
            }
            Some(Err(reason)) => {
                warn!(in_flight = s.in_flight.len(), "Task producer failed, rejecting aggregate");
                s.current = Current::Failed;
                let owed = !s.in_flight.is_empty();
                let aggregate = s.aggregate.clone();
                let queue = s.queue.clone();
                drop(s);
                drop(source);
                let Some(aggregate) = aggregate else {
                    return false;
                };
                if !owed {
                    aggregate.reject(reason);
                } else if aggregate.seal() {
                    // Admitted tasks may still report, but nothing else can
                    // settle the aggregate; the rejection runs behind their
                    // reactions.
                    queue.add(move || {
                        aggregate.settle_sealed(Settlement::Rejected(reason));
                    });
                }
                false
            }
        }
    }

    /// Admit the current element into the in-flight set
    fn admit(&self) -> bool {
        let mut s = self.lock();
        if s.released {
            return false;
        }
        let (key, task) = match mem::replace(&mut s.current, Current::Consumed) {
            Current::Ready(key, task) => (key, task),
            other => {
                s.current = other;
                return false;
            }
        };

        let seq = s.next_seq;
        s.next_seq += 1;

        let task = task.into_promise_in(&s.queue);
        let on_value = self.clone();
        let on_reason = self.clone();
        let value_key = key.clone();
        let reason_key = key.clone();
        let promise: Promise<(), E> = task.then(
            move |value| {
                on_value.settle_item(seq, value_key, Settlement::Fulfilled(value));
                Ok::<(), E>(())
            },
            move |reason| {
                on_reason.settle_item(seq, reason_key, Settlement::Rejected(reason));
                Ok::<(), E>(())
            },
        );
        s.in_flight.insert(seq, InFlight { key, promise });
        trace!(seq, in_flight = s.in_flight.len(), "Admitted task");
        true
    }

    fn settle_item(&self, seq: u64, key: K, outcome: Settlement<T, E>) {
        let (aggregate, on_fulfilled, on_rejected) = {
            let s = self.lock();
            let Some(aggregate) = s.aggregate.clone() else {
                return;
            };
            if !aggregate.is_pending() || !s.in_flight.contains_key(&seq) {
                trace!(seq, "Ignoring settlement after the aggregate settled");
                return;
            }
            (aggregate, s.on_fulfilled.clone(), s.on_rejected.clone())
        };

        match outcome {
            Settlement::Fulfilled(value) => {
                if let Some(callback) = on_fulfilled {
                    callback(value, key, &aggregate);
                }
            }
            Settlement::Rejected(reason) => {
                if let Some(callback) = on_rejected {
                    callback(reason, key, &aggregate);
                }
            }
        }
        self.step(seq);
    }

    /// Bookkeeping after one task settled
    fn step(&self, seq: u64) {
        {
            let mut s = self.lock();
            if !s.is_pending() {
                let spent = s.release();
                drop(s);
                drop(spent);
                return;
            }
            s.in_flight.remove(&seq);
            s.completed += 1;
            if s.pumping {
                trace!(seq, "Step arrived during a pass, deferring");
                s.dirty = true;
                return;
            }
            s.pumping = true;
        }
        self.pump(true);
    }

    /// One scheduling pass. Runs with `pumping` set; steps recorded while it
    /// runs are replayed before it returns.
    fn pump(&self, mut stepped: bool) {
        loop {
            if (stepped && !self.advance()) || self.check_finished() {
                self.finish_pass();
                return;
            }
            self.refill();

            let mut s = self.lock();
            if s.dirty && s.is_pending() && !s.released {
                s.dirty = false;
                stepped = true;
                continue;
            }
            s.dirty = false;
            s.pumping = false;
            return;
        }
    }

    fn finish_pass(&self) {
        let mut s = self.lock();
        s.pumping = false;
        s.dirty = false;
    }

    fn check_finished(&self) -> bool {
        let aggregate = {
            let s = self.lock();
            if !s.in_flight.is_empty() || !matches!(s.current, Current::Exhausted) {
                return false;
            }
            s.aggregate.clone()
        };
        if let Some(aggregate) = aggregate {
            if aggregate.fulfill(()) {
                debug!("Source exhausted and nothing in flight, aggregate fulfilled");
            }
        }
        true
    }

    /// Top up the in-flight set
    fn refill(&self) {
        let (concurrency, in_flight) = {
            let s = self.lock();
            if s.released {
                return;
            }
            (s.concurrency.clone(), s.in_flight.len())
        };

        let Some(limit) = concurrency.limit(in_flight) else {
            while self.admit() && self.advance() {}
            return;
        };

        let mut slots = limit.saturating_sub(in_flight);
        if slots == 0 {
            debug!(limit, in_flight, "No free slots, intake paused");
            return;
        }

        // Admit before advancing: the producer may not be able to yield the
        // next task until the current one has been admitted.
        self.admit();
        loop {
            slots -= 1;
            if slots == 0 || !self.advance() || !self.admit() {
                break;
            }
        }
    }
}

/// Drives a lazy source of tasks with bounded concurrency.
///
/// Cloning shares the same pipeline.
pub struct EachPromise<K, T, E = PromiseError> {
    pipeline: Pipeline<K, T, E>,
}

impl<K, T, E> Clone for EachPromise<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
        }
    }
}

impl<K, T, E> EachPromise<K, T, E>
where
    K: Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    /// Create a pipeline on the current thread's queue. Nothing runs until
    /// [`promise`](Self::promise) is called.
    pub fn new(source: Source<K, T, E>, options: EachOptions<K, T, E>) -> Self {
        Self::new_in(TaskQueue::current(), source, options)
    }

    pub fn new_in(queue: Arc<TaskQueue>, source: Source<K, T, E>, options: EachOptions<K, T, E>) -> Self {
        let EachOptions {
            concurrency,
            on_fulfilled,
            on_rejected,
        } = options;

        Self {
            pipeline: Pipeline {
                scheduler: Arc::new(Mutex::new(Scheduler {
                    queue,
                    aggregate: None,
                    source: Some(source),
                    current: Current::Consumed,
                    concurrency,
                    on_fulfilled,
                    on_rejected,
                    in_flight: BTreeMap::new(),
                    next_seq: 0,
                    completed: 0,
                    pumping: false,
                    dirty: false,
                    released: false,
                })),
            },
        }
    }

    /// The aggregate promise. The first call starts consuming the source;
    /// later calls return the same promise.
    ///
    /// The aggregate does not keep the pipeline alive. A pipeline with
    /// nothing in flight (for example one frozen by a zero limit) is dropped
    /// together with its last `EachPromise` handle, and waiting on its
    /// aggregate afterwards rejects with [`PromiseError::WaitDidNotSettle`].
    pub fn promise(&self) -> Promise<(), E> {
        self.pipeline.start()
    }

    /// Number of tasks currently in flight
    pub fn in_flight(&self) -> usize {
        self.pipeline.lock().in_flight.len()
    }

    /// Keys of the tasks currently in flight, in admission order
    pub fn in_flight_keys(&self) -> Vec<K> {
        self.pipeline
            .lock()
            .in_flight
            .values()
            .map(|task| task.key.clone())
            .collect()
    }

    /// Number of item settlements processed so far
    pub fn completed(&self) -> usize {
        self.pipeline.lock().completed
    }

    pub fn is_started(&self) -> bool {
        self.pipeline.lock().aggregate.is_some()
    }
}

impl<K, T, E> fmt::Debug for EachPromise<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.pipeline.scheduler.lock();
        f.debug_struct("EachPromise")
            .field("started", &s.aggregate.is_some())
            .field("in_flight", &s.in_flight.len())
            .field("completed", &s.completed)
            .field("concurrency", &s.concurrency)
            .field("released", &s.released)
            .finish()
    }
}
