//! # Promise: the settlement primitive
//!
//! A [`Promise`] is created pending and settles exactly once, either
//! fulfilled with a value or rejected with a reason. Later settlement
//! attempts are ignored.
//!
//! Reactions registered through [`Promise::then`] run in registration order,
//! always from the promise's [`TaskQueue`] and never on the stack that
//! settled the promise or registered the reaction.
//!
//! There is no background scheduler. A promise may carry a wait function:
//! deferred work run by [`Promise::force_settle`] / [`Promise::wait`] to
//! drive the owner's progress until the promise is no longer pending.
//!
//! ```rust
//! use dog_promise::{Promise, PromiseError};
//!
//! let answer: Promise<u32> = Promise::with_wait(|p: &Promise<u32>| {
//!     p.fulfill(41);
//! });
//! let next: Promise<u32> = answer.and_then(|v| Ok::<_, PromiseError>(v + 1));
//!
//! assert_eq!(next.wait(), Ok(42));
//! ```

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::PromiseError;
use crate::queue::TaskQueue;

/// Observable state of a promise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// Terminal outcome of a promise
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settlement<T, E> {
    pub fn state(&self) -> PromiseState {
        match self {
            Settlement::Fulfilled(_) => PromiseState::Fulfilled,
            Settlement::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Settlement<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Settlement::Fulfilled(value),
            Err(reason) => Settlement::Rejected(reason),
        }
    }
}

/// What a promise is resolved with: an outcome, or another promise to adopt.
///
/// Reaction callbacks return anything convertible into a `Resolution`,
/// which in practice means a `Result<U, E>` or a `Promise<U, E>`.
pub enum Resolution<T, E> {
    Settled(Settlement<T, E>),
    Adopt(Promise<T, E>),
}

impl<T, E> From<Result<T, E>> for Resolution<T, E> {
    fn from(result: Result<T, E>) -> Self {
        Resolution::Settled(result.into())
    }
}

impl<T, E> From<Settlement<T, E>> for Resolution<T, E> {
    fn from(settlement: Settlement<T, E>) -> Self {
        Resolution::Settled(settlement)
    }
}

impl<T, E> From<Promise<T, E>> for Resolution<T, E> {
    fn from(promise: Promise<T, E>) -> Self {
        Resolution::Adopt(promise)
    }
}

type Reaction<T, E> = Box<dyn FnOnce(Settlement<T, E>) + Send + 'static>;
type WaitFn<T, E> = Box<dyn FnOnce(&Promise<T, E>) + Send + 'static>;

/// Something a pending promise can drive while it is being waited on.
/// Type-erased so a `Promise<U, E>` can wait on a `Promise<T, E>`.
pub(crate) trait WaitDependency: Send + Sync {
    fn wait_if_pending(&self);
}

struct Core<T, E> {
    settlement: Option<Settlement<T, E>>,
    reactions: Vec<Reaction<T, E>>,
    wait_fn: Option<WaitFn<T, E>>,
    wait_list: Vec<Box<dyn WaitDependency>>,
    waiting: bool,
    /// Only the owner that sealed the promise may still settle it
    sealed: bool,
}

impl<T, E> Core<T, E> {
    fn new(settlement: Option<Settlement<T, E>>, wait_fn: Option<WaitFn<T, E>>) -> Self {
        Self {
            settlement,
            reactions: Vec::new(),
            wait_fn,
            wait_list: Vec::new(),
            waiting: false,
            sealed: false,
        }
    }
}

struct Shared<T, E> {
    core: Mutex<Core<T, E>>,
    queue: Arc<TaskQueue>,
}

/// Handle to the eventual outcome of one unit of asynchronous work.
///
/// Cloning the handle shares the same promise; the promise lives as long as
/// any handle, registered reaction or dependent promise refers to it.
pub struct Promise<T, E = PromiseError> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    fn from_core(queue: Arc<TaskQueue>, core: Core<T, E>) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(core),
                queue,
            }),
        }
    }

    /// A pending promise with no wait function, on the current thread's queue
    pub fn pending() -> Self {
        Self::pending_in(TaskQueue::current())
    }

    pub fn pending_in(queue: Arc<TaskQueue>) -> Self {
        Self::from_core(queue, Core::new(None, None))
    }

    /// A pending promise whose wait function drives it to settlement.
    ///
    /// The wait function runs at most once, the first time the promise is
    /// waited on while pending. It receives the promise so it can settle it
    /// without capturing its own handle.
    pub fn with_wait<F>(wait: F) -> Self
    where
        F: FnOnce(&Promise<T, E>) + Send + 'static,
    {
        Self::with_wait_in(TaskQueue::current(), wait)
    }

    pub fn with_wait_in<F>(queue: Arc<TaskQueue>, wait: F) -> Self
    where
        F: FnOnce(&Promise<T, E>) + Send + 'static,
    {
        Self::from_core(queue, Core::new(None, Some(Box::new(wait))))
    }

    /// An already fulfilled promise
    pub fn fulfilled(value: T) -> Self {
        Self::fulfilled_in(TaskQueue::current(), value)
    }

    pub fn fulfilled_in(queue: Arc<TaskQueue>, value: T) -> Self {
        Self::from_core(queue, Core::new(Some(Settlement::Fulfilled(value)), None))
    }

    /// An already rejected promise
    pub fn rejected(reason: E) -> Self {
        Self::rejected_in(TaskQueue::current(), reason)
    }

    pub fn rejected_in(queue: Arc<TaskQueue>, reason: E) -> Self {
        Self::from_core(queue, Core::new(Some(Settlement::Rejected(reason)), None))
    }

    /// Queue this promise schedules its reactions on
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.shared.queue
    }

    pub fn state(&self) -> PromiseState {
        self.shared
            .core
            .lock()
            .settlement
            .as_ref()
            .map_or(PromiseState::Pending, Settlement::state)
    }

    pub fn is_pending(&self) -> bool {
        self.shared.core.lock().settlement.is_none()
    }

    /// The outcome, once settled
    pub fn outcome(&self) -> Option<Settlement<T, E>> {
        self.shared.core.lock().settlement.clone()
    }

    /// Whether both handles refer to the same promise
    pub fn ptr_eq(&self, other: &Promise<T, E>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Fulfill with `value`. Returns false if the promise was already settled.
    pub fn fulfill(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    /// Reject with `reason`. Returns false if the promise was already settled.
    pub fn reject(&self, reason: E) -> bool {
        self.settle(Settlement::Rejected(reason))
    }

    /// Settle with an outcome, or adopt the eventual outcome of another
    /// promise. Adopting also makes waiting on this promise drive the other.
    pub fn resolve(&self, resolution: impl Into<Resolution<T, E>>) -> bool {
        match resolution.into() {
            Resolution::Settled(settlement) => self.settle(settlement),
            Resolution::Adopt(other) => self.adopt(other),
        }
    }

    fn adopt(&self, other: Promise<T, E>) -> bool {
        if self.ptr_eq(&other) {
            return self.reject(PromiseError::rejected("cannot resolve a promise with itself").into());
        }
        {
            let core = self.shared.core.lock();
            if core.settlement.is_some() || core.sealed {
                return false;
            }
        }

        self.push_dependency(Box::new(other.clone()));
        let target = Arc::downgrade(&self.shared);
        other.react(move |settlement| {
            if let Some(promise) = Self::upgrade(&target) {
                promise.settle(settlement);
            }
        });
        true
    }

    fn upgrade(weak: &Weak<Shared<T, E>>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Refuse every later `fulfill`/`reject`/`resolve` while staying
    /// pending. The sealing owner settles through [`settle_sealed`](Self::settle_sealed).
    pub(crate) fn seal(&self) -> bool {
        let mut core = self.shared.core.lock();
        if core.settlement.is_some() || core.sealed {
            return false;
        }
        core.sealed = true;
        true
    }

    pub(crate) fn settle_sealed(&self, settlement: Settlement<T, E>) -> bool {
        self.settle_with(settlement, true)
    }

    fn settle(&self, settlement: Settlement<T, E>) -> bool {
        self.settle_with(settlement, false)
    }

    fn settle_with(&self, settlement: Settlement<T, E>, unseal: bool) -> bool {
        let state = settlement.state();
        let (reactions, wait_fn, wait_list) = {
            let mut core = self.shared.core.lock();
            if core.settlement.is_some() || (core.sealed && !unseal) {
                return false;
            }
            core.settlement = Some(settlement.clone());
            (
                mem::take(&mut core.reactions),
                core.wait_fn.take(),
                mem::take(&mut core.wait_list),
            )
        };
        // Owners captured by the wait function are released outside the lock.
        drop(wait_fn);
        drop(wait_list);

        trace!(state = ?state, reactions = reactions.len(), "Promise settled");
        if !reactions.is_empty() {
            self.shared.queue.add(move || {
                for reaction in reactions {
                    reaction(settlement.clone());
                }
            });
        }
        true
    }

    /// Register a raw reaction; scheduled on the queue if already settled.
    fn react<F>(&self, reaction: F)
    where
        F: FnOnce(Settlement<T, E>) + Send + 'static,
    {
        let settled = {
            let mut core = self.shared.core.lock();
            match core.settlement.clone() {
                Some(settlement) => settlement,
                None => {
                    core.reactions.push(Box::new(reaction));
                    return;
                }
            }
        };
        self.shared.queue.add(move || reaction(settled));
    }

    fn push_dependency(&self, dependency: Box<dyn WaitDependency>) {
        let mut core = self.shared.core.lock();
        if core.settlement.is_none() {
            core.wait_list.push(dependency);
        }
    }

    /// Register reactions for both outcomes.
    ///
    /// Returns a promise resolved with whatever the reaction that fires
    /// returns. Waiting on the returned promise drives this one.
    pub fn then<U, F, R, G, S>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        R: Into<Resolution<U, E>>,
        G: FnOnce(E) -> S + Send + 'static,
        S: Into<Resolution<U, E>>,
    {
        let child = Promise::<U, E>::pending_in(self.shared.queue.clone());
        child.push_dependency(Box::new(self.clone()));

        let target = Arc::downgrade(&child.shared);
        self.react(move |settlement| {
            let resolution = match settlement {
                Settlement::Fulfilled(value) => on_fulfilled(value).into(),
                Settlement::Rejected(reason) => on_rejected(reason).into(),
            };
            if let Some(child) = Promise::upgrade(&target) {
                child.resolve(resolution);
            }
        });
        child
    }

    /// React to fulfillment only; rejections pass through unchanged
    pub fn and_then<U, F, R>(&self, on_fulfilled: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> R + Send + 'static,
        R: Into<Resolution<U, E>>,
    {
        self.then(on_fulfilled, |reason: E| Err::<U, E>(reason))
    }

    /// React to rejection only; values pass through unchanged
    pub fn otherwise<G, S>(&self, on_rejected: G) -> Promise<T, E>
    where
        G: FnOnce(E) -> S + Send + 'static,
        S: Into<Resolution<T, E>>,
    {
        self.then(|value: T| Ok::<T, E>(value), on_rejected)
    }

    /// Drive this promise until it is no longer pending.
    ///
    /// Runs the wait function if there is one, otherwise waits on the
    /// promises this one depends on, then drains the queue. A promise that
    /// is still pending afterwards is rejected. No-op once settled, and a
    /// nested call while a wait is already in progress only drains the queue.
    pub fn force_settle(&self) {
        let (wait_fn, wait_list) = {
            let mut core = self.shared.core.lock();
            if core.settlement.is_some() {
                return;
            }
            if core.waiting {
                drop(core);
                self.shared.queue.run();
                return;
            }
            core.waiting = true;
            (core.wait_fn.take(), mem::take(&mut core.wait_list))
        };

        if let Some(wait) = wait_fn {
            wait(self);
        } else if !wait_list.is_empty() {
            for dependency in &wait_list {
                dependency.wait_if_pending();
            }
        } else {
            self.reject(PromiseError::NoWaitFunction.into());
        }
        drop(wait_list);

        self.shared.queue.run();
        self.shared.core.lock().waiting = false;

        if self.is_pending() {
            warn!("Wait function returned without settling the promise");
            self.reject(PromiseError::WaitDidNotSettle.into());
        }
    }

    /// Block on the outcome, driving deferred work as needed
    pub fn wait(&self) -> Result<T, E> {
        self.force_settle();
        match self.outcome() {
            Some(settlement) => settlement.into_result(),
            None => Err(PromiseError::WaitDidNotSettle.into()),
        }
    }
}

impl<T, E> WaitDependency for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: From<PromiseError> + Clone + Send + 'static,
{
    fn wait_if_pending(&self) {
        self.force_settle();
    }
}

impl<T, E> fmt::Debug for Promise<T, E>
where
    T: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Promise")
            .field("settlement", &core.settlement)
            .field("reactions", &core.reactions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type P<T> = Promise<T, PromiseError>;

    #[test]
    fn test_settles_exactly_once() {
        let p: P<u32> = Promise::pending();
        assert_eq!(p.state(), PromiseState::Pending);

        assert!(p.fulfill(1));
        assert!(!p.fulfill(2));
        assert!(!p.reject(PromiseError::rejected("late")));

        assert_eq!(p.state(), PromiseState::Fulfilled);
        assert_eq!(p.outcome(), Some(Settlement::Fulfilled(1)));
    }

    #[test]
    fn test_reactions_are_deferred_to_the_queue() {
        let queue = Arc::new(TaskQueue::new());
        let p: P<u32> = Promise::pending_in(queue.clone());
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let _: P<()> = p.and_then(move |v| {
            s.store(v as usize, Ordering::SeqCst);
            Ok::<_, PromiseError>(())
        });

        p.fulfill(7);
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        queue.run();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_then_after_settlement_does_not_reenter() {
        let queue = Arc::new(TaskQueue::new());
        let p: P<u32> = Promise::fulfilled_in(queue.clone(), 3);
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let child: P<u32> = p.and_then(move |v| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok::<_, PromiseError>(v * 2)
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(child.is_pending());

        queue.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(child.outcome(), Some(Settlement::Fulfilled(6)));
    }

    #[test]
    fn test_reactions_run_in_registration_order() {
        let queue = Arc::new(TaskQueue::new());
        let p: P<u32> = Promise::pending_in(queue.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let order = order.clone();
            let _: P<()> = p.and_then(move |_| {
                order.lock().push(i);
                Ok::<_, PromiseError>(())
            });
        }
        p.fulfill(0);
        queue.run();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rejection_reaches_on_rejected() {
        let p: P<u32> = Promise::pending();
        let child: P<&'static str> = p.then(
            |_| Ok::<_, PromiseError>("fulfilled"),
            |e| {
                assert_eq!(e, PromiseError::rejected("nope"));
                Ok::<_, PromiseError>("recovered")
            },
        );
        p.reject(PromiseError::rejected("nope"));

        assert_eq!(child.wait(), Ok("recovered"));
    }

    #[test]
    fn test_and_then_passes_rejection_through() {
        let p: P<u32> = Promise::rejected(PromiseError::rejected("bad"));
        let child: P<u32> = p.and_then(|v| Ok::<_, PromiseError>(v + 1));

        assert_eq!(child.wait(), Err(PromiseError::rejected("bad")));
    }

    #[test]
    fn test_otherwise_passes_value_through() {
        let p: P<u32> = Promise::fulfilled(5);
        let child = p.otherwise(|_| Ok::<_, PromiseError>(0));

        assert_eq!(child.wait(), Ok(5));
    }

    #[test]
    fn test_wait_runs_wait_function_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let p: P<&'static str> = Promise::with_wait(move |p| {
            c.fetch_add(1, Ordering::SeqCst);
            p.fulfill("done");
        });

        assert_eq!(p.wait(), Ok("done"));
        assert_eq!(p.wait(), Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_without_wait_function_rejects() {
        let p: P<u32> = Promise::pending();

        assert_eq!(p.wait(), Err(PromiseError::NoWaitFunction));
        assert_eq!(p.state(), PromiseState::Rejected);
    }

    #[test]
    fn test_wait_function_that_does_not_settle_rejects() {
        let p: P<u32> = Promise::with_wait(|_| {});

        assert_eq!(p.wait(), Err(PromiseError::WaitDidNotSettle));
    }

    #[test]
    fn test_force_settle_is_noop_when_settled() {
        let p: P<u32> = Promise::fulfilled(1);
        p.force_settle();
        p.force_settle();

        assert_eq!(p.outcome(), Some(Settlement::Fulfilled(1)));
    }

    #[test]
    fn test_waiting_on_child_drives_parent() {
        let parent: P<u32> = Promise::with_wait(|p| {
            p.fulfill(10);
        });
        let child: P<u32> = parent
            .and_then(|v| Ok::<u32, PromiseError>(v + 1))
            .and_then(|v| Ok::<_, PromiseError>(v * 2));

        assert_eq!(child.wait(), Ok(22));
        assert_eq!(parent.state(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_resolve_adopts_other_promise() {
        let inner: P<u32> = Promise::with_wait(|p| {
            p.fulfill(99);
        });
        let outer: P<u32> = Promise::pending();

        assert!(outer.resolve(inner.clone()));
        assert_eq!(outer.wait(), Ok(99));
    }

    #[test]
    fn test_reaction_returning_promise_is_adopted() {
        let p: P<u32> = Promise::fulfilled(1);
        let child: P<u32> = p.and_then(|v| {
            Promise::<u32, PromiseError>::with_wait(move |p| {
                p.fulfill(v + 100);
            })
        });

        assert_eq!(child.wait(), Ok(101));
    }

    #[test]
    fn test_resolve_with_itself_rejects() {
        let p: P<u32> = Promise::pending();
        p.resolve(p.clone());

        assert_eq!(p.state(), PromiseState::Rejected);
    }

    #[test]
    fn test_nested_wait_does_not_deadlock() {
        let outer_handle: Arc<Mutex<Option<P<u32>>>> = Arc::new(Mutex::new(None));
        let handle = outer_handle.clone();
        let p: P<u32> = Promise::with_wait(move |p| {
            if let Some(same) = handle.lock().clone() {
                // Re-entrant wait while the outer wait is still running.
                same.force_settle();
            }
            p.fulfill(4);
        });
        *outer_handle.lock() = Some(p.clone());

        assert_eq!(p.wait(), Ok(4));
        outer_handle.lock().take();
    }

    #[test]
    fn test_sealed_promise_ignores_other_settlements() {
        let queue = Arc::new(TaskQueue::new());
        let promise: Promise<u32> = Promise::pending_in(queue.clone());

        assert!(promise.seal());
        assert!(!promise.seal());
        assert!(!promise.fulfill(1));
        assert!(!promise.resolve(Promise::fulfilled_in(queue.clone(), 2)));
        assert!(promise.is_pending());

        assert!(promise.settle_sealed(Settlement::Rejected(PromiseError::rejected("owner"))));
        assert_eq!(promise.wait(), Err(PromiseError::rejected("owner")));
    }
}
