//! # dog-promise: deferred values and bounded fan-out
//!
//! **Single-threaded promises with an explicit reaction queue, and a
//! concurrency-limited aggregator over lazy task sources**
//!
//! ## Building blocks
//!
//! - [`Promise`]: settles exactly once; reactions are always deferred to a
//!   [`TaskQueue`] and run in registration order.
//! - [`EachPromise`]: pulls keyed tasks from a [`Source`] on demand, keeps
//!   at most N in flight and reports each outcome to callbacks that may
//!   short-circuit the whole pipeline.
//! - [`combinators`]: `each`, `each_limit`, `each_limit_all`, `all` and
//!   `settle` built on top of `EachPromise`.
//! - [`TokioBackend`] (feature `tokio-backend`): runs futures on a tokio
//!   runtime and hands back promises synchronous code can wait on.
//!
//! ## Quick start
//!
//! ```rust
//! use dog_promise::prelude::*;
//!
//! let source: Source<usize, u32> = Source::from_values(vec![3, 1, 2]);
//! let values = dog_promise::all(source).wait().unwrap();
//!
//! assert_eq!(values, vec![(0, 3), (1, 1), (2, 2)]);
//! ```

pub mod combinators;
pub mod each;
pub mod error;
pub mod promise;
pub mod queue;
pub mod source;

#[cfg(feature = "tokio-backend")]
pub mod backend;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use combinators::{all, each, each_limit, each_limit_all, settle};
pub use each::{Concurrency, EachOptions, EachPromise, LimitFn, OnFulfilled, OnRejected};
pub use error::{PromiseError, PromiseResult};
pub use promise::{Promise, PromiseState, Resolution, Settlement};
pub use queue::{QueueTask, TaskQueue};
pub use source::{Source, SourceItem, Task};

#[cfg(feature = "tokio-backend")]
pub use backend::TokioBackend;

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Common imports
pub mod prelude {
    pub use crate::{
        Concurrency, EachOptions, EachPromise, Promise, PromiseError, PromiseResult,
        PromiseState, Settlement, Source, Task, TaskQueue,
    };

    #[cfg(feature = "tokio-backend")]
    pub use crate::TokioBackend;
}
