//! # EachPromise configuration
//!
//! Options are plain builder calls. For applications that keep their
//! settings in a string key/value store, [`EachOptions::set`] and
//! [`EachOptions::from_settings`] accept the same options as strings and
//! reject unknown keys or malformed values up front, before any task is
//! scheduled.
//!
//! ```rust
//! use dog_promise::EachOptions;
//!
//! let options: EachOptions<usize, String> = EachOptions::from_settings([("concurrency", "4")]).unwrap();
//! assert_eq!(options.concurrency_setting().limit(0), Some(4));
//!
//! assert!(EachOptions::<usize, String>::new().set("concurrency", "-1").is_err());
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{PromiseError, PromiseResult};
use crate::promise::Promise;

/// Callback invoked when an item fulfills: `(value, key, aggregate)`
pub type OnFulfilled<K, T, E> = Arc<dyn Fn(T, K, &Promise<(), E>) + Send + Sync + 'static>;

/// Callback invoked when an item rejects: `(reason, key, aggregate)`
pub type OnRejected<K, E> = Arc<dyn Fn(E, K, &Promise<(), E>) + Send + Sync + 'static>;

/// Limit as a function of the current in-flight count
pub type LimitFn = Arc<dyn Fn(usize) -> usize + Send + Sync + 'static>;

/// How many tasks may be in flight at once
#[derive(Clone, Default)]
pub enum Concurrency {
    #[default]
    Unlimited,
    /// A fixed cap; `0` freezes intake
    Fixed(usize),
    /// Re-evaluated on every refill with the current in-flight count
    Dynamic(LimitFn),
}

impl Concurrency {
    pub fn dynamic<F>(limit: F) -> Self
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        Concurrency::Dynamic(Arc::new(limit))
    }

    /// The cap given `in_flight` admitted tasks; `None` when unlimited
    pub fn limit(&self, in_flight: usize) -> Option<usize> {
        match self {
            Concurrency::Unlimited => None,
            Concurrency::Fixed(limit) => Some(*limit),
            Concurrency::Dynamic(limit) => Some(limit(in_flight)),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Concurrency::Unlimited)
    }
}

impl From<usize> for Concurrency {
    fn from(limit: usize) -> Self {
        Concurrency::Fixed(limit)
    }
}

impl FromStr for Concurrency {
    type Err = PromiseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "unlimited" | "none" => Ok(Concurrency::Unlimited),
            other => other
                .parse::<usize>()
                .map(Concurrency::Fixed)
                .map_err(|_| PromiseError::InvalidConcurrency(value.to_string())),
        }
    }
}

impl fmt::Debug for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Unlimited => f.write_str("Unlimited"),
            Concurrency::Fixed(limit) => f.debug_tuple("Fixed").field(limit).finish(),
            Concurrency::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Options for an [`EachPromise`](crate::EachPromise)
pub struct EachOptions<K, T, E = PromiseError> {
    pub(crate) concurrency: Concurrency,
    pub(crate) on_fulfilled: Option<OnFulfilled<K, T, E>>,
    pub(crate) on_rejected: Option<OnRejected<K, E>>,
}

impl<K, T, E> Default for EachOptions<K, T, E> {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Unlimited,
            on_fulfilled: None,
            on_rejected: None,
        }
    }
}

impl<K, T, E> EachOptions<K, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of tasks in flight; `0` freezes intake
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Concurrency::Fixed(limit);
        self
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Compute the cap from the current in-flight count on every refill
    pub fn concurrency_fn<F>(mut self, limit: F) -> Self
    where
        F: Fn(usize) -> usize + Send + Sync + 'static,
    {
        self.concurrency = Concurrency::dynamic(limit);
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.concurrency = Concurrency::Unlimited;
        self
    }

    /// Called once per fulfilled item. The aggregate may be settled from
    /// inside the callback to short-circuit the pipeline.
    pub fn on_fulfilled<F>(mut self, callback: F) -> Self
    where
        F: Fn(T, K, &Promise<(), E>) + Send + Sync + 'static,
    {
        self.on_fulfilled = Some(Arc::new(callback));
        self
    }

    /// Called once per rejected item. The aggregate may be settled from
    /// inside the callback to short-circuit the pipeline.
    pub fn on_rejected<F>(mut self, callback: F) -> Self
    where
        F: Fn(E, K, &Promise<(), E>) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(callback));
        self
    }

    pub fn concurrency_setting(&self) -> &Concurrency {
        &self.concurrency
    }

    /// Apply a string setting. Recognised keys: `concurrency`.
    pub fn set(mut self, key: &str, value: &str) -> PromiseResult<Self> {
        match key {
            "concurrency" => {
                self.concurrency = value.parse()?;
                Ok(self)
            }
            other => Err(PromiseError::UnknownOption(other.to_string())),
        }
    }

    /// Build options from string key/value pairs
    pub fn from_settings<I, S, V>(settings: I) -> PromiseResult<Self>
    where
        I: IntoIterator<Item = (S, V)>,
        S: AsRef<str>,
        V: AsRef<str>,
    {
        settings
            .into_iter()
            .try_fold(Self::new(), |options, (key, value)| {
                options.set(key.as_ref(), value.as_ref())
            })
    }
}

impl<K, T, E> fmt::Debug for EachOptions<K, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EachOptions")
            .field("concurrency", &self.concurrency)
            .field("on_fulfilled", &self.on_fulfilled.is_some())
            .field("on_rejected", &self.on_rejected.is_some())
            .finish()
    }
}
