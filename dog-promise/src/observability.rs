//! Optional subscriber setup.
//!
//! The library only emits `tracing` events. Binaries and tests that want to
//! see them can install a basic formatter with [`init_tracing`] (feature
//! `tracing-basic`), filtered by `RUST_LOG`.

use crate::error::{PromiseError, PromiseResult};

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Fails instead of panicking when a global subscriber is already set.
pub fn init_tracing() -> PromiseResult<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| PromiseError::observability(format!("Failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        let _ = init_tracing();
        assert!(matches!(init_tracing(), Err(PromiseError::Observability(_))));
    }
}
