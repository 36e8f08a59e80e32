//! Tracing subscriber setup
//!
//! The library itself only emits `tracing` events. Applications and tests
//! pick where they go: [`LoggingScope`] installs a subscriber for the current
//! thread until the scope is dropped, [`init_global`] installs one for the
//! whole process.

use crate::error::{Result, RevStoreError};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

/// A thread-local subscriber, active until dropped
pub struct LoggingScope {
    filter: String,
    _guard: DefaultGuard,
}

impl std::fmt::Debug for LoggingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingScope").field("filter", &self.filter).finish()
    }
}

impl LoggingScope {
    /// Log events matching `filter` (e.g. `"revstore=debug"`) on this thread
    pub fn install(filter: &str) -> Result<Self> {
        let env_filter = parse_filter(filter)?;
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_test_writer()
            .finish();
        Ok(Self {
            filter: filter.to_string(),
            _guard: tracing::subscriber::set_default(subscriber),
        })
    }

    /// Filter this scope was installed with
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

/// Install a process-wide subscriber
///
/// `RUST_LOG` wins over `default_filter` when set. Fails if a global
/// subscriber is already installed.
pub fn init_global(default_filter: &str) -> Result<()> {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(value) if !value.is_empty() => parse_filter(&value)?,
        _ => parse_filter(default_filter)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|e| RevStoreError::InvalidConfiguration(format!("failed to install subscriber: {}", e)))
}

fn parse_filter(filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter)
        .map_err(|e| RevStoreError::InvalidConfiguration(format!("invalid log filter '{}': {}", filter, e)))
}
