//! Engine metrics, registered against a caller-supplied registry.

use crate::error::{Error, Result};
use prometheus::{IntCounter, Registry};

/// Counters the engine maintains.
#[derive(Clone)]
pub struct Metrics {
    container_destroy_errors: IntCounter,
}

impl Metrics {
    /// Creates the engine's metrics and registers them on `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let container_destroy_errors = IntCounter::new(
            "containerizer_mesos_container_destroy_errors",
            "Number of containers that failed to be destroyed",
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        registry
            .register(Box::new(container_destroy_errors.clone()))
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(Self {
            container_destroy_errors,
        })
    }

    /// Counts one destroy-time failure.
    pub(crate) fn destroy_error(&self) {
        self.container_destroy_errors.inc();
    }

    /// Current destroy-failure count.
    #[must_use]
    pub fn container_destroy_errors(&self) -> u64 {
        self.container_destroy_errors.get()
    }
}
