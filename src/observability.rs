//! Logging setup, health status, and the error history buffer

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::EngineError;

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level so operators can raise
/// verbosity per target without touching config files. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Engine health for the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Reconcile loop alive and draining
    Healthy,
    /// Loop alive, but recent internal errors were recorded
    Degraded,
    /// Loop gone
    Unhealthy,
}

/// One recorded error
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Stable error code
    pub code: String,
    /// Human message
    pub message: String,
    /// Want the error relates to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub want_id: Option<String>,
    /// When it was recorded
    pub timestamp: DateTime<Utc>,
}

/// Bounded ring buffer of recent errors, inspectable via the API
#[derive(Clone)]
pub struct ErrorLog {
    inner: Arc<Mutex<VecDeque<ErrorRecord>>>,
    capacity: usize,
}

impl ErrorLog {
    /// Default capacity used by the engine
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Ring buffer holding at most `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    /// Record an engine error
    pub fn record(&self, error: &EngineError, want_id: Option<String>) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(ErrorRecord {
            code: error.code().to_string(),
            message: error.to_string(),
            want_id,
            timestamp: Utc::now(),
        });
    }

    /// Most recent errors, newest last
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Number of buffered records
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Drop every buffered record
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
