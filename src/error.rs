//! Error taxonomy for the HA client.
//!
//! Operational faults inside per-broker clients are caught at method
//! boundaries, logged, handed to the [`ExceptionTracker`], and converted to
//! a boolean `false` return. The coordinator surfaces only
//! `InvalidArgument` and `NoConnectedBrokers` to callers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::error;

use crate::protocol::SerializeError;
use crate::transport::TransportError;

/// Main error type for HA client operations
#[derive(Debug, Error)]
pub enum HaClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no user data available")]
    NoUserData,

    #[error("no broker hosts in address source")]
    NoBrokerHosts,

    #[error("publish failed: no connected brokers")]
    NoConnectedBrokers,

    #[error("transport operation failed: {0}")]
    Transport(#[from] TransportError),

    #[error("serializer failed: {0}")]
    Serialize(#[from] SerializeError),

    #[error("subscription handler failed: {0}")]
    Handler(String),
}

/// Result type for HA client operations
pub type HaResult<T> = Result<T, HaClientError>;

/// Callback invoked for every tracked exception: `(error, activity)`
pub type ExceptionCallback = Arc<dyn Fn(&HaClientError, &str) + Send + Sync>;

/// Records operational faults and relays them to the user callback.
///
/// Tracked faults never propagate out of the client; the tracker is the
/// single place a user can observe them besides the log.
#[derive(Default)]
pub struct ExceptionTracker {
    callback: Mutex<Option<ExceptionCallback>>,
    count: AtomicU64,
    last: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl ExceptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the user exception callback
    pub fn set_callback(&self, callback: ExceptionCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Record a fault that was suppressed at a method boundary
    pub fn track(&self, activity: &str, error: &HaClientError) {
        error!(activity, %error, "operation failed");
        self.count.fetch_add(1, Ordering::Relaxed);
        *self.last.lock().unwrap() = Some((error.to_string(), Utc::now()));
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(error, activity);
        }
    }

    /// Total number of tracked faults
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Most recently tracked fault, if any
    pub fn last(&self) -> Option<(String, DateTime<Utc>)> {
        self.last.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for ExceptionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionTracker")
            .field("count", &self.count())
            .finish()
    }
}
