//! Activity counters and per-broker status and statistics records.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::BrokerStatus;

/// A counter that also remembers when it last moved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityCounter {
    total: u64,
    last: Option<DateTime<Utc>>,
}

impl ActivityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence
    pub fn update(&mut self) {
        self.total += 1;
        self.last = Some(Utc::now());
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn last(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.last = None;
    }

    /// Count as `Some` only when non-zero, for the stats record
    pub fn non_zero(&self) -> Option<u64> {
        (self.total > 0).then_some(self.total)
    }
}

/// Status summary for one broker
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BrokerSummary {
    pub identity: String,
    pub alias: String,
    pub status: BrokerStatus,
    pub disconnects: u64,
    pub failures: u64,
    pub retries: u32,
}

/// Statistics record for one broker; zero counters serialize as absent
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BrokerStats {
    pub alias: String,
    pub identity: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnects: Option<u64>,
    #[serde(rename = "disconnect-last", skip_serializing_if = "Option::is_none")]
    pub disconnect_last: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<u64>,
    #[serde(rename = "failure-last", skip_serializing_if = "Option::is_none")]
    pub failure_last: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}
