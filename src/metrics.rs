//! Process-lifetime counters reported through `get_metrics`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Counters only grow; they reset when the process restarts, never on reload.
#[derive(Debug)]
pub struct Metrics {
    pub messages_processed: u64,
    pub duplicates_suppressed: u64,
    pub errors: u64,
    pub restarts: u64,
    started_at: DateTime<Utc>,
    started: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_processed: u64,
    pub duplicates_suppressed: u64,
    pub errors: u64,
    pub restarts: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_processed: 0,
            duplicates_suppressed: 0,
            errors: 0,
            restarts: 0,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_processed: self.messages_processed,
            duplicates_suppressed: self.duplicates_suppressed,
            errors: self.errors,
            restarts: self.restarts,
            started_at: self.started_at,
            uptime_secs: self.uptime_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
