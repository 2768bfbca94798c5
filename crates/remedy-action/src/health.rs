//! Point-in-time view of engine load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ActionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Actions waiting for a worker.
    pub queue_depth: usize,
    /// Actions currently executing.
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub awaiting_approval: usize,
    /// Provider calls available right now.
    pub rate_limit_remaining: u32,
    /// Terminal outcomes within the last `window_seconds`.
    pub terminal_counts: BTreeMap<ActionStatus, u64>,
    pub window_seconds: u64,
    pub dry_run_mode: bool,
    pub shutting_down: bool,
}

impl HealthSnapshot {
    /// Every worker slot is busy and work is waiting.
    pub fn is_saturated(&self) -> bool {
        self.in_flight >= self.max_concurrent && self.queue_depth > 0
    }

    /// Terminal outcomes in the window that were not `completed`.
    pub fn failure_count(&self) -> u64 {
        self.terminal_counts
            .iter()
            .filter(|(status, _)| **status != ActionStatus::Completed)
            .map(|(_, n)| *n)
            .sum()
    }
}
