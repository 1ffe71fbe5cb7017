//! Conservation ledger and backpressure state.

use serde::{Deserialize, Serialize};

use crate::config::GovernorConfig;

/// Running totals of abstraction added by installs and collapsed by demotions.
///
/// Both counters only ever grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Ledger {
    pub added: u64,
    pub collapsed: u64,
}

impl Ledger {
    pub fn record_added(&mut self, delta: u64) {
        self.added = self.added.saturating_add(delta);
    }

    pub fn record_collapsed(&mut self, delta: u64) {
        self.collapsed = self.collapsed.saturating_add(delta);
    }

    /// `added - collapsed`, floored at zero.
    pub fn imbalance(&self) -> u64 {
        self.added.saturating_sub(self.collapsed)
    }
}

/// Reversible knobs the governor turns when the ledger is out of balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backpressure {
    pub active: bool,
    pub dedup_sweep_scheduled: bool,
    pub reasoning_depth: u8,
    pub min_crispness: f32,
    /// Times backpressure has engaged.
    pub engagements: u64,
}

impl Backpressure {
    pub fn relaxed(config: &GovernorConfig) -> Self {
        Self {
            active: false,
            dedup_sweep_scheduled: false,
            reasoning_depth: config.default_reasoning_depth,
            min_crispness: config.default_min_crispness,
            engagements: 0,
        }
    }
}

/// Outcome of a backpressure evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureChange {
    Engaged,
    Held,
    Relaxed,
    Idle,
}
