//! Abstraction governor: tier placement, sublinear budgets, conservation.
//!
//! The governor decides which tier a record belongs in, keeps the higher
//! tiers sparse as the store grows, and watches the [`Ledger`] for runaway
//! abstraction. It never installs records itself; the commit pipeline calls
//! [`Governor::place`] during install and the periodic upgrade calls the
//! maintenance operations here.
//!
//! Budgets for a store of `N` records:
//!
//! | Tier | Capacity |
//! |---|---|
//! | Aggregate | `floor(sqrt(N) / 2)` |
//! | Kernel | `floor(log2(N) / 5)` |

pub mod ledger;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use ledger::{Backpressure, BackpressureChange, Ledger};

use crate::config::GovernorConfig;
use crate::record::{Record, RecordId, Tier};
use crate::store::RecordStore;

/// Tier and score decided for a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub tier: Tier,
    pub score: f32,
}

/// Capacity of the higher tiers for a given store size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBudgets {
    pub aggregate: usize,
    pub kernel: usize,
}

impl TierBudgets {
    pub fn for_size(n: usize) -> Self {
        let aggregate = ((n as f64).sqrt() / 2.0).floor() as usize;
        let kernel = if n < 2 {
            0
        } else {
            ((n as f64).log2() / 5.0).floor() as usize
        };
        Self { aggregate, kernel }
    }

    pub fn capacity(&self, tier: Tier) -> usize {
        match tier {
            Tier::Regular => usize::MAX,
            Tier::Aggregate => self.aggregate,
            Tier::Kernel => self.kernel,
        }
    }
}

/// A single one-step demotion performed by budget enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demotion {
    pub id: RecordId,
    pub from: Tier,
    pub to: Tier,
}

/// Governor state that survives restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorState {
    pub ledger: Ledger,
    pub backpressure: Backpressure,
    /// Unix seconds of the last periodic upgrade.
    pub last_upgrade: Option<u64>,
}

impl GovernorState {
    pub fn new(config: &GovernorConfig) -> Self {
        Self {
            ledger: Ledger::default(),
            backpressure: Backpressure::relaxed(config),
            last_upgrade: None,
        }
    }
}

/// The abstraction governor.
#[derive(Debug, Clone)]
pub struct Governor {
    config: GovernorConfig,
    state: GovernorState,
}

fn saturate(value: f32, at: f32) -> f32 {
    if at <= 0.0 {
        return 1.0;
    }
    (value / at).clamp(0.0, 1.0)
}

impl Governor {
    pub fn new(config: GovernorConfig) -> Self {
        let state = GovernorState::new(&config);
        Self { config, state }
    }

    pub fn with_state(config: GovernorConfig, state: GovernorState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn state(&self) -> &GovernorState {
        &self.state
    }

    pub fn ledger(&self) -> Ledger {
        self.state.ledger
    }

    pub fn backpressure(&self) -> &Backpressure {
        &self.state.backpressure
    }

    /// Blend of reuse and richness in `[0, 1]`, plus a small bonus for tests.
    pub fn score(&self, record: &Record) -> f32 {
        let c = &self.config;
        let uses = saturate(record.usage.count as f32, c.use_saturation as f32);
        let contexts = saturate(
            record.usage.contexts.len() as f32,
            c.context_saturation as f32,
        );
        let reuse = 0.5 * uses + 0.5 * contexts;
        let body = &record.content;
        let richness = saturate(
            (body.definitions.len() + body.invariants.len() + body.examples.len()) as f32,
            c.richness_saturation as f32,
        );
        let bonus = if record.has_tests() { c.test_bonus } else { 0.0 };
        (c.reuse_weight * reuse + c.richness_weight * richness + bonus).clamp(0.0, 1.0)
    }

    /// Decide tier and score from usage and content.
    pub fn place(&self, record: &Record) -> Placement {
        let c = &self.config;
        let score = self.score(record);
        let uses = record.usage.count;
        let contexts = record.usage.contexts.len();
        let tier = if score >= c.kernel_min_score
            && uses >= c.kernel_min_uses
            && contexts >= c.kernel_min_contexts
            && record.has_tests()
        {
            Tier::Kernel
        } else if score >= c.aggregate_min_score
            && uses >= c.aggregate_min_uses
            && contexts >= c.aggregate_min_contexts
        {
            Tier::Aggregate
        } else {
            Tier::Regular
        };
        Placement { tier, score }
    }

    /// Account for an install at `tier`.
    pub fn record_install(&mut self, tier: Tier) {
        self.state.ledger.record_added(tier.level());
    }

    /// Account for a one-step demotion.
    pub fn record_demotion(&mut self) {
        self.state.ledger.record_collapsed(1);
    }

    /// Remaining room in the Aggregate and Kernel tiers.
    pub fn spare_capacity(&self, store: &RecordStore) -> TierBudgets {
        let budgets = TierBudgets::for_size(store.len());
        TierBudgets {
            aggregate: budgets
                .aggregate
                .saturating_sub(store.count_tier(Tier::Aggregate)),
            kernel: budgets.kernel.saturating_sub(store.count_tier(Tier::Kernel)),
        }
    }

    /// Demote the lowest-utility members of any over-budget tier by one step.
    ///
    /// Kernel is enforced first so that its demotions are counted against the
    /// Aggregate budget in the same pass.
    pub fn enforce_budgets(&mut self, store: &mut RecordStore, now: u64) -> Vec<Demotion> {
        let budgets = TierBudgets::for_size(store.len());
        let mut demotions = Vec::new();
        for tier in [Tier::Kernel, Tier::Aggregate] {
            let mut members: Vec<(RecordId, f32)> = store
                .iter()
                .filter(|r| r.tier == tier)
                .map(|r| (r.id, r.abstraction_score * (r.usage.count as f32 + 1.0)))
                .collect();
            let cap = budgets.capacity(tier);
            if members.len() <= cap {
                continue;
            }
            members.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            let excess = members.len() - cap;
            for (id, utility) in members.into_iter().take(excess) {
                let Some(record) = store.get_mut(id) else {
                    tracing::warn!(record_id = %id, "budget enforcement: record vanished, skipping");
                    continue;
                };
                let Some(to) = tier.demoted() else {
                    continue;
                };
                record.tier = to;
                record.updated_at = now;
                self.record_demotion();
                tracing::info!(
                    record_id = %id,
                    from = %tier,
                    to = %to,
                    utility,
                    "governor: demoted over-budget record"
                );
                demotions.push(Demotion { id, from: tier, to });
            }
        }
        demotions
    }

    /// Engage or relax backpressure from the current ledger imbalance.
    pub fn evaluate_backpressure(&mut self) -> BackpressureChange {
        let imbalance = self.state.ledger.imbalance();
        let threshold = self.config.backpressure_threshold;
        let bp = &mut self.state.backpressure;
        if imbalance > threshold {
            if bp.active {
                return BackpressureChange::Held;
            }
            bp.active = true;
            bp.dedup_sweep_scheduled = true;
            bp.reasoning_depth = self.config.default_reasoning_depth.saturating_sub(1).max(1);
            bp.min_crispness =
                (self.config.default_min_crispness + self.config.crispness_step).min(self.config.max_crispness);
            bp.engagements += 1;
            tracing::info!(
                imbalance,
                threshold,
                reasoning_depth = bp.reasoning_depth,
                min_crispness = bp.min_crispness,
                "governor: backpressure engaged"
            );
            BackpressureChange::Engaged
        } else if bp.active {
            *bp = Backpressure {
                engagements: bp.engagements,
                ..Backpressure::relaxed(&self.config)
            };
            tracing::info!(imbalance, threshold, "governor: backpressure relaxed");
            BackpressureChange::Relaxed
        } else {
            BackpressureChange::Idle
        }
    }

    /// Point live duplicates (same fingerprint) at the oldest copy and clear
    /// the sweep flag. Returns the ids that received a canonical pointer.
    pub fn dedup_sweep(&mut self, store: &mut RecordStore, now: u64) -> Vec<RecordId> {
        let mut groups: HashMap<String, Vec<RecordId>> = HashMap::new();
        for record in store.iter().filter(|r| r.is_live_canonical()) {
            if !record.fingerprint.is_empty() {
                groups
                    .entry(record.fingerprint.clone())
                    .or_default()
                    .push(record.id);
            }
        }
        let mut merged = Vec::new();
        for ids in groups.into_values().filter(|ids| ids.len() > 1) {
            let keeper = ids.iter().copied().min();
            for id in ids {
                if Some(id) == keeper {
                    continue;
                }
                if let Some(record) = store.get_mut(id) {
                    record.canonical = keeper;
                    record.updated_at = now;
                    merged.push(id);
                }
            }
        }
        merged.sort();
        self.state.backpressure.dedup_sweep_scheduled = false;
        tracing::info!(merged = merged.len(), "governor: dedup sweep complete");
        merged
    }

    /// Whether the periodic upgrade should run at `now`.
    pub fn upgrade_due(&self, now: u64) -> bool {
        match self.state.last_upgrade {
            None => true,
            Some(last) => now >= last.saturating_add(self.config.upgrade_cadence_secs()),
        }
    }

    pub fn mark_upgraded(&mut self, now: u64) {
        self.state.last_upgrade = Some(now);
    }
}
