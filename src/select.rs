//! Working-set selection.
//!
//! [`select`] is a pure function over already-scored candidates. It applies
//! the eligibility filters, ranks by structural richness then relevance, and
//! slices the ranking into the peripheral, focus, micro and macro sets every
//! read path works from.
//!
//! If strict richness filtering would leave the focus set starved, the
//! richness floor is dropped and the ranking is rebuilt from every eligible
//! record. Eligibility (shadow, dormant, canonical-only) is never relaxed.

use serde::{Deserialize, Serialize};

use crate::config::SelectionConfig;
use crate::record::{Record, RecordId, Tier, Visibility};

/// A record paired with the caller's relevance score in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct ScoredCandidate<'a> {
    pub record: &'a Record,
    pub relevance: f32,
}

/// Size limits and filters for one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionBudgets {
    pub peripheral: usize,
    pub focus: usize,
    pub micro: usize,
    /// Structural richness floor applied before the starvation guard.
    pub min_richness: f32,
    /// Drop records that point at a canonical replacement.
    pub canonical_only: bool,
}

impl Default for SelectionBudgets {
    fn default() -> Self {
        Self::from_config(&SelectionConfig::default(), 0.30)
    }
}

impl SelectionBudgets {
    pub fn from_config(config: &SelectionConfig, min_richness: f32) -> Self {
        Self {
            peripheral: config.peripheral,
            focus: config.focus,
            micro: config.micro,
            min_richness,
            canonical_only: false,
        }
    }

    pub fn canonical_only(mut self, on: bool) -> Self {
        self.canonical_only = on;
        self
    }

    /// Focus size below which the starvation guard widens selection.
    pub fn starvation_floor(&self) -> usize {
        50.min(self.focus / 10)
    }
}

/// Result of a selection. Every list is in rank order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSet {
    pub focus: Vec<RecordId>,
    /// Detail-eligible subset of focus, for tight citations.
    pub micro: Vec<RecordId>,
    /// Aggregate and Kernel members of focus, for generalization.
    pub macro_set: Vec<RecordId>,
    pub peripheral: Vec<RecordId>,
    /// Whether the starvation guard dropped the richness floor.
    pub relaxed: bool,
}

/// Structural richness in `[0, 1]`: rewards invariants, tests, lineage and
/// concrete content, and halves the score of near-empty records.
pub fn structural_richness(record: &Record) -> f32 {
    let c = &record.content;
    let mut score = 0.0;
    if !c.invariants.is_empty() {
        score += 0.30;
    }
    if !c.tests.is_empty() {
        score += 0.20;
    }
    if !record.lineage.is_empty() {
        score += 0.15;
    }
    if !c.definitions.is_empty() {
        score += 0.15;
    }
    if !c.examples.is_empty() {
        score += 0.10;
    }
    if !c.claims.is_empty() || !c.next_actions.is_empty() {
        score += 0.10;
    }
    if c.richness() + c.tests.len() <= 1 {
        score *= 0.5;
    }
    score
}

fn eligible(record: &Record, budgets: &SelectionBudgets) -> bool {
    record.visibility != Visibility::Shadow
        && !record.status.is_dormant()
        && (!budgets.canonical_only || record.is_canonical())
}

/// Regular records with something concrete to cite.
fn detail_eligible(record: &Record) -> bool {
    record.tier == Tier::Regular
        && (!record.content.invariants.is_empty()
            || !record.content.examples.is_empty()
            || !record.content.claims.is_empty())
}

/// Select a working set from scored candidates.
pub fn select(candidates: &[ScoredCandidate<'_>], budgets: &SelectionBudgets) -> WorkingSet {
    let mut ranked: Vec<(&Record, f32, f32)> = candidates
        .iter()
        .filter(|c| eligible(c.record, budgets))
        .map(|c| (c.record, structural_richness(c.record), c.relevance))
        .collect();
    ranked.sort_by(|a, b| {
        b.1.total_cmp(&a.1)
            .then(b.2.total_cmp(&a.2))
            .then(a.0.id.cmp(&b.0.id))
    });

    let strict: Vec<&Record> = ranked
        .iter()
        .filter(|(_, richness, _)| *richness >= budgets.min_richness)
        .map(|(r, _, _)| *r)
        .collect();

    let mut relaxed = false;
    let mut peripheral: Vec<&Record> = strict.into_iter().take(budgets.peripheral).collect();
    let floor = budgets.starvation_floor();
    if peripheral.len().min(budgets.focus) < floor && ranked.len() > peripheral.len() {
        peripheral = ranked
            .iter()
            .map(|(r, _, _)| *r)
            .take(budgets.peripheral)
            .collect();
        relaxed = true;
    }

    let focus: Vec<&Record> = peripheral.iter().copied().take(budgets.focus).collect();
    WorkingSet {
        micro: focus
            .iter()
            .filter(|r| detail_eligible(r))
            .take(budgets.micro)
            .map(|r| r.id)
            .collect(),
        macro_set: focus
            .iter()
            .filter(|r| r.tier >= Tier::Aggregate)
            .map(|r| r.id)
            .collect(),
        focus: focus.iter().map(|r| r.id).collect(),
        peripheral: peripheral.iter().map(|r| r.id).collect(),
        relaxed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{CandidateRecord, RecordStatus};

    fn rec(id: u64, candidate: CandidateRecord) -> Record {
        candidate.into_record(RecordId::new(id).unwrap(), 40, 0)
    }

    fn rich(id: u64) -> Record {
        rec(
            id,
            CandidateRecord::new(format!("rich {id}"))
                .invariant("holds")
                .definition("d")
                .example("e")
                .test("t"),
        )
    }

    fn thin(id: u64) -> Record {
        rec(id, CandidateRecord::new(format!("thin {id}")).claim("maybe"))
    }

    fn scored(records: &[Record], relevance: f32) -> Vec<ScoredCandidate<'_>> {
        records
            .iter()
            .map(|record| ScoredCandidate { record, relevance })
            .collect()
    }

    #[test]
    fn richness_rewards_structure_and_penalizes_empty() {
        assert!(structural_richness(&rich(1)) > 0.7);
        assert!(structural_richness(&thin(1)) < 0.1);
    }

    #[test]
    fn shadow_and_dormant_records_are_never_selected() {
        let mut records = vec![rich(1), rich(2), rich(3)];
        records[0].visibility = Visibility::Shadow;
        records[1].status = RecordStatus::Merged;
        let ws = select(&scored(&records, 0.5), &SelectionBudgets::default());
        assert_eq!(ws.focus, vec![RecordId::new(3).unwrap()]);
    }

    #[test]
    fn richness_ranks_before_relevance() {
        let records = vec![thin(1), rich(2)];
        let mut candidates = scored(&records, 0.1);
        candidates[0].relevance = 1.0;
        let budgets = SelectionBudgets {
            min_richness: 0.0,
            ..Default::default()
        };
        let ws = select(&candidates, &budgets);
        assert_eq!(ws.focus[0], RecordId::new(2).unwrap());
    }

    #[test]
    fn relevance_breaks_richness_ties() {
        let records = vec![rich(1), rich(2)];
        let mut candidates = scored(&records, 0.1);
        candidates[1].relevance = 0.9;
        let ws = select(&candidates, &SelectionBudgets::default());
        assert_eq!(ws.focus, vec![RecordId::new(2).unwrap(), RecordId::new(1).unwrap()]);
    }

    #[test]
    fn starvation_guard_widens_focus() {
        let mut records: Vec<Record> = (1..=1000).map(thin).collect();
        records.push(rich(1001));
        let mut candidates = scored(&records, 0.05);
        candidates[1000].relevance = 1.0;
        let budgets = SelectionBudgets::default();
        let ws = select(&candidates, &budgets);
        assert!(ws.relaxed);
        assert!(ws.focus.len() >= budgets.starvation_floor());
        assert_eq!(ws.focus.len(), 500);
        assert_eq!(ws.focus[0], RecordId::new(1001).unwrap());
        assert_eq!(ws.micro.len(), 50);
    }

    #[test]
    fn guard_does_not_fire_when_focus_is_healthy() {
        let records: Vec<Record> = (1..=60).map(rich).collect();
        let ws = select(&scored(&records, 0.5), &SelectionBudgets::default());
        assert!(!ws.relaxed);
        assert_eq!(ws.focus.len(), 60);
    }

    #[test]
    fn canonical_only_drops_subsumed_records() {
        let mut records = vec![rich(1), rich(2)];
        records[0].canonical = RecordId::new(2);
        records[1].tier = Tier::Aggregate;
        let budgets = SelectionBudgets::default().canonical_only(true);
        let ws = select(&scored(&records, 0.5), &budgets);
        assert_eq!(ws.focus, vec![RecordId::new(2).unwrap()]);
        assert_eq!(ws.macro_set, vec![RecordId::new(2).unwrap()]);
        assert!(ws.micro.is_empty());
    }

    #[test]
    fn budgets_bound_every_set() {
        let records: Vec<Record> = (1..=40).map(rich).collect();
        let budgets = SelectionBudgets {
            peripheral: 30,
            focus: 20,
            micro: 5,
            min_richness: 0.3,
            canonical_only: false,
        };
        let ws = select(&scored(&records, 0.5), &budgets);
        assert_eq!(ws.peripheral.len(), 30);
        assert_eq!(ws.focus.len(), 20);
        assert_eq!(ws.micro.len(), 5);
        assert_eq!(ws.focus[..], ws.peripheral[..20]);
    }
}
