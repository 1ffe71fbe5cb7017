//! Auto-promotion: cluster base records and synthesize higher-tier records.
//!
//! This module only plans. It picks clusters of similar canonical Regular
//! records and builds extractive [`CandidateRecord`]s for them; the knowledge
//! base submits those candidates through the commit pipeline as
//! [`Origin::System`](crate::record::Origin::System) and applies canonical
//! pointers once an install succeeds.
//!
//! Synthesis never writes content of its own: every definition, invariant,
//! claim, example, next action and test in an aggregate is copied from a
//! member. Kernels carry only definitions and routing entries that cite their
//! aggregates.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::PromotionConfig;
use crate::fingerprint::{jaccard, normalize, tag_jaccard, token_set};
use crate::record::{CandidateRecord, Record, RecordId, Tier};
use crate::store::RecordStore;

/// Originator stamped on synthesized candidates.
pub const PROMOTION_ORIGINATOR: &str = "auto-promotion";

/// A cluster and the aggregate candidate synthesized from it.
#[derive(Debug, Clone)]
pub struct AggregatePlan {
    pub seed: RecordId,
    pub members: Vec<RecordId>,
    pub candidate: CandidateRecord,
}

/// Aggregates to route over and the kernel candidate synthesized from them.
#[derive(Debug, Clone)]
pub struct KernelPlan {
    pub members: Vec<RecordId>,
    pub candidate: CandidateRecord,
}

/// What a promotion run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    pub aggregates: Vec<RecordId>,
    pub kernels: Vec<RecordId>,
    /// Members that received a canonical pointer.
    pub canonicalized: usize,
    /// Plans that did not install (rejected or failed).
    pub skipped: usize,
}

/// Clustering and synthesis over a store.
#[derive(Debug, Clone, Copy)]
pub struct Promoter<'a> {
    config: &'a PromotionConfig,
    tag_cap: usize,
}

impl<'a> Promoter<'a> {
    pub fn new(config: &'a PromotionConfig, tag_cap: usize) -> Self {
        Self { config, tag_cap }
    }

    /// Cold-store guard: promotion needs enough cumulative usage to mean anything.
    pub fn is_warm(&self, store: &RecordStore) -> bool {
        store.total_usage() >= self.config.min_total_usage
    }

    /// Group canonical Regular records into clusters, seeded by usage.
    pub fn clusters(&self, store: &RecordStore, limit: usize) -> Vec<Vec<RecordId>> {
        let mut pool: Vec<&Record> = store
            .iter()
            .filter(|r| r.tier == Tier::Regular && r.is_live_canonical())
            .collect();
        pool.sort_by(|a, b| b.usage.count.cmp(&a.usage.count).then(a.id.cmp(&b.id)));
        let tokens: Vec<HashSet<String>> = pool.iter().map(|r| token_set(r)).collect();

        let mut taken = vec![false; pool.len()];
        let mut out = Vec::new();
        for seed in 0..pool.len() {
            if out.len() >= limit {
                break;
            }
            if taken[seed] {
                continue;
            }
            let mut cluster = vec![seed];
            for cand in 0..pool.len() {
                if cluster.len() >= self.config.max_cluster {
                    break;
                }
                if cand == seed || taken[cand] {
                    continue;
                }
                let by_tags = tag_jaccard(&pool[seed].tags, &pool[cand].tags) >= self.config.tag_jaccard;
                let by_tokens = jaccard(&tokens[seed], &tokens[cand]) >= self.config.token_jaccard;
                if by_tags || by_tokens {
                    cluster.push(cand);
                }
            }
            if cluster.len() < self.config.min_cluster {
                continue;
            }
            for &i in &cluster {
                taken[i] = true;
            }
            out.push(cluster.into_iter().map(|i| pool[i].id).collect());
        }
        out
    }

    /// Plan up to `limit` aggregates.
    pub fn plan_aggregates(&self, store: &RecordStore, limit: usize) -> Vec<AggregatePlan> {
        self.clusters(store, limit)
            .into_iter()
            .filter_map(|members| {
                let records: Vec<&Record> = members.iter().filter_map(|id| store.get(*id)).collect();
                if records.len() != members.len() {
                    return None;
                }
                Some(AggregatePlan {
                    seed: members[0],
                    candidate: self.synthesize_aggregate(&records),
                    members,
                })
            })
            .collect()
    }

    /// Extractive aggregate over `members` (seed first).
    pub fn synthesize_aggregate(&self, members: &[&Record]) -> CandidateRecord {
        let cap = self.config.content_cap;
        let seed = members[0];
        let mut candidate = CandidateRecord::new(format!(
            "{} (aggregate of {})",
            seed.title,
            members.len()
        ));
        candidate.summary = Some(
            members
                .iter()
                .map(|r| r.title.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        );
        let c = &mut candidate.content;
        c.definitions = capped_union(members.iter().map(|r| &r.content.definitions), cap);
        c.invariants = capped_union(members.iter().map(|r| &r.content.invariants), cap);
        c.claims = capped_union(members.iter().map(|r| &r.content.claims), cap);
        c.examples = capped_union(members.iter().map(|r| &r.content.examples), cap);
        c.next_actions = capped_union(members.iter().map(|r| &r.content.next_actions), cap);
        c.tests = capped_union(members.iter().map(|r| &r.content.tests), cap);
        candidate.tags = shared_tags_first(members.iter().map(|r| &r.tags), self.tag_cap);
        candidate.parents = members.iter().map(|r| r.id).collect();
        candidate.requested_tier = Some(Tier::Aggregate);
        candidate.originator = Some(PROMOTION_ORIGINATOR.to_string());
        candidate
    }

    /// Plan a kernel over canonical aggregates not yet routed by a kernel.
    pub fn plan_kernel(&self, store: &RecordStore) -> Option<KernelPlan> {
        let kernel_children: HashSet<RecordId> = store
            .iter()
            .filter(|r| r.tier == Tier::Kernel)
            .flat_map(|k| k.lineage.parents.iter().copied())
            .collect();
        let mut aggregates: Vec<&Record> = store
            .iter()
            .filter(|r| {
                r.tier == Tier::Aggregate && r.is_live_canonical() && !kernel_children.contains(&r.id)
            })
            .collect();
        if aggregates.len() < self.config.kernel_min_aggregates.max(2) {
            return None;
        }
        aggregates.sort_by(|a, b| {
            let ua = a.abstraction_score * (a.usage.count as f32 + 1.0);
            let ub = b.abstraction_score * (b.usage.count as f32 + 1.0);
            ub.total_cmp(&ua).then(a.id.cmp(&b.id))
        });
        aggregates.truncate(self.config.max_cluster);
        Some(KernelPlan {
            members: aggregates.iter().map(|r| r.id).collect(),
            candidate: self.synthesize_kernel(&aggregates),
        })
    }

    /// Routing kernel over `aggregates`: their definitions plus one routing
    /// entry per aggregate. Claims, invariants and examples are never copied up.
    pub fn synthesize_kernel(&self, aggregates: &[&Record]) -> CandidateRecord {
        let cap = self.config.content_cap;
        let mut candidate = CandidateRecord::new(format!(
            "Routing kernel over {}",
            aggregates
                .iter()
                .map(|r| r.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        candidate.summary = Some(
            aggregates
                .iter()
                .map(|r| r.title.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        );
        candidate.content.definitions =
            capped_union(aggregates.iter().map(|r| &r.content.definitions), cap);
        candidate.content.next_actions = aggregates
            .iter()
            .map(|r| format!("route {} -> {}", r.title, r.id))
            .collect();
        candidate.content.tests = capped_union(aggregates.iter().map(|r| &r.content.tests), cap);
        candidate.tags = shared_tags_first(aggregates.iter().map(|r| &r.tags), self.tag_cap);
        candidate.parents = aggregates.iter().map(|r| r.id).collect();
        candidate.requested_tier = Some(Tier::Kernel);
        candidate.originator = Some(PROMOTION_ORIGINATOR.to_string());
        candidate
    }
}

/// Order-preserving union of string lists, deduplicated on normalized text.
fn capped_union<'r>(lists: impl Iterator<Item = &'r Vec<String>>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in lists.flatten() {
        if out.len() >= cap {
            break;
        }
        if seen.insert(normalize(item)) {
            out.push(item.clone());
        }
    }
    out
}

/// Union of tag sets, most widely shared first, capped.
fn shared_tags_first<'r>(sets: impl Iterator<Item = &'r BTreeSet<String>>, cap: usize) -> Vec<String> {
    let mut freq: BTreeMap<&str, usize> = BTreeMap::new();
    for set in sets {
        for tag in set {
            *freq.entry(tag.as_str()).or_default() += 1;
        }
    }
    let mut tags: Vec<(&str, usize)> = freq.into_iter().collect();
    tags.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    tags.into_iter().take(cap).map(|(t, _)| t.to_string()).collect()
}
