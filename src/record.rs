//! Core record types for the strata knowledge base.
//!
//! A [`Record`] is the atomic knowledge unit. Callers never build records
//! directly: they submit a [`CandidateRecord`], whose optional fields are
//! defaulted exactly once by [`CandidateRecord::into_record`] at ingestion.

use std::collections::BTreeSet;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

/// Maximum number of distinct usage contexts remembered per record.
pub const CONTEXT_CAP: usize = 64;

/// Unique, niche-optimized identifier for a record.
///
/// Uses `NonZeroU64` so that `Option<RecordId>` is the same size as `RecordId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RecordId(NonZeroU64);

impl RecordId {
    /// Create a `RecordId` from a raw `u64`. Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(RecordId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rec:{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("rec:").unwrap_or(s);
        raw.parse::<u64>()
            .ok()
            .and_then(RecordId::new)
            .ok_or_else(|| format!("invalid record id: {s}"))
    }
}

/// Abstraction tier of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Tier {
    /// Base knowledge.
    #[default]
    Regular,
    /// Synthesized summary of several base records.
    Aggregate,
    /// Routing/derivation layer over aggregates.
    Kernel,
}

impl Tier {
    /// Abstraction level above the base tier (Regular = 0).
    pub fn level(self) -> u64 {
        match self {
            Tier::Regular => 0,
            Tier::Aggregate => 1,
            Tier::Kernel => 2,
        }
    }

    /// The tier one step below, or `None` at the floor.
    pub fn demoted(self) -> Option<Tier> {
        match self {
            Tier::Regular => None,
            Tier::Aggregate => Some(Tier::Regular),
            Tier::Kernel => Some(Tier::Aggregate),
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Regular => write!(f, "Regular"),
            Tier::Aggregate => write!(f, "Aggregate"),
            Tier::Kernel => write!(f, "Kernel"),
        }
    }
}

/// Who submitted a candidate. Only `System` may request a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Origin {
    /// External caller (API, CLI, import).
    #[default]
    User,
    /// Auto-promotion or other internal maintenance.
    System,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::User => write!(f, "user"),
            Origin::System => write!(f, "system"),
        }
    }
}

/// Lifecycle status. Anything other than `Active` is dormant for reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RecordStatus {
    #[default]
    Active,
    Merged,
    Archived,
    Inactive,
}

impl RecordStatus {
    pub fn is_dormant(self) -> bool {
        self != RecordStatus::Active
    }
}

/// Read visibility. Shadow records are internal-only and never selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Visibility {
    #[default]
    Public,
    Shadow,
}

/// Structured content blocks. Every list keeps caller order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentBlocks {
    #[serde(default)]
    pub definitions: Vec<String>,
    #[serde(default)]
    pub invariants: Vec<String>,
    #[serde(default)]
    pub claims: Vec<String>,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub next_actions: Vec<String>,
    /// Executable checks or test references backing the record.
    #[serde(default)]
    pub tests: Vec<String>,
}

impl ContentBlocks {
    /// Policy-gate richness: count of definitions, invariants, examples,
    /// claims and next actions.
    pub fn richness(&self) -> usize {
        self.definitions.len()
            + self.invariants.len()
            + self.examples.len()
            + self.claims.len()
            + self.next_actions.len()
    }

    /// Statements subject to the negation conflict scan.
    pub fn statements(&self) -> impl Iterator<Item = &String> {
        self.invariants.iter().chain(self.claims.iter())
    }

    /// Every human-readable string, block by block.
    pub fn all_text(&self) -> impl Iterator<Item = &String> {
        self.definitions
            .iter()
            .chain(&self.invariants)
            .chain(&self.claims)
            .chain(&self.examples)
            .chain(&self.next_actions)
            .chain(&self.tests)
    }

    pub fn is_empty(&self) -> bool {
        self.richness() == 0 && self.tests.is_empty()
    }
}

/// Parent/child lineage between records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Lineage {
    #[serde(default)]
    pub parents: Vec<RecordId>,
    #[serde(default)]
    pub children: Vec<RecordId>,
}

impl Lineage {
    pub fn is_empty(&self) -> bool {
        self.parents.is_empty() && self.children.is_empty()
    }
}

/// Reuse statistics fed by the usage-marking hook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub count: u64,
    /// Seconds since UNIX epoch of the last use, 0 if never used.
    pub last_used: u64,
    pub contexts: BTreeSet<String>,
}

/// Who installed a record and under what conditions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Authority {
    pub origin: Origin,
    pub originator: String,
    pub stamped_at: u64,
    /// Tier the candidate asked for when it was forced down to Regular.
    pub downgraded_from: Option<Tier>,
    /// Richness score measured by the policy gate.
    pub richness: usize,
}

/// A stored knowledge record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub tier: Tier,
    pub title: String,
    /// Human-readable projection of the content.
    pub summary: String,
    pub content: ContentBlocks,
    pub tags: BTreeSet<String>,
    pub lineage: Lineage,
    pub usage: UsageStats,
    pub abstraction_score: f32,
    pub fingerprint: String,
    /// Aggregate that subsumes this record for reads.
    pub canonical: Option<RecordId>,
    pub status: RecordStatus,
    pub visibility: Visibility,
    pub authority: Authority,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Record {
    /// A record with no canonical pointer represents itself for reads.
    pub fn is_canonical(&self) -> bool {
        self.canonical.is_none()
    }

    /// Active, public and canonical.
    pub fn is_live_canonical(&self) -> bool {
        self.is_canonical() && !self.status.is_dormant() && self.visibility == Visibility::Public
    }

    pub fn has_tests(&self) -> bool {
        !self.content.tests.is_empty()
    }
}

/// Loosely shaped record proposal as submitted by a caller.
///
/// Missing list fields default to empty; the requested tier is honored only
/// for [`Origin::System`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CandidateRecord {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub content: ContentBlocks,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parents: Vec<RecordId>,
    #[serde(default)]
    pub requested_tier: Option<Tier>,
    #[serde(default)]
    pub shadow: bool,
    #[serde(default)]
    pub originator: Option<String>,
}

impl CandidateRecord {
    /// Start a candidate with a title; builder methods fill the rest.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn definition(mut self, text: impl Into<String>) -> Self {
        self.content.definitions.push(text.into());
        self
    }

    pub fn invariant(mut self, text: impl Into<String>) -> Self {
        self.content.invariants.push(text.into());
        self
    }

    pub fn claim(mut self, text: impl Into<String>) -> Self {
        self.content.claims.push(text.into());
        self
    }

    pub fn example(mut self, text: impl Into<String>) -> Self {
        self.content.examples.push(text.into());
        self
    }

    pub fn next_action(mut self, text: impl Into<String>) -> Self {
        self.content.next_actions.push(text.into());
        self
    }

    pub fn test(mut self, text: impl Into<String>) -> Self {
        self.content.tests.push(text.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn parent(mut self, id: RecordId) -> Self {
        self.parents.push(id);
        self
    }

    pub fn requested_tier(mut self, tier: Tier) -> Self {
        self.requested_tier = Some(tier);
        self
    }

    /// Normalize tags: trimmed, lowercased, non-empty, deduplicated, capped.
    pub fn normalized_tags(&self, cap: usize) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for tag in &self.tags {
            let t = tag.trim().to_lowercase();
            if t.is_empty() {
                continue;
            }
            if out.len() >= cap {
                break;
            }
            out.insert(t);
        }
        out
    }

    /// Materialize the candidate as a record. `tier` and `fingerprint` are
    /// provisional and overwritten at install.
    pub fn into_record(self, id: RecordId, tag_cap: usize, now: u64) -> Record {
        let tags = self.normalized_tags(tag_cap);
        Record {
            id,
            tier: Tier::Regular,
            title: self.title.trim().to_string(),
            summary: self.summary.unwrap_or_default(),
            content: self.content,
            tags,
            lineage: Lineage {
                parents: self.parents,
                children: Vec::new(),
            },
            usage: UsageStats::default(),
            abstraction_score: 0.0,
            fingerprint: String::new(),
            canonical: None,
            status: RecordStatus::Active,
            visibility: if self.shadow {
                Visibility::Shadow
            } else {
                Visibility::Public
            },
            authority: Authority {
                originator: self.originator.unwrap_or_default(),
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Seconds since UNIX epoch.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
