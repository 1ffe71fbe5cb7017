//! The commit pipeline: the only path by which records enter the store.
//!
//! Every candidate runs, uninterrupted, through
//!
//! 1. schema validation
//! 2. fingerprint dedupe
//! 3. explicit-negation conflict scan
//! 4. policy gate (richness floor, projection repair, authority stamp)
//! 5. pre-install snapshot
//! 6. install (id allocation, tier placement, lineage, [`InstallHook`])
//!
//! and every outcome is appended to the WAL and the audit trail. An install
//! error restores the store from the snapshot bytes before anything else can
//! observe it, so a failed proposal leaves no trace in the store.

pub mod gate;
pub mod proposal;

pub use gate::GateOutcome;
pub use proposal::{ActionKind, CheckResult, InstallMeta, Proposal, ProposalResult, ProposalStatus};

use serde::de::DeserializeOwned;
use serde_json::json;

use crate::conflict::{find_conflict, find_duplicate};
use crate::config::StrataConfig;
use crate::error::{CommitError, Rejection, StoreError, StrataResult};
use crate::fingerprint::{fingerprint, record_fingerprint};
use crate::governor::{Demotion, Governor};
use crate::record::{CONTEXT_CAP, CandidateRecord, Origin, Record, RecordId, Tier, now_secs};
use crate::store::snapshot::{SnapshotManager, SnapshotRef};
use crate::store::wal::{AuditEntry, Wal, WalEntry, WalKind};
use crate::store::{RecordStore, StoreResult};

/// Called at the persist step of every install, after the record is in the
/// store. Returning `Err` fails the install and rolls the store back.
pub trait InstallHook {
    fn on_install(&mut self, record: &Record, store: &RecordStore) -> Result<(), String>;
}

impl<F> InstallHook for F
where
    F: FnMut(&Record, &RecordStore) -> Result<(), String>,
{
    fn on_install(&mut self, record: &Record, store: &RecordStore) -> Result<(), String> {
        self(record, store)
    }
}

/// Reasons attached to `record.update` WAL entries.
pub mod update_reason {
    pub const DEMOTE: &str = "demote";
    pub const CANONICALIZE: &str = "canonicalize";
    pub const DEDUP: &str = "dedup";
}

/// Single-writer commit pipeline owning the store and everything that
/// mutates it.
pub struct CommitPipeline {
    store: RecordStore,
    governor: Governor,
    wal: Wal,
    snapshots: SnapshotManager,
    proposals: Vec<Proposal>,
    next_proposal: u64,
    tag_cap: usize,
    min_richness: usize,
    hook: Option<Box<dyn InstallHook + Send>>,
}

struct Installed {
    record_id: RecordId,
    tier: Tier,
    score: f32,
    touched_parents: Vec<RecordId>,
}

impl CommitPipeline {
    pub fn new(
        settings: &StrataConfig,
        store: RecordStore,
        governor: Governor,
        wal: Wal,
        snapshots: SnapshotManager,
    ) -> Self {
        Self {
            store,
            governor,
            wal,
            snapshots,
            proposals: Vec::new(),
            next_proposal: 1,
            tag_cap: settings.tag_cap,
            min_richness: settings.min_richness,
            hook: None,
        }
    }

    /// Reinstate proposals loaded from a state dump.
    pub fn with_proposals(mut self, proposals: Vec<Proposal>, next_proposal: u64) -> Self {
        let after_last = proposals.last().map_or(1, |p| p.id + 1);
        self.next_proposal = next_proposal.max(after_last);
        self.proposals = proposals;
        self
    }

    pub fn set_install_hook(&mut self, hook: Option<Box<dyn InstallHook + Send>>) {
        self.hook = hook;
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub fn governor_mut(&mut self) -> &mut Governor {
        &mut self.governor
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn snapshots_mut(&mut self) -> &mut SnapshotManager {
        &mut self.snapshots
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn audit_trail(&self) -> &[AuditEntry] {
        self.wal.audit_trail()
    }

    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    pub fn next_proposal(&self) -> u64 {
        self.next_proposal
    }

    /// Up to `limit` proposals, most recent first.
    pub fn list_proposals(&self, limit: usize) -> Vec<&Proposal> {
        self.proposals.iter().rev().take(limit).collect()
    }

    /// Run one candidate through the full pipeline.
    ///
    /// Rejections and rolled-back installs are reported in the returned
    /// [`ProposalResult`]. `Err` means the outcome itself could not be
    /// recorded (WAL, snapshot or audit I/O). The proposal is kept either
    /// way, marked `Failed` if it had not yet reached a terminal state.
    pub fn commit(
        &mut self,
        candidate: CandidateRecord,
        origin: Origin,
        action: ActionKind,
    ) -> StrataResult<ProposalResult> {
        let now = now_secs();
        let id = self.next_proposal;
        self.next_proposal += 1;
        let mut proposal = Proposal::new(id, action, candidate, origin, now);
        let result = self.run(&mut proposal, now);
        if let Err(err) = &result {
            tracing::error!(proposal_id = id, error = %err, "pipeline: proposal outcome not recorded");
            if !proposal.status.is_terminal() {
                proposal.error = Some(err.to_string());
                proposal.advance(ProposalStatus::Failed)?;
            }
        }
        self.proposals.push(proposal);
        result
    }

    fn run(&mut self, proposal: &mut Proposal, now: u64) -> StrataResult<ProposalResult> {
        self.wal.append(
            WalKind::ProposalCreate,
            Some(proposal.id),
            json!({
                "title": proposal.payload.title,
                "origin": proposal.origin,
                "action": proposal.action,
                "payload": proposal.payload,
            }),
        )?;

        let screened = match self.verify(proposal) {
            Ok(()) => {
                proposal.advance(ProposalStatus::Verified)?;
                self.policy(proposal, now)
            }
            Err(reason) => Err(reason),
        };
        match screened {
            Ok(outcome) => {
                proposal.advance(ProposalStatus::Approved)?;
                self.install(proposal, outcome, now)
            }
            Err(reason) => self.reject(proposal, reason),
        }
    }

    /// Schema, dedupe and conflict checks.
    fn verify(&self, proposal: &mut Proposal) -> Result<(), Rejection> {
        if let Err(reason) = gate::validate_schema(&proposal.payload, &self.store) {
            proposal.check("schema", false, reason.to_string());
            return Err(reason);
        }
        proposal.check("schema", true, "ok");

        let candidate = &proposal.payload;
        let fp = fingerprint(
            &candidate.title,
            &candidate.normalized_tags(self.tag_cap),
            &candidate.content,
        );
        if let Some(existing) = find_duplicate(&self.store, &fp) {
            let reason = Rejection::DuplicateContent { existing };
            proposal.check("dedupe", false, reason.to_string());
            return Err(reason);
        }
        proposal.check("dedupe", true, fp);

        if let Some(conflict) = find_conflict(&self.store, &proposal.payload.content) {
            let reason = Rejection::ExplicitConflict {
                existing: conflict.existing,
                statement: conflict.statement,
                conflicting: conflict.conflicting,
            };
            proposal.check("conflict", false, reason.to_string());
            return Err(reason);
        }
        proposal.check("conflict", true, "no explicit negation");
        Ok(())
    }

    fn policy(&self, proposal: &mut Proposal, now: u64) -> Result<GateOutcome, Rejection> {
        match gate::policy_gate(&proposal.payload, proposal.origin, self.min_richness, now) {
            Ok(outcome) => {
                let detail = if outcome.regenerated {
                    format!("richness {}, projection regenerated", outcome.richness)
                } else {
                    format!("richness {}", outcome.richness)
                };
                proposal.check("policy", true, detail);
                Ok(outcome)
            }
            Err(reason) => {
                proposal.check("policy", false, reason.to_string());
                Err(reason)
            }
        }
    }

    fn reject(&mut self, proposal: &mut Proposal, reason: Rejection) -> StrataResult<ProposalResult> {
        proposal.rejection = Some(reason.clone());
        proposal.advance(ProposalStatus::Rejected)?;
        self.wal.append(
            WalKind::Reject,
            Some(proposal.id),
            json!({ "reason": reason.to_string(), "rejection": reason }),
        )?;
        self.wal.audit(Some(proposal.id), "rejected", reason.to_string())?;
        tracing::debug!(
            proposal_id = proposal.id,
            title = %proposal.payload.title,
            reason = %reason,
            "pipeline: proposal rejected"
        );
        Ok(ProposalResult::Rejected {
            proposal_id: proposal.id,
            reason,
        })
    }

    fn install(
        &mut self,
        proposal: &mut Proposal,
        outcome: GateOutcome,
        now: u64,
    ) -> StrataResult<ProposalResult> {
        let before = self.store.to_bytes()?;
        let snapshot = self.snapshots.capture(&before)?;
        proposal.check("snapshot", true, snapshot.to_string());

        let installed = match self.apply(proposal, outcome, now) {
            Ok(installed) => installed,
            Err(message) => return self.fail(proposal, &before, snapshot, message),
        };
        // Nothing is durable until the install entry lands.
        if let Err(err) = self.log_install(proposal, &installed, &snapshot) {
            return self.fail(proposal, &before, snapshot, format!("WAL append failed: {err}"));
        }

        self.governor.record_install(installed.tier);
        proposal.install = Some(InstallMeta {
            snapshot,
            record_id: Some(installed.record_id),
            tier: Some(installed.tier),
            score: Some(installed.score),
        });
        proposal.check("install", true, installed.record_id.to_string());
        proposal.advance(ProposalStatus::Installed)?;
        if let Err(err) = self.wal.audit(
            Some(proposal.id),
            "installed",
            format!("{} at {}", installed.record_id, installed.tier),
        ) {
            tracing::warn!(proposal_id = proposal.id, error = %err, "pipeline: audit append failed after install");
        }
        tracing::info!(
            proposal_id = proposal.id,
            record_id = %installed.record_id,
            tier = %installed.tier,
            score = installed.score,
            "pipeline: record installed"
        );
        Ok(ProposalResult::Installed {
            proposal_id: proposal.id,
            record_id: installed.record_id,
            tier: installed.tier,
        })
    }

    /// Roll the store back to `before` and mark the proposal failed.
    fn fail(
        &mut self,
        proposal: &mut Proposal,
        before: &[u8],
        snapshot: SnapshotRef,
        message: String,
    ) -> StrataResult<ProposalResult> {
        self.store = RecordStore::from_bytes(before)?;
        proposal.error = Some(message.clone());
        proposal.install = Some(InstallMeta {
            snapshot: snapshot.clone(),
            record_id: None,
            tier: None,
            score: None,
        });
        proposal.check("install", false, message.clone());
        proposal.advance(ProposalStatus::Failed)?;
        tracing::warn!(
            proposal_id = proposal.id,
            error = %message,
            snapshot = %snapshot,
            "pipeline: install failed, store rolled back"
        );
        self.wal.append(
            WalKind::InstallFail,
            Some(proposal.id),
            json!({ "error": message, "snapshot": snapshot.to_string() }),
        )?;
        self.wal.audit(Some(proposal.id), "failed", message.clone())?;
        Ok(ProposalResult::Failed {
            proposal_id: proposal.id,
            error: CommitError::InstallFailure {
                proposal_id: proposal.id,
                message,
                snapshot: snapshot.to_string(),
            },
            snapshot,
        })
    }

    /// WAL the installed record together with every parent whose lineage it
    /// changed, as one entry.
    fn log_install(&mut self, proposal: &Proposal, installed: &Installed, snapshot: &SnapshotRef) -> StrataResult<()> {
        let record = record_payload(self.store.require(installed.record_id)?)?;
        let mut parents = Vec::with_capacity(installed.touched_parents.len());
        for &parent in &installed.touched_parents {
            parents.push(record_payload(self.store.require(parent)?)?);
        }
        self.wal.append(
            WalKind::Install,
            Some(proposal.id),
            json!({
                "record": record,
                "parents": parents,
                "snapshot": snapshot.to_string(),
                "annotations": proposal.annotations,
            }),
        )?;
        Ok(())
    }

    /// Mutate the store. Any `Err` is rolled back by the caller.
    fn apply(&mut self, proposal: &mut Proposal, outcome: GateOutcome, now: u64) -> Result<Installed, String> {
        let id = self.store.allocate_id();
        let mut record = proposal.payload.clone().into_record(id, self.tag_cap, now);
        record.summary = outcome.summary;
        record.authority = outcome.authority;
        record.fingerprint = record_fingerprint(&record);

        let placement = self.governor.place(&record);
        record.abstraction_score = placement.score;
        record.tier = match (proposal.origin, proposal.payload.requested_tier) {
            (Origin::System, Some(requested)) => requested,
            (Origin::System, None) => placement.tier,
            (Origin::User, Some(requested)) if requested > Tier::Regular => {
                record.authority.downgraded_from = Some(requested);
                proposal
                    .annotations
                    .push(format!("requested tier {requested} downgraded to regular: user origin"));
                Tier::Regular
            }
            (Origin::User, _) => Tier::Regular,
        };

        let mut touched_parents = Vec::new();
        for parent in record.lineage.parents.clone() {
            let Some(p) = self.store.get_mut(parent) else {
                return Err(format!("lineage parent {parent} vanished before install"));
            };
            if !p.lineage.children.contains(&id) {
                p.lineage.children.push(id);
                p.updated_at = now;
                touched_parents.push(parent);
            }
        }

        let tier = record.tier;
        let score = record.abstraction_score;
        self.store.upsert(record);
        if let Some(hook) = self.hook.as_mut() {
            let installed = self
                .store
                .get(id)
                .ok_or_else(|| format!("{id} missing after upsert"))?;
            hook.on_install(installed, &self.store)?;
        }
        Ok(Installed {
            record_id: id,
            tier,
            score,
            touched_parents,
        })
    }

    /// WAL the current state of `id` as a `record.update`.
    fn log_update(&mut self, id: RecordId, reason: &str) -> StrataResult<()> {
        let payload = record_payload(self.store.require(id)?)?;
        self.wal.append(
            WalKind::RecordUpdate,
            None,
            json!({ "reason": reason, "record": payload }),
        )?;
        Ok(())
    }

    /// Demote over-budget records and log each demotion.
    pub fn enforce_budgets(&mut self, now: u64) -> StrataResult<Vec<Demotion>> {
        let demotions = self.governor.enforce_budgets(&mut self.store, now);
        for d in &demotions {
            self.log_update(d.id, update_reason::DEMOTE)?;
        }
        Ok(demotions)
    }

    /// Run the scheduled dedup sweep and log each merge.
    pub fn dedup_sweep(&mut self, now: u64) -> StrataResult<Vec<RecordId>> {
        let merged = self.governor.dedup_sweep(&mut self.store, now);
        for id in &merged {
            self.log_update(*id, update_reason::DEDUP)?;
        }
        if !merged.is_empty() {
            self.wal.audit(None, "dedup", format!("{} records merged", merged.len()))?;
        }
        Ok(merged)
    }

    /// Point `members` at `canonical`. Returns how many pointers changed.
    pub fn canonicalize(&mut self, members: &[RecordId], canonical: RecordId, now: u64) -> StrataResult<usize> {
        let mut changed = 0;
        for &id in members {
            if id == canonical {
                continue;
            }
            let Some(record) = self.store.get_mut(id) else {
                tracing::warn!(record_id = %id, "canonicalize: member vanished, skipping");
                continue;
            };
            if record.canonical == Some(canonical) {
                continue;
            }
            record.canonical = Some(canonical);
            record.updated_at = now;
            self.log_update(id, update_reason::CANONICALIZE)?;
            changed += 1;
        }
        Ok(changed)
    }

    /// Record one use of `id` in `context` and rescore it. The tier is left
    /// to the next placement or enforcement pass.
    pub fn mark_used(&mut self, id: RecordId, context: &str, now: u64) -> StoreResult<&Record> {
        let record = self.store.get_mut(id).ok_or(StoreError::NotFound { id })?;
        record.usage.count += 1;
        record.usage.last_used = now;
        let context = context.trim();
        if !context.is_empty() && record.usage.contexts.len() < CONTEXT_CAP {
            record.usage.contexts.insert(context.to_string());
        }
        record.abstraction_score = self.governor.score(record);
        Ok(&*record)
    }

    /// Encoded store state, as captured by snapshots.
    pub fn store_bytes(&self) -> StoreResult<Vec<u8>> {
        self.store.to_bytes()
    }

    /// Replace the store with previously captured state. Ids handed out
    /// since the snapshot stay reserved.
    pub fn restore_bytes(&mut self, bytes: &[u8], reference: &SnapshotRef) -> StrataResult<()> {
        let issued = self.store.state().next_id;
        self.store = RecordStore::from_bytes(bytes)?;
        self.store.reserve_ids_below(issued);
        self.wal
            .audit(None, "restored", format!("store restored from {reference}"))?;
        tracing::info!(snapshot = %reference, records = self.store.len(), "pipeline: store restored");
        Ok(())
    }

    /// Re-apply WAL entries newer than the last state dump, rebuilding the
    /// proposals they describe. Returns how many entries changed the store.
    pub fn replay(&mut self, entries: &[WalEntry]) -> StrataResult<usize> {
        let mut applied = 0;
        for entry in entries {
            if let Some(pid) = entry.proposal_id {
                self.next_proposal = self.next_proposal.max(pid + 1);
            }
            match entry.kind {
                WalKind::Install => {
                    let record: Record = decode_field(entry, "record")?;
                    let parents: Vec<Record> = decode_optional(entry, "parents")?;
                    self.governor.record_install(record.tier);
                    self.replay_install(entry, &record)?;
                    for parent in parents {
                        self.store.upsert(parent);
                    }
                    self.store.upsert(record);
                    applied += 1;
                }
                WalKind::RecordUpdate => {
                    let record: Record = decode_field(entry, "record")?;
                    if entry.metadata["reason"] == update_reason::DEMOTE {
                        self.governor.record_demotion();
                    }
                    self.store.upsert(record);
                    applied += 1;
                }
                WalKind::ProposalCreate => self.replay_create(entry)?,
                WalKind::Reject => {
                    if let Some(proposal) = self.replayable(entry) {
                        proposal.rejection = Some(decode_field(entry, "rejection")?);
                        proposal.advance(ProposalStatus::Rejected)?;
                    }
                }
                WalKind::InstallFail => {
                    if let Some(proposal) = self.replayable(entry) {
                        let error = entry.metadata["error"].as_str().unwrap_or_default().to_string();
                        proposal.install = Some(InstallMeta {
                            snapshot: snapshot_field(entry),
                            record_id: None,
                            tier: None,
                            score: None,
                        });
                        proposal.error = Some(error);
                        proposal.advance(ProposalStatus::Verified)?;
                        proposal.advance(ProposalStatus::Approved)?;
                        proposal.advance(ProposalStatus::Failed)?;
                    }
                }
            }
        }
        Ok(applied)
    }

    fn replay_create(&mut self, entry: &WalEntry) -> StrataResult<()> {
        let Some(id) = entry.proposal_id else {
            return Ok(());
        };
        if self.proposals.iter().any(|p| p.id == id) {
            return Ok(());
        }
        let payload: CandidateRecord = decode_field(entry, "payload")?;
        let origin: Origin = decode_field(entry, "origin")?;
        let action: ActionKind = decode_field(entry, "action")?;
        self.proposals.push(Proposal::new(id, action, payload, origin, entry.at));
        Ok(())
    }

    fn replay_install(&mut self, entry: &WalEntry, record: &Record) -> StrataResult<()> {
        let Some(proposal) = self.replayable(entry) else {
            return Ok(());
        };
        proposal.annotations = decode_optional(entry, "annotations")?;
        proposal.install = Some(InstallMeta {
            snapshot: snapshot_field(entry),
            record_id: Some(record.id),
            tier: Some(record.tier),
            score: Some(record.abstraction_score),
        });
        proposal.advance(ProposalStatus::Verified)?;
        proposal.advance(ProposalStatus::Approved)?;
        proposal.advance(ProposalStatus::Installed)?;
        Ok(())
    }

    /// The still-open proposal `entry` belongs to. Proposals settled in the
    /// dump are left alone.
    fn replayable(&mut self, entry: &WalEntry) -> Option<&mut Proposal> {
        let id = entry.proposal_id?;
        self.proposals
            .iter_mut()
            .find(|p| p.id == id)
            .filter(|p| p.status == ProposalStatus::Proposed)
    }
}

impl std::fmt::Debug for CommitPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitPipeline")
            .field("records", &self.store.len())
            .field("proposals", &self.proposals.len())
            .field("next_proposal", &self.next_proposal)
            .field("wal_seq", &self.wal.last_seq())
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

fn record_payload(record: &Record) -> StoreResult<serde_json::Value> {
    serde_json::to_value(record).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode record {}: {e}", record.id),
    })
}

fn decode_field<T: DeserializeOwned>(entry: &WalEntry, field: &str) -> StoreResult<T> {
    serde_json::from_value(entry.metadata[field].clone()).map_err(|e| StoreError::Serialization {
        message: format!("WAL entry {} has no usable {field}: {e}", entry.seq),
    })
}

/// Like [`decode_field`], but an absent field decodes to the default.
fn decode_optional<T: DeserializeOwned + Default>(entry: &WalEntry, field: &str) -> StoreResult<T> {
    if entry.metadata[field].is_null() {
        return Ok(T::default());
    }
    decode_field(entry, field)
}

fn snapshot_field(entry: &WalEntry) -> SnapshotRef {
    let reference = entry.metadata["snapshot"].as_str().unwrap_or_default();
    reference.parse().unwrap_or_else(|never| match never {})
}
