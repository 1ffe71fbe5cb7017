//! Knowledge-base facade: the explicit store handle.
//!
//! `KnowledgeBase` owns the commit pipeline (and through it the store, WAL,
//! snapshots and governor) plus the write-behind dump. It is the only public
//! way to mutate records: `submit` for new records, `mark_used` for reuse
//! statistics, and the maintenance operations (`run_upgrade`, `promote`,
//! `heartbeat`) for everything the governor does on its own.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::KbConfig;
use crate::error::{GovernorError, StoreError, StrataResult};
use crate::governor::{BackpressureChange, Governor, GovernorState, Ledger, TierBudgets};
use crate::paths::DataLayout;
use crate::pipeline::{ActionKind, CommitPipeline, InstallHook, Proposal, ProposalResult};
use crate::promotion::{PromotionReport, Promoter};
use crate::record::{CandidateRecord, Origin, Record, RecordId, Tier, now_secs};
use crate::select::{ScoredCandidate, SelectionBudgets, WorkingSet, select};
use crate::store::persist::WriteBehind;
use crate::store::snapshot::{SnapshotManager, SnapshotRef};
use crate::store::wal::{AuditEntry, Wal};
use crate::store::{RecordStore, StoreState};

/// The full-state document rewritten by the write-behind dump.
#[derive(Debug, Serialize, Deserialize)]
struct StateDump {
    store: StoreState,
    governor: GovernorState,
    proposals: Vec<Proposal>,
    next_proposal: u64,
    /// Newest WAL entry reflected in this dump.
    wal_seq: u64,
}

/// What one periodic upgrade did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeReport {
    /// False when the cadence gate skipped the run.
    pub ran: bool,
    pub demotions: usize,
    pub merged: usize,
    pub promotion: PromotionReport,
    pub backpressure: Option<BackpressureChange>,
}

/// What one heartbeat did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub upgraded: bool,
    pub flushed: bool,
}

/// The strata knowledge base.
pub struct KnowledgeBase {
    config: KbConfig,
    layout: Option<DataLayout>,
    pipeline: CommitPipeline,
    dump: WriteBehind,
}

impl KnowledgeBase {
    /// Open a knowledge base. With a data directory, the last dump is loaded
    /// and newer WAL entries are replayed over it.
    pub fn open(config: KbConfig) -> StrataResult<Self> {
        config.settings.validate()?;
        let settings = &config.settings;

        let Some(dir) = &config.data_dir else {
            let pipeline = CommitPipeline::new(
                settings,
                RecordStore::new(),
                Governor::new(settings.governor.clone()),
                Wal::memory_only(),
                SnapshotManager::memory_only().with_memory_retention(settings.persistence.memory_snapshots),
            );
            tracing::info!("opened memory-only knowledge base");
            return Ok(Self {
                config,
                layout: None,
                pipeline,
                dump: WriteBehind::disabled(),
            });
        };

        let layout = DataLayout::new(dir);
        layout.ensure_dirs()?;
        let dumped = match WriteBehind::load(&layout.state_file)? {
            Some(bytes) => Some(serde_json::from_slice::<StateDump>(&bytes).map_err(|e| {
                StoreError::Serialization {
                    message: format!("corrupt state dump {}: {e}", layout.state_file.display()),
                }
            })?),
            None => None,
        };
        let wal = Wal::open(&layout.root)?;
        let snapshots = SnapshotManager::in_dir(&layout.snapshot_dir)?;

        let (mut pipeline, wal_seq) = match dumped {
            Some(dump) => {
                let governor = Governor::with_state(settings.governor.clone(), dump.governor);
                let pipeline = CommitPipeline::new(
                    settings,
                    RecordStore::from_state(dump.store),
                    governor,
                    wal,
                    snapshots,
                )
                .with_proposals(dump.proposals, dump.next_proposal);
                (pipeline, dump.wal_seq)
            }
            None => {
                let governor = Governor::new(settings.governor.clone());
                let pipeline = CommitPipeline::new(settings, RecordStore::new(), governor, wal, snapshots);
                (pipeline, 0)
            }
        };

        let pending = pipeline.wal().replay_after(wal_seq)?;
        let replayed = pipeline.replay(&pending)?;
        let mut dump = WriteBehind::new(layout.state_file.clone(), settings.persistence.flush_interval());
        if replayed > 0 {
            dump.mark_dirty();
        }
        tracing::info!(
            data_dir = %layout.root.display(),
            records = pipeline.store().len(),
            replayed,
            "opened persistent knowledge base"
        );
        Ok(Self {
            config,
            layout: Some(layout),
            pipeline,
            dump,
        })
    }

    pub fn config(&self) -> &KbConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        self.pipeline.store()
    }

    pub fn governor(&self) -> &Governor {
        self.pipeline.governor()
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.pipeline.store().get(id)
    }

    /// Look up a record, failing with a diagnostic if it does not exist.
    pub fn require(&self, id: RecordId) -> StrataResult<&Record> {
        Ok(self.pipeline.store().require(id)?)
    }

    pub fn set_install_hook(&mut self, hook: impl InstallHook + Send + 'static) {
        self.pipeline.set_install_hook(Some(Box::new(hook)));
    }

    pub fn clear_install_hook(&mut self) {
        self.pipeline.set_install_hook(None);
    }

    /// Submit a candidate. The sole write entry point; `origin` decides
    /// whether a requested tier is honored.
    pub fn submit(&mut self, candidate: CandidateRecord, origin: Origin) -> StrataResult<ProposalResult> {
        let result = self.pipeline.commit(candidate, origin, ActionKind::Create)?;
        self.dump.mark_dirty();
        if result.is_installed() {
            if let Err(e) = self.maintain(now_secs()) {
                tracing::warn!(error = %e, "maintenance: post-install pass failed");
            }
        }
        self.flush_if_due()?;
        Ok(result)
    }

    /// Budget enforcement, backpressure, and the upgrade when it is due.
    fn maintain(&mut self, now: u64) -> StrataResult<()> {
        self.pipeline.enforce_budgets(now)?;
        self.pipeline.governor_mut().evaluate_backpressure();
        if self.pipeline.governor().upgrade_due(now) {
            self.run_upgrade(now, false)?;
        }
        Ok(())
    }

    /// Up to `limit` proposals, most recent first.
    pub fn list_proposals(&self, limit: usize) -> Vec<&Proposal> {
        self.pipeline.list_proposals(limit)
    }

    /// Audit decisions recorded since this knowledge base was opened.
    pub fn audit_trail(&self) -> &[AuditEntry] {
        self.pipeline.audit_trail()
    }

    /// Usage-marking hook for read paths.
    pub fn mark_used(&mut self, id: RecordId, context: &str) -> StrataResult<()> {
        self.pipeline.mark_used(id, context, now_secs())?;
        self.dump.mark_dirty();
        Ok(())
    }

    /// Select a working set using the configured budgets and the current
    /// backpressure crispness floor.
    pub fn select<F>(&self, relevance: F, canonical_only: bool) -> WorkingSet
    where
        F: Fn(&Record) -> f32,
    {
        let floor = self.pipeline.governor().backpressure().min_crispness;
        let budgets = SelectionBudgets::from_config(&self.config.settings.selection, floor)
            .canonical_only(canonical_only);
        self.select_with(relevance, &budgets)
    }

    pub fn select_with<F>(&self, relevance: F, budgets: &SelectionBudgets) -> WorkingSet
    where
        F: Fn(&Record) -> f32,
    {
        let candidates: Vec<ScoredCandidate<'_>> = self
            .pipeline
            .store()
            .iter()
            .map(|record| ScoredCandidate {
                record,
                relevance: relevance(record).clamp(0.0, 1.0),
            })
            .collect();
        select(&candidates, budgets)
    }

    /// Cluster warm Regular records into aggregates and, when enough
    /// aggregates exist, route them through a kernel. Each synthesized
    /// record is committed as [`Origin::System`]; a failed cluster is logged
    /// and skipped.
    pub fn promote(&mut self, max_aggregates: usize, max_kernels: usize) -> StrataResult<PromotionReport> {
        let mut report = PromotionReport::default();
        let promoter = Promoter::new(&self.config.settings.promotion, self.config.settings.tag_cap);
        if !promoter.is_warm(self.pipeline.store()) {
            tracing::debug!(
                total_usage = self.pipeline.store().total_usage(),
                "promotion: store is cold, skipping"
            );
            return Ok(report);
        }
        let now = now_secs();

        let spare = self.pipeline.governor().spare_capacity(self.pipeline.store());
        let plans = promoter.plan_aggregates(self.pipeline.store(), max_aggregates.min(spare.aggregate));
        for plan in plans {
            if self.pipeline.governor().spare_capacity(self.pipeline.store()).aggregate == 0 {
                break;
            }
            match install_plan(&mut self.pipeline, plan.candidate, plan.seed) {
                Ok(id) => {
                    report.aggregates.push(id);
                    match self.pipeline.canonicalize(&plan.members, id, now) {
                        Ok(n) => report.canonicalized += n,
                        Err(e) => tracing::warn!(record_id = %id, error = %e, "promotion: canonicalize failed"),
                    }
                }
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(error = %e, "promotion: aggregate skipped");
                }
            }
        }

        for _ in 0..max_kernels {
            if self.pipeline.governor().spare_capacity(self.pipeline.store()).kernel == 0 {
                break;
            }
            let Some(plan) = promoter.plan_kernel(self.pipeline.store()) else {
                break;
            };
            match install_plan(&mut self.pipeline, plan.candidate, plan.members[0]) {
                Ok(id) => report.kernels.push(id),
                Err(e) => {
                    report.skipped += 1;
                    tracing::warn!(error = %e, "promotion: kernel skipped");
                    break;
                }
            }
        }

        if !report.aggregates.is_empty() || !report.kernels.is_empty() {
            self.dump.mark_dirty();
        }
        tracing::info!(
            aggregates = report.aggregates.len(),
            kernels = report.kernels.len(),
            canonicalized = report.canonicalized,
            skipped = report.skipped,
            "promotion: cycle complete"
        );
        Ok(report)
    }

    /// Periodic upgrade: budgets, scheduled dedup sweep, promotion,
    /// backpressure. A no-op before the next cadence boundary unless forced.
    pub fn run_upgrade(&mut self, now: u64, force: bool) -> StrataResult<UpgradeReport> {
        if !force && !self.pipeline.governor().upgrade_due(now) {
            tracing::debug!("upgrade: not due");
            return Ok(UpgradeReport::default());
        }
        let demotions = self.pipeline.enforce_budgets(now)?.len();
        let merged = if self.pipeline.governor().backpressure().dedup_sweep_scheduled {
            self.pipeline.dedup_sweep(now)?.len()
        } else {
            0
        };
        let limits = &self.config.settings.promotion;
        let (max_aggregates, max_kernels) = (limits.max_new_aggregates, limits.max_new_kernels);
        let promotion = self.promote(max_aggregates, max_kernels)?;
        let governor = self.pipeline.governor_mut();
        let backpressure = governor.evaluate_backpressure();
        governor.mark_upgraded(now);
        self.dump.mark_dirty();
        tracing::info!(
            demotions,
            merged,
            aggregates = promotion.aggregates.len(),
            kernels = promotion.kernels.len(),
            backpressure = ?backpressure,
            "upgrade: cycle complete"
        );
        Ok(UpgradeReport {
            ran: true,
            demotions,
            merged,
            promotion,
            backpressure: Some(backpressure),
        })
    }

    /// Low-frequency timer entry: run the upgrade if due, flush if due.
    pub fn heartbeat(&mut self, now: u64) -> StrataResult<Heartbeat> {
        let upgraded = self.run_upgrade(now, false)?.ran;
        let flushed = self.flush_if_due()?;
        Ok(Heartbeat { upgraded, flushed })
    }

    /// Capture the current store on demand.
    pub fn snapshot(&mut self) -> StrataResult<SnapshotRef> {
        let bytes = self.pipeline.store_bytes()?;
        let reference = self.pipeline.snapshots_mut().capture(&bytes)?;
        tracing::info!(snapshot = %reference, "captured snapshot");
        Ok(reference)
    }

    /// Replace the store with a snapshot and flush immediately, so a later
    /// reopen does not replay entries the snapshot predates.
    pub fn restore(&mut self, reference: &SnapshotRef) -> StrataResult<()> {
        let bytes = self.pipeline.snapshots().load(reference)?;
        self.pipeline.restore_bytes(&bytes, reference)?;
        self.dump.mark_dirty();
        self.flush()?;
        Ok(())
    }

    /// Keep only the newest `keep` snapshots. Returns how many were removed.
    pub fn prune_snapshots(&mut self, keep: usize) -> StrataResult<usize> {
        Ok(self.pipeline.snapshots_mut().prune(keep)?)
    }

    pub fn list_snapshots(&self) -> StrataResult<Vec<SnapshotRef>> {
        Ok(self.pipeline.snapshots().list()?)
    }

    fn dump_bytes(&self) -> StrataResult<Vec<u8>> {
        let dump = StateDump {
            store: self.pipeline.store().state().clone(),
            governor: self.pipeline.governor().state().clone(),
            proposals: self.pipeline.proposals().to_vec(),
            next_proposal: self.pipeline.next_proposal(),
            wal_seq: self.pipeline.wal().last_seq(),
        };
        serde_json::to_vec(&dump).map_err(|e| {
            StoreError::Serialization {
                message: format!("failed to encode state dump: {e}"),
            }
            .into()
        })
    }

    fn flush_if_due(&mut self) -> StrataResult<bool> {
        if self.dump.is_due() {
            self.flush()
        } else {
            Ok(false)
        }
    }

    /// Write the full-state dump now if anything changed.
    pub fn flush(&mut self) -> StrataResult<bool> {
        if !self.dump.is_dirty() {
            return Ok(false);
        }
        let bytes = self.dump_bytes()?;
        Ok(self.dump.flush(&bytes)?)
    }

    /// Flush and drop.
    pub fn close(mut self) -> StrataResult<()> {
        self.flush()?;
        Ok(())
    }

    pub fn info(&self) -> KbInfo {
        let store = self.pipeline.store();
        let governor = self.pipeline.governor();
        let bp = governor.backpressure();
        KbInfo {
            records: store.len(),
            regular: store.count_tier(Tier::Regular),
            aggregate: store.count_tier(Tier::Aggregate),
            kernel: store.count_tier(Tier::Kernel),
            budgets: TierBudgets::for_size(store.len()),
            ledger: governor.ledger(),
            backpressure_active: bp.active,
            reasoning_depth: bp.reasoning_depth,
            min_crispness: bp.min_crispness,
            last_upgrade: governor.state().last_upgrade,
            proposals: self.pipeline.proposals().len(),
            wal_seq: self.pipeline.wal().last_seq(),
            data_dir: self.layout.as_ref().map(|l| l.root.clone()),
        }
    }
}

/// Commit one synthesized candidate; anything but an install is an error.
fn install_plan(
    pipeline: &mut CommitPipeline,
    candidate: CandidateRecord,
    seed: RecordId,
) -> Result<RecordId, GovernorError> {
    let failed = |message: String| GovernorError::PromotionFailed { seed, message };
    match pipeline
        .commit(candidate, Origin::System, ActionKind::Promote)
        .map_err(|e| failed(e.to_string()))?
    {
        ProposalResult::Installed { record_id, .. } => Ok(record_id),
        ProposalResult::Rejected { reason, .. } => Err(failed(reason.to_string())),
        ProposalResult::Failed { error, .. } => Err(failed(error.to_string())),
    }
}

impl Drop for KnowledgeBase {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush state dump on drop");
        }
    }
}

impl std::fmt::Debug for KnowledgeBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeBase")
            .field("data_dir", &self.config.data_dir)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}

/// Summary information about the knowledge base.
#[derive(Debug, Clone)]
pub struct KbInfo {
    pub records: usize,
    pub regular: usize,
    pub aggregate: usize,
    pub kernel: usize,
    pub budgets: TierBudgets,
    pub ledger: Ledger,
    pub backpressure_active: bool,
    pub reasoning_depth: u8,
    pub min_crispness: f32,
    pub last_upgrade: Option<u64>,
    pub proposals: usize,
    pub wal_seq: u64,
    pub data_dir: Option<PathBuf>,
}

impl std::fmt::Display for KbInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "strata knowledge base")?;
        writeln!(f, "  records:       {}", self.records)?;
        writeln!(f, "  regular:       {}", self.regular)?;
        writeln!(f, "  aggregate:     {} / {}", self.aggregate, self.budgets.aggregate)?;
        writeln!(f, "  kernel:        {} / {}", self.kernel, self.budgets.kernel)?;
        writeln!(
            f,
            "  ledger:        added {} collapsed {}",
            self.ledger.added, self.ledger.collapsed
        )?;
        writeln!(f, "  backpressure:  {}", if self.backpressure_active { "active" } else { "idle" })?;
        writeln!(f, "  depth:         {}", self.reasoning_depth)?;
        writeln!(f, "  crispness:     {:.2}", self.min_crispness)?;
        match self.last_upgrade {
            Some(at) => writeln!(f, "  last upgrade:  {at}")?,
            None => writeln!(f, "  last upgrade:  never")?,
        }
        writeln!(f, "  proposals:     {}", self.proposals)?;
        writeln!(f, "  wal seq:       {}", self.wal_seq)?;
        match &self.data_dir {
            Some(dir) => writeln!(f, "  data dir:      {}", dir.display())?,
            None => writeln!(f, "  data dir:      (memory only)")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Rejection;

    fn note(title: &str) -> CandidateRecord {
        CandidateRecord::new(title)
            .definition(format!("{title} defined"))
            .example(format!("{title} example"))
    }

    #[test]
    fn memory_only_knowledge_base() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        let result = kb.submit(note("first"), Origin::User).unwrap();
        assert!(result.is_installed());
        let info = kb.info();
        assert_eq!(info.records, 1);
        assert!(info.data_dir.is_none());
        assert!(info.to_string().contains("memory only"));
    }

    #[test]
    fn first_install_runs_upgrade_once() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        kb.submit(note("one"), Origin::User).unwrap();
        let stamped = kb.info().last_upgrade;
        assert!(stamped.is_some());
        kb.submit(note("two"), Origin::User).unwrap();
        assert_eq!(kb.info().last_upgrade, stamped);
    }

    #[test]
    fn upgrade_is_cadence_gated() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        let now = now_secs();
        assert!(kb.run_upgrade(now, false).unwrap().ran);
        assert!(!kb.run_upgrade(now + 60, false).unwrap().ran);
        assert!(kb.run_upgrade(now + 60, true).unwrap().ran);
    }

    #[test]
    fn mark_used_unknown_record_fails() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        assert!(kb.mark_used(RecordId::new(9).unwrap(), "ctx").is_err());
    }

    #[test]
    fn snapshot_restore_in_memory() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        kb.submit(note("kept"), Origin::User).unwrap();
        let snap = kb.snapshot().unwrap();
        kb.submit(note("dropped"), Origin::User).unwrap();
        assert_eq!(kb.store().len(), 2);
        kb.restore(&snap).unwrap();
        assert_eq!(kb.store().len(), 1);
        assert_eq!(kb.audit_trail().last().unwrap().decision, "restored");
    }

    #[test]
    fn restore_does_not_reissue_dropped_ids() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        kb.submit(note("kept"), Origin::User).unwrap();
        let snap = kb.snapshot().unwrap();
        let dropped = kb.submit(note("dropped"), Origin::User).unwrap().record_id().unwrap();
        kb.restore(&snap).unwrap();

        let fresh = kb.submit(note("fresh"), Origin::User).unwrap().record_id().unwrap();
        assert_ne!(fresh, dropped);
        let installed: Vec<RecordId> = kb
            .list_proposals(10)
            .iter()
            .filter_map(|p| p.install.as_ref().and_then(|meta| meta.record_id))
            .collect();
        assert_eq!(installed.len(), 3);
        assert!(!installed[1..].contains(&installed[0]));
        assert_ne!(installed[1], installed[2]);
    }

    #[test]
    fn memory_snapshots_follow_the_configured_cap() {
        let mut config = KbConfig::memory();
        config.settings.persistence.memory_snapshots = 3;
        let mut kb = KnowledgeBase::open(config).unwrap();
        for i in 0..6 {
            kb.submit(note(&format!("capped {i}")), Origin::User).unwrap();
        }
        assert_eq!(kb.list_snapshots().unwrap().len(), 3);
    }

    #[test]
    fn cold_store_does_not_promote() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        for i in 0..5 {
            kb.submit(note(&format!("cold {i}")).tag("shared"), Origin::User).unwrap();
        }
        assert_eq!(kb.promote(2, 1).unwrap(), PromotionReport::default());
    }

    #[test]
    fn rejected_submission_still_listed() {
        let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
        let result = kb.submit(CandidateRecord::new(""), Origin::User).unwrap();
        assert!(matches!(result.rejection(), Some(Rejection::SchemaViolation { .. })));
        assert_eq!(kb.list_proposals(10).len(), 1);
    }
}
