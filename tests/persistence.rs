//! Persistence and recovery tests for the strata knowledge base.
//!
//! These tests verify that records, proposals and governor state survive a
//! restart, that WAL entries newer than the last dump are replayed, and that
//! snapshots restore the store.

use strata::config::KbConfig;
use strata::error::Rejection;
use strata::kb::KnowledgeBase;
use strata::pipeline::ProposalStatus;
use strata::record::{CandidateRecord, Origin, RecordId, Tier};

fn persistent_kb(dir: &std::path::Path) -> KnowledgeBase {
    KnowledgeBase::open(KbConfig::persistent(dir)).unwrap()
}

fn note(title: &str) -> CandidateRecord {
    CandidateRecord::new(title)
        .definition(format!("{title} definition"))
        .example(format!("{title} example"))
        .tag("notes")
}

#[test]
fn records_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let first;
    // First session: install three records and use one of them.
    {
        let mut kb = persistent_kb(dir.path());
        first = kb.submit(note("alpha"), Origin::User).unwrap().record_id().unwrap();
        kb.submit(note("beta"), Origin::User).unwrap();
        kb.submit(note("gamma"), Origin::User).unwrap();
        kb.mark_used(first, "session-a").unwrap();
        kb.mark_used(first, "session-b").unwrap();
        kb.close().unwrap();
    }

    // Second session: everything is back, and ids continue.
    {
        let mut kb = persistent_kb(dir.path());
        assert_eq!(kb.store().len(), 3);

        let alpha = kb.get(first).unwrap();
        assert_eq!(alpha.title, "alpha");
        assert_eq!(alpha.usage.count, 2);
        assert_eq!(alpha.usage.contexts.len(), 2);
        assert!(!alpha.fingerprint.is_empty());

        assert_eq!(kb.list_proposals(10).len(), 3);
        assert!(kb.info().last_upgrade.is_some());

        let next = kb.submit(note("delta"), Origin::User).unwrap();
        assert_eq!(next.proposal_id(), 4);
        assert_eq!(next.record_id(), RecordId::new(4));

        // The fingerprint index is rebuilt on load.
        let again = kb.submit(note("alpha"), Origin::User).unwrap();
        assert_eq!(again.rejection(), Some(&Rejection::DuplicateContent { existing: first }));
    }
}

#[test]
fn rejected_proposals_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    {
        let mut kb = persistent_kb(dir.path());
        kb.submit(CandidateRecord::new("thin").claim("one"), Origin::User).unwrap();
        kb.close().unwrap();
    }

    {
        let kb = persistent_kb(dir.path());
        assert!(kb.store().is_empty());
        let proposals = kb.list_proposals(10);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].status, ProposalStatus::Rejected);
        assert!(matches!(proposals[0].rejection, Some(Rejection::LowValue { .. })));
    }
}

#[test]
fn governor_state_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    let ledger;
    {
        let mut kb = persistent_kb(dir.path());
        for i in 0..6 {
            let candidate = note(&format!("system digest {i}")).requested_tier(Tier::Kernel);
            kb.submit(candidate, Origin::System).unwrap();
        }
        ledger = kb.governor().ledger();
        assert!(ledger.added > 0);
        kb.close().unwrap();
    }

    {
        let kb = persistent_kb(dir.path());
        assert_eq!(kb.governor().ledger(), ledger);
        assert_eq!(kb.store().count_tier(Tier::Kernel), 0);
    }
}

#[test]
fn wal_entries_after_the_dump_are_replayed() {
    let dir = tempfile::TempDir::new().unwrap();
    let state_file = dir.path().join("state.json");

    // First session: one record, dumped.
    {
        let mut kb = persistent_kb(dir.path());
        kb.submit(note("kept"), Origin::User).unwrap();
        kb.close().unwrap();
    }
    let stale_dump = std::fs::read(&state_file).unwrap();

    // Second session: two more records.
    let (beta, gamma) = {
        let mut kb = persistent_kb(dir.path());
        let beta = kb.submit(note("beta"), Origin::User).unwrap().record_id().unwrap();
        let gamma = kb.submit(note("gamma"), Origin::User).unwrap().record_id().unwrap();
        kb.close().unwrap();
        (beta, gamma)
    };

    // Simulate a crash before the second dump landed.
    std::fs::write(&state_file, &stale_dump).unwrap();

    // Third session: the WAL brings the store forward.
    {
        let mut kb = persistent_kb(dir.path());
        assert_eq!(kb.store().len(), 3);
        assert_eq!(kb.get(beta).unwrap().title, "beta");
        assert_eq!(kb.get(gamma).unwrap().title, "gamma");

        // Proposals the stale dump never saw are rebuilt from the log.
        let proposals = kb.list_proposals(10);
        assert_eq!(proposals.len(), 3);
        assert!(proposals.iter().all(|p| p.status == ProposalStatus::Installed));
        let rebuilt: Vec<Option<RecordId>> = proposals[..2]
            .iter()
            .map(|p| p.install.as_ref().and_then(|meta| meta.record_id))
            .collect();
        assert_eq!(rebuilt, [Some(gamma), Some(beta)]);
        assert_eq!(proposals[0].payload.title, "gamma");

        // Ids and proposal numbers are not reused.
        let next = kb.submit(note("delta"), Origin::User).unwrap();
        assert_eq!(next.record_id(), RecordId::new(4));
        assert!(next.proposal_id() > 3);
    }
}

#[test]
fn snapshot_restore_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    {
        let mut kb = persistent_kb(dir.path());
        kb.submit(note("before"), Origin::User).unwrap();
        let snapshot = kb.snapshot().unwrap();
        kb.submit(note("after one"), Origin::User).unwrap();
        kb.submit(note("after two"), Origin::User).unwrap();
        assert_eq!(kb.store().len(), 3);

        kb.restore(&snapshot).unwrap();
        assert_eq!(kb.store().len(), 1);
        assert_eq!(kb.audit_trail().last().unwrap().decision, "restored");
    }

    // Entries the snapshot predates are not replayed.
    {
        let kb = persistent_kb(dir.path());
        assert_eq!(kb.store().len(), 1);
        assert!(kb.store().iter().all(|r| r.title == "before"));
    }
}

#[test]
fn snapshots_are_pruned_to_the_newest() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut kb = persistent_kb(dir.path());
    for title in ["one", "two", "three", "four"] {
        kb.submit(note(title), Origin::User).unwrap();
    }
    let newest = kb.snapshot().unwrap();

    // One pre-install snapshot per install plus the manual one.
    assert_eq!(kb.list_snapshots().unwrap().len(), 5);

    let removed = kb.prune_snapshots(2).unwrap();
    assert_eq!(removed, 3);
    let left = kb.list_snapshots().unwrap();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&newest));
}

#[test]
fn config_file_round_trips() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    let mut config = KbConfig::persistent(dir.path().join("kb"));
    config.settings.min_richness = 3;
    config.settings.promotion.max_new_aggregates = 5;
    config.settings.save(&path).unwrap();

    let loaded = strata::config::StrataConfig::load(&path).unwrap();
    assert_eq!(loaded, config.settings);

    // A stricter richness floor applies on open.
    let mut kb = KnowledgeBase::open(KbConfig {
        settings: loaded,
        data_dir: config.data_dir.clone(),
    })
    .unwrap();
    let result = kb.submit(note("two blocks"), Origin::User).unwrap();
    assert_eq!(
        result.rejection(),
        Some(&Rejection::LowValue { richness: 2, minimum: 3 })
    );
}
