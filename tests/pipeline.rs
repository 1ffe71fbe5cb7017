//! End-to-end tests for the commit pipeline, governor, promotion and
//! selection, driven through the `KnowledgeBase` facade.

use strata::config::KbConfig;
use strata::error::{CommitError, Rejection};
use strata::governor::TierBudgets;
use strata::kb::KnowledgeBase;
use strata::pipeline::{ProposalResult, ProposalStatus};
use strata::record::{CandidateRecord, Origin, Record, RecordId, Tier};
use strata::select::{ScoredCandidate, SelectionBudgets, select};
use strata::store::RecordStore;

fn memory_kb() -> KnowledgeBase {
    KnowledgeBase::open(KbConfig::memory()).unwrap()
}

fn installed(result: ProposalResult) -> RecordId {
    match result {
        ProposalResult::Installed { record_id, .. } => record_id,
        other => panic!("expected install, got {other:?}"),
    }
}

fn cache_note(i: usize) -> CandidateRecord {
    CandidateRecord::new(format!("Cache eviction note {i}"))
        .definition(format!("eviction policy variant {i}"))
        .claim(format!("lru suits workload {i}"))
        .tag("cache")
        .tag("eviction")
}

#[test]
fn identical_content_installs_once() {
    let mut kb = memory_kb();
    let candidate = CandidateRecord::new("Write-ahead log")
        .definition("append-only event log")
        .invariant("entries are strictly ordered")
        .tag("storage");

    let first = installed(kb.submit(candidate.clone(), Origin::User).unwrap());
    let second = kb.submit(candidate, Origin::User).unwrap();

    assert_eq!(
        second.rejection(),
        Some(&Rejection::DuplicateContent { existing: first })
    );
    assert_eq!(kb.store().len(), 1);
}

#[test]
fn duplicate_detection_ignores_case_and_spacing() {
    let mut kb = memory_kb();
    let first = installed(
        kb.submit(
            CandidateRecord::new("Snapshot Manager")
                .definition("captures full state")
                .example("before every install")
                .tag("Recovery"),
            Origin::User,
        )
        .unwrap(),
    );
    let again = kb
        .submit(
            CandidateRecord::new("  snapshot   manager ")
                .definition("Captures full state.")
                .example("before every install")
                .tag("recovery "),
            Origin::User,
        )
        .unwrap();
    assert_eq!(again.rejection(), Some(&Rejection::DuplicateContent { existing: first }));
}

#[test]
fn ledger_counters_never_decrease() {
    let mut kb = memory_kb();
    let mut last = kb.governor().ledger();
    for i in 0..12 {
        let candidate = CandidateRecord::new(format!("system summary {i}"))
            .definition(format!("summary definition {i}"))
            .example(format!("summary example {i}"))
            .requested_tier(if i % 3 == 0 { Tier::Kernel } else { Tier::Aggregate });
        kb.submit(candidate, Origin::System).unwrap();

        // A rejection must leave the ledger untouched.
        let before_reject = kb.governor().ledger();
        kb.submit(CandidateRecord::new(format!("thin {i}")).claim("x"), Origin::System)
            .unwrap();
        assert_eq!(kb.governor().ledger(), before_reject);

        let now = kb.governor().ledger();
        assert!(now.added >= last.added, "added decreased: {last:?} -> {now:?}");
        assert!(now.collapsed >= last.collapsed, "collapsed decreased: {last:?} -> {now:?}");
        last = now;
    }
    assert!(last.added > 0);
    assert!(last.collapsed > 0);
}

#[test]
fn budgets_hold_after_every_install() {
    let mut kb = memory_kb();
    for i in 0..40 {
        let candidate = CandidateRecord::new(format!("routing layer {i}"))
            .definition(format!("route definition {i}"))
            .example(format!("route example {i}"))
            .test(format!("route test {i}"))
            .requested_tier(Tier::Kernel);
        installed(kb.submit(candidate, Origin::System).unwrap());

        let store = kb.store();
        let budgets = TierBudgets::for_size(store.len());
        assert!(store.count_tier(Tier::Aggregate) <= budgets.aggregate);
        assert!(store.count_tier(Tier::Kernel) <= budgets.kernel);
    }
    // 40 records: aggregate budget 3, kernel budget 1.
    assert_eq!(kb.store().count_tier(Tier::Kernel), 1);
    assert_eq!(kb.store().count_tier(Tier::Aggregate), 3);
}

#[test]
fn user_cannot_request_a_tier() {
    let mut kb = memory_kb();
    let result = kb
        .submit(
            CandidateRecord::new("Self-promoted")
                .definition("claims to be a kernel")
                .example("it is not")
                .requested_tier(Tier::Kernel),
            Origin::User,
        )
        .unwrap();
    let ProposalResult::Installed { record_id, tier, proposal_id } = result else {
        panic!("expected install, got {result:?}");
    };
    assert_eq!(tier, Tier::Regular);

    let record = kb.get(record_id).unwrap();
    assert_eq!(record.tier, Tier::Regular);
    assert_eq!(record.authority.downgraded_from, Some(Tier::Kernel));

    let proposal = kb.list_proposals(1)[0];
    assert_eq!(proposal.id, proposal_id);
    assert!(proposal.annotations.iter().any(|a| a.contains("downgraded")));
}

#[test]
fn failed_install_leaves_store_byte_identical() {
    let mut kb = memory_kb();
    installed(kb.submit(cache_note(0), Origin::User).unwrap());
    installed(kb.submit(cache_note(1), Origin::User).unwrap());
    let before = kb.store().to_bytes().unwrap();
    let ledger = kb.governor().ledger();

    kb.set_install_hook(|record: &Record, _: &RecordStore| -> Result<(), String> {
        Err(format!("mirror rejected {}", record.id))
    });
    let result = kb.submit(cache_note(2).requested_tier(Tier::Aggregate), Origin::System).unwrap();
    let ProposalResult::Failed { error, proposal_id, .. } = result else {
        panic!("expected failure, got {result:?}");
    };
    assert!(error.to_string().contains("mirror rejected"));
    assert!(matches!(
        error,
        CommitError::InstallFailure { proposal_id: failed, .. } if failed == proposal_id
    ));
    assert_eq!(kb.store().to_bytes().unwrap(), before);
    assert_eq!(kb.governor().ledger(), ledger);

    let proposal = kb.list_proposals(1)[0];
    assert_eq!(proposal.id, proposal_id);
    assert_eq!(proposal.status, ProposalStatus::Failed);
    assert!(proposal.install.as_ref().is_some_and(|m| m.record_id.is_none()));
    assert_eq!(kb.audit_trail().last().unwrap().decision, "failed");

    // The rolled-back candidate is not a duplicate of anything.
    kb.clear_install_hook();
    assert!(kb.submit(cache_note(2), Origin::User).unwrap().is_installed());
}

#[test]
fn explicit_negation_is_a_conflict() {
    let mut kb = memory_kb();
    let a = installed(
        kb.submit(
            CandidateRecord::new("Data visibility")
                .definition("who may read the dataset")
                .invariant("data is public"),
            Origin::User,
        )
        .unwrap(),
    );
    let b = kb
        .submit(
            CandidateRecord::new("Data visibility, revised")
                .definition("who may read the dataset now")
                .invariant("not data is public"),
            Origin::User,
        )
        .unwrap();
    match b.rejection() {
        Some(Rejection::ExplicitConflict { existing, .. }) => assert_eq!(*existing, a),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(kb.store().len(), 1);
}

#[test]
fn soft_disagreement_is_not_a_conflict() {
    let mut kb = memory_kb();
    let a = kb
        .submit(
            CandidateRecord::new("Option one")
                .definition("the first rollout option")
                .claim("option one works"),
            Origin::User,
        )
        .unwrap();
    let b = kb
        .submit(
            CandidateRecord::new("Option one doubts")
                .definition("a skeptical note")
                .claim("this seems unlikely"),
            Origin::User,
        )
        .unwrap();
    assert!(a.is_installed());
    assert!(b.is_installed());
}

#[test]
fn thin_candidate_is_low_value() {
    let mut kb = memory_kb();
    let result = kb
        .submit(CandidateRecord::new("Only a title").claim("one thing"), Origin::User)
        .unwrap();
    assert_eq!(
        result.rejection(),
        Some(&Rejection::LowValue { richness: 1, minimum: 2 })
    );
}

#[test]
fn machine_summary_is_regenerated() {
    let mut kb = memory_kb();
    let id = installed(
        kb.submit(
            CandidateRecord::new("Backpressure")
                .summary(r#"{"auto": true}"#)
                .definition("reversible throttling of abstraction")
                .invariant("never destructive"),
            Origin::User,
        )
        .unwrap(),
    );
    let record = kb.get(id).unwrap();
    assert!(record.summary.starts_with("Backpressure: reversible throttling"));
    assert_eq!(record.authority.originator, "anonymous");
}

#[test]
fn starvation_guard_keeps_focus_broad() {
    let mut records: Vec<Record> = (1..=1000)
        .map(|i| {
            CandidateRecord::new(format!("thin {i}"))
                .claim("maybe")
                .next_action("check later")
                .into_record(RecordId::new(i).unwrap(), 40, 0)
        })
        .collect();
    records.push(
        CandidateRecord::new("rich")
            .definition("d")
            .invariant("i")
            .example("e")
            .test("t")
            .into_record(RecordId::new(1001).unwrap(), 40, 0),
    );
    let candidates: Vec<ScoredCandidate<'_>> = records
        .iter()
        .map(|record| ScoredCandidate {
            record,
            relevance: if record.id.get() == 1001 { 1.0 } else { 0.1 },
        })
        .collect();

    let budgets = SelectionBudgets::default();
    let ws = select(&candidates, &budgets);
    assert_eq!(ws.focus.len(), budgets.focus);
    assert_eq!(ws.focus[0], RecordId::new(1001).unwrap());
    assert!(ws.relaxed);
}

#[test]
fn starvation_guard_fills_focus_when_every_record_is_thin() {
    let records: Vec<Record> = (1..=1001)
        .map(|i| {
            CandidateRecord::new(format!("thin {i}"))
                .claim("maybe")
                .next_action("check later")
                .into_record(RecordId::new(i).unwrap(), 40, 0)
        })
        .collect();
    let candidates: Vec<ScoredCandidate<'_>> = records
        .iter()
        .map(|record| ScoredCandidate {
            record,
            relevance: if record.id.get() == 1001 { 1.0 } else { 0.1 },
        })
        .collect();

    let budgets = SelectionBudgets::default();
    let ws = select(&candidates, &budgets);
    assert!(ws.relaxed);
    assert!(ws.focus.len() >= budgets.starvation_floor());
    assert_eq!(ws.focus.len(), budgets.focus);
    assert_eq!(ws.peripheral.len(), 1001);
    assert_eq!(ws.focus[0], RecordId::new(1001).unwrap());
}

#[test]
fn unrelated_topics_are_never_aggregated() {
    let mut kb = memory_kb();
    let topics = [
        ("Volcano", "vent where magma reaches the surface", "Etna erupted last spring"),
        ("Sonnet", "fourteen line poem in iambic pentameter", "Shakespeare wrote many"),
        ("Mortgage", "loan secured against real estate", "thirty year fixed rate"),
        ("Mitochondria", "organelle producing cellular energy", "muscle cells hold thousands"),
        ("Glacier", "slow moving mass of compacted ice", "Aletsch retreats yearly"),
        ("Espresso", "coffee brewed under high pressure", "ristretto uses less water"),
        ("Chess opening", "first moves of a chess game", "the Sicilian defence"),
        ("Photosynthesis", "plants turning light into sugar", "leaves absorb red light"),
    ];
    for (n, (title, definition, example)) in topics.into_iter().enumerate() {
        let candidate = CandidateRecord::new(title).definition(definition).example(example);
        let id = installed(kb.submit(candidate, Origin::User).unwrap());
        for use_no in 0..8 {
            kb.mark_used(id, &format!("reader-{n}-{use_no}")).unwrap();
        }
    }

    let report = kb.promote(2, 0).unwrap();
    assert!(report.aggregates.is_empty());
    assert_eq!(kb.store().count_tier(Tier::Aggregate), 0);
}

#[test]
fn promotion_subsumes_members_for_canonical_reads() {
    let mut kb = memory_kb();
    let members: Vec<RecordId> = (0..4)
        .map(|i| installed(kb.submit(cache_note(i), Origin::User).unwrap()))
        .collect();
    for (n, id) in members.iter().enumerate() {
        for use_no in 0..7 {
            kb.mark_used(*id, &format!("session-{n}-{use_no}")).unwrap();
        }
    }

    let report = kb.promote(2, 1).unwrap();
    assert_eq!(report.aggregates.len(), 1);
    assert_eq!(report.canonicalized, 4);
    let aggregate = report.aggregates[0];

    let agg = kb.get(aggregate).unwrap();
    assert_eq!(agg.tier, Tier::Aggregate);
    assert_eq!(agg.authority.origin, Origin::System);
    let mut parents = agg.lineage.parents.clone();
    parents.sort();
    assert_eq!(parents, members);
    for id in &members {
        let member = kb.get(*id).unwrap();
        assert_eq!(member.canonical, Some(aggregate));
        assert!(member.lineage.children.contains(&aggregate));
    }

    let canonical = kb.select(|_| 0.5, true);
    assert_eq!(canonical.focus, vec![aggregate]);
    assert_eq!(canonical.macro_set, vec![aggregate]);

    let everything = kb.select(|_| 0.5, false);
    assert_eq!(everything.focus.len(), 5);
    for id in &members {
        assert!(everything.focus.contains(id));
    }
}

#[test]
fn small_store_does_not_promote() {
    let mut kb = memory_kb();
    // Three records: below the cluster minimum and an aggregate budget of 0.
    let ids: Vec<RecordId> = (0..3)
        .map(|i| installed(kb.submit(cache_note(i), Origin::User).unwrap()))
        .collect();
    for id in &ids {
        for u in 0..10 {
            kb.mark_used(*id, &format!("ctx-{u}")).unwrap();
        }
    }
    let report = kb.promote(2, 1).unwrap();
    assert!(report.aggregates.is_empty());
    assert!(kb.store().iter().all(|r| r.canonical.is_none()));
}

#[test]
fn backpressure_raises_selection_floor() {
    let mut kb = memory_kb();
    // 100 base records give room for 5 aggregates and 1 kernel.
    for i in 0..100 {
        let candidate = CandidateRecord::new(format!("base fact {i}"))
            .definition(format!("fact definition {i}"))
            .example(format!("fact example {i}"));
        installed(kb.submit(candidate, Origin::User).unwrap());
    }
    for i in 0..4 {
        let candidate = CandidateRecord::new(format!("hand aggregate {i}"))
            .definition(format!("aggregate definition {i}"))
            .example(format!("aggregate example {i}"))
            .requested_tier(Tier::Aggregate);
        installed(kb.submit(candidate, Origin::System).unwrap());
    }
    let quiet = kb.info();
    assert!(!quiet.backpressure_active);

    let kernel = CandidateRecord::new("hand kernel")
        .definition("routes everything")
        .example("route a")
        .test("routes resolve")
        .requested_tier(Tier::Kernel);
    installed(kb.submit(kernel, Origin::System).unwrap());

    // added = 4 * 1 + 2 = 6 > 5
    let info = kb.info();
    assert_eq!(info.ledger.added, 6);
    assert!(info.backpressure_active);
    assert_eq!(info.reasoning_depth, 2);
    assert!(info.min_crispness > quiet.min_crispness);
    assert!(kb.governor().backpressure().dedup_sweep_scheduled);
}
