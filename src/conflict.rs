//! Duplicate and explicit-negation conflict detection.
//!
//! A candidate statement conflicts with a stored one only when both normalize
//! to the same head phrase and exactly one of them carries an explicit
//! negation prefix. Disagreement in any other form passes.

use crate::fingerprint::normalize;
use crate::record::{ContentBlocks, RecordId};
use crate::store::RecordStore;

/// Prefixes (in normalized form) that mark a statement as the negation of its head.
const NEGATION_PREFIXES: &[&str] = &[
    "it is not the case that ",
    "it is not true that ",
    "not ",
];

/// A statement split into polarity and head phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polarized {
    pub negated: bool,
    pub head: String,
}

/// Split a statement into polarity and normalized head.
///
/// Returns `None` for statements that normalize to nothing.
pub fn polarize(statement: &str) -> Option<Polarized> {
    let norm = normalize(statement);
    if norm.is_empty() {
        return None;
    }
    for prefix in NEGATION_PREFIXES {
        if let Some(rest) = norm.strip_prefix(prefix) {
            if rest.is_empty() {
                return None;
            }
            return Some(Polarized {
                negated: true,
                head: rest.to_string(),
            });
        }
    }
    Some(Polarized {
        negated: false,
        head: norm,
    })
}

/// An explicit negation pair between a candidate and a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub existing: RecordId,
    pub statement: String,
    pub conflicting: String,
}

/// Scan the live store for a statement that explicitly negates one of the
/// candidate's invariants or claims. Dormant records are ignored.
pub fn find_conflict(store: &RecordStore, candidate: &ContentBlocks) -> Option<Conflict> {
    let wanted: Vec<(&String, Polarized)> = candidate
        .statements()
        .filter_map(|s| polarize(s).map(|p| (s, p)))
        .collect();
    if wanted.is_empty() {
        return None;
    }
    for record in store.iter().filter(|r| !r.status.is_dormant()) {
        for stored in record.content.statements() {
            let Some(existing) = polarize(stored) else {
                continue;
            };
            for (statement, polarized) in &wanted {
                if polarized.head == existing.head && polarized.negated != existing.negated {
                    return Some(Conflict {
                        existing: record.id,
                        statement: (*statement).clone(),
                        conflicting: stored.clone(),
                    });
                }
            }
        }
    }
    None
}

/// Id of a stored record with the same fingerprint.
pub fn find_duplicate(store: &RecordStore, fingerprint: &str) -> Option<RecordId> {
    store.find_fingerprint(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::record_fingerprint;
    use crate::record::CandidateRecord;

    fn store_with(candidate: CandidateRecord) -> (RecordStore, RecordId) {
        let mut store = RecordStore::new();
        let id = store.allocate_id();
        let mut r = candidate.into_record(id, 40, 0);
        r.fingerprint = record_fingerprint(&r);
        store.upsert(r);
        (store, id)
    }

    #[test]
    fn polarize_detects_prefix() {
        assert_eq!(
            polarize("Not data is public."),
            Some(Polarized {
                negated: true,
                head: "data is public".into()
            })
        );
        assert_eq!(polarize("not"), Some(Polarized { negated: false, head: "not".into() }));
        assert_eq!(polarize("  !! "), None);
    }

    #[test]
    fn explicit_negation_is_flagged() {
        let (store, id) = store_with(CandidateRecord::new("A").invariant("data is public"));
        let candidate = CandidateRecord::new("B").invariant("not data is public");
        let conflict = find_conflict(&store, &candidate.content).unwrap();
        assert_eq!(conflict.existing, id);
        assert_eq!(conflict.conflicting, "data is public");
    }

    #[test]
    fn negation_against_claims_is_flagged_in_reverse() {
        let (store, _) = store_with(CandidateRecord::new("A").claim("It is not the case that caches are coherent"));
        let candidate = CandidateRecord::new("B").invariant("caches are coherent");
        assert!(find_conflict(&store, &candidate.content).is_some());
    }

    #[test]
    fn soft_disagreement_is_not_flagged() {
        let (store, _) = store_with(CandidateRecord::new("A").claim("option one works"));
        let candidate = CandidateRecord::new("B").claim("this seems unlikely");
        assert!(find_conflict(&store, &candidate.content).is_none());

        let candidate = CandidateRecord::new("C").claim("option one does not work");
        assert!(find_conflict(&store, &candidate.content).is_none());
    }

    #[test]
    fn dormant_records_are_ignored() {
        let (mut store, id) = store_with(CandidateRecord::new("A").invariant("x holds"));
        store.get_mut(id).unwrap().status = crate::record::RecordStatus::Archived;
        let candidate = CandidateRecord::new("B").invariant("not x holds");
        assert!(find_conflict(&store, &candidate.content).is_none());
    }

    #[test]
    fn definitions_are_not_scanned() {
        let (store, _) = store_with(CandidateRecord::new("A").definition("x holds"));
        let candidate = CandidateRecord::new("B").invariant("not x holds");
        assert!(find_conflict(&store, &candidate.content).is_none());
    }
}
