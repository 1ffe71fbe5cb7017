//! Rich diagnostic error types for the strata knowledge base.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong and how to fix it.
//!
//! Expected pipeline outcomes (schema violations, duplicates, conflicts, low
//! value) are modelled by [`Rejection`]. They travel inside a
//! [`ProposalResult`](crate::pipeline::ProposalResult) rather than as `Err`.

use miette::Diagnostic;
use thiserror::Error;

use crate::record::RecordId;

/// Top-level error type for the strata knowledge base.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, sources) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum StrataError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Governor(#[from] GovernorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] crate::paths::PathError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(strata::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(strata::store::redb),
        help(
            "The embedded log database encountered a transaction error. \
             The WAL is append-only; if it is corrupt, restore the newest snapshot \
             into a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(strata::store::serde),
        help(
            "Failed to serialize or deserialize store state. \
             This usually means the on-disk format changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("record not found: {id}")]
    #[diagnostic(
        code(strata::store::not_found),
        help("The record id does not exist in the store. List records with `strata select`.")
    )]
    NotFound { id: RecordId },

    #[error("snapshot not found: {reference}")]
    #[diagnostic(
        code(strata::store::snapshot_missing),
        help(
            "The snapshot was pruned or never captured. \
             Snapshots live under `<data_dir>/snapshots/` and are named by capture time."
        )
    )]
    SnapshotMissing { reference: String },
}

// ---------------------------------------------------------------------------
// Pipeline rejections (expected outcomes, never retried automatically)
// ---------------------------------------------------------------------------

/// Why the commit pipeline refused a candidate.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic, serde::Serialize, serde::Deserialize)]
pub enum Rejection {
    #[error("schema violation: {message}")]
    #[diagnostic(
        code(strata::pipeline::schema),
        help("A candidate needs a non-empty title, existing lineage parents, and no secrets in readable fields.")
    )]
    SchemaViolation { message: String },

    #[error("duplicate content: identical to {existing}")]
    #[diagnostic(
        code(strata::pipeline::duplicate),
        help("The same normalized title, tags and content are already stored. Reuse the existing record.")
    )]
    DuplicateContent { existing: RecordId },

    #[error("explicit conflict with {existing}: \"{statement}\" negates \"{conflicting}\"")]
    #[diagnostic(
        code(strata::pipeline::conflict),
        help("An invariant or claim is the explicit negation of a stored statement. Resolve the contradiction first.")
    )]
    ExplicitConflict {
        existing: RecordId,
        statement: String,
        conflicting: String,
    },

    #[error("low value: richness {richness} below minimum {minimum}")]
    #[diagnostic(
        code(strata::pipeline::low_value),
        help("Add definitions, invariants, claims, examples or next actions before submitting.")
    )]
    LowValue { richness: usize, minimum: usize },
}

// ---------------------------------------------------------------------------
// Commit errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum CommitError {
    #[error("install failed for proposal {proposal_id}: {message}")]
    #[diagnostic(
        code(strata::pipeline::install_failure),
        help(
            "The store was rolled back to the pre-install snapshot ({snapshot}). \
             The proposal is terminal; resubmit the candidate once the cause is fixed."
        )
    )]
    InstallFailure {
        proposal_id: u64,
        message: String,
        snapshot: String,
    },

    #[error("illegal proposal transition: {from} -> {to}")]
    #[diagnostic(
        code(strata::pipeline::illegal_transition),
        help("Proposal status is append-only and terminal once Installed, Rejected or Failed.")
    )]
    IllegalTransition { from: String, to: String },
}

// ---------------------------------------------------------------------------
// Governor errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GovernorError {
    #[error("promotion of cluster seeded by {seed} failed: {message}")]
    #[diagnostic(
        code(strata::governor::promotion),
        help("The cluster was skipped; the remaining clusters in this cycle still ran.")
    )]
    PromotionFailed { seed: RecordId, message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(strata::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}")]
    #[diagnostic(
        code(strata::config::parse),
        help("Check the TOML syntax in the config file. {message}")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(strata::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(strata::config::invalid),
        help("Check the [governor], [promotion] and [selection] sections. {message}")
    )]
    Invalid { message: String },
}

/// Convenience alias for functions returning strata results.
pub type StrataResult<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_to_strata_error() {
        let err = StoreError::NotFound {
            id: RecordId::new(7).unwrap(),
        };
        let top: StrataError = err.into();
        assert!(matches!(top, StrataError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn rejection_display_names_the_existing_record() {
        let rejection = Rejection::DuplicateContent {
            existing: RecordId::new(3).unwrap(),
        };
        assert_eq!(format!("{rejection}"), "duplicate content: identical to rec:3");
    }

    #[test]
    fn low_value_message_is_descriptive() {
        let msg = format!(
            "{}",
            Rejection::LowValue {
                richness: 1,
                minimum: 2
            }
        );
        assert!(msg.contains("richness 1"));
        assert!(msg.contains("minimum 2"));
    }
}
