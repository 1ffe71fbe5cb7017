// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # strata
//!
//! A single-writer record commit pipeline composed with an abstraction-tiering
//! governor.
//!
//! ## Architecture
//!
//! - **Record store** (`store`): keyed records with a fingerprint index, WAL,
//!   pre-install snapshots and a write-behind dump
//! - **Commit pipeline** (`pipeline`): validate, dedupe, conflict-check,
//!   policy-gate, snapshot, install, audit
//! - **Governor** (`governor`): tier placement, sublinear tier budgets,
//!   conservation ledger and backpressure
//! - **Auto-promotion** (`promotion`): extractive aggregates and routing kernels
//! - **Selection** (`select`): pure budgeted working-set ranking
//!
//! ## Library usage
//!
//! ```no_run
//! use strata::config::KbConfig;
//! use strata::kb::KnowledgeBase;
//! use strata::record::{CandidateRecord, Origin};
//!
//! let mut kb = KnowledgeBase::open(KbConfig::memory()).unwrap();
//! let result = kb
//!     .submit(
//!         CandidateRecord::new("Write-ahead log")
//!             .definition("append-only record of every install attempt")
//!             .invariant("entries are strictly ordered"),
//!         Origin::User,
//!     )
//!     .unwrap();
//! assert!(result.is_installed());
//! ```

pub mod config;
pub mod conflict;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod error;
pub mod fingerprint;
pub mod governor;
pub mod kb;
pub mod paths;
pub mod pipeline;
pub mod promotion;
pub mod record;
pub mod select;
pub mod store;
