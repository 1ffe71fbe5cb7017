//! Write-ahead log and audit trail.
//!
//! Both logs are append-only and strictly ordered by sequence number. With a
//! data directory they are persisted through [`DurableLog`]; without one they
//! live in memory for the lifetime of the knowledge base. The core never
//! compacts either log.

use serde::{Deserialize, Serialize};

use super::StoreResult;
use super::durable::{DurableLog, LogTable};
use crate::error::StoreError;
use crate::record::now_secs;

/// Kind of a WAL event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalKind {
    #[serde(rename = "proposal.create")]
    ProposalCreate,
    #[serde(rename = "proposal.install")]
    Install,
    #[serde(rename = "proposal.install.fail")]
    InstallFail,
    #[serde(rename = "proposal.reject")]
    Reject,
    /// Governor or promotion mutation of an installed record.
    #[serde(rename = "record.update")]
    RecordUpdate,
}

impl std::fmt::Display for WalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WalKind::ProposalCreate => "proposal.create",
            WalKind::Install => "proposal.install",
            WalKind::InstallFail => "proposal.install.fail",
            WalKind::Reject => "proposal.reject",
            WalKind::RecordUpdate => "record.update",
        };
        f.write_str(s)
    }
}

/// One WAL event. `Install` and `RecordUpdate` carry the full record under
/// `metadata.record` so the log can be replayed over an older dump; `Install`
/// also carries the lineage parents it touched under `metadata.parents`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub seq: u64,
    pub at: u64,
    pub kind: WalKind,
    pub proposal_id: Option<u64>,
    pub metadata: serde_json::Value,
}

/// One decision in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub at: u64,
    pub proposal_id: Option<u64>,
    pub decision: String,
    pub detail: String,
}

/// Append-only WAL plus audit trail.
#[derive(Debug)]
pub struct Wal {
    durable: Option<DurableLog>,
    entries: Vec<WalEntry>,
    audit: Vec<AuditEntry>,
    next_seq: u64,
    next_audit_seq: u64,
    #[cfg(test)]
    refused: Option<WalKind>,
}

impl Wal {
    /// In-memory log (no persistence).
    pub fn memory_only() -> Self {
        Self {
            durable: None,
            entries: Vec::new(),
            audit: Vec::new(),
            next_seq: 1,
            next_audit_seq: 1,
            #[cfg(test)]
            refused: None,
        }
    }

    /// Log persisted under `data_dir`, resuming sequence numbers.
    pub fn open(data_dir: &std::path::Path) -> StoreResult<Self> {
        let durable = DurableLog::open(data_dir)?;
        let next_seq = durable.last_seq(LogTable::Wal)? + 1;
        let next_audit_seq = durable.last_seq(LogTable::Audit)? + 1;
        Ok(Self {
            durable: Some(durable),
            entries: Vec::new(),
            audit: Vec::new(),
            next_seq,
            next_audit_seq,
            #[cfg(test)]
            refused: None,
        })
    }

    /// Append a WAL event and return its sequence number.
    pub fn append(
        &mut self,
        kind: WalKind,
        proposal_id: Option<u64>,
        metadata: serde_json::Value,
    ) -> StoreResult<u64> {
        #[cfg(test)]
        if self.refused == Some(kind) {
            return Err(StoreError::Redb {
                message: format!("{kind} append refused"),
            });
        }
        let entry = WalEntry {
            seq: self.next_seq,
            at: now_secs(),
            kind,
            proposal_id,
            metadata,
        };
        if let Some(durable) = &self.durable {
            durable.append(LogTable::Wal, entry.seq, &encode(&entry)?)?;
        }
        self.next_seq += 1;
        let seq = entry.seq;
        self.entries.push(entry);
        Ok(seq)
    }

    /// Append an audit decision.
    pub fn audit(
        &mut self,
        proposal_id: Option<u64>,
        decision: impl Into<String>,
        detail: impl Into<String>,
    ) -> StoreResult<u64> {
        let entry = AuditEntry {
            seq: self.next_audit_seq,
            at: now_secs(),
            proposal_id,
            decision: decision.into(),
            detail: detail.into(),
        };
        if let Some(durable) = &self.durable {
            durable.append(LogTable::Audit, entry.seq, &encode(&entry)?)?;
        }
        self.next_audit_seq += 1;
        let seq = entry.seq;
        self.audit.push(entry);
        Ok(seq)
    }

    /// Entries appended during this session, in order.
    pub fn entries(&self) -> &[WalEntry] {
        &self.entries
    }

    /// Audit decisions appended during this session, in order.
    pub fn audit_trail(&self) -> &[AuditEntry] {
        &self.audit
    }

    /// Sequence number of the newest WAL entry, 0 if none.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Make every later append of `kind` fail.
    #[cfg(test)]
    pub(crate) fn refuse(&mut self, kind: WalKind) {
        self.refused = Some(kind);
    }

    /// Durable WAL entries newer than `after` (empty in memory-only mode).
    pub fn replay_after(&self, after: u64) -> StoreResult<Vec<WalEntry>> {
        let Some(durable) = &self.durable else {
            return Ok(Vec::new());
        };
        durable
            .scan_after(LogTable::Wal, after)?
            .into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization {
                    message: format!("corrupt WAL entry: {e}"),
                })
            })
            .collect()
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
        message: format!("failed to encode log entry: {e}"),
    })
}
