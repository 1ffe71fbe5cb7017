//! Record storage for strata.
//!
//! - [`RecordStore`]: the keyed record table with a fingerprint index
//! - [`wal::Wal`]: append-only event log and audit trail (redb when persistent)
//! - [`snapshot::SnapshotManager`]: pre-install full-state captures
//! - [`persist::WriteBehind`]: debounced full-state dump
//!
//! The store is owned by a single writer. Only [`StoreState`] crosses the
//! serialization boundary, and its encoding is deterministic (ordered maps),
//! so two captures of the same state are byte-identical.

pub mod durable;
pub mod persist;
pub mod snapshot;
pub mod wal;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::{Record, RecordId, Tier};

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Serializable full state of a [`RecordStore`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    /// Next raw id to allocate.
    pub next_id: u64,
    pub records: BTreeMap<RecordId, Record>,
}

/// Keyed table of records with a fingerprint → id index.
#[derive(Debug, Default)]
pub struct RecordStore {
    state: StoreState,
    by_fingerprint: HashMap<String, RecordId>,
}

impl RecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: StoreState {
                next_id: 1,
                records: BTreeMap::new(),
            },
            by_fingerprint: HashMap::new(),
        }
    }

    /// Rebuild a store (and its indexes) from serialized state.
    pub fn from_state(state: StoreState) -> Self {
        let mut store = Self {
            state,
            by_fingerprint: HashMap::new(),
        };
        store.state.next_id = store.state.next_id.max(1);
        store.reindex();
        store
    }

    fn reindex(&mut self) {
        self.by_fingerprint.clear();
        for record in self.state.records.values() {
            if !record.fingerprint.is_empty() {
                // Oldest record wins when fingerprints collide.
                self.by_fingerprint
                    .entry(record.fingerprint.clone())
                    .or_insert(record.id);
            }
        }
    }

    /// Allocate a fresh record id.
    pub fn allocate_id(&mut self) -> RecordId {
        loop {
            let raw = self.state.next_id.max(1);
            self.state.next_id = raw + 1;
            if let Some(id) = RecordId::new(raw) {
                if !self.state.records.contains_key(&id) {
                    return id;
                }
            }
        }
    }

    /// Never allocate a raw id below `next`.
    pub fn reserve_ids_below(&mut self, next: u64) {
        self.state.next_id = self.state.next_id.max(next);
    }

    /// Insert or replace a record, keeping the fingerprint index current.
    pub fn upsert(&mut self, record: Record) {
        if let Some(previous) = self.state.records.get(&record.id) {
            if previous.fingerprint != record.fingerprint
                && self.by_fingerprint.get(&previous.fingerprint) == Some(&record.id)
            {
                self.by_fingerprint.remove(&previous.fingerprint);
            }
        }
        if !record.fingerprint.is_empty() {
            self.by_fingerprint
                .entry(record.fingerprint.clone())
                .or_insert(record.id);
        }
        if record.id.get() >= self.state.next_id {
            self.state.next_id = record.id.get() + 1;
        }
        self.state.records.insert(record.id, record);
    }

    pub fn get(&self, id: RecordId) -> Option<&Record> {
        self.state.records.get(&id)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut Record> {
        self.state.records.get_mut(&id)
    }

    /// Look up a record, failing with [`StoreError::NotFound`].
    pub fn require(&self, id: RecordId) -> StoreResult<&Record> {
        self.get(id).ok_or(StoreError::NotFound { id })
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.state.records.contains_key(&id)
    }

    /// Id of the record carrying `fingerprint`, if any.
    pub fn find_fingerprint(&self, fingerprint: &str) -> Option<RecordId> {
        self.by_fingerprint.get(fingerprint).copied()
    }

    /// Iterate records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.state.records.values()
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.state.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    /// Number of records currently at `tier`.
    pub fn count_tier(&self, tier: Tier) -> usize {
        self.iter().filter(|r| r.tier == tier).count()
    }

    /// Sum of usage counts across the store.
    pub fn total_usage(&self) -> u64 {
        self.iter().map(|r| r.usage.count).sum()
    }

    pub fn state(&self) -> &StoreState {
        &self.state
    }

    /// Deterministic binary encoding of the full state.
    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        bincode::serialize(&self.state).map_err(|e| StoreError::Serialization {
            message: format!("failed to encode store state: {e}"),
        })
    }

    /// Decode state produced by [`RecordStore::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let state: StoreState = bincode::deserialize(bytes).map_err(|e| StoreError::Serialization {
            message: format!("failed to decode store state: {e}"),
        })?;
        Ok(Self::from_state(state))
    }
}
