//! ACID-durable append-only logs backed by redb.
//!
//! Holds the WAL and the audit trail. Each log is a table keyed by a
//! monotonically increasing sequence number; entries are never rewritten
//! or compacted here.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::StoreResult;

/// Which append-only log a call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTable {
    Wal,
    Audit,
}

const WAL_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("wal");
const AUDIT_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("audit");

impl LogTable {
    fn definition(self) -> TableDefinition<'static, u64, &'static [u8]> {
        match self {
            LogTable::Wal => WAL_TABLE,
            LogTable::Audit => AUDIT_TABLE,
        }
    }
}

/// ACID-durable log store using redb.
///
/// All writes go through transactions. Reads use MVCC snapshots.
pub struct DurableLog {
    db: Arc<Database>,
}

impl DurableLog {
    /// Open or create the log database in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join("log.redb");
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Append an entry at `seq`. The caller owns sequence allocation.
    pub fn append(&self, table: LogTable, seq: u64, value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(|e| StoreError::Redb {
            message: format!("begin_write failed: {e}"),
        })?;
        {
            let mut t = txn.open_table(table.definition()).map_err(|e| StoreError::Redb {
                message: format!("open_table failed: {e}"),
            })?;
            t.insert(seq, value).map_err(|e| StoreError::Redb {
                message: format!("insert failed: {e}"),
            })?;
        }
        txn.commit().map_err(|e| StoreError::Redb {
            message: format!("commit failed: {e}"),
        })?;
        Ok(())
    }

    /// All entries with sequence number strictly greater than `after`, in order.
    pub fn scan_after(&self, table: LogTable, after: u64) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let t = match txn.open_table(table.definition()) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                });
            }
        };
        let range = t.range((after + 1)..).map_err(|e| StoreError::Redb {
            message: format!("range failed: {e}"),
        })?;
        let mut out = Vec::new();
        for item in range {
            let (k, v) = item.map_err(|e| StoreError::Redb {
                message: format!("range read failed: {e}"),
            })?;
            out.push((k.value(), v.value().to_vec()));
        }
        Ok(out)
    }

    /// Highest sequence number in `table`, 0 when empty.
    pub fn last_seq(&self, table: LogTable) -> StoreResult<u64> {
        let txn = self.db.begin_read().map_err(|e| StoreError::Redb {
            message: format!("begin_read failed: {e}"),
        })?;
        let t = match txn.open_table(table.definition()) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(0),
            Err(e) => {
                return Err(StoreError::Redb {
                    message: format!("open_table failed: {e}"),
                });
            }
        };
        let last = t.last().map_err(|e| StoreError::Redb {
            message: format!("last failed: {e}"),
        })?;
        Ok(last.map(|(k, _)| k.value()).unwrap_or(0))
    }
}

impl std::fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLog").finish()
    }
}
