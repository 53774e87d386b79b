//! The per-node consensus database: replicated log and upgrade history.

use crate::{Result, StorageError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;
use voidlux_core::{
    ConsensusLogEntry, Lamport, NodeId, ProposalId, Timestamp, UpgradeId, UpgradeRecord,
    UpgradeStatus,
};

/// Store backing `consensus-<node_id>.db`.
pub struct ConsensusStore {
    conn: Mutex<Connection>,
}

impl ConsensusStore {
    /// Opens (creating if needed) the consensus database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .optional()?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS consensus_log (
                id TEXT NOT NULL UNIQUE,
                term INTEGER NOT NULL,
                log_index INTEGER PRIMARY KEY,
                proposer_node_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT NOT NULL,
                lamport_ts INTEGER NOT NULL,
                committed_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upgrade_history (
                id TEXT PRIMARY KEY,
                from_commit TEXT NOT NULL,
                to_commit TEXT NOT NULL,
                status TEXT NOT NULL,
                initiated_by TEXT NOT NULL,
                failure_reason TEXT,
                nodes_total INTEGER NOT NULL DEFAULT 0,
                nodes_updated INTEGER NOT NULL DEFAULT 0,
                nodes_rolled_back INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- consensus log ----

    /// Highest committed log index on this node (zero when empty).
    pub fn last_index(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(log_index) FROM consensus_log", [], |row| {
                row.get(0)
            })?;
        Ok(max.unwrap_or(0) as u64)
    }

    /// Appends a committed entry. Idempotent by proposal id: appending an
    /// entry already in the log is a no-op returning false.
    ///
    /// The entry's own index is used when the slot is free; otherwise the
    /// next local index is assigned, preserving strict per-node
    /// monotonicity across leader turnover.
    pub fn append(&self, entry: &ConsensusLogEntry) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT log_index FROM consensus_log WHERE id = ?1",
                params![entry.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            tx.commit()?;
            return Ok(false);
        }

        let max: Option<i64> =
            tx.query_row("SELECT MAX(log_index) FROM consensus_log", [], |row| {
                row.get(0)
            })?;
        let next = max.map_or(1, |m| m as u64 + 1);
        let index = entry.log_index.max(next);

        tx.execute(
            "INSERT INTO consensus_log (
                id, term, log_index, proposer_node_id, operation, payload,
                lamport_ts, committed_at, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id.to_string(),
                entry.term as i64,
                index as i64,
                entry.proposer_node_id.to_hex(),
                entry.operation,
                entry.payload.to_string(),
                entry.lamport_ts.value() as i64,
                entry.committed_at.to_rfc3339(),
                Timestamp::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        debug!(proposal_id = %entry.id, log_index = index, "appended consensus log entry");
        Ok(true)
    }

    /// True when the proposal id is already in the log.
    pub fn contains(&self, id: &ProposalId) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT log_index FROM consensus_log WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Entries after the given index, ascending, capped (anti-entropy).
    pub fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<ConsensusLogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM consensus_log WHERE log_index > ?1
             ORDER BY log_index ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![after as i64, limit as i64], log_entry_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    /// The full log, ascending by index.
    pub fn all_entries(&self) -> Result<Vec<ConsensusLogEntry>> {
        self.entries_after(0, usize::MAX / 2)
    }

    // ---- upgrade history ----

    /// Inserts a new history row.
    pub fn insert_upgrade(&self, record: &UpgradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO upgrade_history (
                id, from_commit, to_commit, status, initiated_by,
                failure_reason, nodes_total, nodes_updated, nodes_rolled_back,
                started_at, completed_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.id.to_string(),
                record.from_commit,
                record.to_commit,
                record.status.as_str(),
                record.initiated_by,
                record.failure_reason,
                record.nodes_total,
                record.nodes_updated,
                record.nodes_rolled_back,
                record.started_at.to_rfc3339(),
                record.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Rewrites the mutable fields of a history row.
    pub fn update_upgrade(&self, record: &UpgradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE upgrade_history SET status = ?1, failure_reason = ?2,
                 nodes_updated = ?3, nodes_rolled_back = ?4, completed_at = ?5
             WHERE id = ?6",
            params![
                record.status.as_str(),
                record.failure_reason,
                record.nodes_updated,
                record.nodes_rolled_back,
                record.completed_at.map(|t| t.to_rfc3339()),
                record.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(record.id.to_string()));
        }
        Ok(())
    }

    /// Fetches a history row by id.
    pub fn get_upgrade(&self, id: &UpgradeId) -> Result<Option<UpgradeRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM upgrade_history WHERE id = ?1",
            params![id.to_string()],
            upgrade_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Full history, newest first.
    pub fn list_upgrades(&self) -> Result<Vec<UpgradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM upgrade_history ORDER BY started_at DESC")?;
        let rows = stmt.query_map([], upgrade_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn corrupt(table: &'static str, e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(StorageError::corrupt(table, e.to_string())),
    )
}

fn log_entry_from_row(row: &Row<'_>) -> rusqlite::Result<ConsensusLogEntry> {
    let id: String = row.get("id")?;
    let proposer: String = row.get("proposer_node_id")?;
    let payload: String = row.get("payload")?;
    let committed_at: String = row.get("committed_at")?;

    Ok(ConsensusLogEntry {
        id: id.parse().map_err(|e| corrupt("consensus_log", e))?,
        term: row.get::<_, i64>("term")? as u64,
        log_index: row.get::<_, i64>("log_index")? as u64,
        proposer_node_id: NodeId::from_hex(&proposer).map_err(|e| corrupt("consensus_log", e))?,
        operation: row.get("operation")?,
        payload: serde_json::from_str(&payload).map_err(|e| corrupt("consensus_log", e))?,
        lamport_ts: Lamport(row.get::<_, i64>("lamport_ts")? as u64),
        committed_at: Timestamp::parse(&committed_at).map_err(|e| corrupt("consensus_log", e))?,
    })
}

fn upgrade_from_row(row: &Row<'_>) -> rusqlite::Result<UpgradeRecord> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let started_at: String = row.get("started_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    Ok(UpgradeRecord {
        id: id.parse().map_err(|e| corrupt("upgrade_history", e))?,
        from_commit: row.get("from_commit")?,
        to_commit: row.get("to_commit")?,
        status: status
            .parse::<UpgradeStatus>()
            .map_err(|e| corrupt("upgrade_history", e))?,
        initiated_by: row.get("initiated_by")?,
        failure_reason: row.get("failure_reason")?,
        nodes_total: row.get("nodes_total")?,
        nodes_updated: row.get("nodes_updated")?,
        nodes_rolled_back: row.get("nodes_rolled_back")?,
        started_at: Timestamp::parse(&started_at).map_err(|e| corrupt("upgrade_history", e))?,
        completed_at: completed_at
            .map(|t| Timestamp::parse(&t))
            .transpose()
            .map_err(|e| corrupt("upgrade_history", e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use voidlux_core::Proposal;

    fn store() -> ConsensusStore {
        ConsensusStore::open_in_memory().unwrap()
    }

    fn entry(index: u64) -> ConsensusLogEntry {
        let proposal = Proposal::new(
            NodeId::generate(),
            1,
            "config_change",
            serde_json::json!({"x": index}),
            2,
        );
        ConsensusLogEntry::from_proposal(&proposal, index)
    }

    #[test]
    fn append_assigns_monotone_indexes() {
        let store = store();
        assert_eq!(store.last_index().unwrap(), 0);

        assert!(store.append(&entry(1)).unwrap());
        assert!(store.append(&entry(2)).unwrap());
        assert_eq!(store.last_index().unwrap(), 2);

        // An entry claiming an occupied slot lands on the next local index.
        assert!(store.append(&entry(2)).unwrap());
        assert_eq!(store.last_index().unwrap(), 3);
    }

    #[test]
    fn append_is_idempotent_by_proposal_id() {
        let store = store();
        let e = entry(1);
        assert!(store.append(&e).unwrap());
        assert!(!store.append(&e).unwrap());
        assert_eq!(store.last_index().unwrap(), 1);
        assert!(store.contains(&e.id).unwrap());
    }

    #[test]
    fn entries_after_watermark() {
        let store = store();
        for i in 1..=5 {
            store.append(&entry(i)).unwrap();
        }

        let tail = store.entries_after(3, 100).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].log_index, 4);
        assert_eq!(tail[1].log_index, 5);

        let capped = store.entries_after(0, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn upgrade_history_roundtrip() {
        let store = store();
        let mut record = UpgradeRecord::new("abc123", "def456", "seneschal", 4);
        store.insert_upgrade(&record).unwrap();

        record.status = UpgradeStatus::RolledBack;
        record.nodes_updated = 2;
        record.nodes_rolled_back = 2;
        record.failure_reason = Some("canary failed".into());
        record.completed_at = Some(Timestamp::now());
        store.update_upgrade(&record).unwrap();

        let loaded = store.get_upgrade(&record.id).unwrap().unwrap();
        assert_eq!(loaded.status, UpgradeStatus::RolledBack);
        assert_eq!(loaded.nodes_rolled_back, 2);
        assert_eq!(loaded.failure_reason.as_deref(), Some("canary failed"));

        assert_eq!(store.list_upgrades().unwrap().len(), 1);
    }

    #[test]
    fn update_missing_upgrade_errors() {
        let store = store();
        let record = UpgradeRecord::new("a", "b", "x", 1);
        assert!(matches!(
            store.update_upgrade(&record),
            Err(StorageError::NotFound(_))
        ));
    }
}
