//! SQLite Persistent Storage for the Withdraw Core
//!
//! Provides durable storage that survives service restarts, including the
//! scheduler's task queue. Uses connection pooling via r2d2 for concurrent
//! access; multi-row operations run in `BEGIN IMMEDIATE` transactions.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{named_params, params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use super::traits::{
    apply_consume, apply_lock, apply_release, check_owner, StorageError, StorageResult,
    WithdrawStore,
};
use crate::accumulator::Nullifier;
use crate::types::checkbook::{Allocation, AllocationId, Checkbook};
use crate::types::events::EventKey;
use crate::types::primitives::{Bytes32, UniversalAddress};
use crate::types::task::{RetryTask, Stage};
use crate::types::withdraw::{MainStatus, WithdrawRequest};

/// SQLite-backed withdraw store with connection pooling
pub struct SqliteWithdrawStore {
    pool: Pool<SqliteConnectionManager>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Map a text column that failed to parse into a row error
fn bad_column(column: &str, msg: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{}: {}", column, msg).into(),
    )
}

fn parse_col<T: std::str::FromStr>(row: &rusqlite::Row, column: &str) -> rusqlite::Result<T>
where
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(column)?;
    raw.parse::<T>().map_err(|e| bad_column(column, e))
}

fn parse_opt_col<T: std::str::FromStr>(
    row: &rusqlite::Row,
    column: &str,
) -> rusqlite::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.get(column)?;
    raw.map(|s| s.parse::<T>().map_err(|e| bad_column(column, e)))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &rusqlite::Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|e| bad_column(column, e))
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::InvalidData(e.to_string()))
}

impl SqliteWithdrawStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_init(|c| c.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkbooks (
                id TEXT PRIMARY KEY,
                deposit_id INTEGER NOT NULL,
                chain_id INTEGER NOT NULL,
                token_key TEXT NOT NULL,
                owner_chain_id INTEGER NOT NULL,
                owner_address TEXT NOT NULL,
                gross_amount TEXT NOT NULL,
                allocatable_amount TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                commitment TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS allocations (
                checkbook_id TEXT NOT NULL REFERENCES checkbooks(id),
                seq INTEGER NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle',
                nullifier TEXT UNIQUE,
                withdraw_request_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (checkbook_id, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_allocations_request ON allocations(withdraw_request_id);

            CREATE TABLE IF NOT EXISTS withdraw_requests (
                id TEXT PRIMARY KEY,
                checkbook_id TEXT NOT NULL,
                allocation_seqs TEXT NOT NULL,
                owner_chain_id INTEGER NOT NULL,
                owner_address TEXT NOT NULL,
                token_key TEXT NOT NULL,
                amount TEXT NOT NULL,
                intent TEXT NOT NULL,
                onchain_request_id TEXT NOT NULL,
                proof_status TEXT NOT NULL,
                execute_status TEXT NOT NULL,
                payout_status TEXT NOT NULL,
                hook_status TEXT NOT NULL,
                status TEXT NOT NULL,
                proof TEXT,
                proof_error TEXT,
                proof_attempts INTEGER NOT NULL DEFAULT 0,
                proof_started_at INTEGER,
                execute_tx_hash TEXT,
                execute_error TEXT,
                execute_attempts INTEGER NOT NULL DEFAULT 0,
                execute_submitted_at INTEGER,
                bridge_tx_id TEXT,
                payout_tx_hash TEXT,
                payout_error TEXT,
                payout_retry_count INTEGER NOT NULL DEFAULT 0,
                hook_tx_hash TEXT,
                hook_error TEXT,
                fallback_transferred INTEGER NOT NULL DEFAULT 0,
                fallback_tx_hash TEXT,
                fallback_error TEXT,
                resolution_note TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_requests_status ON withdraw_requests(status);
            CREATE INDEX IF NOT EXISTS idx_requests_onchain ON withdraw_requests(onchain_request_id);
            CREATE INDEX IF NOT EXISTS idx_requests_created_at ON withdraw_requests(created_at);

            CREATE TABLE IF NOT EXISTS processed_events (
                chain_id INTEGER NOT NULL,
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                kind TEXT NOT NULL,
                processed_at INTEGER NOT NULL,
                PRIMARY KEY (chain_id, tx_hash, log_index)
            );

            CREATE TABLE IF NOT EXISTS retry_tasks (
                request_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                next_eligible_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (request_id, stage)
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due ON retry_tasks(next_eligible_at);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    // Row conversions

    fn row_to_checkbook(row: &rusqlite::Row) -> rusqlite::Result<Checkbook> {
        let owner_address: Bytes32 = parse_col(row, "owner_address")?;
        Ok(Checkbook {
            id: row.get("id")?,
            deposit_id: row.get::<_, i64>("deposit_id")? as u64,
            chain_id: row.get::<_, i64>("chain_id")? as u32,
            token_key: row.get("token_key")?,
            owner: UniversalAddress::new(row.get::<_, i64>("owner_chain_id")? as u32, owner_address),
            gross_amount: parse_col(row, "gross_amount")?,
            allocatable_amount: parse_col(row, "allocatable_amount")?,
            status: parse_col(row, "status")?,
            commitment: parse_opt_col(row, "commitment")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    fn row_to_allocation(row: &rusqlite::Row) -> rusqlite::Result<Allocation> {
        Ok(Allocation {
            checkbook_id: row.get("checkbook_id")?,
            seq: row.get::<_, i64>("seq")? as u8,
            amount: parse_col(row, "amount")?,
            status: parse_col(row, "status")?,
            nullifier: parse_opt_col(row, "nullifier")?,
            withdraw_request_id: row.get("withdraw_request_id")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<WithdrawRequest> {
        let owner_address: Bytes32 = parse_col(row, "owner_address")?;
        let proof: Option<String> = row.get("proof")?;
        let proof = proof
            .map(|raw| serde_json::from_str(&raw).map_err(|e| bad_column("proof", e)))
            .transpose()?;

        Ok(WithdrawRequest {
            id: row.get("id")?,
            checkbook_id: row.get("checkbook_id")?,
            allocation_seqs: json_col(row, "allocation_seqs")?,
            owner: UniversalAddress::new(row.get::<_, i64>("owner_chain_id")? as u32, owner_address),
            token_key: row.get("token_key")?,
            amount: parse_col(row, "amount")?,
            intent: json_col(row, "intent")?,
            onchain_request_id: parse_col(row, "onchain_request_id")?,
            proof_status: parse_col(row, "proof_status")?,
            execute_status: parse_col(row, "execute_status")?,
            payout_status: parse_col(row, "payout_status")?,
            hook_status: parse_col(row, "hook_status")?,
            status: parse_col(row, "status")?,
            proof,
            proof_error: row.get("proof_error")?,
            proof_attempts: row.get::<_, i64>("proof_attempts")? as u32,
            proof_started_at: row.get::<_, Option<i64>>("proof_started_at")?.map(|v| v as u64),
            execute_tx_hash: row.get("execute_tx_hash")?,
            execute_error: row.get("execute_error")?,
            execute_attempts: row.get::<_, i64>("execute_attempts")? as u32,
            execute_submitted_at: row
                .get::<_, Option<i64>>("execute_submitted_at")?
                .map(|v| v as u64),
            bridge_tx_id: row.get("bridge_tx_id")?,
            payout_tx_hash: row.get("payout_tx_hash")?,
            payout_error: row.get("payout_error")?,
            payout_retry_count: row.get::<_, i64>("payout_retry_count")? as u32,
            hook_tx_hash: row.get("hook_tx_hash")?,
            hook_error: row.get("hook_error")?,
            fallback_transferred: row.get::<_, i64>("fallback_transferred")? != 0,
            fallback_tx_hash: row.get("fallback_tx_hash")?,
            fallback_error: row.get("fallback_error")?,
            resolution_note: row.get("resolution_note")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
            version: row.get::<_, i64>("version")? as u64,
        })
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<RetryTask> {
        Ok(RetryTask {
            request_id: row.get("request_id")?,
            stage: parse_col(row, "stage")?,
            attempt: row.get::<_, i64>("attempt")? as u32,
            next_eligible_at: row.get::<_, i64>("next_eligible_at")? as u64,
            last_error: row.get("last_error")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
            updated_at: row.get::<_, i64>("updated_at")? as u64,
        })
    }

    // Statement helpers usable inside a transaction

    fn load_allocations(conn: &Connection, ids: &[AllocationId]) -> StorageResult<Vec<Allocation>> {
        let mut stmt = conn
            .prepare_cached("SELECT * FROM allocations WHERE checkbook_id = ?1 AND seq = ?2")
            .map_err(db_err)?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let allocation = stmt
                .query_row(params![id.checkbook_id, id.seq as i64], |row| {
                    Self::row_to_allocation(row)
                })
                .optional()
                .map_err(db_err)?
                .ok_or_else(|| StorageError::NotFound(format!("allocation {}", id)))?;
            out.push(allocation);
        }
        Ok(out)
    }

    fn insert_allocation(conn: &Connection, a: &Allocation) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO allocations (
                checkbook_id, seq, amount, status, nullifier,
                withdraw_request_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                a.checkbook_id,
                a.seq as i64,
                a.amount.to_string(),
                a.status.to_string(),
                a.nullifier.map(|n| n.to_hex()),
                a.withdraw_request_id,
                a.created_at as i64,
                a.updated_at as i64,
            ],
        )
        .map_err(|e| unique_violation(e, format!("allocation {}", a.id())))?;
        Ok(())
    }

    fn save_allocation(conn: &Connection, a: &Allocation) -> StorageResult<()> {
        conn.execute(
            r#"
            UPDATE allocations SET
                status = ?3,
                nullifier = ?4,
                withdraw_request_id = ?5,
                updated_at = ?6
            WHERE checkbook_id = ?1 AND seq = ?2
            "#,
            params![
                a.checkbook_id,
                a.seq as i64,
                a.status.to_string(),
                a.nullifier.map(|n| n.to_hex()),
                a.withdraw_request_id,
                a.updated_at as i64,
            ],
        )
        .map_err(|e| unique_violation(e, format!("nullifier of allocation {}", a.id())))?;
        Ok(())
    }

    /// Insert (`expected_version = None`) or compare-and-swap update a request.
    /// Writes `request.version + 1` on update.
    fn write_request(
        conn: &Connection,
        request: &WithdrawRequest,
        expected_version: Option<u64>,
    ) -> StorageResult<usize> {
        let insert_sql = r#"
            INSERT INTO withdraw_requests (
                id, checkbook_id, allocation_seqs, owner_chain_id, owner_address,
                token_key, amount, intent, onchain_request_id,
                proof_status, execute_status, payout_status, hook_status, status,
                proof, proof_error, proof_attempts, proof_started_at,
                execute_tx_hash, execute_error, execute_attempts, execute_submitted_at,
                bridge_tx_id, payout_tx_hash, payout_error, payout_retry_count,
                hook_tx_hash, hook_error, fallback_transferred, fallback_tx_hash, fallback_error,
                resolution_note, created_at, updated_at, version
            ) VALUES (
                :id, :checkbook_id, :allocation_seqs, :owner_chain_id, :owner_address,
                :token_key, :amount, :intent, :onchain_request_id,
                :proof_status, :execute_status, :payout_status, :hook_status, :status,
                :proof, :proof_error, :proof_attempts, :proof_started_at,
                :execute_tx_hash, :execute_error, :execute_attempts, :execute_submitted_at,
                :bridge_tx_id, :payout_tx_hash, :payout_error, :payout_retry_count,
                :hook_tx_hash, :hook_error, :fallback_transferred, :fallback_tx_hash, :fallback_error,
                :resolution_note, :created_at, :updated_at, :version
            )
        "#;

        // Same parameter set as the insert; the CAS compares against :version - 1.
        let update_sql = r#"
            UPDATE withdraw_requests SET
                checkbook_id = :checkbook_id,
                allocation_seqs = :allocation_seqs,
                owner_chain_id = :owner_chain_id,
                owner_address = :owner_address,
                token_key = :token_key,
                amount = :amount,
                intent = :intent,
                onchain_request_id = :onchain_request_id,
                proof_status = :proof_status,
                execute_status = :execute_status,
                payout_status = :payout_status,
                hook_status = :hook_status,
                status = :status,
                proof = :proof,
                proof_error = :proof_error,
                proof_attempts = :proof_attempts,
                proof_started_at = :proof_started_at,
                execute_tx_hash = :execute_tx_hash,
                execute_error = :execute_error,
                execute_attempts = :execute_attempts,
                execute_submitted_at = :execute_submitted_at,
                bridge_tx_id = :bridge_tx_id,
                payout_tx_hash = :payout_tx_hash,
                payout_error = :payout_error,
                payout_retry_count = :payout_retry_count,
                hook_tx_hash = :hook_tx_hash,
                hook_error = :hook_error,
                fallback_transferred = :fallback_transferred,
                fallback_tx_hash = :fallback_tx_hash,
                fallback_error = :fallback_error,
                resolution_note = :resolution_note,
                created_at = :created_at,
                updated_at = :updated_at,
                version = :version
            WHERE id = :id AND version = :version - 1
        "#;

        let (sql, version) = match expected_version {
            None => (insert_sql, request.version),
            Some(expected) => (update_sql, expected + 1),
        };

        let allocation_seqs = to_json(&request.allocation_seqs)?;
        let intent = to_json(&request.intent)?;
        let proof = request.proof.as_ref().map(to_json).transpose()?;

        conn.execute(
            sql,
            named_params! {
                ":id": request.id,
                ":checkbook_id": request.checkbook_id,
                ":allocation_seqs": allocation_seqs,
                ":owner_chain_id": request.owner.chain_id as i64,
                ":owner_address": request.owner.data.to_hex(),
                ":token_key": request.token_key,
                ":amount": request.amount.to_string(),
                ":intent": intent,
                ":onchain_request_id": request.onchain_request_id.to_hex(),
                ":proof_status": request.proof_status.to_string(),
                ":execute_status": request.execute_status.to_string(),
                ":payout_status": request.payout_status.to_string(),
                ":hook_status": request.hook_status.to_string(),
                ":status": request.status.to_string(),
                ":proof": proof,
                ":proof_error": request.proof_error,
                ":proof_attempts": request.proof_attempts as i64,
                ":proof_started_at": request.proof_started_at.map(|v| v as i64),
                ":execute_tx_hash": request.execute_tx_hash,
                ":execute_error": request.execute_error,
                ":execute_attempts": request.execute_attempts as i64,
                ":execute_submitted_at": request.execute_submitted_at.map(|v| v as i64),
                ":bridge_tx_id": request.bridge_tx_id,
                ":payout_tx_hash": request.payout_tx_hash,
                ":payout_error": request.payout_error,
                ":payout_retry_count": request.payout_retry_count as i64,
                ":hook_tx_hash": request.hook_tx_hash,
                ":hook_error": request.hook_error,
                ":fallback_transferred": request.fallback_transferred as i64,
                ":fallback_tx_hash": request.fallback_tx_hash,
                ":fallback_error": request.fallback_error,
                ":resolution_note": request.resolution_note,
                ":created_at": request.created_at as i64,
                ":updated_at": request.updated_at as i64,
                ":version": version as i64,
            },
        )
        .map_err(|e| unique_violation(e, format!("request {}", request.id)))
    }

    /// CAS-update a request inside an open transaction
    fn update_request_in(conn: &Connection, request: &mut WithdrawRequest) -> StorageResult<()> {
        let rows = Self::write_request(conn, request, Some(request.version))?;
        if rows == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM withdraw_requests WHERE id = ?1",
                    params![request.id],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(db_err)?
                > 0;
            return Err(if exists {
                StorageError::Conflict(request.id.clone())
            } else {
                StorageError::NotFound(request.id.clone())
            });
        }
        request.version += 1;
        Ok(())
    }

    fn query_requests(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StorageResult<Vec<WithdrawRequest>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let records = stmt
            .query_map(args, |row| Self::row_to_request(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    fn query_allocations(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StorageResult<Vec<Allocation>> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let records = stmt
            .query_map(args, |row| Self::row_to_allocation(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(records)
    }

    // Synchronous helper methods for the trait implementations

    fn insert_checkbook_sync(
        &self,
        checkbook: &Checkbook,
        allocations: &[Allocation],
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        tx.execute(
            r#"
            INSERT INTO checkbooks (
                id, deposit_id, chain_id, token_key, owner_chain_id, owner_address,
                gross_amount, allocatable_amount, status, commitment, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                checkbook.id,
                checkbook.deposit_id as i64,
                checkbook.chain_id as i64,
                checkbook.token_key,
                checkbook.owner.chain_id as i64,
                checkbook.owner.data.to_hex(),
                checkbook.gross_amount.to_string(),
                checkbook.allocatable_amount.to_string(),
                checkbook.status.to_string(),
                checkbook.commitment.map(|c| c.to_hex()),
                checkbook.created_at as i64,
                checkbook.updated_at as i64,
            ],
        )
        .map_err(|e| unique_violation(e, format!("checkbook {}", checkbook.id)))?;

        for allocation in allocations {
            Self::insert_allocation(&tx, allocation)?;
        }

        tx.commit().map_err(db_err)
    }

    fn get_checkbook_sync(&self, id: &str) -> StorageResult<Option<Checkbook>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM checkbooks WHERE id = ?1",
            params![id],
            |row| Self::row_to_checkbook(row),
        )
        .optional()
        .map_err(db_err)
    }

    fn update_checkbook_sync(&self, checkbook: &Checkbook) -> StorageResult<()> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE checkbooks SET status = ?2, commitment = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    checkbook.id,
                    checkbook.status.to_string(),
                    checkbook.commitment.map(|c| c.to_hex()),
                    checkbook.updated_at as i64,
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(checkbook.id.clone()));
        }
        Ok(())
    }

    fn lock_allocations_sync(&self, ids: &[AllocationId], request_id: &str) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut loaded = Self::load_allocations(&tx, ids)?;
        for allocation in loaded.iter_mut() {
            apply_lock(allocation, request_id)?;
            Self::save_allocation(&tx, allocation)?;
        }

        tx.commit().map_err(db_err)
    }

    fn release_allocations_sync(&self, ids: &[AllocationId]) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut changed = 0;
        for allocation in Self::load_allocations(&tx, ids)?.iter_mut() {
            if apply_release(allocation)? {
                Self::save_allocation(&tx, allocation)?;
                changed += 1;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(changed)
    }

    fn consume_in(
        conn: &Connection,
        consumptions: &[(AllocationId, Nullifier)],
        owner: Option<&str>,
    ) -> StorageResult<usize> {
        let ids: Vec<AllocationId> = consumptions.iter().map(|(id, _)| id.clone()).collect();
        let mut loaded = Self::load_allocations(conn, &ids)?;

        let mut changed = 0;
        for (allocation, (_, nullifier)) in loaded.iter_mut().zip(consumptions) {
            if let Some(request_id) = owner {
                check_owner(allocation, request_id)?;
            }
            if apply_consume(allocation, nullifier)? {
                Self::save_allocation(conn, allocation)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn consume_allocations_sync(
        &self,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let changed = Self::consume_in(&tx, consumptions, None)?;
        tx.commit().map_err(db_err)?;
        Ok(changed)
    }

    fn insert_request_sync(
        &self,
        request: &WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        // A cancelled request gives up its on-chain id
        let live_holders: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM withdraw_requests WHERE onchain_request_id = ?1 AND status != 'cancelled'",
                params![request.onchain_request_id.to_hex()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if live_holders > 0 {
            return Err(StorageError::Duplicate(format!(
                "on-chain request id {}",
                request.onchain_request_id
            )));
        }

        let mut loaded = Self::load_allocations(&tx, allocation_ids)?;
        for allocation in loaded.iter_mut() {
            apply_lock(allocation, &request.id)?;
            Self::save_allocation(&tx, allocation)?;
        }
        Self::write_request(&tx, request, None)?;

        tx.commit().map_err(db_err)
    }

    fn commit_execution_sync(
        &self,
        request: &mut WithdrawRequest,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut staged = request.clone();
        let changed = Self::consume_in(&tx, consumptions, Some(&request.id))?;
        Self::update_request_in(&tx, &mut staged)?;

        tx.commit().map_err(db_err)?;
        request.version = staged.version;
        Ok(changed)
    }

    fn commit_cancellation_sync(
        &self,
        request: &mut WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut changed = 0;
        for allocation in Self::load_allocations(&tx, allocation_ids)?.iter_mut() {
            if allocation.withdraw_request_id.is_some() {
                check_owner(allocation, &request.id)?;
            }
            if apply_release(allocation)? {
                Self::save_allocation(&tx, allocation)?;
                changed += 1;
            }
        }

        let mut staged = request.clone();
        Self::update_request_in(&tx, &mut staged)?;

        tx.commit().map_err(db_err)?;
        request.version = staged.version;
        Ok(changed)
    }

    fn update_request_sync(&self, request: &mut WithdrawRequest) -> StorageResult<()> {
        let conn = self.conn()?;
        Self::update_request_in(&conn, request)
    }

    fn count_by_status_sync(&self) -> StorageResult<HashMap<String, u64>> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) as count FROM withdraw_requests GROUP BY status")
            .map_err(db_err)?;

        let mut counts = HashMap::new();
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;

        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            counts.insert(status, count as u64);
        }

        Ok(counts)
    }

    fn mark_event_processed_sync(&self, key: &EventKey, kind: &str) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO processed_events (chain_id, tx_hash, log_index, kind, processed_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    key.chain_id as i64,
                    key.tx_hash,
                    key.log_index as i64,
                    kind,
                    crate::types::now_secs() as i64,
                ],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    fn upsert_task_sync(&self, task: &RetryTask) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO retry_tasks (
                request_id, stage, attempt, next_eligible_at, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(request_id, stage) DO UPDATE SET
                attempt = excluded.attempt,
                next_eligible_at = excluded.next_eligible_at,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
            params![
                task.request_id,
                task.stage.to_string(),
                task.attempt as i64,
                task.next_eligible_at as i64,
                task.last_error,
                task.created_at as i64,
                task.updated_at as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn claim_due_tasks_sync(
        &self,
        now: u64,
        lease_secs: u64,
        limit: usize,
    ) -> StorageResult<Vec<RetryTask>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let tasks = {
            let mut stmt = tx
                .prepare(
                    r#"
                SELECT * FROM retry_tasks
                WHERE next_eligible_at <= ?1
                ORDER BY next_eligible_at ASC, request_id ASC, stage ASC
                LIMIT ?2
                "#,
                )
                .map_err(db_err)?;
            let tasks = stmt
                .query_map(params![now as i64, limit as i64], |row| Self::row_to_task(row))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            tasks
        };

        for task in &tasks {
            tx.execute(
                "UPDATE retry_tasks SET next_eligible_at = ?3 WHERE request_id = ?1 AND stage = ?2",
                params![
                    task.request_id,
                    task.stage.to_string(),
                    (now + lease_secs) as i64
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(tasks)
    }
}

/// Map SQLite unique/primary-key violations to `Duplicate`
fn unique_violation(e: rusqlite::Error, what: String) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(what);
        }
    }
    StorageError::Database(e.to_string())
}

#[async_trait]
impl WithdrawStore for SqliteWithdrawStore {
    async fn insert_checkbook(
        &self,
        checkbook: &Checkbook,
        allocations: &[Allocation],
    ) -> StorageResult<()> {
        self.insert_checkbook_sync(checkbook, allocations)
    }

    async fn get_checkbook(&self, id: &str) -> StorageResult<Option<Checkbook>> {
        self.get_checkbook_sync(id)
    }

    async fn update_checkbook(&self, checkbook: &Checkbook) -> StorageResult<()> {
        self.update_checkbook_sync(checkbook)
    }

    async fn get_allocations(&self, ids: &[AllocationId]) -> StorageResult<Vec<Allocation>> {
        let conn = self.conn()?;
        Self::load_allocations(&conn, ids)
    }

    async fn get_allocations_by_checkbook(
        &self,
        checkbook_id: &str,
    ) -> StorageResult<Vec<Allocation>> {
        let conn = self.conn()?;
        Self::query_allocations(
            &conn,
            "SELECT * FROM allocations WHERE checkbook_id = ?1 ORDER BY seq ASC",
            params![checkbook_id],
        )
    }

    async fn get_allocations_by_request(&self, request_id: &str) -> StorageResult<Vec<Allocation>> {
        let conn = self.conn()?;
        Self::query_allocations(
            &conn,
            "SELECT * FROM allocations WHERE withdraw_request_id = ?1 ORDER BY checkbook_id, seq ASC",
            params![request_id],
        )
    }

    async fn lock_allocations(&self, ids: &[AllocationId], request_id: &str) -> StorageResult<()> {
        self.lock_allocations_sync(ids, request_id)
    }

    async fn release_allocations(&self, ids: &[AllocationId]) -> StorageResult<usize> {
        self.release_allocations_sync(ids)
    }

    async fn consume_allocations(
        &self,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize> {
        self.consume_allocations_sync(consumptions)
    }

    async fn insert_request(
        &self,
        request: &WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<()> {
        self.insert_request_sync(request, allocation_ids)
    }

    async fn get_request(&self, id: &str) -> StorageResult<Option<WithdrawRequest>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM withdraw_requests WHERE id = ?1",
            params![id],
            |row| Self::row_to_request(row),
        )
        .optional()
        .map_err(db_err)
    }

    async fn get_request_by_onchain_id(
        &self,
        onchain_request_id: &Nullifier,
    ) -> StorageResult<Option<WithdrawRequest>> {
        let conn = self.conn()?;
        conn.query_row(
            r#"
            SELECT * FROM withdraw_requests WHERE onchain_request_id = ?1
            ORDER BY (status = 'cancelled') ASC, created_at DESC
            LIMIT 1
            "#,
            params![onchain_request_id.to_hex()],
            |row| Self::row_to_request(row),
        )
        .optional()
        .map_err(db_err)
    }

    async fn update_request(&self, request: &mut WithdrawRequest) -> StorageResult<()> {
        self.update_request_sync(request)
    }

    async fn commit_execution(
        &self,
        request: &mut WithdrawRequest,
        consumptions: &[(AllocationId, Nullifier)],
    ) -> StorageResult<usize> {
        self.commit_execution_sync(request, consumptions)
    }

    async fn commit_cancellation(
        &self,
        request: &mut WithdrawRequest,
        allocation_ids: &[AllocationId],
    ) -> StorageResult<usize> {
        self.commit_cancellation_sync(request, allocation_ids)
    }

    async fn get_requests_by_status(
        &self,
        status: MainStatus,
    ) -> StorageResult<Vec<WithdrawRequest>> {
        let conn = self.conn()?;
        Self::query_requests(
            &conn,
            "SELECT * FROM withdraw_requests WHERE status = ?1 ORDER BY created_at ASC",
            params![status.to_string()],
        )
    }

    async fn count_by_status(&self) -> StorageResult<HashMap<String, u64>> {
        self.count_by_status_sync()
    }

    async fn is_event_processed(&self, key: &EventKey) -> StorageResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM processed_events WHERE chain_id = ?1 AND tx_hash = ?2 AND log_index = ?3",
                params![key.chain_id as i64, key.tx_hash, key.log_index as i64],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn mark_event_processed(&self, key: &EventKey, kind: &str) -> StorageResult<bool> {
        self.mark_event_processed_sync(key, kind)
    }

    async fn upsert_task(&self, task: &RetryTask) -> StorageResult<()> {
        self.upsert_task_sync(task)
    }

    async fn get_task(&self, request_id: &str, stage: Stage) -> StorageResult<Option<RetryTask>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM retry_tasks WHERE request_id = ?1 AND stage = ?2",
            params![request_id, stage.to_string()],
            |row| Self::row_to_task(row),
        )
        .optional()
        .map_err(db_err)
    }

    async fn claim_due_tasks(
        &self,
        now: u64,
        lease_secs: u64,
        limit: usize,
    ) -> StorageResult<Vec<RetryTask>> {
        self.claim_due_tasks_sync(now, lease_secs, limit)
    }

    async fn reschedule_task(
        &self,
        request_id: &str,
        stage: Stage,
        next_eligible_at: u64,
    ) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "UPDATE retry_tasks SET next_eligible_at = ?3 WHERE request_id = ?1 AND stage = ?2",
                params![request_id, stage.to_string(), next_eligible_at as i64],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn remove_task(&self, request_id: &str, stage: Stage) -> StorageResult<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "DELETE FROM retry_tasks WHERE request_id = ?1 AND stage = ?2",
                params![request_id, stage.to_string()],
            )
            .map_err(db_err)?;
        Ok(rows > 0)
    }

    async fn get_tasks_for_request(&self, request_id: &str) -> StorageResult<Vec<RetryTask>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM retry_tasks WHERE request_id = ?1 ORDER BY stage ASC")
            .map_err(db_err)?;
        let tasks = stmt
            .query_map(params![request_id], |row| Self::row_to_task(row))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::{fixture_checkbook, fixture_request};
    use crate::types::checkbook::AllocationStatus;
    use crate::types::withdraw::{Intent, ProofArtifact};

    #[tokio::test]
    async fn test_checkbook_round_trip() {
        let store = SqliteWithdrawStore::in_memory().unwrap();
        let (cb, allocations) = fixture_checkbook("cb_1", 3);
        store.insert_checkbook(&cb, &allocations).await.unwrap();

        let loaded = store.get_checkbook("cb_1").await.unwrap().unwrap();
        assert_eq!(loaded.commitment, cb.commitment);
        assert_eq!(loaded.owner, cb.owner);

        let allocs = store.get_allocations_by_checkbook("cb_1").await.unwrap();
        assert_eq!(allocs.len(), 3);
        assert_eq!(allocs[2].amount, allocations[2].amount);

        assert!(matches!(
            store.insert_checkbook(&cb, &[]).await,
            Err(StorageError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_request_round_trip_and_cas() {
        let store = SqliteWithdrawStore::in_memory().unwrap();
        let (cb, allocations) = fixture_checkbook("cb_1", 2);
        store.insert_checkbook(&cb, &allocations).await.unwrap();

        let request = fixture_request("cb_1", vec![0, 1]);
        let ids = [AllocationId::new("cb_1", 0), AllocationId::new("cb_1", 1)];
        store.insert_request(&request, &ids).await.unwrap();

        let mut loaded = store.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(loaded.intent, request.intent);
        assert_eq!(loaded.allocation_seqs, vec![0, 1]);
        assert!(matches!(loaded.intent, Intent::RawToken { .. }));

        let mut stale = loaded.clone();
        loaded.mark_proof_completed(ProofArtifact {
            proof: "0xaa".to_string(),
            public_values: "0xbb".to_string(),
        });
        store.update_request(&mut loaded).await.unwrap();
        assert_eq!(loaded.version, 1);

        stale.mark_proof_failed("stale writer".to_string());
        assert!(matches!(
            store.update_request(&mut stale).await,
            Err(StorageError::Conflict(_))
        ));

        let again = store.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(again.proof.unwrap().proof, "0xaa");
        let by_onchain = store
            .get_request_by_onchain_id(&request.onchain_request_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_onchain.id, request.id);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_allocations_untouched() {
        let store = SqliteWithdrawStore::in_memory().unwrap();
        let (cb, allocations) = fixture_checkbook("cb_1", 2);
        store.insert_checkbook(&cb, &allocations).await.unwrap();

        let request = fixture_request("cb_1", vec![0, 1]);
        let ids = [AllocationId::new("cb_1", 0), AllocationId::new("cb_1", 1)];
        store.insert_request(&request, &ids).await.unwrap();

        // Stale version: the consume must roll back with the request write.
        let mut stale = request.clone();
        stale.version = 7;
        stale.mark_execute_success(None);
        let consumptions = vec![
            (ids[0].clone(), Bytes32([1u8; 32])),
            (ids[1].clone(), Bytes32([2u8; 32])),
        ];
        assert!(store.commit_execution(&mut stale, &consumptions).await.is_err());

        let allocs = store.get_allocations(&ids).await.unwrap();
        assert!(allocs.iter().all(|a| a.status == AllocationStatus::Pending));
    }

    #[tokio::test]
    async fn test_event_dedup_and_tasks() {
        let store = SqliteWithdrawStore::in_memory().unwrap();
        let key = EventKey::new(714, "0xAB", 2);

        assert!(!store.is_event_processed(&key).await.unwrap());
        assert!(store.mark_event_processed(&key, "payout_executed").await.unwrap());
        assert!(!store.mark_event_processed(&key, "payout_executed").await.unwrap());
        assert!(store.is_event_processed(&key).await.unwrap());

        let mut task = RetryTask::new("wr_1", Stage::Payout, 100);
        store.upsert_task(&task).await.unwrap();
        task.attempt = 2;
        task.next_eligible_at = 50;
        store.upsert_task(&task).await.unwrap();

        let claimed = store.claim_due_tasks(60, 30, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 2);
        let leased = store.get_task("wr_1", Stage::Payout).await.unwrap().unwrap();
        assert_eq!(leased.next_eligible_at, 90);

        assert!(store.remove_task("wr_1", Stage::Payout).await.unwrap());
        assert!(store.get_tasks_for_request("wr_1").await.unwrap().is_empty());
    }
}
