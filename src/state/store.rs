//! SQLite-backed transfer status store

use crate::config::DatabaseConfig;
use crate::error::{TransferError, TransferResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

const SELECT_COLUMNS: &str = r#"
    SELECT request_id, block_id, activity_ids, user_did, admin_did, contract_hash,
           reward_points, status, message, error_details, created_at, updated_at
    FROM transfer_status
"#;

/// Lifecycle state of a transfer row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Pending,
    Success,
    Failed,
    Timeout,
}

impl TransferState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Pending => "pending",
            TransferState::Success => "success",
            TransferState::Failed => "failed",
            TransferState::Timeout => "timeout",
        }
    }

    /// `timeout` is not terminal: a late callback may still resolve it
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Success | TransferState::Failed)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferState {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferState::Pending),
            "success" => Ok(TransferState::Success),
            "failed" => Ok(TransferState::Failed),
            "timeout" => Ok(TransferState::Timeout),
            other => Err(TransferError::Internal(format!(
                "unknown transfer state '{}'",
                other
            ))),
        }
    }
}

/// Durable record of one reward transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatus {
    pub request_id: String,
    pub block_id: String,
    pub activity_ids: Vec<String>,
    pub user_did: String,
    pub admin_did: String,
    pub contract_hash: String,
    pub reward_points: i64,
    pub status: TransferState,
    pub message: String,
    pub error_details: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub status: Option<TransferState>,
    pub message: Option<String>,
    pub error_details: Option<String>,
    pub block_id: Option<String>,
}

impl StatusUpdate {
    pub fn to_state(state: TransferState) -> Self {
        Self {
            status: Some(state),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_error_details(mut self, details: impl Into<String>) -> Self {
        self.error_details = Some(details.into());
        self
    }

    pub fn with_block_id(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Fields written
    Applied,
    /// Row already `success`/`failed`; only `updated_at` was refreshed
    TerminalUnchanged,
}

/// Row counts per state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferStats {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
}

/// Transfer status store over a SQLite pool
pub struct StatusStore {
    pool: SqlitePool,
}

impl StatusStore {
    /// Open the pool, creating the database file if needed
    pub async fn new(config: &DatabaseConfig) -> TransferResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> TransferResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transfer_status (
                request_id TEXT PRIMARY KEY,
                block_id TEXT NOT NULL DEFAULT '',
                activity_ids TEXT NOT NULL,
                user_did TEXT NOT NULL,
                admin_did TEXT NOT NULL,
                contract_hash TEXT NOT NULL,
                reward_points INTEGER NOT NULL,
                status TEXT NOT NULL,
                message TEXT NOT NULL DEFAULT '',
                error_details TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // A block belongs to at most one transfer once it is known
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_transfer_block_id
            ON transfer_status (block_id) WHERE block_id <> ''
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transfer_status ON transfer_status (status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transfer_created_at ON transfer_status (created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transfer_admin_did ON transfer_status (admin_did)",
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> TransferResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a new transfer row
    pub async fn create(&self, status: &TransferStatus) -> TransferResult<()> {
        let activity_ids = serde_json::to_string(&status.activity_ids)?;

        let result = sqlx::query(
            r#"
            INSERT INTO transfer_status (
                request_id, block_id, activity_ids, user_did, admin_did, contract_hash,
                reward_points, status, message, error_details, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&status.request_id)
        .bind(&status.block_id)
        .bind(&activity_ids)
        .bind(&status.user_did)
        .bind(&status.admin_did)
        .bind(&status.contract_hash)
        .bind(status.reward_points)
        .bind(status.status.as_str())
        .bind(&status.message)
        .bind(&status.error_details)
        .bind(status.created_at)
        .bind(status.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(
                    "Created transfer {} for block {}",
                    status.request_id, status.block_id
                );
                Ok(())
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation()
                    || db_err.message().contains("UNIQUE constraint failed") =>
            {
                if db_err.message().contains("block_id") {
                    Err(TransferError::DuplicateBlockId {
                        block_id: status.block_id.clone(),
                    })
                } else {
                    Err(TransferError::DuplicateRequestId {
                        request_id: status.request_id.clone(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a transfer by its request id
    pub async fn get_by_request_id(&self, request_id: &str) -> TransferResult<TransferStatus> {
        let row = sqlx::query(&format!("{} WHERE request_id = ?", SELECT_COLUMNS))
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_status(&row),
            None => Err(TransferError::not_found(format!("transfer {}", request_id))),
        }
    }

    /// Get the transfer bound to a block
    pub async fn get_by_block_id(&self, block_id: &str) -> TransferResult<TransferStatus> {
        if block_id.is_empty() {
            return Err(TransferError::not_found("transfer for empty block id"));
        }

        let row = sqlx::query(&format!("{} WHERE block_id = ?", SELECT_COLUMNS))
            .bind(block_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_status(&row),
            None => Err(TransferError::not_found(format!(
                "transfer for block {}",
                block_id
            ))),
        }
    }

    /// Apply a partial update and refresh `updated_at`.
    ///
    /// Rows in a terminal state keep their fields; the statement's own guard
    /// makes this hold under concurrent writers.
    pub async fn update(
        &self,
        request_id: &str,
        update: &StatusUpdate,
    ) -> TransferResult<UpdateOutcome> {
        let now = Utc::now();

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE transfer_status SET updated_at = ");
        query.push_bind(now);
        if let Some(state) = update.status {
            query.push(", status = ").push_bind(state.as_str());
        }
        if let Some(message) = &update.message {
            query.push(", message = ").push_bind(message.as_str());
        }
        if let Some(details) = &update.error_details {
            query.push(", error_details = ").push_bind(details.as_str());
        }
        if let Some(block_id) = &update.block_id {
            query.push(", block_id = ").push_bind(block_id.as_str());
        }
        query.push(" WHERE request_id = ").push_bind(request_id);
        query.push(" AND status NOT IN ('success', 'failed')");

        let applied = match query.build().execute(&self.pool).await {
            Ok(result) => result.rows_affected(),
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation()
                    || db_err.message().contains("UNIQUE constraint failed") =>
            {
                return Err(TransferError::DuplicateBlockId {
                    block_id: update.block_id.clone().unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if applied > 0 {
            debug!("Updated transfer {}: {:?}", request_id, update);
            return Ok(UpdateOutcome::Applied);
        }

        let touched = sqlx::query("UPDATE transfer_status SET updated_at = ? WHERE request_id = ?")
            .bind(now)
            .bind(request_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if touched == 0 {
            return Err(TransferError::not_found(format!("transfer {}", request_id)));
        }

        warn!(
            "Transfer {} is already terminal, ignoring update {:?}",
            request_id, update
        );
        Ok(UpdateOutcome::TerminalUnchanged)
    }

    /// Move every `pending` row to `timeout`, returning how many changed
    pub async fn expire_pending(&self, message: &str) -> TransferResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE transfer_status
            SET status = 'timeout', message = ?, updated_at = ?
            WHERE status = 'pending'
            "#,
        )
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Get transfer statistics
    pub async fn stats(&self) -> TransferResult<TransferStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(CASE WHEN status = 'pending' THEN 1 END) AS pending,
                COUNT(CASE WHEN status = 'success' THEN 1 END) AS success,
                COUNT(CASE WHEN status = 'failed' THEN 1 END) AS failed,
                COUNT(CASE WHEN status = 'timeout' THEN 1 END) AS timeout
            FROM transfer_status
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TransferStats {
            pending: row.get::<i64, _>("pending") as u64,
            success: row.get::<i64, _>("success") as u64,
            failed: row.get::<i64, _>("failed") as u64,
            timeout: row.get::<i64, _>("timeout") as u64,
        })
    }
}

fn row_to_status(row: &SqliteRow) -> TransferResult<TransferStatus> {
    let activity_ids: String = row.try_get("activity_ids")?;
    let status: String = row.try_get("status")?;

    Ok(TransferStatus {
        request_id: row.try_get("request_id")?,
        block_id: row.try_get("block_id")?,
        activity_ids: serde_json::from_str(&activity_ids)?,
        user_did: row.try_get("user_did")?,
        admin_did: row.try_get("admin_did")?,
        contract_hash: row.try_get("contract_hash")?,
        reward_points: row.try_get("reward_points")?,
        status: status.parse()?,
        message: row.try_get("message")?,
        error_details: row.try_get("error_details")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
