//! SQLite operation store implementation.
//!
//! Durable, process-local persistence for operation records. Mutations are
//! serialized per id through a keyed lock and guarded by an optimistic
//! status check at write time, so concurrent writers surface
//! `StaleTransition` instead of silently overwriting each other.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use tokio::sync::Mutex;
use tracing::{info, instrument};

use crate::domain::{
    AppError, DelayedRequest, Fee, InvariantViolation, OperationId, OperationRecord,
    OperationStore, Receipt, RequestMutation, StoreError, Transfer, TransferMutation,
};

/// SQLite connection pool configuration
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// SQLite-backed operation store with connection pooling
pub struct SqliteStore {
    pool: SqlitePool,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SqliteStore {
    /// Create a new store with custom configuration. `database_url` uses
    /// sqlx syntax, e.g. `sqlite:///var/lib/tracker/operations.db?mode=rwc`.
    pub async fn new(database_url: &str, config: SqliteConfig) -> Result<Self, AppError> {
        info!("Opening operation store...");
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        info!("Operation store opened");
        Ok(Self {
            pool,
            write_locks: DashMap::new(),
        })
    }

    /// Create a new store with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, SqliteConfig::default()).await
    }

    /// In-memory store for tests and ephemeral use. A single pooled
    /// connection is pinned so the database outlives pool idling.
    pub async fn in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        Ok(Self {
            pool,
            write_locks: DashMap::new(),
        })
    }

    /// Run embedded migrations
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Migration(e.to_string())))?;
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn write_lock(&self, id: &OperationId) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn row_to_transfer(row: &SqliteRow) -> Result<Transfer, AppError> {
        let status: String = row.get("status");
        let amount: i64 = row.get("amount");
        let fee_native: i64 = row.get("fee_native");
        let fee_token: Option<i64> = row.get("fee_token");
        let retry_count: i64 = row.get("retry_count");

        Ok(Transfer {
            id: OperationId::from(row.get::<String, _>("id")),
            source_ledger: row.get("source_ledger"),
            destination_ledger: row.get("destination_ledger"),
            asset: row.get("asset"),
            amount: decode_amount(amount)?,
            sender: row.get("sender"),
            recipient: row.get("recipient"),
            fee: Fee {
                native_amount: decode_amount(fee_native)?,
                token_amount: fee_token.map(decode_amount).transpose()?,
            },
            status: status
                .parse()
                .map_err(|e: String| AppError::Store(StoreError::Serialization(e)))?,
            source_receipt: row
                .get::<Option<String>, _>("source_receipt")
                .map(Receipt::from),
            destination_receipt: row
                .get::<Option<String>, _>("destination_receipt")
                .map(Receipt::from),
            last_error: row.get("last_error"),
            retry_count: retry_count as u32,
            submitted_at: row.get("submitted_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_request(row: &SqliteRow) -> Result<DelayedRequest, AppError> {
        let status: String = row.get("status");
        let source_amount: i64 = row.get("source_amount");
        let target_amount: i64 = row.get("target_amount");
        let delay_window_secs: i64 = row.get("delay_window_secs");

        Ok(DelayedRequest {
            id: OperationId::from(row.get::<String, _>("id")),
            owner: row.get("owner"),
            source_ledger: row.get("source_ledger"),
            queue_id: row.get("queue_id"),
            requested_asset: row.get("requested_asset"),
            source_amount: decode_amount(source_amount)?,
            target_amount: decode_amount(target_amount)?,
            delay_window_secs: decode_amount(delay_window_secs)?,
            status: status
                .parse()
                .map_err(|e: String| AppError::Store(StoreError::Serialization(e)))?,
            last_error: row.get("last_error"),
            requested_at: row.get("requested_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn fetch_transfer(&self, id: &OperationId) -> Result<Option<Transfer>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, source_ledger, destination_ledger, asset, amount, sender,
                   recipient, fee_native, fee_token, status, source_receipt,
                   destination_receipt, last_error, retry_count, submitted_at, updated_at
            FROM transfers
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transfer(&row)?)),
            None => Ok(None),
        }
    }

    async fn fetch_request(&self, id: &OperationId) -> Result<Option<DelayedRequest>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, source_ledger, queue_id, requested_asset, source_amount,
                   target_amount, delay_window_secs, status, last_error, requested_at, updated_at
            FROM delayed_requests
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_request(&row)?)),
            None => Ok(None),
        }
    }
}

fn encode_amount(value: u64) -> Result<i64, AppError> {
    i64::try_from(value).map_err(|_| {
        AppError::Store(StoreError::Serialization(format!(
            "amount {} exceeds storage range",
            value
        )))
    })
}

fn decode_amount(value: i64) -> Result<u64, AppError> {
    u64::try_from(value).map_err(|_| {
        AppError::Store(StoreError::Serialization(format!(
            "stored amount {} is negative",
            value
        )))
    })
}

#[async_trait]
impl OperationStore for SqliteStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Store(StoreError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self, transfer), fields(id = %transfer.id))]
    async fn put_transfer(&self, transfer: &Transfer) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, source_ledger, destination_ledger, asset, amount, sender,
                recipient, fee_native, fee_token, status, source_receipt,
                destination_receipt, last_error, retry_count, submitted_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(transfer.id.as_str())
        .bind(&transfer.source_ledger)
        .bind(&transfer.destination_ledger)
        .bind(&transfer.asset)
        .bind(encode_amount(transfer.amount)?)
        .bind(&transfer.sender)
        .bind(&transfer.recipient)
        .bind(encode_amount(transfer.fee.native_amount)?)
        .bind(
            transfer
                .fee
                .token_amount
                .map(encode_amount)
                .transpose()?,
        )
        .bind(transfer.status.as_str())
        .bind(transfer.source_receipt.as_ref().map(Receipt::as_str))
        .bind(transfer.destination_receipt.as_ref().map(Receipt::as_str))
        .bind(transfer.last_error.as_deref())
        .bind(i64::from(transfer.retry_count))
        .bind(transfer.submitted_at)
        .bind(transfer.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        Ok(())
    }

    #[instrument(skip(self, request), fields(id = %request.id))]
    async fn put_request(&self, request: &DelayedRequest) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delayed_requests (
                id, owner, source_ledger, queue_id, requested_asset, source_amount,
                target_amount, delay_window_secs, status, last_error, requested_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(request.id.as_str())
        .bind(&request.owner)
        .bind(&request.source_ledger)
        .bind(&request.queue_id)
        .bind(&request.requested_asset)
        .bind(encode_amount(request.source_amount)?)
        .bind(encode_amount(request.target_amount)?)
        .bind(encode_amount(request.delay_window_secs)?)
        .bind(request.status.as_str())
        .bind(request.last_error.as_deref())
        .bind(request.requested_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_transfer(&self, id: &OperationId) -> Result<Option<Transfer>, AppError> {
        self.fetch_transfer(id).await
    }

    #[instrument(skip(self))]
    async fn get_request(&self, id: &OperationId) -> Result<Option<DelayedRequest>, AppError> {
        self.fetch_request(id).await
    }

    #[instrument(skip(self, mutation))]
    async fn update_transfer(
        &self,
        id: &OperationId,
        mutation: TransferMutation,
    ) -> Result<Transfer, AppError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let current = self
            .fetch_transfer(id)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;
        let expected_status = current.status;
        let next = mutation(&current)?;

        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET status = ?,
                fee_native = ?,
                fee_token = ?,
                source_receipt = ?,
                destination_receipt = ?,
                last_error = ?,
                retry_count = ?,
                submitted_at = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.status.as_str())
        .bind(encode_amount(next.fee.native_amount)?)
        .bind(next.fee.token_amount.map(encode_amount).transpose()?)
        .bind(next.source_receipt.as_ref().map(Receipt::as_str))
        .bind(next.destination_receipt.as_ref().map(Receipt::as_str))
        .bind(next.last_error.as_deref())
        .bind(i64::from(next.retry_count))
        .bind(next.submitted_at)
        .bind(next.updated_at)
        .bind(id.as_str())
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            let found = self
                .fetch_transfer(id)
                .await?
                .map(|t| t.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(InvariantViolation::StaleTransition {
                id: id.to_string(),
                expected: expected_status.to_string(),
                found,
            }
            .into());
        }

        Ok(next)
    }

    #[instrument(skip(self, mutation))]
    async fn update_request(
        &self,
        id: &OperationId,
        mutation: RequestMutation,
    ) -> Result<DelayedRequest, AppError> {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let current = self
            .fetch_request(id)
            .await?
            .ok_or_else(|| AppError::Store(StoreError::NotFound(id.to_string())))?;
        let expected_status = current.status;
        let next = mutation(&current)?;

        let result = sqlx::query(
            r#"
            UPDATE delayed_requests
            SET status = ?,
                last_error = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.status.as_str())
        .bind(next.last_error.as_deref())
        .bind(next.updated_at)
        .bind(id.as_str())
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            let found = self
                .fetch_request(id)
                .await?
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(InvariantViolation::StaleTransition {
                id: id.to_string(),
                expected: expected_status.to_string(),
                found,
            }
            .into());
        }

        Ok(next)
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> Result<Vec<OperationRecord>, AppError> {
        let transfer_rows = sqlx::query(
            r#"
            SELECT id, source_ledger, destination_ledger, asset, amount, sender,
                   recipient, fee_native, fee_token, status, source_receipt,
                   destination_receipt, last_error, retry_count, submitted_at, updated_at
            FROM transfers
            WHERE status IN ('pending', 'confirmed_source')
            ORDER BY submitted_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        let request_rows = sqlx::query(
            r#"
            SELECT id, owner, source_ledger, queue_id, requested_asset, source_amount,
                   target_amount, delay_window_secs, status, last_error, requested_at, updated_at
            FROM delayed_requests
            WHERE status IN ('locked', 'ready')
            ORDER BY requested_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        let mut records = Vec::with_capacity(transfer_rows.len() + request_rows.len());
        for row in &transfer_rows {
            records.push(OperationRecord::Transfer(Self::row_to_transfer(row)?));
        }
        for row in &request_rows {
            records.push(OperationRecord::DelayedRequest(Self::row_to_request(row)?));
        }
        Ok(records)
    }

    #[instrument(skip(self))]
    async fn active_request_for(
        &self,
        owner: &str,
        queue_id: &str,
    ) -> Result<Option<DelayedRequest>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner, source_ledger, queue_id, requested_asset, source_amount,
                   target_amount, delay_window_secs, status, last_error, requested_at, updated_at
            FROM delayed_requests
            WHERE owner = ? AND queue_id = ? AND status IN ('locked', 'ready')
            LIMIT 1
            "#,
        )
        .bind(owner)
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_request(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn list_transfers(&self, limit: i64) -> Result<Vec<Transfer>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_ledger, destination_ledger, asset, amount, sender,
                   recipient, fee_native, fee_token, status, source_receipt,
                   destination_receipt, last_error, retry_count, submitted_at, updated_at
            FROM transfers
            ORDER BY submitted_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_transfer).collect()
    }

    #[instrument(skip(self))]
    async fn list_requests(&self, limit: i64) -> Result<Vec<DelayedRequest>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, source_ledger, queue_id, requested_asset, source_amount,
                   target_amount, delay_window_secs, status, last_error, requested_at, updated_at
            FROM delayed_requests
            ORDER BY requested_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Store(StoreError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_request).collect()
    }
}
