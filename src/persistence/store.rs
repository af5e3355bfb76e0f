//! The persistence interface (§6) and its SQLite implementation, following
//! the teacher's `storage/repository/sqlite.rs` pattern: a pool, hand-written
//! query/bind/fetch methods, no ORM macros.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::migrations;
use super::models::{
    MessageKind, OrderMessage, OrderStatus, OrderStoreStats, ServerMessage, ServerMessageStatus,
};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("row not found")]
    NotFound,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Required operations on the two tables from §6.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn save_server_message(&self, msg: &ServerMessage) -> Result<i64>;
    async fn update_server_message(&self, msg: &ServerMessage) -> Result<()>;
    async fn find_server_messages_by_status(
        &self,
        status: ServerMessageStatus,
        limit: u32,
    ) -> Result<Vec<ServerMessage>>;
    async fn find_recent_by_instrument(
        &self,
        instrument: &str,
        limit: u32,
    ) -> Result<Vec<ServerMessage>>;

    async fn save_order(&self, order: &OrderMessage) -> Result<i64>;
    async fn update_order(&self, order: &OrderMessage) -> Result<()>;
    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<OrderMessage>>;
    async fn find_pending_by_instrument(&self, instrument: &str) -> Result<Vec<OrderMessage>>;
    /// Atomic CAS from `PENDING` to `PROCESSING`; returns `false` if another
    /// worker already claimed it or it is no longer `PENDING` (§4.8 invariant
    /// 6: no order skips `PROCESSING` on its way to `SUCCESS`).
    async fn mark_processing(&self, id: i64) -> Result<bool>;
    async fn order_stats(&self) -> Result<OrderStoreStats>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    /// A single-connection in-memory database for tests: SQLite's
    /// `:memory:` database is per-connection, so the pool is capped at one
    /// connection to keep every query against the same database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_server_message(row: &sqlx::sqlite::SqliteRow) -> Result<ServerMessage> {
        let message_type: String = row.try_get("message_type")?;
        let status: String = row.try_get("status")?;
        let message_id: String = row.try_get("message_id")?;
        Ok(ServerMessage {
            id: row.try_get("id")?,
            message_id: Uuid::parse_str(&message_id).unwrap_or_else(|_| Uuid::nil()),
            instrument: row.try_get("instrument")?,
            raw_text: row.try_get("raw_text")?,
            message_type: MessageKind::from_str(&message_type).unwrap_or(MessageKind::Unknown),
            status: ServerMessageStatus::from_str(&status).unwrap_or(ServerMessageStatus::Error),
            received_at: parse_dt(row.try_get("received_at")?),
            processed_at: row.try_get::<Option<String>, _>("processed_at")?.map(parse_dt),
            published_at: row.try_get::<Option<String>, _>("published_at")?.map(parse_dt),
            error: row.try_get("error")?,
            remote_addr: row.try_get("remote_addr")?,
            result_count: row.try_get("result_count")?,
            order_count: row.try_get("order_count")?,
        })
    }

    fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> Result<OrderMessage> {
        let status: String = row.try_get("status")?;
        let message_id: String = row.try_get("message_id")?;
        let content: String = row.try_get("content")?;
        Ok(OrderMessage {
            id: row.try_get("id")?,
            message_id: Uuid::parse_str(&message_id).unwrap_or_else(|_| Uuid::nil()),
            instrument: row.try_get("instrument")?,
            content: serde_json::from_str(&content)?,
            status: OrderStatus::from_str(&status).unwrap_or(OrderStatus::Failed),
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            created_at: parse_dt(row.try_get("created_at")?),
            updated_at: parse_dt(row.try_get("updated_at")?),
            last_retry_at: row.try_get::<Option<String>, _>("last_retry_at")?.map(parse_dt),
            next_retry_at: row.try_get::<Option<String>, _>("next_retry_at")?.map(parse_dt),
            error: row.try_get("error")?,
        })
    }
}

fn parse_dt(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn save_server_message(&self, msg: &ServerMessage) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO astm_server_messages
                (message_id, instrument, raw_text, message_type, status, received_at, processed_at, published_at, error, remote_addr, result_count, order_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(msg.message_id.to_string())
        .bind(&msg.instrument)
        .bind(&msg.raw_text)
        .bind(msg.message_type.as_str())
        .bind(msg.status.as_str())
        .bind(msg.received_at.to_rfc3339())
        .bind(msg.processed_at.map(|d| d.to_rfc3339()))
        .bind(msg.published_at.map(|d| d.to_rfc3339()))
        .bind(&msg.error)
        .bind(&msg.remote_addr)
        .bind(msg.result_count)
        .bind(msg.order_count)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_server_message(&self, msg: &ServerMessage) -> Result<()> {
        sqlx::query(
            "UPDATE astm_server_messages SET
                status = ?, processed_at = ?, published_at = ?, error = ?, message_type = ?, result_count = ?, order_count = ?
             WHERE id = ?",
        )
        .bind(msg.status.as_str())
        .bind(msg.processed_at.map(|d| d.to_rfc3339()))
        .bind(msg.published_at.map(|d| d.to_rfc3339()))
        .bind(&msg.error)
        .bind(msg.message_type.as_str())
        .bind(msg.result_count)
        .bind(msg.order_count)
        .bind(msg.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_server_messages_by_status(
        &self,
        status: ServerMessageStatus,
        limit: u32,
    ) -> Result<Vec<ServerMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM astm_server_messages WHERE status = ? ORDER BY received_at ASC LIMIT ?",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_server_message).collect()
    }

    async fn find_recent_by_instrument(
        &self,
        instrument: &str,
        limit: u32,
    ) -> Result<Vec<ServerMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM astm_server_messages WHERE instrument = ? ORDER BY received_at DESC LIMIT ?",
        )
        .bind(instrument)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_server_message).collect()
    }

    async fn save_order(&self, order: &OrderMessage) -> Result<i64> {
        let content = serde_json::to_string(&order.content)?;
        let result = sqlx::query(
            "INSERT INTO astm_order_messages
                (message_id, instrument, content, status, retry_count, max_retries, created_at, updated_at, last_retry_at, next_retry_at, error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(order.message_id.to_string())
        .bind(&order.instrument)
        .bind(content)
        .bind(order.status.as_str())
        .bind(order.retry_count as i64)
        .bind(order.max_retries as i64)
        .bind(order.created_at.to_rfc3339())
        .bind(order.updated_at.to_rfc3339())
        .bind(order.last_retry_at.map(|d| d.to_rfc3339()))
        .bind(order.next_retry_at.map(|d| d.to_rfc3339()))
        .bind(&order.error)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn update_order(&self, order: &OrderMessage) -> Result<()> {
        sqlx::query(
            "UPDATE astm_order_messages SET
                status = ?, retry_count = ?, updated_at = ?, last_retry_at = ?, next_retry_at = ?, error = ?
             WHERE id = ?",
        )
        .bind(order.status.as_str())
        .bind(order.retry_count as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(order.last_retry_at.map(|d| d.to_rfc3339()))
        .bind(order.next_retry_at.map(|d| d.to_rfc3339()))
        .bind(&order.error)
        .bind(order.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_ready_for_retry(&self, limit: u32) -> Result<Vec<OrderMessage>> {
        let now = Utc::now().to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM astm_order_messages
             WHERE status = 'PENDING' AND retry_count < max_retries
               AND (next_retry_at IS NULL OR next_retry_at <= ?)
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    async fn find_pending_by_instrument(&self, instrument: &str) -> Result<Vec<OrderMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM astm_order_messages WHERE instrument = ? AND status = 'PENDING' ORDER BY created_at ASC",
        )
        .bind(instrument)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_order).collect()
    }

    async fn mark_processing(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE astm_order_messages SET status = 'PROCESSING', updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn order_stats(&self) -> Result<OrderStoreStats> {
        let row = sqlx::query(
            "SELECT
                SUM(CASE WHEN status = 'PENDING' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'PROCESSING' THEN 1 ELSE 0 END) AS processing,
                SUM(CASE WHEN status = 'SUCCESS' THEN 1 ELSE 0 END) AS success,
                SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END) AS failed
             FROM astm_order_messages",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(OrderStoreStats {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0) as u64,
            processing: row.try_get::<Option<i64>, _>("processing")?.unwrap_or(0) as u64,
            success: row.try_get::<Option<i64>, _>("success")?.unwrap_or(0) as u64,
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_and_fetch_server_message_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let msg = ServerMessage::new_received("INST1", "H|\\^&\r".to_string(), Some("127.0.0.1:1234".into()));
        let id = store.save_server_message(&msg).await.unwrap();
        assert!(id > 0);
        let found = store
            .find_server_messages_by_status(ServerMessageStatus::Received, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].instrument, "INST1");
    }

    #[tokio::test]
    async fn mark_processing_is_a_one_shot_cas() {
        let store = SqliteStore::in_memory().await.unwrap();
        let order = OrderMessage::new_pending("INST1", json!({"order": 1}), 5);
        let id = store.save_order(&order).await.unwrap();

        assert!(store.mark_processing(id).await.unwrap());
        assert!(!store.mark_processing(id).await.unwrap());
    }

    /// Exercises the real `connect()` path (migrations + pooled connections)
    /// against an on-disk database file instead of `sqlite::memory:`, the
    /// way a restart-durability check would (§9 "Durable retry": "no order
    /// is lost across restarts").
    #[tokio::test]
    async fn on_disk_database_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("gateway.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());

        {
            let store = SqliteStore::connect(&url).await.unwrap();
            let order = OrderMessage::new_pending("INST1", json!({"order": 1}), 5);
            store.save_order(&order).await.unwrap();
        }

        let reopened = SqliteStore::connect(&url).await.unwrap();
        let pending = reopened.find_pending_by_instrument("INST1").await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn order_stats_counts_by_status() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut order = OrderMessage::new_pending("INST1", json!({}), 5);
        store.save_order(&order).await.unwrap();
        order.status = OrderStatus::Failed;
        let id2 = store
            .save_order(&OrderMessage::new_pending("INST1", json!({}), 5))
            .await
            .unwrap();
        let mut second = order.clone();
        second.id = id2;
        store.update_order(&second).await.unwrap();

        let stats = store.order_stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
    }
}
