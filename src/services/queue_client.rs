//! Queue client: at-least-once delivery of [`FileNotification`]s.
//!
//! The SQLite implementation keeps one row per in-flight message. A receive
//! hides the message for the visibility timeout and hands out a fresh
//! receipt handle; only that handle can acknowledge (delete) it. A consumer
//! that crashes simply lets the timeout lapse and the message reappears.

use super::transport::{Retryable, TransportPolicy};
use crate::{
    db,
    models::notification::{FileNotification, ReceivedMessage},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue name `{0}` is invalid")]
    InvalidQueueName(String),
    #[error("queue `{0}` could neither be found nor created")]
    Unresolved(String),
    #[error("message could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl Retryable for QueueError {
    fn is_transient(&self) -> bool {
        match self {
            QueueError::Timeout { .. } => true,
            QueueError::Sqlx(err) => db::is_transient(err),
            _ => false,
        }
    }

    fn timed_out(operation: &'static str, after: Duration) -> Self {
        QueueError::Timeout { operation, after }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Enqueue `message`, returning the assigned message id.
    async fn send(&self, message: &FileNotification) -> QueueResult<String>;

    /// Take at most one visible message.
    async fn receive(&self) -> QueueResult<Option<ReceivedMessage>>;

    /// Delete the delivery identified by `receipt_handle`. Returns false for
    /// an unknown or superseded handle.
    async fn acknowledge(&self, receipt_handle: &str) -> QueueResult<bool>;

    /// Messages currently stored, visible or not.
    async fn depth(&self) -> QueueResult<i64>;
}

#[derive(Clone, Copy, Debug)]
pub struct QueueSettings {
    /// How long a received message stays hidden from other receivers.
    pub visibility_timeout: Duration,

    /// How long a sent message waits before its first delivery.
    pub delivery_delay: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            delivery_delay: Duration::from_secs(3),
        }
    }
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queues (
    name TEXT PRIMARY KEY NOT NULL,
    queue_url TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS queue_messages (
    id TEXT PRIMARY KEY NOT NULL,
    seq INTEGER NOT NULL,
    queue_name TEXT NOT NULL REFERENCES queues (name),
    body TEXT NOT NULL,
    visible_at INTEGER NOT NULL,
    receipt_handle TEXT,
    receive_count INTEGER NOT NULL DEFAULT 0,
    sent_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_queue_messages_visible ON queue_messages (queue_name, visible_at, seq);
CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_messages_receipt ON queue_messages (receipt_handle)
"#;

/// [`NotificationQueue`] over a dedicated SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteQueue {
    db: SqlitePool,
    queue_name: String,
    queue_url: String,
    settings: QueueSettings,
    policy: TransportPolicy,
}

impl SqliteQueue {
    /// Resolve `queue_name`, creating it when absent.
    ///
    /// Fails when the queue can neither be looked up nor created, so a
    /// running client always points at an existing queue.
    pub async fn connect(
        db: SqlitePool,
        queue_name: &str,
        settings: QueueSettings,
        policy: TransportPolicy,
    ) -> QueueResult<Self> {
        ensure_queue_name_valid(queue_name)?;
        db::apply_schema(&db, QUEUE_SCHEMA).await?;

        let queue_url = match resolve_queue_url(&db, queue_name).await {
            Ok(Some(url)) => {
                info!(queue_name, url = %url, "queue.url_resolved");
                url
            }
            Ok(None) => {
                warn!(queue_name, "queue.missing_creating");
                create_queue(&db, queue_name).await.map_err(|err| {
                    error!(queue_name, "queue.create_failed: {}", err);
                    QueueError::Unresolved(queue_name.to_string())
                })?
            }
            Err(err) => {
                error!(queue_name, "queue.get_url_failed: {}", err);
                return Err(QueueError::Unresolved(queue_name.to_string()));
            }
        };

        Ok(Self {
            db,
            queue_name: queue_name.to_string(),
            queue_url,
            settings,
            policy,
        })
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Idempotent per `id`, so a retry after a timed-out but applied insert
    /// does not fail the send.
    async fn insert_message(&self, id: &str, body: &str) -> QueueResult<()> {
        let now = Utc::now();
        let visible_at = now.timestamp_millis() + millis(self.settings.delivery_delay);
        sqlx::query(
            "INSERT INTO queue_messages (id, seq, queue_name, body, visible_at, receive_count, sent_at)
             VALUES (?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_messages), ?, ?, ?, 0, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(id)
        .bind(&self.queue_name)
        .bind(body)
        .bind(visible_at)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Claim the oldest visible message in one statement, so two receivers
    /// can never be handed the same delivery.
    async fn claim_next(&self) -> QueueResult<Option<(String, String, String, i64)>> {
        let now = Utc::now().timestamp_millis();
        let receipt = Uuid::new_v4().to_string();
        let row = sqlx::query(
            "UPDATE queue_messages
             SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
             WHERE id = (
                 SELECT id FROM queue_messages
                 WHERE queue_name = ? AND visible_at <= ?
                 ORDER BY seq ASC LIMIT 1
             )
             RETURNING id, body, receive_count",
        )
        .bind(&receipt)
        .bind(now + millis(self.settings.visibility_timeout))
        .bind(&self.queue_name)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| {
            (
                row.get::<String, _>("id"),
                row.get::<String, _>("body"),
                receipt,
                row.get::<i64, _>("receive_count"),
            )
        }))
    }

    async fn delete_by_receipt(&self, receipt_handle: &str) -> QueueResult<u64> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE queue_name = ? AND receipt_handle = ?")
                .bind(&self.queue_name)
                .bind(receipt_handle)
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl NotificationQueue for SqliteQueue {
    async fn send(&self, message: &FileNotification) -> QueueResult<String> {
        let body = message.to_canonical_json()?;
        let id = Uuid::new_v4().to_string();

        match self
            .policy
            .run("queue.send", || self.insert_message(&id, &body))
            .await
        {
            Ok(()) => {
                info!(queue_url = %self.queue_url, message_id = %id, "queue.send_ok");
                Ok(id)
            }
            Err(err) => {
                error!(queue_url = %self.queue_url, "queue.send_failed: {}", err);
                Err(err)
            }
        }
    }

    async fn receive(&self) -> QueueResult<Option<ReceivedMessage>> {
        let claimed = self
            .policy
            .run("queue.receive", || self.claim_next())
            .await
            .inspect_err(|err| error!(queue_url = %self.queue_url, "queue.receive_failed: {}", err))?;

        let Some((message_id, body, receipt_handle, receive_count)) = claimed else {
            debug!(queue_url = %self.queue_url, "queue.receive_empty");
            return Ok(None);
        };

        let payload = match serde_json::from_str::<FileNotification>(&body) {
            Ok(payload) => {
                info!(queue_url = %self.queue_url, message_id = %message_id, "queue.receive_ok");
                Some(payload)
            }
            Err(err) => {
                let preview: String = body.chars().take(200).collect();
                error!(
                    queue_url = %self.queue_url,
                    message_id = %message_id,
                    body_preview = %preview,
                    "queue.receive_json_decode_failed: {}",
                    err
                );
                None
            }
        };

        Ok(Some(ReceivedMessage {
            message_id,
            receipt_handle,
            payload,
            receive_count,
        }))
    }

    async fn acknowledge(&self, receipt_handle: &str) -> QueueResult<bool> {
        let deleted = self
            .policy
            .run("queue.delete", || self.delete_by_receipt(receipt_handle))
            .await
            .inspect_err(|err| error!(queue_url = %self.queue_url, "queue.delete_failed: {}", err))?;

        if deleted == 1 {
            info!(queue_url = %self.queue_url, "queue.delete_ok");
            Ok(true)
        } else {
            warn!(queue_url = %self.queue_url, "queue.delete_unknown_receipt");
            Ok(false)
        }
    }

    async fn depth(&self) -> QueueResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?",
        )
        .bind(&self.queue_name)
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }
}

async fn resolve_queue_url(db: &SqlitePool, queue_name: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT queue_url FROM queues WHERE name = ?")
        .bind(queue_name)
        .fetch_optional(db)
        .await
}

async fn create_queue(db: &SqlitePool, queue_name: &str) -> Result<String, sqlx::Error> {
    let url = format!("sqlite-queue://{}", queue_name);
    sqlx::query("INSERT INTO queues (name, queue_url, created_at) VALUES (?, ?, ?)")
        .bind(queue_name)
        .bind(&url)
        .bind(Utc::now())
        .execute(db)
        .await?;
    info!(queue_name, url = %url, "queue.created");
    Ok(url)
}

/// Queue names: 1–80 characters of ASCII letters, digits, `-` and `_`.
fn ensure_queue_name_valid(name: &str) -> QueueResult<()> {
    let valid = (1..=80).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidQueueName(name.to_string()))
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file_record::FileCategory;

    fn notification(key: &str) -> FileNotification {
        FileNotification {
            store_key: key.to_string(),
            owner_id: 9,
            category: FileCategory::Invoice,
            original_filename: "bill.pdf".into(),
            size_bytes: 10,
            uploaded_at: Utc::now(),
            content_hash: Some("abc".into()),
            mime_type: Some("application/pdf".into()),
        }
    }

    async fn queue(visibility: Duration) -> SqliteQueue {
        let settings = QueueSettings {
            visibility_timeout: visibility,
            delivery_delay: Duration::ZERO,
        };
        SqliteQueue::connect(
            db::memory_pool().await,
            "file-processing",
            settings,
            TransportPolicy::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn repeated_insert_of_one_message_is_absorbed() {
        let queue = queue(Duration::from_secs(30)).await;
        let body = notification("k1").to_canonical_json().unwrap();

        queue.insert_message("m-1", &body).await.unwrap();
        // a retry of an insert that already landed
        queue.insert_message("m-1", &body).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 1);
        let received = queue.receive().await.unwrap().unwrap();
        assert_eq!(received.message_id, "m-1");
    }

    #[tokio::test]
    async fn send_receive_acknowledge() {
        let queue = queue(Duration::from_secs(30)).await;
        let id = queue.send(&notification("k1")).await.unwrap();

        let received = queue.receive().await.unwrap().unwrap();
        assert_eq!(received.message_id, id);
        assert_eq!(received.receive_count, 1);
        assert_eq!(received.payload.unwrap().store_key, "k1");

        // hidden while in flight
        assert!(queue.receive().await.unwrap().is_none());

        assert!(queue.acknowledge(&received.receipt_handle).await.unwrap());
        assert!(!queue.acknowledge(&received.receipt_handle).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unacknowledged_message_reappears_after_visibility_timeout() {
        let queue = queue(Duration::from_millis(50)).await;
        queue.send(&notification("k2")).await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = queue.receive().await.unwrap().unwrap();

        assert_eq!(first.message_id, second.message_id);
        assert_ne!(first.receipt_handle, second.receipt_handle);
        assert_eq!(second.receive_count, 2);
        // the superseded handle no longer acknowledges
        assert!(!queue.acknowledge(&first.receipt_handle).await.unwrap());
        assert!(queue.acknowledge(&second.receipt_handle).await.unwrap());
    }

    #[tokio::test]
    async fn poison_message_is_returned_without_payload() {
        let queue = queue(Duration::from_secs(30)).await;
        queue.insert_message("poison", "{not json").await.unwrap();

        let received = queue.receive().await.unwrap().unwrap();
        assert!(received.payload.is_none());
        assert!(queue.acknowledge(&received.receipt_handle).await.unwrap());
    }

    #[tokio::test]
    async fn delivery_delay_hides_new_messages() {
        let settings = QueueSettings {
            visibility_timeout: Duration::from_secs(30),
            delivery_delay: Duration::from_secs(60),
        };
        let queue = SqliteQueue::connect(
            db::memory_pool().await,
            "delayed",
            settings,
            TransportPolicy::default(),
        )
        .await
        .unwrap();

        queue.send(&notification("k3")).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn existing_queue_is_reused() {
        let pool = db::memory_pool().await;
        let a = SqliteQueue::connect(pool.clone(), "jobs", QueueSettings::default(), TransportPolicy::default())
            .await
            .unwrap();
        let b = SqliteQueue::connect(pool, "jobs", QueueSettings::default(), TransportPolicy::default())
            .await
            .unwrap();
        assert_eq!(a.queue_url(), b.queue_url());
    }

    #[tokio::test]
    async fn invalid_name_fails_construction() {
        let err = SqliteQueue::connect(
            db::memory_pool().await,
            "bad name!",
            QueueSettings::default(),
            TransportPolicy::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueueName(_)));
    }
}
