use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio::time::{sleep, Instant};
use tokio_retry::RetryIf;
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::{
        db::{conflict_retry_strategy, SurrealDbClient},
        types::{queue_message::QueueMessage, StoredObject},
    },
    utils::config::AppConfig,
};

use super::{MessageQueue, ReceiptHandle, ReceivedMessage};

/// Queue backed by the `queue_message` table of the record store.
#[derive(Clone)]
pub struct SurrealQueue {
    db: Arc<SurrealDbClient>,
    poll_interval: Duration,
}

impl SurrealQueue {
    pub fn new(db: Arc<SurrealDbClient>, poll_interval: Duration) -> Self {
        Self { db, poll_interval }
    }

    pub fn from_config(db: Arc<SurrealDbClient>, config: &AppConfig) -> Self {
        Self::new(db, Duration::from_millis(config.queue_poll_interval_ms))
    }

    /// Messages stored for a queue, leased or not.
    pub async fn depth(&self, queue: &str) -> Result<usize, AppError> {
        #[derive(Debug, serde::Deserialize)]
        struct CountResult {
            count: usize,
        }

        let result: Option<CountResult> = self
            .db
            .client
            .query("SELECT count() as count FROM type::table($table) WHERE queue = $queue GROUP ALL")
            .bind(("table", QueueMessage::table_name()))
            .bind(("queue", queue.to_string()))
            .await?
            .take(0)?;

        Ok(result.map(|r| r.count).unwrap_or(0))
    }

    async fn claim(
        &self,
        queue: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>, AppError> {
        let claim_query = format!(
            r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE queue = $queue AND visible_at <= $now
                ORDER BY visible_at ASC
                LIMIT {max_messages}
            )
            SET visible_at = $lease_until,
                receive_count = receive_count + 1,
                lease_token = $lease_token,
                updated_at = $now
            WHERE visible_at <= $now
            RETURN AFTER;
            "#
        );

        let now = chrono::Utc::now();
        let lease_until = now
            + ChronoDuration::from_std(visibility_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(30));
        let lease_token = Uuid::new_v4().to_string();

        let mut result = self
            .db
            .client
            .query(claim_query)
            .bind(("table", QueueMessage::table_name()))
            .bind(("queue", queue.to_string()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("lease_until", SurrealDatetime::from(lease_until)))
            .bind(("lease_token", lease_token))
            .await?;

        let claimed: Vec<QueueMessage> = result.take(0)?;
        Ok(claimed)
    }

    async fn try_delete(&self, queue: &str, receipt: &ReceiptHandle) -> Result<bool, AppError> {
        const DELETE_QUERY: &str = r#"
            DELETE type::thing($table, $id)
            WHERE queue = $queue AND lease_token = $lease_token
            RETURN BEFORE;
        "#;

        let mut result = self
            .db
            .client
            .query(DELETE_QUERY)
            .bind(("table", QueueMessage::table_name()))
            .bind(("id", receipt.message_id.clone()))
            .bind(("queue", queue.to_string()))
            .bind(("lease_token", receipt.lease_token.clone()))
            .await?;

        let deleted: Option<QueueMessage> = result.take(0)?;
        Ok(deleted.is_some())
    }
}

fn into_received(message: QueueMessage) -> ReceivedMessage {
    let receipt = ReceiptHandle {
        message_id: message.id.clone(),
        lease_token: message.lease_token.clone().unwrap_or_default(),
    };

    ReceivedMessage {
        message_id: message.id,
        body: message.body,
        receive_count: message.receive_count,
        sent_at: message.created_at,
        receipt,
    }
}

#[async_trait]
impl MessageQueue for SurrealQueue {
    async fn send(&self, queue: &str, body: String, delay: Duration) -> Result<String, AppError> {
        let message = QueueMessage::new(queue.to_string(), body, delay);
        let message_id = message.id.clone();
        self.db.store_item(message).await?;
        Ok(message_id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, AppError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let claimed = RetryIf::spawn(
                conflict_retry_strategy(),
                || self.claim(queue, max_messages, visibility_timeout),
                AppError::is_retryable_conflict,
            )
            .await?;

            if !claimed.is_empty() {
                return Ok(claimed.into_iter().map(into_received).collect());
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn delete(&self, queue: &str, receipt: &ReceiptHandle) -> Result<bool, AppError> {
        let deleted = RetryIf::spawn(
            conflict_retry_strategy(),
            || self.try_delete(queue, receipt),
            AppError::is_retryable_conflict,
        )
        .await?;

        if !deleted {
            warn!(
                %queue,
                message_id = %receipt.message_id,
                "delete ignored; lease expired or message already removed"
            );
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_queue() -> SurrealQueue {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("indexes");
        SurrealQueue::new(Arc::new(db), Duration::from_millis(20))
    }

    const LONG_LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_send_receive_delete() {
        let queue = memory_queue().await;
        let id = queue
            .send("requests", "hello".into(), Duration::ZERO)
            .await
            .expect("send");

        let received = queue
            .receive("requests", 10, Duration::ZERO, LONG_LEASE)
            .await
            .expect("receive");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, id);
        assert_eq!(received[0].body, "hello");
        assert_eq!(received[0].receive_count, 1);

        let deleted = queue
            .delete("requests", &received[0].receipt)
            .await
            .expect("delete");
        assert!(deleted);
        assert_eq!(queue.depth("requests").await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn test_leased_message_is_hidden_from_other_receivers() {
        let queue = memory_queue().await;
        queue
            .send("requests", "only-once".into(), Duration::ZERO)
            .await
            .expect("send");

        let first = queue
            .receive("requests", 10, Duration::ZERO, LONG_LEASE)
            .await
            .expect("first receive");
        let second = queue
            .receive("requests", 10, Duration::from_millis(60), LONG_LEASE)
            .await
            .expect("second receive");

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(queue.depth("requests").await.expect("depth"), 1);
    }

    #[tokio::test]
    async fn test_unacknowledged_message_is_redelivered_after_lease_expiry() {
        let queue = memory_queue().await;
        queue
            .send("requests", "retry-me".into(), Duration::ZERO)
            .await
            .expect("send");

        let first = queue
            .receive("requests", 1, Duration::ZERO, Duration::from_millis(100))
            .await
            .expect("first receive");
        assert_eq!(first.len(), 1);

        let again = queue
            .receive("requests", 1, Duration::from_secs(2), LONG_LEASE)
            .await
            .expect("redelivery");
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, first[0].message_id);
        assert_eq!(again[0].receive_count, 2);
        assert_ne!(again[0].receipt, first[0].receipt);

        // The first receipt lost its lease and can no longer acknowledge.
        let stale = queue
            .delete("requests", &first[0].receipt)
            .await
            .expect("stale delete");
        assert!(!stale);
        assert_eq!(queue.depth("requests").await.expect("depth"), 1);

        assert!(queue
            .delete("requests", &again[0].receipt)
            .await
            .expect("delete"));
    }

    #[tokio::test]
    async fn test_delayed_message_is_invisible_until_due() {
        let queue = memory_queue().await;
        queue
            .send("restores", "later".into(), Duration::from_millis(200))
            .await
            .expect("send");

        let early = queue
            .receive("restores", 1, Duration::ZERO, LONG_LEASE)
            .await
            .expect("early receive");
        assert!(early.is_empty());

        let due = queue
            .receive("restores", 1, Duration::from_secs(2), LONG_LEASE)
            .await
            .expect("due receive");
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_respects_batch_size_and_queue_isolation() {
        let queue = memory_queue().await;
        for n in 0..3 {
            queue
                .send("a", format!("a-{n}"), Duration::ZERO)
                .await
                .expect("send a");
        }
        queue
            .send("b", "b-0".into(), Duration::ZERO)
            .await
            .expect("send b");

        let batch = queue
            .receive("a", 2, Duration::ZERO, LONG_LEASE)
            .await
            .expect("receive a");
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|m| m.body.starts_with("a-")));

        let other = queue
            .receive("b", 10, Duration::ZERO, LONG_LEASE)
            .await
            .expect("receive b");
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].body, "b-0");
    }

    #[tokio::test]
    async fn test_empty_long_poll_returns_after_wait() {
        let queue = memory_queue().await;
        let started = Instant::now();

        let received = queue
            .receive("empty", 10, Duration::from_millis(100), LONG_LEASE)
            .await
            .expect("receive");

        assert!(received.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
