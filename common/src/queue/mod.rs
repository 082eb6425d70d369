//! At-least-once message queue with visibility-timeout leases.
//!
//! A received message stays invisible to other receivers until its lease
//! expires. Deleting it with the receipt from that receive is the only
//! acknowledgement; a message that is never deleted is delivered again.

mod surreal;

pub use surreal::SurrealQueue;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    error::AppError,
    events::{self, QueueEvent},
};

/// Proof of one particular receive of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    pub message_id: String,
    pub lease_token: String,
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.message_id, self.lease_token)
    }
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    /// Number of times this message has been handed out, this receive included.
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
    pub receipt: ReceiptHandle,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a body, invisible to receivers until `delay` has passed. Returns the message id.
    async fn send(&self, queue: &str, body: String, delay: Duration) -> Result<String, AppError>;

    /// Long-poll for up to `max_messages`, waiting at most `wait` for the first one,
    /// and lease what is returned for `visibility_timeout`.
    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, AppError>;

    /// Acknowledge a message. Returns `false` when the receipt no longer owns the
    /// lease (it expired and the message went to someone else) or the message is gone.
    async fn delete(&self, queue: &str, receipt: &ReceiptHandle) -> Result<bool, AppError>;
}

pub async fn send_event<E: QueueEvent>(
    queue: &dyn MessageQueue,
    queue_name: &str,
    event: &E,
) -> Result<String, AppError> {
    send_event_delayed(queue, queue_name, event, Duration::ZERO).await
}

pub async fn send_event_delayed<E: QueueEvent>(
    queue: &dyn MessageQueue,
    queue_name: &str,
    event: &E,
    delay: Duration,
) -> Result<String, AppError> {
    let body = events::encode(event)?;
    let message_id = queue.send(queue_name, body, delay).await?;
    debug!(queue = %queue_name, %message_id, kind = E::KIND, "event sent");
    Ok(message_id)
}

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}-dead-letter")
}

/// Fan-out point: publishing delivers one copy to every subscribed queue.
#[derive(Debug, Clone)]
pub struct Topic {
    name: String,
    subscribers: Vec<String>,
}

impl Topic {
    pub fn new(name: impl Into<String>, subscribers: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subscribers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribers(&self) -> &[String] {
        &self.subscribers
    }

    /// Stops at the first failed send; a retried publish may duplicate earlier copies.
    pub async fn publish<E: QueueEvent>(
        &self,
        queue: &dyn MessageQueue,
        event: &E,
    ) -> Result<(), AppError> {
        let body = events::encode(event)?;
        for subscriber in &self.subscribers {
            queue.send(subscriber, body.clone(), Duration::ZERO).await?;
        }
        debug!(
            topic = %self.name,
            subscribers = self.subscribers.len(),
            kind = E::KIND,
            "event published"
        );
        Ok(())
    }
}
