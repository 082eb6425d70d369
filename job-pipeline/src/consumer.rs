//! Long-poll loop shared by every worker role.
//!
//! A message is deleted only after its handler returns `Ok`. Handler errors
//! leave the message leased; it becomes visible again once the lease expires.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    events::{self, QueueEvent},
    queue::{dead_letter_queue_name, MessageQueue, ReceiptHandle, ReceivedMessage},
    utils::config::AppConfig,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const IDLE_BACKOFF: Duration = Duration::from_millis(200);

/// Role-specific processing of one decoded event.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    type Event: QueueEvent;

    fn name(&self) -> &'static str;

    async fn handle(&self, delivery: Delivery<Self::Event>) -> Result<(), AppError>;
}

/// Acknowledges one received message. Shared with the consumer so it can
/// tell whether the handler already acknowledged.
#[derive(Clone)]
pub struct Acker {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    receipt: ReceiptHandle,
    acked: Arc<AtomicBool>,
}

impl Acker {
    fn new(queue: Arc<dyn MessageQueue>, queue_name: &str, receipt: ReceiptHandle) -> Self {
        Self {
            queue,
            queue_name: queue_name.to_string(),
            receipt,
            acked: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delete the message now. Fails when the lease was already lost.
    pub async fn ack(&self) -> Result<(), AppError> {
        if self.is_acked() {
            return Ok(());
        }
        if self.queue.delete(&self.queue_name, &self.receipt).await? {
            self.acked.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(AppError::Conflict(format!(
                "lease on message {} in {} was lost",
                self.receipt.message_id, self.queue_name
            )))
        }
    }

    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

pub struct Delivery<E> {
    pub event: E,
    pub message_id: String,
    pub receive_count: u32,
    acker: Acker,
}

impl<E> Delivery<E> {
    pub fn new(event: E, message_id: String, receive_count: u32, acker: Acker) -> Self {
        Self {
            event,
            message_id,
            receive_count,
            acker,
        }
    }

    /// Acknowledge before the handler returns. The consumer will not delete again.
    pub async fn ack(&self) -> Result<(), AppError> {
        self.acker.ack().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub queue: String,
    pub max_messages: usize,
    pub wait: Duration,
    pub visibility_timeout: Duration,
    pub max_receive_count: Option<u32>,
}

impl ConsumerSettings {
    pub fn from_config(queue: &str, config: &AppConfig) -> Self {
        Self {
            queue: queue.to_string(),
            max_messages: config.queue_max_messages,
            wait: Duration::from_secs(config.queue_wait_time_secs),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_receive_count: config.max_receive_count,
        }
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acknowledged,
    /// Handler failed or the acknowledgement was lost; the message will come back.
    Retained,
    DeadLettered,
    /// Undecodable payload, deleted without handling.
    Discarded,
}

pub struct QueueConsumer<H: MessageHandler> {
    queue: Arc<dyn MessageQueue>,
    settings: ConsumerSettings,
    handler: Arc<H>,
}

impl<H: MessageHandler> QueueConsumer<H> {
    pub fn new(queue: Arc<dyn MessageQueue>, settings: ConsumerSettings, handler: Arc<H>) -> Self {
        Self {
            queue,
            settings,
            handler,
        }
    }

    /// Receive one batch and process every message in it.
    pub async fn poll_once(&self) -> Result<Vec<MessageOutcome>, AppError> {
        let batch = self.receive_batch().await?;
        Ok(self.process_batch(batch).await)
    }

    /// Poll until the token is cancelled. Cancellation is observed between batches.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            handler = self.handler.name(),
            queue = %self.settings.queue,
            "consumer started"
        );

        while !shutdown.is_cancelled() {
            let batch = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.receive_batch() => received,
            };

            match batch {
                // Without a long poll an empty queue would be polled in a tight loop.
                Ok(batch) if batch.is_empty() && self.settings.wait.is_zero() => {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(IDLE_BACKOFF) => {}
                    }
                }
                Ok(batch) => {
                    self.process_batch(batch).await;
                }
                Err(err) => {
                    error!(
                        handler = self.handler.name(),
                        queue = %self.settings.queue,
                        error = %err,
                        "receive failed"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = sleep(RECEIVE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(
            handler = self.handler.name(),
            queue = %self.settings.queue,
            "consumer stopped"
        );
    }

    async fn receive_batch(&self) -> Result<Vec<ReceivedMessage>, AppError> {
        self.queue
            .receive(
                &self.settings.queue,
                self.settings.max_messages,
                self.settings.wait,
                self.settings.visibility_timeout,
            )
            .await
    }

    async fn process_batch(&self, batch: Vec<ReceivedMessage>) -> Vec<MessageOutcome> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for message in batch {
            outcomes.push(self.process_message(message).await);
        }
        outcomes
    }

    #[tracing::instrument(
        skip_all,
        fields(
            handler = self.handler.name(),
            queue = %self.settings.queue,
            message_id = %message.message_id,
            receive_count = message.receive_count
        )
    )]
    async fn process_message(&self, message: ReceivedMessage) -> MessageOutcome {
        if let Some(limit) = self.settings.max_receive_count {
            if message.receive_count > limit {
                return self.dead_letter(&message).await;
            }
        }

        let event = match events::decode::<H::Event>(&message.body) {
            Ok(event) => event,
            Err(err) => return self.discard(&message.receipt, &err).await,
        };

        let acker = Acker::new(
            Arc::clone(&self.queue),
            &self.settings.queue,
            message.receipt.clone(),
        );
        let delivery = Delivery::new(
            event,
            message.message_id.clone(),
            message.receive_count,
            acker.clone(),
        );

        match self.handler.handle(delivery).await {
            Ok(()) if acker.is_acked() => MessageOutcome::Acknowledged,
            Ok(()) => match acker.ack().await {
                Ok(()) => {
                    debug!("message acknowledged");
                    MessageOutcome::Acknowledged
                }
                Err(err) => {
                    warn!(error = %err, "handled message could not be acknowledged");
                    MessageOutcome::Retained
                }
            },
            Err(err @ AppError::MalformedMessage(_)) => self.discard(&message.receipt, &err).await,
            Err(err) => {
                warn!(error = %err, "handler failed; message left for redelivery");
                MessageOutcome::Retained
            }
        }
    }

    async fn discard(&self, receipt: &ReceiptHandle, err: &AppError) -> MessageOutcome {
        error!(error = %err, "discarding malformed message");
        match self.queue.delete(&self.settings.queue, receipt).await {
            Ok(_) => MessageOutcome::Discarded,
            Err(delete_err) => {
                warn!(error = %delete_err, "failed to delete malformed message");
                MessageOutcome::Retained
            }
        }
    }

    async fn dead_letter(&self, message: &ReceivedMessage) -> MessageOutcome {
        let dead_letter_queue = dead_letter_queue_name(&self.settings.queue);
        if let Err(err) = self
            .queue
            .send(&dead_letter_queue, message.body.clone(), Duration::ZERO)
            .await
        {
            error!(error = %err, %dead_letter_queue, "failed to dead-letter message");
            return MessageOutcome::Retained;
        }

        warn!(%dead_letter_queue, "receive limit exceeded; message moved to dead letter queue");
        match self.queue.delete(&self.settings.queue, &message.receipt).await {
            Ok(_) => MessageOutcome::DeadLettered,
            Err(err) => {
                warn!(error = %err, "dead-lettered message could not be deleted");
                MessageOutcome::Retained
            }
        }
    }
}
