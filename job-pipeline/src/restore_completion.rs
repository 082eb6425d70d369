use async_trait::async_trait;
use common::{
    error::AppError,
    events::RestoreCompletionEvent,
    storage::types::job::Job,
};
use tracing::{error, info};

use crate::{
    consumer::{Delivery, MessageHandler},
    context::WorkerContext,
};

/// Writes a finished retrieval back to the hot tier and drops the archive.
pub struct RestoreCompletionHandler {
    ctx: WorkerContext,
}

impl RestoreCompletionHandler {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl MessageHandler for RestoreCompletionHandler {
    type Event = RestoreCompletionEvent;

    fn name(&self) -> &'static str {
        "restore-completion"
    }

    #[tracing::instrument(
        skip_all,
        fields(
            job_id = %delivery.event.job_id,
            archive_reference = %delivery.event.archive_reference,
            retrieval_job_id = %delivery.event.retrieval_job_id
        )
    )]
    async fn handle(&self, delivery: Delivery<RestoreCompletionEvent>) -> Result<(), AppError> {
        let event = &delivery.event;
        let job = Job::require(&event.job_id, &self.ctx.db).await?;

        if job.archive_reference.as_deref() != Some(event.archive_reference.as_str()) {
            info!("archive no longer referenced by the job; nothing to restore");
            return Ok(());
        }
        let result_location = job.result_location.ok_or_else(|| {
            AppError::InternalError(format!("archived job {} has no result location", job.id))
        })?;

        let retrieved = self
            .ctx
            .vault
            .retrieval_output(&event.retrieval_job_id)
            .await?;
        let bytes = self.ctx.storage.put_stream(&result_location, retrieved).await?;
        info!(%result_location, bytes, "result restored to hot tier");

        delivery.ack().await?;

        // The message is gone; remaining failures can only be logged.
        if let Err(err) = self.ctx.vault.delete_archive(&event.archive_reference).await {
            error!(error = %err, "restored archive could not be deleted");
        }
        if let Err(err) = self
            .ctx
            .vault
            .delete_retrieval_output(&event.retrieval_job_id)
            .await
        {
            error!(error = %err, "retrieval output could not be deleted");
        }
        if let Err(err) = Job::clear_archive_fields(&self.ctx.db, &event.job_id).await {
            error!(error = %err, "archive fields could not be cleared");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{ConsumerSettings, MessageOutcome, QueueConsumer},
        context::testing::{memory_context, test_config},
    };
    use bytes::Bytes;
    use common::{
        events::RestoreRequest,
        queue::send_event,
        storage::{
            store::ObjectLocation,
            types::job::{RestoreStatus, TransitionFields},
            vault::RetrievalTier,
        },
    };
    use std::sync::Arc;

    async fn archived_job(ctx: &WorkerContext) -> (ObjectLocation, String) {
        let input = ObjectLocation::new("gas-inputs", "gas/u1/j1~a.vcf");
        let result = ObjectLocation::new("gas-results", "gas/u1/j1/a.annot.vcf");
        Job::create(Job::new("j1".into(), "u1".into(), "a.vcf".into(), input), &ctx.db)
            .await
            .expect("create");
        Job::mark_running(&ctx.db, "j1").await.expect("running");
        Job::mark_completed(
            &ctx.db,
            "j1",
            TransitionFields {
                complete_time: Some(chrono::Utc::now()),
                result_location: Some(result.clone()),
                log_location: None,
            },
        )
        .await
        .expect("completed");
        let archive_id = ctx
            .vault
            .upload_archive("j1", Bytes::from_static(b"annotated bytes"))
            .await
            .expect("archive");
        Job::set_archive_reference(&ctx.db, "j1", &archive_id)
            .await
            .expect("reference");
        (result, archive_id)
    }

    fn consumer(ctx: &WorkerContext) -> QueueConsumer<RestoreCompletionHandler> {
        QueueConsumer::new(
            Arc::clone(&ctx.queue),
            ConsumerSettings::from_config(&ctx.config.restore_queue, &ctx.config),
            Arc::new(RestoreCompletionHandler::new(ctx.clone())),
        )
    }

    #[tokio::test]
    async fn test_restored_bytes_return_and_archive_fields_clear() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        let (result, archive_id) = archived_job(&ctx).await;
        ctx.vault
            .initiate_retrieval(
                &RestoreRequest {
                    job_id: "j1".into(),
                    archive_reference: archive_id.clone(),
                },
                RetrievalTier::Standard,
            )
            .await
            .expect("retrieval");
        Job::set_restore_status(&ctx.db, "j1", RestoreStatus::StandardPending)
            .await
            .expect("restore status");

        let outcomes = consumer(&ctx).poll_once().await.expect("poll");
        assert_eq!(outcomes, vec![MessageOutcome::Acknowledged]);

        assert_eq!(
            ctx.storage.get(&result).await.expect("restored").as_ref(),
            b"annotated bytes"
        );
        let job = Job::require("j1", &ctx.db).await.expect("job");
        assert!(job.archive_reference.is_none());
        assert!(job.restore_status.is_none());
        let vault_objects = ctx.storage.list("vault", "").await.expect("list vault");
        assert!(vault_objects.is_empty(), "left in vault: {vault_objects:?}");
        let leftover = ctx
            .queue
            .receive(
                &ctx.config.restore_queue,
                10,
                std::time::Duration::ZERO,
                std::time::Duration::from_secs(30),
            )
            .await
            .expect("receive");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_stale_completion_for_restored_job_is_acknowledged() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        archived_job(&ctx).await;
        Job::clear_archive_fields(&ctx.db, "j1").await.expect("clear");

        send_event(
            ctx.queue.as_ref(),
            &ctx.config.restore_queue,
            &RestoreCompletionEvent {
                archive_reference: "old-archive".into(),
                job_id: "j1".into(),
                retrieval_job_id: "r1".into(),
            },
        )
        .await
        .expect("send");

        let outcomes = consumer(&ctx).poll_once().await.expect("poll");
        assert_eq!(outcomes, vec![MessageOutcome::Acknowledged]);
    }

    #[tokio::test]
    async fn test_missing_retrieval_output_is_retried() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        let (_result, archive_id) = archived_job(&ctx).await;

        send_event(
            ctx.queue.as_ref(),
            &ctx.config.restore_queue,
            &RestoreCompletionEvent {
                archive_reference: archive_id,
                job_id: "j1".into(),
                retrieval_job_id: "never-started".into(),
            },
        )
        .await
        .expect("send");

        let outcomes = consumer(&ctx).poll_once().await.expect("poll");
        assert_eq!(outcomes, vec![MessageOutcome::Retained]);
        assert!(Job::require("j1", &ctx.db)
            .await
            .expect("job")
            .archive_reference
            .is_some());
    }
}
