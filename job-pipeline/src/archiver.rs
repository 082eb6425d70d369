use async_trait::async_trait;
use common::{
    error::AppError,
    events::CompletionEvent,
    storage::types::{
        job::{Job, JobStatus},
        user_profile::UserProfile,
    },
};
use tracing::{error, info};

use crate::{
    consumer::{Delivery, MessageHandler},
    context::WorkerContext,
};

/// Moves results of archive-eligible users from the hot tier to the vault.
pub struct Archiver {
    ctx: WorkerContext,
}

impl Archiver {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Copy, delete the hot copy, record the reference. Returns the archive id,
    /// or `None` when the job needs no archiving.
    ///
    /// Archives are keyed by job id, so a redelivery that finds the hot copy
    /// gone but the archive present only has the reference left to record.
    pub async fn archive_job(&self, job_id: &str) -> Result<Option<String>, AppError> {
        let job = Job::require(job_id, &self.ctx.db).await?;
        if let Some(existing) = &job.archive_reference {
            info!(archive_reference = %existing, "result already archived");
            return Ok(None);
        }
        if job.status != JobStatus::Completed {
            return Err(AppError::PreconditionFailed {
                job_id: job.id,
                expected: JobStatus::Completed,
                actual: job.status,
            });
        }
        let result_location = job.result_location.ok_or_else(|| {
            AppError::InternalError(format!("completed job {job_id} has no result location"))
        })?;

        let data = match self.ctx.storage.get(&result_location).await {
            Ok(data) => data,
            Err(object_store::Error::NotFound { .. }) => {
                if self.ctx.vault.archive_exists(job_id).await? {
                    Job::set_archive_reference(&self.ctx.db, job_id, job_id).await?;
                    info!(archive_id = %job_id, "recorded reference for earlier archive");
                    return Ok(Some(job_id.to_string()));
                }
                error!(
                    %result_location,
                    "hot copy missing and no archive reference recorded"
                );
                return Err(AppError::NotFound(format!("result object {result_location}")));
            }
            Err(err) => return Err(err.into()),
        };

        let archive_id = self.ctx.vault.upload_archive(job_id, data).await?;
        self.ctx.storage.delete(&result_location).await?;
        Job::set_archive_reference(&self.ctx.db, job_id, &archive_id).await?;

        info!(%archive_id, "result archived");
        Ok(Some(archive_id))
    }
}

#[async_trait]
impl MessageHandler for Archiver {
    type Event = CompletionEvent;

    fn name(&self) -> &'static str {
        "archiver"
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = %delivery.event.job_id, user_id = %delivery.event.user_id)
    )]
    async fn handle(&self, delivery: Delivery<CompletionEvent>) -> Result<(), AppError> {
        let event = &delivery.event;
        let profile = UserProfile::require(&event.user_id, &self.ctx.db).await?;
        if !profile.is_archive_eligible() {
            info!(role = profile.role.as_str(), "user keeps results in the hot tier");
            return Ok(());
        }

        self.archive_job(&event.job_id).await?;
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
        queue::send_event,
        storage::{
            store::ObjectLocation,
            types::{job::TransitionFields, user_profile::UserRole},
        },
    };
    use std::sync::Arc;

    async fn completed_job(ctx: &WorkerContext, job_id: &str) -> ObjectLocation {
        let input = ObjectLocation::new("gas-inputs", format!("gas/u1/{job_id}~a.vcf"));
        Job::create(
            Job::new(job_id.into(), "u1".into(), "a.vcf".into(), input),
            &ctx.db,
        )
        .await
        .expect("create");
        Job::mark_running(&ctx.db, job_id).await.expect("running");

        let result = ObjectLocation::new("gas-results", format!("gas/u1/{job_id}/a.annot.vcf"));
        ctx.storage
            .put(&result, Bytes::from_static(b"annotated"))
            .await
            .expect("put result");
        Job::mark_completed(
            &ctx.db,
            job_id,
            TransitionFields {
                complete_time: Some(chrono::Utc::now()),
                result_location: Some(result.clone()),
                log_location: None,
            },
        )
        .await
        .expect("completed");
        result
    }

    async fn profile(ctx: &WorkerContext, role: UserRole) {
        UserProfile::save(
            UserProfile::new("u1".into(), "Ada".into(), "ada@example.com".into(), role),
            &ctx.db,
        )
        .await
        .expect("profile");
    }

    async fn deliver(ctx: &WorkerContext, job_id: &str) -> Vec<MessageOutcome> {
        send_event(
            ctx.queue.as_ref(),
            &ctx.config.archive_queue,
            &CompletionEvent {
                job_id: job_id.into(),
                user_id: "u1".into(),
                complete_time: chrono::Utc::now(),
            },
        )
        .await
        .expect("send");
        let consumer = QueueConsumer::new(
            Arc::clone(&ctx.queue),
            ConsumerSettings::from_config(&ctx.config.archive_queue, &ctx.config),
            Arc::new(Archiver::new(ctx.clone())),
        );
        consumer.poll_once().await.expect("poll")
    }

    #[tokio::test]
    async fn test_free_user_result_moves_to_vault() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        profile(&ctx, UserRole::FreeUser).await;
        let result = completed_job(&ctx, "j1").await;

        assert_eq!(deliver(&ctx, "j1").await, vec![MessageOutcome::Acknowledged]);

        let job = Job::require("j1", &ctx.db).await.expect("job");
        assert!(job.archive_reference.is_some());
        assert!(!ctx.storage.exists(&result).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_premium_user_is_left_alone() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        profile(&ctx, UserRole::PremiumUser).await;
        let result = completed_job(&ctx, "j1").await;

        assert_eq!(deliver(&ctx, "j1").await, vec![MessageOutcome::Acknowledged]);

        let job = Job::require("j1", &ctx.db).await.expect("job");
        assert!(job.archive_reference.is_none());
        assert!(ctx.storage.exists(&result).await.expect("exists"));
    }

    #[tokio::test]
    async fn test_redelivered_completion_is_a_no_op() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        profile(&ctx, UserRole::FreeUser).await;
        completed_job(&ctx, "j1").await;

        deliver(&ctx, "j1").await;
        let first = Job::require("j1", &ctx.db).await.expect("job");

        assert_eq!(deliver(&ctx, "j1").await, vec![MessageOutcome::Acknowledged]);
        let second = Job::require("j1", &ctx.db).await.expect("job");
        assert_eq!(first.archive_reference, second.archive_reference);

        let archived = ctx
            .storage
            .list("vault", "")
            .await
            .expect("list vault");
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_archive_is_completed_on_redelivery() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        profile(&ctx, UserRole::FreeUser).await;
        let result = completed_job(&ctx, "j1").await;

        // Copied and deleted, but the reference never made it to the record.
        ctx.vault
            .upload_archive("j1", Bytes::from_static(b"annotated"))
            .await
            .expect("upload");
        ctx.storage.delete(&result).await.expect("delete hot copy");

        assert_eq!(deliver(&ctx, "j1").await, vec![MessageOutcome::Acknowledged]);

        let job = Job::require("j1", &ctx.db).await.expect("job");
        assert_eq!(job.archive_reference.as_deref(), Some("j1"));
        assert!(ctx.vault.archive_exists("j1").await.expect("exists"));
    }

    #[tokio::test]
    async fn test_lost_result_without_archive_is_retried() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        profile(&ctx, UserRole::FreeUser).await;
        let result = completed_job(&ctx, "j1").await;
        ctx.storage.delete(&result).await.expect("delete hot copy");

        assert_eq!(deliver(&ctx, "j1").await, vec![MessageOutcome::Retained]);
        let job = Job::require("j1", &ctx.db).await.expect("job");
        assert!(job.archive_reference.is_none());
    }

    #[tokio::test]
    async fn test_unknown_user_is_retried() {
        let (ctx, _mailer) = memory_context(test_config()).await.expect("context");
        completed_job(&ctx, "j1").await;

        assert_eq!(deliver(&ctx, "j1").await, vec![MessageOutcome::Retained]);
    }
}
