use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    events::{CompletionEvent, ExecutionFinished},
    storage::{
        store::ObjectLocation,
        types::job::{Job, JobStatus, TransitionFields},
    },
    utils::artifacts::{self, LocalArtifacts},
};
use tracing::{debug, info, warn};

use crate::{
    consumer::{Delivery, MessageHandler},
    context::WorkerContext,
};

/// Finishes a run: upload artifacts, RUNNING -> COMPLETED, publish the
/// completion event, remove the staging directory.
pub struct CompletionHandler {
    ctx: WorkerContext,
}

impl CompletionHandler {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    async fn upload(&self, local: &Path, location: &ObjectLocation) -> Result<(), AppError> {
        let data = tokio::fs::read(local).await.map_err(|err| {
            AppError::Processing(format!("reading {}: {err}", local.display()))
        })?;
        let size = data.len();
        self.ctx.storage.put(location, Bytes::from(data)).await?;
        debug!(%location, size, "artifact uploaded");
        Ok(())
    }

    /// Upload both artifacts and take the job to COMPLETED. A job another
    /// delivery already completed is returned as is.
    async fn complete(&self, job: Job, staged_input: &Path) -> Result<Job, AppError> {
        if job.status == JobStatus::Completed {
            // Republishing after a crash between the transition and the publish
            // means each redelivery here also sends the user another email.
            info!("job already completed; republishing");
            return Ok(job);
        }

        let local = LocalArtifacts::for_staged_input(staged_input).ok_or_else(|| {
            AppError::MalformedMessage(format!(
                "staged input path {} has no file name",
                staged_input.display()
            ))
        })?;
        let config = &self.ctx.config;
        let result_location = artifacts::result_location(
            &config.results_bucket,
            &config.key_prefix,
            &job.user_id,
            &job.id,
            &job.input_file_name,
        );
        let log_location = artifacts::log_location(
            &config.results_bucket,
            &config.key_prefix,
            &job.user_id,
            &job.id,
            &job.input_file_name,
        );

        self.upload(&local.result, &result_location).await?;
        self.upload(&local.log, &log_location).await?;

        let fields = TransitionFields {
            complete_time: Some(chrono::Utc::now()),
            result_location: Some(result_location),
            log_location: Some(log_location),
        };
        match Job::mark_completed(&self.ctx.db, &job.id, fields).await {
            Ok(completed) => {
                info!("job completed");
                Ok(completed)
            }
            Err(AppError::PreconditionFailed {
                actual: JobStatus::Completed,
                ..
            }) => Job::require(&job.id, &self.ctx.db).await,
            // PENDING: the dispatcher has not recorded RUNNING yet, so retry later.
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MessageHandler for CompletionHandler {
    type Event = ExecutionFinished;

    fn name(&self) -> &'static str {
        "completion"
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = %delivery.event.job_id, user_id = %delivery.event.user_id)
    )]
    async fn handle(&self, delivery: Delivery<ExecutionFinished>) -> Result<(), AppError> {
        let event = &delivery.event;
        let job = Job::require(&event.job_id, &self.ctx.db).await?;
        let job = self.complete(job, &event.staged_input).await?;

        let complete_time = job.complete_time.ok_or_else(|| {
            AppError::InternalError(format!("completed job {} has no complete_time", job.id))
        })?;
        self.ctx
            .results_topic()
            .publish(
                self.ctx.queue.as_ref(),
                &CompletionEvent {
                    job_id: job.id.clone(),
                    user_id: job.user_id.clone(),
                    complete_time,
                },
            )
            .await?;

        if let Some(dir) = event.staged_input.parent() {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => debug!(path = %dir.display(), "staging removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = %dir.display(), error = %err, "could not remove staging"),
            }
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
    use common::{events, queue::send_event};
    use std::{path::PathBuf, sync::Arc, time::Duration};

    struct Fixture {
        ctx: WorkerContext,
        consumer: QueueConsumer<CompletionHandler>,
        staging: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let staging = tempfile::tempdir().expect("tempdir");
        let config = common::utils::config::AppConfig {
            staging_dir: staging.path().to_string_lossy().into_owned(),
            visibility_timeout_secs: 1,
            ..test_config()
        };
        let (ctx, _mailer) = memory_context(config).await.expect("context");
        let consumer = QueueConsumer::new(
            Arc::clone(&ctx.queue),
            ConsumerSettings::from_config(&ctx.config.execution_queue, &ctx.config),
            Arc::new(CompletionHandler::new(ctx.clone())),
        );
        Fixture {
            ctx,
            consumer,
            staging,
        }
    }

    /// Create a job and the files a successful annotator run leaves behind.
    async fn finished_run(fx: &Fixture, job_id: &str, status: JobStatus) -> PathBuf {
        let location = ObjectLocation::new("gas-inputs", format!("gas/u1/{job_id}~sample.vcf"));
        Job::create(
            Job::new(job_id.into(), "u1".into(), "sample.vcf".into(), location),
            &fx.ctx.db,
        )
        .await
        .expect("create");
        if status != JobStatus::Pending {
            Job::mark_running(&fx.ctx.db, job_id).await.expect("running");
        }

        let dir = fx.staging.path().join("u1").join(job_id);
        tokio::fs::create_dir_all(&dir).await.expect("staging dir");
        let staged = dir.join("sample.vcf");
        tokio::fs::write(&staged, b"input").await.expect("input");
        tokio::fs::write(dir.join("sample.annot.vcf"), b"annotated")
            .await
            .expect("result");
        tokio::fs::write(dir.join("sample.vcf.count.log"), b"3 variants")
            .await
            .expect("log");

        send_event(
            fx.ctx.queue.as_ref(),
            &fx.ctx.config.execution_queue,
            &ExecutionFinished {
                job_id: job_id.into(),
                user_id: "u1".into(),
                staged_input: staged.clone(),
            },
        )
        .await
        .expect("send");
        staged
    }

    async fn completion_events(fx: &Fixture, queue: &str) -> Vec<CompletionEvent> {
        fx.ctx
            .queue
            .receive(queue, 10, Duration::ZERO, Duration::from_secs(30))
            .await
            .expect("receive")
            .iter()
            .map(|message| events::decode(&message.body).expect("decode"))
            .collect()
    }

    #[tokio::test]
    async fn test_completion_uploads_transitions_publishes_and_cleans_up() {
        let fx = fixture().await;
        let staged = finished_run(&fx, "j1", JobStatus::Running).await;

        let outcomes = fx.consumer.poll_once().await.expect("poll");
        assert_eq!(outcomes, vec![MessageOutcome::Acknowledged]);

        let job = Job::require("j1", &fx.ctx.db).await.expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        let result_location = job.result_location.clone().expect("result location");
        assert_eq!(result_location.key, "gas/u1/j1/sample.annot.vcf");
        let log_location = job.log_location.clone().expect("log location");
        assert_eq!(log_location.key, "gas/u1/j1/sample.vcf.count.log");
        assert_eq!(
            fx.ctx.storage.get(&result_location).await.expect("result").as_ref(),
            b"annotated"
        );
        assert_eq!(
            fx.ctx.storage.get(&log_location).await.expect("log").as_ref(),
            b"3 variants"
        );

        for queue in fx.ctx.config.result_subscribers() {
            let published = completion_events(&fx, &queue).await;
            assert_eq!(published.len(), 1, "one completion event on {queue}");
            assert_eq!(published[0].job_id, "j1");
            assert_eq!(Some(published[0].complete_time), job.complete_time);
        }

        assert!(!staged.parent().expect("staging dir").exists());
    }

    #[tokio::test]
    async fn test_finish_before_running_transition_is_retried() {
        let fx = fixture().await;
        finished_run(&fx, "j1", JobStatus::Pending).await;

        let outcomes = fx.consumer.poll_once().await.expect("poll");
        assert_eq!(outcomes, vec![MessageOutcome::Retained]);
        assert_eq!(
            Job::require("j1", &fx.ctx.db).await.expect("job").status,
            JobStatus::Pending
        );
        assert!(completion_events(&fx, &fx.ctx.config.notify_queue)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_artifact_leaves_job_running() {
        let fx = fixture().await;
        let staged = finished_run(&fx, "j1", JobStatus::Running).await;
        let parent = staged.parent().expect("staging dir");
        tokio::fs::remove_file(parent.join("sample.annot.vcf"))
            .await
            .expect("remove result");

        let outcomes = fx.consumer.poll_once().await.expect("poll");
        assert_eq!(outcomes, vec![MessageOutcome::Retained]);
        assert_eq!(
            Job::require("j1", &fx.ctx.db).await.expect("job").status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_republishes_without_regressing() {
        let fx = fixture().await;
        let staged = finished_run(&fx, "j1", JobStatus::Running).await;
        fx.consumer.poll_once().await.expect("first poll");
        let first = Job::require("j1", &fx.ctx.db).await.expect("job");

        send_event(
            fx.ctx.queue.as_ref(),
            &fx.ctx.config.execution_queue,
            &ExecutionFinished {
                job_id: "j1".into(),
                user_id: "u1".into(),
                staged_input: staged,
            },
        )
        .await
        .expect("resend");
        let outcomes = fx.consumer.poll_once().await.expect("second poll");
        assert_eq!(outcomes, vec![MessageOutcome::Acknowledged]);

        let second = Job::require("j1", &fx.ctx.db).await.expect("job");
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(second.complete_time, first.complete_time);
        assert_eq!(
            completion_events(&fx, &fx.ctx.config.notify_queue).await.len(),
            2
        );
    }
}
