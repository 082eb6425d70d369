use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    events::SubmissionEvent,
    storage::types::job::{Job, JobStatus},
    utils::artifacts,
};
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::{
    consumer::{Delivery, MessageHandler},
    context::WorkerContext,
    executor::{ExecutionLauncher, ExecutionRequest},
};

/// Moves submitted jobs to RUNNING: stage the input, launch the annotator,
/// then take ownership with the PENDING -> RUNNING transition.
pub struct Dispatcher {
    ctx: WorkerContext,
    launcher: Arc<dyn ExecutionLauncher>,
}

impl Dispatcher {
    pub fn new(ctx: WorkerContext, launcher: Arc<dyn ExecutionLauncher>) -> Self {
        Self { ctx, launcher }
    }

    /// Copy the job's input object into `<staging_dir>/<user>/<job>/<file>`.
    /// Only the stored record is trusted for the owner and names.
    async fn stage_input(&self, job: &Job) -> Result<PathBuf, AppError> {
        let location = &job.input_location;
        let stream = match self.ctx.storage.get_stream(location).await {
            Ok(stream) => stream,
            Err(object_store::Error::NotFound { .. }) => {
                warn!(job_id = %job.id, %location, "input not found yet; will retry");
                return Err(AppError::NotFound(format!("input object {location}")));
            }
            Err(err) => return Err(err.into()),
        };

        let dir = artifacts::staging_dir(
            std::path::Path::new(&self.ctx.config.staging_dir),
            &job.user_id,
            &job.id,
        );
        tokio::fs::create_dir_all(&dir).await?;
        let staged = dir.join(&job.input_file_name);

        let mut reader = StreamReader::new(stream.map_err(std::io::Error::other));
        let mut file = tokio::fs::File::create(&staged).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        debug!(job_id = %job.id, path = %staged.display(), bytes, "input staged");
        Ok(staged)
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    type Event = SubmissionEvent;

    fn name(&self) -> &'static str {
        "dispatcher"
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = %delivery.event.job_id, user_id = %delivery.event.user_id)
    )]
    async fn handle(&self, delivery: Delivery<SubmissionEvent>) -> Result<(), AppError> {
        let event = &delivery.event;

        // A missing record is treated like a missing input: the submitter may
        // not have finished writing it.
        let job = Job::require(&event.job_id, &self.ctx.db).await?;
        if job.status != JobStatus::Pending {
            info!(status = %job.status, "job already dispatched; skipping launch");
            return Ok(());
        }

        if job.user_id != event.user_id {
            warn!(
                owner = %job.user_id,
                "submission names a different user; using the job record"
            );
        }

        let staged_input = self.stage_input(&job).await?;

        self.launcher
            .launch(ExecutionRequest {
                job_id: job.id.clone(),
                user_id: job.user_id.clone(),
                staged_input,
            })
            .await?;

        match Job::mark_running(&self.ctx.db, &job.id).await {
            Ok(_) => {
                info!("job running");
                Ok(())
            }
            Err(err) if err.is_precondition_failed() => {
                info!(error = %err, "job was advanced by another delivery");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
