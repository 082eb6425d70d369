use async_trait::async_trait;
use common::{
    error::AppError,
    events::{RestoreRequest, UpgradeEvent},
    storage::{
        types::job::{Job, RestoreStatus},
        vault::{ArchiveError, RetrievalTier},
    },
};
use tracing::{error, info, warn};

use crate::{
    consumer::{Delivery, MessageHandler},
    context::WorkerContext,
};

/// Per-user tally of one restore pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub expedited: usize,
    pub standard: usize,
    /// Jobs that already had a retrieval in flight.
    pub already_restoring: usize,
    pub failed: usize,
}

/// Starts cold-tier retrievals for every archived job of an upgraded user.
pub struct Restorer {
    ctx: WorkerContext,
}

impl Restorer {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx }
    }

    /// Initiate retrieval for each archived job of the user. Failures for a
    /// single job are logged and counted; only listing the jobs can fail the call.
    #[tracing::instrument(skip(self))]
    pub async fn restore_user(&self, user_id: &str) -> Result<RestoreSummary, AppError> {
        let jobs = Job::list_archived_for_user(user_id, &self.ctx.db).await?;
        let mut summary = RestoreSummary::default();

        for job in jobs {
            if job.restore_status.is_some() {
                summary.already_restoring += 1;
                continue;
            }
            let Some(archive_reference) = job.archive_reference.clone() else {
                continue;
            };
            let request = RestoreRequest {
                job_id: job.id.clone(),
                archive_reference,
            };

            match self.restore_job(&request).await {
                Ok(RestoreStatus::ExpeditedPending) => summary.expedited += 1,
                Ok(RestoreStatus::StandardPending) => summary.standard += 1,
                Err(err) => {
                    error!(job_id = %request.job_id, error = %err, "restore not started; skipping job");
                    summary.failed += 1;
                }
            }
        }

        info!(
            expedited = summary.expedited,
            standard = summary.standard,
            already_restoring = summary.already_restoring,
            failed = summary.failed,
            "restore pass finished"
        );
        Ok(summary)
    }

    async fn restore_job(&self, request: &RestoreRequest) -> Result<RestoreStatus, AppError> {
        let status = match self
            .ctx
            .vault
            .initiate_retrieval(request, RetrievalTier::Expedited)
            .await
        {
            Ok(_) => RestoreStatus::ExpeditedPending,
            Err(ArchiveError::InsufficientCapacity(_)) => {
                warn!(job_id = %request.job_id, "expedited capacity exhausted; using standard retrieval");
                self.ctx
                    .vault
                    .initiate_retrieval(request, RetrievalTier::Standard)
                    .await?;
                RestoreStatus::StandardPending
            }
            Err(err) => return Err(err.into()),
        };

        Job::set_restore_status(&self.ctx.db, &request.job_id, status).await?;
        info!(job_id = %request.job_id, restore_status = status.as_str(), "restore started");
        Ok(status)
    }
}

#[async_trait]
impl MessageHandler for Restorer {
    type Event = UpgradeEvent;

    fn name(&self) -> &'static str {
        "restorer"
    }

    async fn handle(&self, delivery: Delivery<UpgradeEvent>) -> Result<(), AppError> {
        self.restore_user(&delivery.event.user_id).await?;
        Ok(())
    }
}
