//! Entry points used by the outer surfaces: submitting a job and upgrading a user.

use bytes::Bytes;
use common::{
    error::AppError,
    events::{SubmissionEvent, UpgradeEvent},
    queue::send_event,
    storage::{
        store::ObjectLocation,
        types::{job::Job, user_profile::UserProfile},
    },
    utils::artifacts,
};
use tracing::info;
use uuid::Uuid;

use crate::context::WorkerContext;

/// Store the input, create the PENDING job and queue it for dispatch.
#[tracing::instrument(skip(ctx, data), fields(size = data.len()))]
pub async fn submit_job(
    ctx: &WorkerContext,
    user_id: &str,
    input_file_name: &str,
    data: Bytes,
) -> Result<Job, AppError> {
    if input_file_name.is_empty() || input_file_name.contains('/') {
        return Err(AppError::Validation(format!(
            "invalid input file name {input_file_name:?}"
        )));
    }

    let job_id = Uuid::new_v4().to_string();
    let config = &ctx.config;
    let input_key = artifacts::input_key(&config.key_prefix, user_id, &job_id, input_file_name);
    let input_location = ObjectLocation::new(&config.inputs_bucket, &input_key);

    ctx.storage.put(&input_location, data).await?;
    let job = Job::create(
        Job::new(
            job_id.clone(),
            user_id.to_string(),
            input_file_name.to_string(),
            input_location,
        ),
        &ctx.db,
    )
    .await?;

    send_event(
        ctx.queue.as_ref(),
        &config.request_queue,
        &SubmissionEvent {
            job_id: job_id.clone(),
            user_id: user_id.to_string(),
            inputs_bucket: config.inputs_bucket.clone(),
            input_key,
            input_file_name: input_file_name.to_string(),
        },
    )
    .await?;

    info!(%job_id, "job submitted");
    Ok(job)
}

/// Record the premium role and ask the restorer to bring archived results back.
#[tracing::instrument(skip(ctx))]
pub async fn upgrade_user(ctx: &WorkerContext, user_id: &str) -> Result<UserProfile, AppError> {
    let profile = UserProfile::upgrade_to_premium(&ctx.db, user_id).await?;
    send_event(
        ctx.queue.as_ref(),
        &ctx.config.upgrade_queue,
        &UpgradeEvent {
            user_id: user_id.to_string(),
        },
    )
    .await?;

    info!("user upgraded");
    Ok(profile)
}
