use surrealdb::sql::Datetime as SurrealDatetime;
use tokio_retry::RetryIf;
use tracing::debug;

use crate::{
    error::AppError,
    storage::{
        db::{conflict_retry_strategy, SurrealDbClient},
        store::ObjectLocation,
    },
    stored_object,
};

#[derive(
    Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash,
)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    #[default]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl JobStatus {
    /// The only status a job may move to from this one.
    pub fn next(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Pending => Some(JobStatus::Running),
            JobStatus::Running => Some(JobStatus::Completed),
            JobStatus::Completed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier of an in-flight cold-tier retrieval.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
pub enum RestoreStatus {
    #[serde(rename = "EXPEDITED_PENDING")]
    ExpeditedPending,
    #[serde(rename = "STANDARD_PENDING")]
    StandardPending,
}

impl RestoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreStatus::ExpeditedPending => "EXPEDITED_PENDING",
            RestoreStatus::StandardPending => "STANDARD_PENDING",
        }
    }
}

fn validate_transition(from: JobStatus, to: JobStatus) -> Result<(), AppError> {
    if from.next() == Some(to) {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Invalid job transition: {from} -> {to}"
        )))
    }
}

/// Fields written together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    pub complete_time: Option<chrono::DateTime<chrono::Utc>>,
    pub result_location: Option<ObjectLocation>,
    pub log_location: Option<ObjectLocation>,
}

stored_object!(Job, "job", {
    user_id: String,
    input_file_name: String,
    input_location: ObjectLocation,
    status: JobStatus,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    submit_time: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    complete_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    result_location: Option<ObjectLocation>,
    #[serde(default)]
    log_location: Option<ObjectLocation>,
    #[serde(default)]
    archive_reference: Option<String>,
    #[serde(default)]
    restore_status: Option<RestoreStatus>
});

impl Job {
    pub fn new(
        job_id: String,
        user_id: String,
        input_file_name: String,
        input_location: ObjectLocation,
    ) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: job_id,
            user_id,
            input_file_name,
            input_location,
            status: JobStatus::Pending,
            submit_time: now,
            complete_time: None,
            result_location: None,
            log_location: None,
            archive_reference: None,
            restore_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archive_reference.is_some()
    }

    /// Persist a new job. Fails with `Conflict` when the id is already taken.
    pub async fn create(job: Job, db: &SurrealDbClient) -> Result<Job, AppError> {
        let job_id = job.id.clone();
        match db.store_item(job).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Err(AppError::InternalError(format!(
                "record store returned nothing for new job {job_id}"
            ))),
            Err(err) => {
                if db.get_item::<Job>(&job_id).await?.is_some() {
                    Err(AppError::Conflict(format!("job {job_id} already exists")))
                } else {
                    Err(err.into())
                }
            }
        }
    }

    pub async fn get(job_id: &str, db: &SurrealDbClient) -> Result<Option<Job>, AppError> {
        Ok(db.get_item::<Job>(job_id).await?)
    }

    pub async fn require(job_id: &str, db: &SurrealDbClient) -> Result<Job, AppError> {
        Self::get(job_id, db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    /// Jobs owned by a user, newest submission first.
    pub async fn list_for_user(user_id: &str, db: &SurrealDbClient) -> Result<Vec<Job>, AppError> {
        let jobs: Vec<Job> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id
                 ORDER BY submit_time DESC",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Jobs of a user whose result currently lives in the cold tier.
    pub async fn list_archived_for_user(
        user_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Job>, AppError> {
        let jobs: Vec<Job> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE user_id = $user_id AND archive_reference != NONE
                 ORDER BY submit_time ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Conditionally move a job from `from` to `to`.
    ///
    /// The write only applies while the stored status equals `from`. Otherwise
    /// the call fails with `PreconditionFailed`, which callers treat as
    /// "already handled". Pairs outside PENDING -> RUNNING -> COMPLETED are
    /// rejected with `Validation` without touching the store.
    pub async fn transition(
        db: &SurrealDbClient,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        fields: TransitionFields,
    ) -> Result<Job, AppError> {
        validate_transition(from, to)?;

        RetryIf::spawn(
            conflict_retry_strategy(),
            || Self::try_transition(db, job_id, from, to, &fields),
            |err: &AppError| {
                let retry = err.is_retryable_conflict();
                if retry {
                    debug!(%job_id, error = %err, "retrying conflicted job transition");
                }
                retry
            },
        )
        .await
    }

    pub async fn mark_running(db: &SurrealDbClient, job_id: &str) -> Result<Job, AppError> {
        Self::transition(
            db,
            job_id,
            JobStatus::Pending,
            JobStatus::Running,
            TransitionFields::default(),
        )
        .await
    }

    pub async fn mark_completed(
        db: &SurrealDbClient,
        job_id: &str,
        fields: TransitionFields,
    ) -> Result<Job, AppError> {
        Self::transition(db, job_id, JobStatus::Running, JobStatus::Completed, fields).await
    }

    async fn try_transition(
        db: &SurrealDbClient,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        fields: &TransitionFields,
    ) -> Result<Job, AppError> {
        let mut assignments = vec!["status = $to", "updated_at = $now"];
        if fields.complete_time.is_some() {
            assignments.push("complete_time = $complete_time");
        }
        if fields.result_location.is_some() {
            assignments.push("result_location = $result_location");
        }
        if fields.log_location.is_some() {
            assignments.push("log_location = $log_location");
        }

        let statement = format!(
            "UPDATE type::thing($table, $id) SET {} WHERE status = $from RETURN AFTER;",
            assignments.join(", ")
        );

        let mut query = db
            .client
            .query(statement)
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_string()))
            .bind(("from", from.as_str()))
            .bind(("to", to.as_str()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())));
        if let Some(complete_time) = fields.complete_time {
            query = query.bind(("complete_time", SurrealDatetime::from(complete_time)));
        }
        if let Some(location) = &fields.result_location {
            query = query.bind(("result_location", location.clone()));
        }
        if let Some(location) = &fields.log_location {
            query = query.bind(("log_location", location.clone()));
        }

        let mut result = query.await?;
        let updated: Option<Job> = result.take(0)?;
        match updated {
            Some(job) => Ok(job),
            None => Err(Self::explain_missed_update(db, job_id, from).await),
        }
    }

    /// Turn an update that matched nothing into `NotFound` or `PreconditionFailed`.
    async fn explain_missed_update(
        db: &SurrealDbClient,
        job_id: &str,
        expected: JobStatus,
    ) -> AppError {
        match db.get_item::<Job>(job_id).await {
            Ok(Some(job)) => AppError::PreconditionFailed {
                job_id: job_id.to_string(),
                expected,
                actual: job.status,
            },
            Ok(None) => AppError::NotFound(format!("job {job_id}")),
            Err(err) => err.into(),
        }
    }

    /// Record the cold-tier reference of an archived result. Only completed jobs qualify.
    pub async fn set_archive_reference(
        db: &SurrealDbClient,
        job_id: &str,
        archive_reference: &str,
    ) -> Result<Job, AppError> {
        const ARCHIVE_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET archive_reference = $archive_reference,
                updated_at = $now
            WHERE status = $completed
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(ARCHIVE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_string()))
            .bind(("archive_reference", archive_reference.to_string()))
            .bind(("completed", JobStatus::Completed.as_str()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?;

        let updated: Option<Job> = result.take(0)?;
        match updated {
            Some(job) => Ok(job),
            None => Err(Self::explain_missed_update(db, job_id, JobStatus::Completed).await),
        }
    }

    /// Drop archive bookkeeping once the result is back in the hot tier.
    pub async fn clear_archive_fields(db: &SurrealDbClient, job_id: &str) -> Result<Job, AppError> {
        const CLEAR_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET archive_reference = NONE,
                restore_status = NONE,
                updated_at = $now
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(CLEAR_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_string()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?;

        let updated: Option<Job> = result.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    /// Record an in-flight retrieval. Only jobs that still hold an archive reference qualify.
    pub async fn set_restore_status(
        db: &SurrealDbClient,
        job_id: &str,
        status: RestoreStatus,
    ) -> Result<Job, AppError> {
        const RESTORE_STATUS_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET restore_status = $restore_status,
                updated_at = $now
            WHERE archive_reference != NONE
            RETURN AFTER;
        "#;

        let mut result = db
            .client
            .query(RESTORE_STATUS_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_string()))
            .bind(("restore_status", status.as_str()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?;

        let updated: Option<Job> = result.take(0)?;
        match updated {
            Some(job) => Ok(job),
            None => match Self::get(job_id, db).await? {
                Some(_) => Err(AppError::Conflict(format!(
                    "job {job_id} has no archived result to restore"
                ))),
                None => Err(AppError::NotFound(format!("job {job_id}"))),
            },
        }
    }
}
