//! Cold tier: write-once archives with asynchronous, tiered retrieval.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    events::{self, RestoreCompletionEvent, RestoreRequest},
    queue::MessageQueue,
    storage::store::{ByteStream, ObjectLocation, StorageManager},
    utils::config::AppConfig,
};

const VAULT_BUCKET: &str = "vault";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("insufficient capacity for {0} retrieval")]
    InsufficientCapacity(RetrievalTier),
    #[error("archive object not found: {0}")]
    NotFound(String),
    #[error("cold tier storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("could not announce retrieval completion: {0}")]
    Notification(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalTier {
    Expedited,
    Standard,
}

impl std::fmt::Display for RetrievalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetrievalTier::Expedited => write!(f, "expedited"),
            RetrievalTier::Standard => write!(f, "standard"),
        }
    }
}

#[async_trait]
pub trait ColdArchive: Send + Sync {
    /// Store bytes under `archive_id`, replacing any earlier upload with the
    /// same id, and return the id.
    async fn upload_archive(&self, archive_id: &str, data: Bytes) -> Result<String, ArchiveError>;

    async fn archive_exists(&self, archive_id: &str) -> Result<bool, ArchiveError>;

    /// Start an asynchronous retrieval. Completion is announced later with a
    /// `RestoreCompletionEvent` carrying the returned retrieval job id.
    async fn initiate_retrieval(
        &self,
        request: &RestoreRequest,
        tier: RetrievalTier,
    ) -> Result<String, ArchiveError>;

    /// Bytes of a finished retrieval.
    async fn retrieval_output(&self, retrieval_job_id: &str) -> Result<ByteStream, ArchiveError>;

    /// Removing an archive that is already gone succeeds.
    async fn delete_archive(&self, archive_id: &str) -> Result<(), ArchiveError>;

    /// Drop the output of a retrieval once it has been copied out. Idempotent.
    async fn delete_retrieval_output(&self, retrieval_job_id: &str) -> Result<(), ArchiveError>;
}

/// Vault kept inside an object store, announcing finished retrievals on a queue.
pub struct ObjectStoreVault {
    name: String,
    storage: StorageManager,
    queue: Arc<dyn MessageQueue>,
    restore_queue: String,
    expedited_capacity: Option<usize>,
    expedited_delay: Duration,
    standard_delay: Duration,
    /// Ready times of expedited retrievals still in flight.
    expedited_in_flight: Mutex<Vec<Instant>>,
}

impl ObjectStoreVault {
    pub fn new(
        name: impl Into<String>,
        storage: StorageManager,
        queue: Arc<dyn MessageQueue>,
        restore_queue: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            queue,
            restore_queue: restore_queue.into(),
            expedited_capacity: None,
            expedited_delay: Duration::ZERO,
            standard_delay: Duration::ZERO,
            expedited_in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        storage: StorageManager,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self::new(
            config.vault_name.clone(),
            storage,
            queue,
            config.restore_queue.clone(),
        )
        .with_expedited_capacity(config.expedited_capacity)
        .with_retrieval_delays(
            Duration::from_secs(config.expedited_retrieval_delay_secs),
            Duration::from_secs(config.standard_retrieval_delay_secs),
        )
    }

    /// `None` leaves expedited retrievals unbounded.
    pub fn with_expedited_capacity(mut self, capacity: Option<usize>) -> Self {
        self.expedited_capacity = capacity;
        self
    }

    pub fn with_retrieval_delays(mut self, expedited: Duration, standard: Duration) -> Self {
        self.expedited_delay = expedited;
        self.standard_delay = standard;
        self
    }

    fn archive_location(&self, archive_id: &str) -> ObjectLocation {
        ObjectLocation::new(VAULT_BUCKET, format!("{}/archives/{archive_id}", self.name))
    }

    fn retrieval_location(&self, retrieval_job_id: &str) -> ObjectLocation {
        ObjectLocation::new(
            VAULT_BUCKET,
            format!("{}/retrievals/{retrieval_job_id}", self.name),
        )
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, Vec<Instant>> {
        self.expedited_in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a slot for the tier. Returns the delay before the output is
    /// ready and, for expedited retrievals, the slot to release on failure.
    fn reserve(&self, tier: RetrievalTier) -> Result<(Duration, Option<Instant>), ArchiveError> {
        match tier {
            RetrievalTier::Standard => Ok((self.standard_delay, None)),
            RetrievalTier::Expedited => {
                let now = Instant::now();
                let mut in_flight = self.in_flight();
                in_flight.retain(|ready_at| *ready_at > now);

                if let Some(capacity) = self.expedited_capacity {
                    if in_flight.len() >= capacity {
                        return Err(ArchiveError::InsufficientCapacity(tier));
                    }
                }
                let ready_at = now + self.expedited_delay;
                in_flight.push(ready_at);
                Ok((self.expedited_delay, Some(ready_at)))
            }
        }
    }

    fn release(&self, slot: Instant) {
        let mut in_flight = self.in_flight();
        if let Some(index) = in_flight.iter().position(|ready_at| *ready_at == slot) {
            in_flight.swap_remove(index);
        }
    }

    /// Copy the archive to its retrieval location and queue the completion notice.
    async fn stage_retrieval(
        &self,
        request: &RestoreRequest,
        retrieval_job_id: &str,
        delay: Duration,
    ) -> Result<(), ArchiveError> {
        let archived = self
            .storage
            .get_stream(&self.archive_location(&request.archive_reference))
            .await
            .map_err(|err| not_found_or(&request.archive_reference, err))?;
        self.storage
            .put_stream(&self.retrieval_location(retrieval_job_id), archived)
            .await?;

        let completion = RestoreCompletionEvent {
            archive_reference: request.archive_reference.clone(),
            job_id: request.job_id.clone(),
            retrieval_job_id: retrieval_job_id.to_string(),
        };
        let body = events::encode(&completion)
            .map_err(|err| ArchiveError::Notification(err.to_string()))?;
        self.queue
            .send(&self.restore_queue, body, delay)
            .await
            .map_err(|err| ArchiveError::Notification(err.to_string()))?;
        Ok(())
    }
}

fn not_found_or(id: &str, err: object_store::Error) -> ArchiveError {
    match err {
        object_store::Error::NotFound { .. } => ArchiveError::NotFound(id.to_string()),
        other => ArchiveError::Storage(other),
    }
}

#[async_trait]
impl ColdArchive for ObjectStoreVault {
    async fn upload_archive(&self, archive_id: &str, data: Bytes) -> Result<String, ArchiveError> {
        let size = data.len();
        self.storage
            .put(&self.archive_location(archive_id), data)
            .await?;

        debug!(vault = %self.name, %archive_id, size, "archive uploaded");
        Ok(archive_id.to_string())
    }

    async fn archive_exists(&self, archive_id: &str) -> Result<bool, ArchiveError> {
        Ok(self.storage.exists(&self.archive_location(archive_id)).await?)
    }

    async fn initiate_retrieval(
        &self,
        request: &RestoreRequest,
        tier: RetrievalTier,
    ) -> Result<String, ArchiveError> {
        if !self.archive_exists(&request.archive_reference).await? {
            return Err(ArchiveError::NotFound(request.archive_reference.clone()));
        }

        let (delay, slot) = self.reserve(tier)?;
        let retrieval_job_id = Uuid::new_v4().to_string();

        if let Err(err) = self.stage_retrieval(request, &retrieval_job_id, delay).await {
            if let Some(slot) = slot {
                self.release(slot);
            }
            // Unannounced output is never read, so drop it.
            if let Err(cleanup) = self
                .storage
                .delete(&self.retrieval_location(&retrieval_job_id))
                .await
            {
                warn!(%retrieval_job_id, error = %cleanup, "abandoned retrieval output not removed");
            }
            return Err(err);
        }

        info!(
            vault = %self.name,
            job_id = %request.job_id,
            %retrieval_job_id,
            %tier,
            ready_in_secs = delay.as_secs(),
            "retrieval initiated"
        );
        Ok(retrieval_job_id)
    }

    async fn retrieval_output(&self, retrieval_job_id: &str) -> Result<ByteStream, ArchiveError> {
        self.storage
            .get_stream(&self.retrieval_location(retrieval_job_id))
            .await
            .map_err(|err| not_found_or(retrieval_job_id, err))
    }

    async fn delete_archive(&self, archive_id: &str) -> Result<(), ArchiveError> {
        self.storage.delete(&self.archive_location(archive_id)).await?;
        debug!(vault = %self.name, %archive_id, "archive deleted");
        Ok(())
    }

    async fn delete_retrieval_output(&self, retrieval_job_id: &str) -> Result<(), ArchiveError> {
        self.storage
            .delete(&self.retrieval_location(retrieval_job_id))
            .await?;
        debug!(vault = %self.name, %retrieval_job_id, "retrieval output deleted");
        Ok(())
    }
}
