use std::sync::Arc;

use common::{
    error::AppError,
    queue::{MessageQueue, SurrealQueue, Topic},
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        vault::{ColdArchive, ObjectStoreVault},
    },
    utils::{
        config::AppConfig,
        mailer::{mailer_from_config, Mailer},
    },
};
use tracing::info;

/// Collaborators shared by every worker role of one process.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub queue: Arc<dyn MessageQueue>,
    pub vault: Arc<dyn ColdArchive>,
    pub mailer: Arc<dyn Mailer>,
    pub config: Arc<AppConfig>,
}

impl WorkerContext {
    /// Connect to the record store and build the default collaborators.
    pub async fn connect(config: AppConfig) -> Result<Self, AppError> {
        let db = Arc::new(
            SurrealDbClient::new(
                &config.surrealdb_address,
                &config.surrealdb_username,
                &config.surrealdb_password,
                &config.surrealdb_namespace,
                &config.surrealdb_database,
            )
            .await?,
        );
        db.ensure_initialized().await?;

        let storage = StorageManager::new(&config).await?;
        info!(backend = ?storage.backend_kind(), "hot tier ready");

        Ok(Self::assemble(db, storage, config))
    }

    /// Wire the queue, vault and mailer around an existing store and hot tier.
    pub fn assemble(db: Arc<SurrealDbClient>, storage: StorageManager, config: AppConfig) -> Self {
        let queue: Arc<dyn MessageQueue> =
            Arc::new(SurrealQueue::from_config(Arc::clone(&db), &config));
        let vault: Arc<dyn ColdArchive> = Arc::new(ObjectStoreVault::from_config(
            &config,
            storage.clone(),
            Arc::clone(&queue),
        ));
        let mailer = mailer_from_config(&config);

        Self {
            db,
            storage,
            queue,
            vault,
            mailer,
            config: Arc::new(config),
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = mailer;
        self
    }

    /// Fan-out of completion events to the notifier and archiver queues.
    pub fn results_topic(&self) -> Topic {
        Topic::new("job-results", self.config.result_subscribers())
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use std::sync::Arc;

    use common::{
        error::AppError,
        storage::{db::SurrealDbClient, store::testing::memory_storage},
        utils::{config::AppConfig, mailer::testing::RecordingMailer},
    };
    use uuid::Uuid;

    use super::WorkerContext;

    /// Defaults tuned for tests: no long polls, instant retrievals.
    pub fn test_config() -> AppConfig {
        AppConfig {
            queue_wait_time_secs: 0,
            queue_poll_interval_ms: 10,
            expedited_retrieval_delay_secs: 0,
            standard_retrieval_delay_secs: 0,
            ..Default::default()
        }
    }

    /// In-memory context with a recording mailer.
    pub async fn memory_context(
        config: AppConfig,
    ) -> Result<(WorkerContext, Arc<RecordingMailer>), AppError> {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string()).await?;
        db.ensure_initialized().await?;

        let mailer = Arc::new(RecordingMailer::default());
        let ctx = WorkerContext::assemble(Arc::new(db), memory_storage(), config)
            .with_mailer(Arc::clone(&mailer) as Arc<dyn common::utils::mailer::Mailer>);
        Ok((ctx, mailer))
    }
}
