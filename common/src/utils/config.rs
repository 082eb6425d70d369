use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Process-wide settings, loaded once at startup and handed to every component.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    /// Bucket backing the object store when `storage = "s3"`.
    #[serde(default)]
    pub s3_bucket: Option<String>,

    // Hot tier layout
    #[serde(default = "default_inputs_bucket")]
    pub inputs_bucket: String,
    #[serde(default = "default_results_bucket")]
    pub results_bucket: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    // Cold tier
    #[serde(default = "default_vault_name")]
    pub vault_name: String,
    #[serde(default)]
    pub expedited_capacity: Option<usize>,
    #[serde(default = "default_expedited_delay")]
    pub expedited_retrieval_delay_secs: u64,
    #[serde(default = "default_standard_delay")]
    pub standard_retrieval_delay_secs: u64,

    // Queues
    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    #[serde(default = "default_execution_queue")]
    pub execution_queue: String,
    #[serde(default = "default_notify_queue")]
    pub notify_queue: String,
    #[serde(default = "default_archive_queue")]
    pub archive_queue: String,
    #[serde(default = "default_upgrade_queue")]
    pub upgrade_queue: String,
    #[serde(default = "default_restore_queue")]
    pub restore_queue: String,
    #[serde(default = "default_max_messages")]
    pub queue_max_messages: usize,
    #[serde(default = "default_wait_time")]
    pub queue_wait_time_secs: u64,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub queue_poll_interval_ms: u64,
    /// Messages received more often than this are moved to `<queue>-dead-letter`.
    #[serde(default)]
    pub max_receive_count: Option<u32>,

    // Annotation execution
    #[serde(default = "default_annotator_command")]
    pub annotator_command: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,

    // Notifications
    #[serde(default = "default_mail_sender")]
    pub mail_default_sender: String,
    #[serde(default = "default_job_detail_url_base")]
    pub job_detail_url_base: String,
    #[serde(default = "default_time_zone")]
    pub display_time_zone: String,
    #[serde(default)]
    pub mail_webhook_url: Option<String>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_inputs_bucket() -> String {
    "gas-inputs".to_string()
}

fn default_results_bucket() -> String {
    "gas-results".to_string()
}

fn default_key_prefix() -> String {
    "gas/".to_string()
}

fn default_vault_name() -> String {
    "gas-vault".to_string()
}

fn default_expedited_delay() -> u64 {
    5
}

fn default_standard_delay() -> u64 {
    300
}

fn default_request_queue() -> String {
    "job-requests".to_string()
}

fn default_execution_queue() -> String {
    "job-executions".to_string()
}

fn default_notify_queue() -> String {
    "job-results-notify".to_string()
}

fn default_archive_queue() -> String {
    "job-results-archive".to_string()
}

fn default_upgrade_queue() -> String {
    "user-upgrades".to_string()
}

fn default_restore_queue() -> String {
    "job-restores".to_string()
}

fn default_max_messages() -> usize {
    10
}

fn default_wait_time() -> u64 {
    20
}

fn default_visibility_timeout() -> u64 {
    300
}

fn default_poll_interval() -> u64 {
    250
}

fn default_annotator_command() -> String {
    "python ./run.py".to_string()
}

fn default_staging_dir() -> String {
    "./anntools/data".to_string()
}

fn default_max_concurrent_executions() -> usize {
    4
}

fn default_mail_sender() -> String {
    "noreply@gas.local".to_string()
}

fn default_job_detail_url_base() -> String {
    "http://localhost:5000/annotations/".to_string()
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "gas".to_string(),
            surrealdb_database: "gas".to_string(),
            data_dir: default_data_dir(),
            storage: default_storage_kind(),
            s3_bucket: None,
            inputs_bucket: default_inputs_bucket(),
            results_bucket: default_results_bucket(),
            key_prefix: default_key_prefix(),
            vault_name: default_vault_name(),
            expedited_capacity: None,
            expedited_retrieval_delay_secs: default_expedited_delay(),
            standard_retrieval_delay_secs: default_standard_delay(),
            request_queue: default_request_queue(),
            execution_queue: default_execution_queue(),
            notify_queue: default_notify_queue(),
            archive_queue: default_archive_queue(),
            upgrade_queue: default_upgrade_queue(),
            restore_queue: default_restore_queue(),
            queue_max_messages: default_max_messages(),
            queue_wait_time_secs: default_wait_time(),
            visibility_timeout_secs: default_visibility_timeout(),
            queue_poll_interval_ms: default_poll_interval(),
            max_receive_count: None,
            annotator_command: default_annotator_command(),
            staging_dir: default_staging_dir(),
            max_concurrent_executions: default_max_concurrent_executions(),
            execution_timeout_secs: None,
            mail_default_sender: default_mail_sender(),
            job_detail_url_base: default_job_detail_url_base(),
            display_time_zone: default_time_zone(),
            mail_webhook_url: None,
        }
    }
}

impl AppConfig {
    /// Queues subscribed to the job results topic.
    pub fn result_subscribers(&self) -> Vec<String> {
        vec![self.notify_queue.clone(), self.archive_queue.clone()]
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
