//! Local execution of the annotator.
//!
//! The dispatcher hands an [`ExecutionRequest`] to the executor over a channel
//! and waits for the spawn acknowledgement. The executor supervises the child
//! and, on a clean exit, sends `ExecutionFinished` to the executions queue.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    events::ExecutionFinished,
    queue::{send_event, MessageQueue},
    utils::config::AppConfig,
};
use tokio::{
    process::{Child, Command},
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const LAUNCH_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub job_id: String,
    pub user_id: String,
    pub staged_input: PathBuf,
}

/// Starts an annotation run. Returns once the run was spawned, not when it ends.
#[async_trait]
pub trait ExecutionLauncher: Send + Sync {
    async fn launch(&self, request: ExecutionRequest) -> Result<(), AppError>;
}

struct LaunchCommand {
    request: ExecutionRequest,
    spawned: oneshot::Sender<Result<(), AppError>>,
}

/// Cloneable sender side of a [`LocalExecutor`].
#[derive(Clone)]
pub struct ExecutorHandle {
    sender: mpsc::Sender<LaunchCommand>,
}

#[async_trait]
impl ExecutionLauncher for ExecutorHandle {
    async fn launch(&self, request: ExecutionRequest) -> Result<(), AppError> {
        let (spawned, ack) = oneshot::channel();
        self.sender
            .send(LaunchCommand { request, spawned })
            .await
            .map_err(|_| AppError::Execution("executor is not running".into()))?;

        ack.await
            .map_err(|_| AppError::Execution("executor dropped the launch".into()))?
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub program: String,
    pub args: Vec<String>,
    pub max_concurrent: usize,
    pub timeout: Option<Duration>,
    pub execution_queue: String,
}

impl ExecutorSettings {
    /// Split `annotator_command` into program and leading arguments.
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let mut parts = config.annotator_command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| AppError::Validation("annotator_command is empty".into()))?;

        Ok(Self {
            program,
            args: parts.collect(),
            max_concurrent: config.max_concurrent_executions.max(1),
            timeout: config.execution_timeout_secs.map(Duration::from_secs),
            execution_queue: config.execution_queue.clone(),
        })
    }
}

pub struct LocalExecutor {
    settings: ExecutorSettings,
    queue: Arc<dyn MessageQueue>,
    permits: Arc<Semaphore>,
    receiver: mpsc::Receiver<LaunchCommand>,
}

impl LocalExecutor {
    pub fn new(settings: ExecutorSettings, queue: Arc<dyn MessageQueue>) -> (Self, ExecutorHandle) {
        let (sender, receiver) = mpsc::channel(LAUNCH_CHANNEL_CAPACITY);
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));

        (
            Self {
                settings,
                queue,
                permits,
                receiver,
            },
            ExecutorHandle { sender },
        )
    }

    /// Accept launches until cancelled or every handle is dropped. Runs already
    /// spawned keep being supervised in their own tasks.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            program = %self.settings.program,
            max_concurrent = self.settings.max_concurrent,
            "executor started"
        );

        loop {
            let command = tokio::select! {
                () = shutdown.cancelled() => break,
                command = self.receiver.recv() => command,
            };
            let Some(LaunchCommand { request, spawned }) = command else {
                break;
            };

            let permit = tokio::select! {
                () = shutdown.cancelled() => {
                    let _ = spawned.send(Err(AppError::Execution("executor shutting down".into())));
                    break;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                let _ = spawned.send(Err(AppError::Execution("executor closed".into())));
                break;
            };

            match self.spawn_child(&request) {
                Ok(child) => {
                    info!(job_id = %request.job_id, pid = child.id(), "annotator spawned");
                    let _ = spawned.send(Ok(()));
                    tokio::spawn(supervise(
                        child,
                        request,
                        permit,
                        self.settings.timeout,
                        Arc::clone(&self.queue),
                        self.settings.execution_queue.clone(),
                    ));
                }
                Err(err) => {
                    error!(job_id = %request.job_id, error = %err, "annotator failed to launch");
                    let _ = spawned.send(Err(err));
                }
            }
        }

        info!("executor stopped");
    }

    fn spawn_child(&self, request: &ExecutionRequest) -> Result<Child, AppError> {
        Command::new(&self.settings.program)
            .args(&self.settings.args)
            .arg(&request.staged_input)
            .arg(&request.job_id)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::Execution(format!(
                    "could not start {}: {err}",
                    self.settings.program
                ))
            })
    }
}

async fn supervise(
    mut child: Child,
    request: ExecutionRequest,
    _permit: OwnedSemaphorePermit,
    timeout: Option<Duration>,
    queue: Arc<dyn MessageQueue>,
    execution_queue: String,
) {
    let job_id = request.job_id.clone();
    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(%job_id, timeout_secs = limit.as_secs(), "annotator timed out; killing it");
                if let Err(err) = child.kill().await {
                    error!(%job_id, error = %err, "failed to kill annotator");
                }
                return;
            }
        },
        None => child.wait().await,
    };

    match status {
        Ok(status) if status.success() => {
            let finished = ExecutionFinished {
                job_id: request.job_id,
                user_id: request.user_id,
                staged_input: request.staged_input,
            };
            match send_event(queue.as_ref(), &execution_queue, &finished).await {
                Ok(_) => info!(%job_id, "annotation finished"),
                Err(err) => error!(%job_id, error = %err, "could not report finished annotation"),
            }
        }
        Ok(status) => {
            warn!(%job_id, code = ?status.code(), "annotator exited unsuccessfully; job stays RUNNING");
        }
        Err(err) => {
            error!(%job_id, error = %err, "lost track of annotator process");
        }
    }
}
