use std::{fmt, str::FromStr, sync::Arc};

use common::error::AppError;
use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    archiver::Archiver,
    completion::CompletionHandler,
    consumer::{ConsumerSettings, MessageHandler, QueueConsumer},
    context::WorkerContext,
    dispatcher::Dispatcher,
    executor::{ExecutorSettings, LocalExecutor},
    notifier::Notifier,
    restore_completion::RestoreCompletionHandler,
    restorer::Restorer,
};

/// Worker roles a process can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dispatcher, local executor and execution completion handler.
    Annotator,
    Notify,
    Archive,
    /// Restorer and restore completion handler.
    Thaw,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Annotator, Role::Notify, Role::Archive, Role::Thaw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Annotator => "annotator",
            Role::Notify => "notify",
            Role::Archive => "archive",
            Role::Thaw => "thaw",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == value.trim())
            .ok_or_else(|| AppError::Validation(format!("unknown worker role {value:?}")))
    }
}

/// Cancel the returned token on SIGTERM or SIGINT.
pub fn install_shutdown_handler() -> Result<CancellationToken, AppError> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
        }
        cancel.cancel();
    });

    Ok(token)
}

/// Run the roles until shutdown. Returns after every loop has stopped.
pub async fn run_roles(
    ctx: WorkerContext,
    roles: &[Role],
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let mut tasks = JoinSet::new();
    for role in roles {
        info!(%role, "starting role");
        spawn_role(&mut tasks, &ctx, *role, &shutdown)?;
    }

    while let Some(joined) = tasks.join_next().await {
        joined?;
    }
    Ok(())
}

fn spawn_role(
    tasks: &mut JoinSet<()>,
    ctx: &WorkerContext,
    role: Role,
    shutdown: &CancellationToken,
) -> Result<(), AppError> {
    let config = Arc::clone(&ctx.config);
    match role {
        Role::Annotator => {
            let settings = ExecutorSettings::from_config(&config)?;
            let (executor, launcher) = LocalExecutor::new(settings, Arc::clone(&ctx.queue));
            tasks.spawn(executor.run(shutdown.clone()));

            spawn_consumer(
                tasks,
                ctx,
                &config.request_queue,
                Dispatcher::new(ctx.clone(), Arc::new(launcher)),
                shutdown,
            );
            spawn_consumer(
                tasks,
                ctx,
                &config.execution_queue,
                CompletionHandler::new(ctx.clone()),
                shutdown,
            );
        }
        Role::Notify => spawn_consumer(
            tasks,
            ctx,
            &config.notify_queue,
            Notifier::new(ctx.clone()),
            shutdown,
        ),
        Role::Archive => spawn_consumer(
            tasks,
            ctx,
            &config.archive_queue,
            Archiver::new(ctx.clone()),
            shutdown,
        ),
        Role::Thaw => {
            spawn_consumer(
                tasks,
                ctx,
                &config.upgrade_queue,
                Restorer::new(ctx.clone()),
                shutdown,
            );
            spawn_consumer(
                tasks,
                ctx,
                &config.restore_queue,
                RestoreCompletionHandler::new(ctx.clone()),
                shutdown,
            );
        }
    }
    Ok(())
}

fn spawn_consumer<H>(
    tasks: &mut JoinSet<()>,
    ctx: &WorkerContext,
    queue: &str,
    handler: H,
    shutdown: &CancellationToken,
) where
    H: MessageHandler + 'static,
{
    let consumer = QueueConsumer::new(
        Arc::clone(&ctx.queue),
        ConsumerSettings::from_config(queue, &ctx.config),
        Arc::new(handler),
    );
    let shutdown = shutdown.clone();
    tasks.spawn(async move { consumer.run(shutdown).await });
}
