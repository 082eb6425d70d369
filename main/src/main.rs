use common::utils::config::get_config;
use job_pipeline::{install_shutdown_handler, run_roles, Role, WorkerContext};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    let ctx = WorkerContext::connect(config).await?;
    let shutdown = install_shutdown_handler()?;

    info!("running every worker role in one process");
    run_roles(ctx, &Role::ALL, shutdown).await?;

    info!("all workers stopped");
    Ok(())
}
