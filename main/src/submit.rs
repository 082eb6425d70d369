//! Submit one input file: `submit <user_id> <path>`.

use std::path::Path;

use bytes::Bytes;
use common::utils::config::get_config;
use job_pipeline::{submission::submit_job, WorkerContext};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let mut args = std::env::args().skip(1);
    let (Some(user_id), Some(path)) = (args.next(), args.next()) else {
        return Err("usage: submit <user_id> <path>".into());
    };

    let file_name = Path::new(&path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or("input path has no file name")?
        .to_string();
    let data = tokio::fs::read(&path).await?;

    let config = get_config()?;
    let ctx = WorkerContext::connect(config).await?;
    let job = submit_job(&ctx, &user_id, &file_name, Bytes::from(data)).await?;

    println!("{}", job.id);
    Ok(())
}
