#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod archiver;
pub mod completion;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod notifier;
pub mod restore_completion;
pub mod restorer;
pub mod runtime;
pub mod submission;

pub use consumer::{ConsumerSettings, Delivery, MessageHandler, MessageOutcome, QueueConsumer};
pub use context::WorkerContext;
pub use runtime::{install_shutdown_handler, run_roles, Role};
