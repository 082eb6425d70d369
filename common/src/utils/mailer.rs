use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::{error::AppError, utils::config::AppConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Outbound notification channel.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), AppError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct TracingMailer;

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), AppError> {
        info!(
            to = %message.to,
            from = %message.from,
            subject = %message.subject,
            "email\n{}",
            message.body
        );
        Ok(())
    }
}

/// Posts each message as JSON to a mail relay.
#[derive(Debug, Clone)]
pub struct WebhookMailer {
    client: reqwest::Client,
    url: String,
}

impl WebhookMailer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), AppError> {
        self.client
            .post(&self.url)
            .json(message)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub fn mailer_from_config(config: &AppConfig) -> Arc<dyn Mailer> {
    match &config.mail_webhook_url {
        Some(url) => Arc::new(WebhookMailer::new(url.clone())),
        None => Arc::new(TracingMailer),
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every sent message; can be told to fail.
    #[derive(Debug, Default)]
    pub struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
        failing: std::sync::atomic::AtomicBool,
    }

    impl RecordingMailer {
        pub fn sent(&self) -> Vec<EmailMessage> {
            self.sent
                .lock()
                .map(|sent| sent.clone())
                .unwrap_or_default()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing
                .store(failing, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: &EmailMessage) -> Result<(), AppError> {
            if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AppError::Processing("mail relay unavailable".into()));
            }
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(message.clone());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingMailer;
    use super::*;

    fn message() -> EmailMessage {
        EmailMessage {
            to: "ada@example.com".into(),
            from: "noreply@gas.local".into(),
            subject: "Results available for job j1".into(),
            body: "done".into(),
        }
    }

    #[tokio::test]
    async fn test_recording_mailer_keeps_messages_and_can_fail() {
        let mailer = RecordingMailer::default();
        mailer.send(&message()).await.expect("send");
        assert_eq!(mailer.sent(), vec![message()]);

        mailer.set_failing(true);
        assert!(mailer.send(&message()).await.is_err());
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_tracing_mailer_is_default() {
        let config = AppConfig::default();
        let mailer = mailer_from_config(&config);
        mailer.send(&message()).await.expect("send");
    }
}
