use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use common::{
    error::AppError,
    events::CompletionEvent,
    storage::types::user_profile::UserProfile,
    utils::mailer::EmailMessage,
};
use tracing::{info, warn};

use crate::{
    consumer::{Delivery, MessageHandler},
    context::WorkerContext,
};

const TIME_FORMAT: &str = "%Y-%m-%d @ %H:%M:%S";

pub struct Notifier {
    ctx: WorkerContext,
    time_zone: Tz,
}

impl Notifier {
    pub fn new(ctx: WorkerContext) -> Self {
        let time_zone = ctx.config.display_time_zone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                time_zone = %ctx.config.display_time_zone,
                "unknown display time zone; using UTC"
            );
            Tz::UTC
        });
        Self { ctx, time_zone }
    }

    pub fn compose(&self, event: &CompletionEvent, recipient: &str) -> EmailMessage {
        EmailMessage {
            to: recipient.to_string(),
            from: self.ctx.config.mail_default_sender.clone(),
            subject: format!("Results available for job {}", event.job_id),
            body: format!(
                "Your annotation job completed at {}.\n\nClick here to view job details and results: {}{}",
                format_completion_time(event.complete_time, self.time_zone),
                self.ctx.config.job_detail_url_base,
                event.job_id
            ),
        }
    }
}

fn format_completion_time(time: DateTime<Utc>, zone: Tz) -> String {
    time.with_timezone(&zone).format(TIME_FORMAT).to_string()
}

#[async_trait]
impl MessageHandler for Notifier {
    type Event = CompletionEvent;

    fn name(&self) -> &'static str {
        "notifier"
    }

    #[tracing::instrument(
        skip_all,
        fields(job_id = %delivery.event.job_id, user_id = %delivery.event.user_id)
    )]
    async fn handle(&self, delivery: Delivery<CompletionEvent>) -> Result<(), AppError> {
        let event = &delivery.event;
        let profile = UserProfile::require(&event.user_id, &self.ctx.db).await?;

        let message = self.compose(event, &profile.email);
        self.ctx.mailer.send(&message).await?;

        info!(to = %profile.email, "completion notice sent");
        Ok(())
    }
}
