use chrono::Duration as ChronoDuration;
use uuid::Uuid;

use crate::stored_object;

stored_object!(QueueMessage, "queue_message", {
    queue: String,
    body: String,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    visible_at: chrono::DateTime<chrono::Utc>,
    receive_count: u32,
    #[serde(default)]
    lease_token: Option<String>
});

impl QueueMessage {
    pub fn new(queue: String, body: String, delay: std::time::Duration) -> Self {
        let now = chrono::Utc::now();
        let delay = ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());

        Self {
            id: Uuid::new_v4().to_string(),
            queue,
            body,
            visible_at: now + delay,
            receive_count: 0,
            lease_token: None,
            created_at: now,
            updated_at: now,
        }
    }
}
