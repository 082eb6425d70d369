//! Typed payloads carried between workers.
//!
//! Every queue body is an envelope `{"kind": ..., "payload": ...}`. Decoding
//! checks the kind against the expected event type, so a message routed to
//! the wrong queue or a hand-written body fails as `MalformedMessage` instead
//! of half-deserializing.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::AppError;

pub trait QueueEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
}

#[derive(Deserialize)]
struct RawEnvelope {
    kind: String,
    payload: serde_json::Value,
}

pub fn encode<E: QueueEvent>(event: &E) -> Result<String, AppError> {
    Ok(serde_json::to_string(&serde_json::json!({
        "kind": E::KIND,
        "payload": event,
    }))?)
}

pub fn decode<E: QueueEvent>(body: &str) -> Result<E, AppError> {
    let envelope: RawEnvelope = serde_json::from_str(body)
        .map_err(|err| AppError::MalformedMessage(format!("invalid envelope: {err}")))?;

    if envelope.kind != E::KIND {
        return Err(AppError::MalformedMessage(format!(
            "expected {} event, got {}",
            E::KIND,
            envelope.kind
        )));
    }

    serde_json::from_value(envelope.payload)
        .map_err(|err| AppError::MalformedMessage(format!("invalid {} payload: {err}", E::KIND)))
}

/// A new job waiting to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionEvent {
    pub job_id: String,
    pub user_id: String,
    #[serde(rename = "s3_inputs_bucket")]
    pub inputs_bucket: String,
    #[serde(rename = "s3_key_input_file")]
    pub input_key: String,
    pub input_file_name: String,
}

impl QueueEvent for SubmissionEvent {
    const KIND: &'static str = "job_submitted";
}

/// The annotator exited successfully; its outputs sit next to `staged_input`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFinished {
    pub job_id: String,
    pub user_id: String,
    pub staged_input: PathBuf,
}

impl QueueEvent for ExecutionFinished {
    const KIND: &'static str = "execution_finished";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: String,
    pub user_id: String,
    pub complete_time: DateTime<Utc>,
}

impl QueueEvent for CompletionEvent {
    const KIND: &'static str = "job_completed";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeEvent {
    pub user_id: String,
}

impl QueueEvent for UpgradeEvent {
    const KIND: &'static str = "user_upgraded";
}

/// Ask the cold tier to bring one archived result back. Passed directly to
/// the vault, never queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub job_id: String,
    pub archive_reference: String,
}

/// Sent by the cold tier once a retrieval's output can be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreCompletionEvent {
    pub archive_reference: String,
    pub job_id: String,
    pub retrieval_job_id: String,
}

impl QueueEvent for RestoreCompletionEvent {
    const KIND: &'static str = "restore_completed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_keeps_wire_field_names() {
        let event = SubmissionEvent {
            job_id: "j1".into(),
            user_id: "u1".into(),
            inputs_bucket: "inputs".into(),
            input_key: "gas/u1/j1~a.vcf".into(),
            input_file_name: "a.vcf".into(),
        };

        let body = encode(&event).expect("encode");
        let value: serde_json::Value = serde_json::from_str(&body).expect("json");

        assert_eq!(value["kind"], "job_submitted");
        assert_eq!(value["payload"]["s3_inputs_bucket"], "inputs");
        assert_eq!(value["payload"]["s3_key_input_file"], "gas/u1/j1~a.vcf");
        assert_eq!(decode::<SubmissionEvent>(&body).expect("decode"), event);
    }

    #[test]
    fn test_decode_rejects_wrong_kind() {
        let body = encode(&UpgradeEvent {
            user_id: "u1".into(),
        })
        .expect("encode");

        let err = decode::<CompletionEvent>(&body).expect_err("wrong kind");
        assert!(matches!(err, AppError::MalformedMessage(_)));
    }

    #[test]
    fn test_decode_rejects_garbage_and_missing_fields() {
        assert!(matches!(
            decode::<UpgradeEvent>("not json"),
            Err(AppError::MalformedMessage(_))
        ));
        assert!(matches!(
            decode::<RestoreCompletionEvent>(r#"{"kind":"restore_completed","payload":{"job_id":"j"}}"#),
            Err(AppError::MalformedMessage(_))
        ));
    }
}
