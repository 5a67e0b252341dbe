//! Message envelope and its side-table metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{QueueError, QueueResult};
use crate::policy::FailureReason;

/// Envelope stored in the backing store while a message is queued or in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier
    pub id: String,

    /// Logical queue name
    pub queue_name: String,

    /// Serialized body, opaque to the engine
    pub payload: String,

    /// Failed delivery attempts so far
    #[serde(default)]
    pub retry_count: u32,

    /// Per-message override of the queue's retry limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Original submission time
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,

    /// Time the message becomes eligible for delivery
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scheduled_at: DateTime<Utc>,

    /// Last failure, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Message {
    /// Create a message that is eligible immediately.
    pub fn new(queue_name: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            payload: payload.into(),
            retry_count: 0,
            max_retries: None,
            enqueued_at: now,
            scheduled_at: now,
            failure: None,
        }
    }

    /// Serialize a value as the payload.
    pub fn json<T: Serialize>(queue_name: impl Into<String>, value: &T) -> QueueResult<Self> {
        Ok(Self::new(queue_name, serde_json::to_string(value)?))
    }

    /// Use a producer-chosen id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the queue's retry limit for this message.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Schedule delivery at a specific time.
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = at;
        self
    }

    /// Schedule delivery after a delay from now.
    pub fn schedule_after(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let at = Utc::now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule_at(at)
    }

    /// Whether the message is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at <= now
    }

    /// Due time in epoch milliseconds, the score used by the delayed set.
    pub fn score(&self) -> i64 {
        self.scheduled_at.timestamp_millis()
    }

    /// Lookup key suffix of the metadata entry for this message.
    pub fn metadata_ref(&self) -> &str {
        &self.id
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, reason: FailureReason, detail: Option<&str>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.failure = Some(match detail {
            Some(detail) => format!("{}: {}", reason, detail),
            None => reason.to_string(),
        });
    }

    /// Serialize the envelope.
    pub fn encode(&self) -> QueueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an envelope.
    pub fn decode(raw: &str) -> QueueResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Decode the payload as JSON.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> QueueResult<T> {
        serde_json::from_str(&self.payload).map_err(|e| {
            QueueError::Serialization(format!("payload of message {}: {}", self.id, e))
        })
    }
}

/// A message claimed from a ready list, together with the exact stored form
/// and the visibility deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Encoded envelope exactly as stored in the processing set
    pub raw: String,
    /// Deadline after which the enforcer may reclaim the message
    pub deadline: DateTime<Utc>,
}

impl Delivery {
    /// Create a delivery.
    pub fn new(raw: impl Into<String>, deadline: DateTime<Utc>) -> Self {
        Self {
            raw: raw.into(),
            deadline,
        }
    }

    /// Decode the envelope.
    pub fn message(&self) -> QueueResult<Message> {
        Message::decode(&self.raw)
    }
}

/// Outcome of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Handler succeeded.
    Succeeded,
    /// Handler failed and the message was requeued.
    Retried,
    /// Handler failed and the message was dead-lettered.
    DeadLettered,
    /// Handler failed and the message was dropped.
    Discarded,
    /// Soft-deleted message acknowledged without running the handler.
    Skipped,
}

/// Summary of the most recent delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    /// 1-based attempt number
    pub attempt: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Per-message side-table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub queue_name: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<ExecutionSummary>,
}

impl MessageMetadata {
    /// Fresh metadata for a message.
    pub fn new(id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            deleted: false,
            deleted_at: None,
            last_execution: None,
        }
    }

    /// Mark the message as deleted.
    pub fn mark_deleted(&mut self) {
        if !self.deleted {
            self.deleted = true;
            self.deleted_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let message = Message::new("emails", r#"{"to":"user@example.com"}"#);

        assert_eq!(message.queue_name, "emails");
        assert_eq!(message.retry_count, 0);
        assert!(message.max_retries.is_none());
        assert_eq!(message.enqueued_at, message.scheduled_at);
        assert!(Uuid::parse_str(&message.id).is_ok());
        assert_eq!(message.metadata_ref(), message.id);
    }

    #[test]
    fn test_message_scheduling() {
        let message = Message::new("emails", "{}").schedule_after(Duration::from_secs(600));
        assert!(!message.is_due(Utc::now()));
        assert!(message.is_due(Utc::now() + chrono::Duration::minutes(11)));
    }

    #[test]
    fn test_envelope_uses_epoch_millis() {
        let message = Message::new("emails", "{}").with_id("m-1");
        let value: serde_json::Value = serde_json::from_str(&message.encode().unwrap()).unwrap();

        assert_eq!(value["id"], "m-1");
        assert_eq!(value["enqueued_at"], json!(message.enqueued_at.timestamp_millis()));
        assert!(value.get("max_retries").is_none());
        assert!(value.get("failure").is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Message::decode("not json"),
            Err(QueueError::Serialization(_))
        ));
    }

    #[test]
    fn test_decode_payload() {
        #[derive(Deserialize)]
        struct Email {
            to: String,
        }

        let message = Message::json("emails", &json!({"to": "a@b.c"})).unwrap();
        let email: Email = message.decode_payload().unwrap();
        assert_eq!(email.to, "a@b.c");

        let bad = Message::new("emails", "[1,2]");
        assert!(bad.decode_payload::<Email>().is_err());
    }

    #[test]
    fn test_record_failure() {
        let mut message = Message::new("emails", "{}");
        message.record_failure(FailureReason::Handler, Some("smtp down"));
        message.record_failure(FailureReason::Timeout, None);

        assert_eq!(message.retry_count, 2);
        assert_eq!(message.failure.as_deref(), Some("visibility timeout"));
    }

    #[test]
    fn test_metadata_soft_delete() {
        let mut meta = MessageMetadata::new("m-1", "emails");
        meta.mark_deleted();
        let first = meta.deleted_at;
        meta.mark_deleted();

        assert!(meta.deleted);
        assert_eq!(meta.deleted_at, first);

        let decoded: MessageMetadata =
            serde_json::from_str(&serde_json::to_string(&meta).unwrap()).unwrap();
        assert!(decoded.deleted);
        assert_eq!(
            decoded.deleted_at.map(|t| t.timestamp_millis()),
            first.map(|t| t.timestamp_millis())
        );
    }
}
