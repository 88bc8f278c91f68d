//! Webhook data model
//!
//! Durable records written by the ingestion pipeline: events, subscriptions
//! and the append-only diagnostic log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Semantic type of an inbound provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    Message,
    Comment,
    Mention,
    StoryMention,
    LiveComment,
}

impl WebhookEventType {
    pub const ALL: [WebhookEventType; 5] = [
        Self::Message,
        Self::Comment,
        Self::Mention,
        Self::StoryMention,
        Self::LiveComment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Comment => "comment",
            Self::Mention => "mention",
            Self::StoryMention => "story_mention",
            Self::LiveComment => "live_comment",
        }
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// Durable record of one provider delivery item (original or duplicate)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Internal identifier, assigned at persistence time
    pub id: String,
    pub event_type: WebhookEventType,
    /// Deduplication identity (suffixed for duplicate audit rows)
    pub dedup_key: String,
    /// Internal account, when the provider account could be resolved
    pub account_id: Option<String>,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_username: Option<String>,
    /// Raw JSON of the classified item, kept verbatim for audit and replay
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processing_attempts: u32,
    pub last_processing_error: Option<String>,
    pub is_duplicate: bool,
    pub duplicate_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    /// Unprocessed original whose attempts are below the retry ceiling
    pub fn is_retry_eligible(&self, max_attempts: u32) -> bool {
        !self.processed && !self.is_duplicate && self.processing_attempts < max_attempts
    }

    /// Unprocessed original that has used up its attempts
    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        !self.processed && !self.is_duplicate && self.processing_attempts >= max_attempts
    }
}

/// Insert shape for [`WebhookEvent`]; the store assigns id and timestamps
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_type: WebhookEventType,
    pub dedup_key: String,
    pub account_id: Option<String>,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_username: Option<String>,
    pub payload: serde_json::Value,
    pub is_duplicate: bool,
    pub duplicate_of: Option<String>,
}

impl NewWebhookEvent {
    /// Audit row for a redelivery of `original`.
    ///
    /// The key gets a receipt-time and random suffix so it collides neither
    /// with the original's key nor with another redelivery in the same
    /// millisecond.
    pub fn duplicate_of(
        original: &WebhookEvent,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: original.event_type,
            dedup_key: format!(
                "{}_dup_{}_{}",
                original.dedup_key,
                received_at.timestamp_millis(),
                Uuid::new_v4().simple()
            ),
            account_id: original.account_id.clone(),
            object_type: original.object_type.clone(),
            object_id: original.object_id.clone(),
            sender_id: original.sender_id.clone(),
            sender_username: original.sender_username.clone(),
            payload,
            is_duplicate: true,
            duplicate_of: Some(original.id.clone()),
        }
    }

    pub fn into_event(self, now: DateTime<Utc>) -> WebhookEvent {
        WebhookEvent {
            id: Uuid::new_v4().to_string(),
            event_type: self.event_type,
            dedup_key: self.dedup_key,
            account_id: self.account_id,
            object_type: self.object_type,
            object_id: self.object_id,
            sender_id: self.sender_id,
            sender_username: self.sender_username,
            payload: self.payload,
            processed: false,
            processing_attempts: 0,
            last_processing_error: None,
            is_duplicate: self.is_duplicate,
            duplicate_of: self.duplicate_of,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Webhook subscription for one connected provider account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub account_id: String,
    pub subscription_fields: BTreeSet<String>,
    pub callback_url: String,
    /// Shared with the provider for the handshake; never serialized back out
    #[serde(skip_serializing)]
    pub verify_token: String,
    pub is_active: bool,
    pub last_verified_at: Option<DateTime<Utc>>,
    pub last_event_received_at: Option<DateTime<Utc>>,
    pub events_received_count: u64,
    pub subscription_errors: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Severity of a [`WebhookLog`] row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Append-only diagnostic trail entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: String,
    pub event_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WebhookLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_id: None,
            level,
            message: message.into(),
            context: serde_json::Value::Object(Default::default()),
            created_at: Utc::now(),
        }
    }

    pub fn with_event(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}
