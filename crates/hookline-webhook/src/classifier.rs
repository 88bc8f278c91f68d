//! Event classification and dedup identity
//!
//! Provider payload shapes overlap, so classification walks an explicit,
//! ordered rule list and the first rule that matches wins.

use crate::events::WebhookEventType;
use serde::Serialize;
use serde_json::Value;

/// Placeholder for missing identity components in a dedup key
pub const UNKNOWN_COMPONENT: &str = "unknown";

/// Minimal fields extracted from a classified delivery item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClassifiedEvent {
    pub event_type: WebhookEventType,
    pub object_type: Option<String>,
    pub object_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_username: Option<String>,
}

impl ClassifiedEvent {
    pub fn dedup_key(&self) -> String {
        derive_key(
            self.event_type,
            self.object_id.as_deref(),
            self.sender_id.as_deref(),
        )
    }
}

/// Classification rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationRule {
    /// `messages` field or `message` node
    Message,
    /// `media` node plus `comment_id`; story media makes it a story mention
    MediaMention,
    /// `comment_id`, bare or under a comments field
    Comment,
    /// `live_comments` field
    LiveComment,
}

/// Evaluation order. `MediaMention` refines `Comment` and must precede it.
pub const CLASSIFICATION_ORDER: [ClassificationRule; 4] = [
    ClassificationRule::Message,
    ClassificationRule::MediaMention,
    ClassificationRule::Comment,
    ClassificationRule::LiveComment,
];

impl ClassificationRule {
    fn apply(&self, node: &NodeView<'_>) -> Option<ClassifiedEvent> {
        match self {
            Self::Message => classify_message(node),
            Self::MediaMention => classify_media_mention(node),
            Self::Comment => classify_comment(node),
            Self::LiveComment => classify_live_comment(node),
        }
    }
}

/// A `messaging[]` item, or the `{field, value}` of a `changes[]` item
struct NodeView<'a> {
    field: Option<&'a str>,
    body: &'a Value,
}

impl<'a> NodeView<'a> {
    fn new(node: &'a Value) -> Self {
        match (node.get("field").and_then(Value::as_str), node.get("value")) {
            (Some(field), Some(value)) => Self {
                field: Some(field),
                body: value,
            },
            _ => Self {
                field: None,
                body: node,
            },
        }
    }

    fn has(&self, key: &str) -> bool {
        self.body.get(key).is_some_and(|v| !v.is_null())
    }
}

/// Classify one delivery item; `None` means the item is skipped
pub fn classify(node: &Value) -> Option<ClassifiedEvent> {
    let view = NodeView::new(node);
    CLASSIFICATION_ORDER.iter().find_map(|rule| rule.apply(&view))
}

/// Dedup identity: `{type}_{object_id|unknown}_{sender_id|unknown}`.
///
/// Carries no timestamp or content hash, so repeated actions on the same
/// object by the same sender share a key.
pub fn derive_key(
    event_type: WebhookEventType,
    object_id: Option<&str>,
    sender_id: Option<&str>,
) -> String {
    [
        event_type.as_str(),
        object_id.unwrap_or(UNKNOWN_COMPONENT),
        sender_id.unwrap_or(UNKNOWN_COMPONENT),
    ]
    .join("_")
}

fn classify_message(node: &NodeView<'_>) -> Option<ClassifiedEvent> {
    let first_message = node
        .body
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.first());

    if node.field != Some("messages") && first_message.is_none() && !node.has("message") {
        return None;
    }

    let object_id = first_message
        .and_then(|m| id_of(m, "id").or_else(|| id_of(m, "mid")))
        .or_else(|| node.body.get("message").and_then(|m| id_of(m, "mid")));

    let sender_id = node
        .body
        .get("sender")
        .and_then(|s| id_of(s, "id"))
        .or_else(|| first_message.and_then(|m| m.get("from")).and_then(sender_of));

    Some(ClassifiedEvent {
        event_type: WebhookEventType::Message,
        object_type: Some("message".to_string()),
        object_id,
        sender_id,
        sender_username: None,
    })
}

fn classify_media_mention(node: &NodeView<'_>) -> Option<ClassifiedEvent> {
    let media = node.body.get("media").filter(|m| m.is_object())?;
    let comment_id = id_of(node.body, "comment_id")?;

    let is_story = media
        .get("media_product_type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("STORY"));

    let (event_type, object_type) = if is_story {
        (WebhookEventType::StoryMention, "story")
    } else {
        (WebhookEventType::Mention, "media")
    };

    let from = node.body.get("from");
    Some(ClassifiedEvent {
        event_type,
        object_type: Some(object_type.to_string()),
        object_id: Some(comment_id),
        sender_id: from.and_then(sender_of),
        sender_username: from.and_then(username_of),
    })
}

fn classify_comment(node: &NodeView<'_>) -> Option<ClassifiedEvent> {
    let comment_id = id_of(node.body, "comment_id").or_else(|| {
        if node.field == Some("comments") {
            id_of(node.body, "id")
        } else {
            None
        }
    })?;

    let from = node.body.get("from");
    Some(ClassifiedEvent {
        event_type: WebhookEventType::Comment,
        object_type: Some("comment".to_string()),
        object_id: Some(comment_id),
        sender_id: from.and_then(sender_of),
        sender_username: from.and_then(username_of),
    })
}

fn classify_live_comment(node: &NodeView<'_>) -> Option<ClassifiedEvent> {
    if node.field != Some("live_comments") && !node.has("live_comments") {
        return None;
    }

    let body = node
        .body
        .get("live_comments")
        .filter(|v| v.is_object())
        .unwrap_or(node.body);

    let object_id = id_of(body, "video_id")
        .or_else(|| body.get("media").and_then(|m| id_of(m, "id")));

    let from = body.get("from");
    Some(ClassifiedEvent {
        event_type: WebhookEventType::LiveComment,
        object_type: Some("video".to_string()),
        object_id,
        sender_id: from.and_then(sender_of),
        sender_username: from.and_then(username_of),
    })
}

/// Provider ids arrive as strings or numbers
fn id_of(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `from` is either `{"id": ..}` or a bare id
fn sender_of(from: &Value) -> Option<String> {
    match from {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(_) => id_of(from, "id"),
        _ => None,
    }
}

fn username_of(from: &Value) -> Option<String> {
    from.get("username")
        .and_then(Value::as_str)
        .map(String::from)
}
