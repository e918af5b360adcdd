//! Activity model
//!
//! Inbound activities are parsed into a closed [`InboundActivity`] enum;
//! outbound activities are built as typed [`OutboundActivity`] envelopes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::data::{Attachment, Note};
use crate::error::AppError;

/// JSON-LD context for every outbound activity
pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Inbound activity types the dispatcher handles
pub const SUPPORTED_ACTIVITY_TYPES: [&str; 5] = ["Create", "Delete", "Follow", "Like", "Undo"];

/// First IRI found in an `id`-bearing value: a string, an object with
/// `id`, or a list of either.
pub fn first_iri(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(iri) => Some(iri.clone()),
        serde_json::Value::Object(map) => map.get("id").and_then(|id| id.as_str()).map(str::to_string),
        serde_json::Value::Array(items) => items.iter().find_map(first_iri),
        _ => None,
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<serde_json::Value>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values.iter().filter_map(first_iri).collect(),
    })
}

// =============================================================================
// Inbound
// =============================================================================

/// `actor` or `object` as sent: a bare IRI or an inline object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Iri(String),
    Object(Box<InlineObject>),
}

impl ObjectRef {
    pub fn iri(&self) -> Option<&str> {
        match self {
            Self::Iri(iri) => Some(iri),
            Self::Object(object) => object.id.as_deref(),
        }
    }

    pub fn inline(&self) -> Option<&InlineObject> {
        match self {
            Self::Iri(_) => None,
            Self::Object(object) => Some(object),
        }
    }
}

/// Inline object, covering the shapes the dispatcher reads: Note,
/// Tombstone, an embedded Follow/Like, or an actor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub object: Option<ObjectRef>,
    #[serde(default)]
    pub attributed_to: Option<serde_json::Value>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub in_reply_to: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub attachment: Option<serde_json::Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub icon: Option<serde_json::Value>,
}

impl InlineObject {
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_deref() == Some(kind)
    }

    pub fn attributed_to_iri(&self) -> Option<String> {
        self.attributed_to.as_ref().and_then(first_iri)
    }

    pub fn in_reply_to_iri(&self) -> Option<String> {
        self.in_reply_to.as_ref().and_then(first_iri)
    }

    /// Attachments in document order; entries without a URL are dropped.
    pub fn attachments(&self) -> Vec<Attachment> {
        let items = match &self.attachment {
            Some(serde_json::Value::Array(items)) => items.clone(),
            Some(item @ serde_json::Value::Object(_)) => vec![item.clone()],
            _ => Vec::new(),
        };

        items
            .iter()
            .filter_map(|item| {
                let url = match item.get("url")? {
                    serde_json::Value::String(url) => url.clone(),
                    other => other.get("href")?.as_str()?.to_string(),
                };
                Some(Attachment {
                    media_type: item
                        .get("mediaType")
                        .and_then(|v| v.as_str())
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    url,
                    width: item.get("width").and_then(|v| v.as_u64()).map(|v| v as u32),
                    height: item.get("height").and_then(|v| v.as_u64()).map(|v| v as u32),
                    name: item.get("name").and_then(|v| v.as_str()).map(str::to_string),
                })
            })
            .collect()
    }

    /// Avatar URL when this object is an actor
    pub fn icon_url(&self) -> Option<String> {
        fn url_of(value: &serde_json::Value) -> Option<String> {
            match value {
                serde_json::Value::String(url) => Some(url.clone()),
                serde_json::Value::Object(map) => map.get("url").and_then(url_of),
                serde_json::Value::Array(items) => items.iter().find_map(url_of),
                _ => None,
            }
        }
        self.icon.as_ref().and_then(url_of)
    }
}

/// Fields shared by every inbound activity
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityFields {
    #[serde(default)]
    pub id: Option<String>,
    pub actor: ObjectRef,
    pub object: ObjectRef,
}

/// Inbound activity, closed over the supported types
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundActivity {
    Follow(ActivityFields),
    Undo(ActivityFields),
    Like(ActivityFields),
    Create(ActivityFields),
    Delete(ActivityFields),
}

impl InboundActivity {
    /// Parse an inbound activity document.
    ///
    /// Unknown types are rejected with the supported set in the message.
    pub fn parse(document: &serde_json::Value) -> Result<Self, AppError> {
        let kind = document
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;

        if !SUPPORTED_ACTIVITY_TYPES.contains(&kind) {
            return Err(AppError::Validation(format!(
                "Unsupported activity type: {}; supported types are {}",
                kind,
                SUPPORTED_ACTIVITY_TYPES.join(", ")
            )));
        }

        Self::deserialize(document)
            .map_err(|e| AppError::Validation(format!("Malformed {} activity: {}", kind, e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Follow(_) => "Follow",
            Self::Undo(_) => "Undo",
            Self::Like(_) => "Like",
            Self::Create(_) => "Create",
            Self::Delete(_) => "Delete",
        }
    }

    pub fn fields(&self) -> &ActivityFields {
        match self {
            Self::Follow(fields)
            | Self::Undo(fields)
            | Self::Like(fields)
            | Self::Create(fields)
            | Self::Delete(fields) => fields,
        }
    }
}

/// Normalize the `actor` of a raw activity to an IRI.
pub fn actor_iri(document: &serde_json::Value) -> Result<String, AppError> {
    document
        .get("actor")
        .and_then(first_iri)
        .ok_or_else(|| AppError::Validation("Missing actor".to_string()))
}

// =============================================================================
// Outbound
// =============================================================================

/// Outbound activity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundKind {
    Create,
    Follow,
    Like,
    Undo,
    Delete,
    Accept,
}

impl OutboundKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Follow => "Follow",
            Self::Like => "Like",
            Self::Undo => "Undo",
            Self::Delete => "Delete",
            Self::Accept => "Accept",
        }
    }

    /// Path segment used in activity IRIs
    pub fn path_segment(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Follow => "follow",
            Self::Like => "like",
            Self::Undo => "undo",
            Self::Delete => "delete",
            Self::Accept => "accept",
        }
    }
}

/// Activity envelope sent to remote inboxes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundActivity {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    pub actor: String,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    pub object: OutboundObject,
}

/// Object carried by an outbound activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundObject {
    Note(NoteObject),
    Tombstone(TombstoneObject),
    /// Embedded activity, e.g. the Follow or Like inside an Undo
    Activity(Box<OutboundActivity>),
    Iri(String),
    /// Activity received from elsewhere, echoed back in an Accept
    Raw(serde_json::Value),
}

/// ActivityStreams Note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributed_to: String,
    pub content: String,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<AttachmentObject>,
}

impl From<&Note> for NoteObject {
    fn from(note: &Note) -> Self {
        Self {
            id: note.iri.clone(),
            kind: "Note".to_string(),
            attributed_to: note.author_iri.clone(),
            content: note.content.clone(),
            published: note.published,
            in_reply_to: note.in_reply_to.clone(),
            to: note.to.clone(),
            cc: note.cc.clone(),
            attachment: note.attachments.iter().map(AttachmentObject::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<&Attachment> for AttachmentObject {
    fn from(attachment: &Attachment) -> Self {
        Self {
            kind: attachment.object_type().to_string(),
            media_type: attachment.media_type.clone(),
            url: attachment.url.clone(),
            width: attachment.width,
            height: attachment.height,
            name: attachment.name.clone(),
        }
    }
}

/// Placeholder for a deleted Note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstoneObject {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub former_type: String,
}
