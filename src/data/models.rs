//! Data models
//!
//! Rust structs representing stored federation entities.
//! All models use ULID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known collection addressing everyone
pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A local actor
///
/// The private key is only ever held encrypted; see
/// [`crate::federation::decrypt_private_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    /// ActivityPub IRI (globally unique)
    pub iri: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub inbox_iri: String,
    pub outbox_iri: String,
    pub followers_iri: String,
    pub following_iri: String,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key, AES-256-GCM encrypted and base64 encoded
    #[serde(skip_serializing)]
    pub encrypted_private_key: String,
    /// Actor IRIs muted by this actor
    pub muted_iris: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Actor {
    /// Key ID advertised in the actor document and used to sign requests
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.iri)
    }

    pub fn has_muted(&self, actor_iri: &str) -> bool {
        self.muted_iris.iter().any(|muted| muted == actor_iri)
    }
}

// =============================================================================
// Note
// =============================================================================

/// Who a locally authored note is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Followers,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Followers => "followers",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "public" => Some(Self::Public),
            "followers" => Some(Self::Followers),
            _ => None,
        }
    }
}

/// Media attached to a note
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub media_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    /// ActivityStreams object type for this media
    pub fn object_type(&self) -> &'static str {
        match self.media_type.split('/').next() {
            Some("image") => "Image",
            Some("video") => "Video",
            Some("audio") => "Audio",
            _ => "Document",
        }
    }
}

/// A note, local or received from a remote server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    /// ActivityPub IRI (globally unique)
    pub iri: String,
    pub author_iri: String,
    /// HTML content
    pub content: String,
    pub published: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub attachments: Vec<Attachment>,
    /// Denormalized number of stored replies
    pub reply_count: i64,
    /// true if authored on this instance
    pub is_local: bool,
}

/// Author fields denormalized next to a note
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NoteAuthor {
    pub note_iri: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

// =============================================================================
// Relationship edges
// =============================================================================

/// Follow edge, keyed by the Follow activity IRI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowEdge {
    pub activity_iri: String,
    pub follower_iri: String,
    pub followee_iri: String,
    pub created_at: DateTime<Utc>,
}

/// Like edge, keyed by the Like activity IRI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LikeEdge {
    pub activity_iri: String,
    pub actor_iri: String,
    pub note_iri: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Delivery queue
// =============================================================================

/// Delivery job state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Waiting for its next attempt
    Pending,
    /// Attempts exhausted
    Abandoned,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Abandoned => "abandoned",
        }
    }
}

/// One outbound activity bound for one inbox
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryJob {
    pub id: String,
    pub inbox_iri: String,
    /// Actor whose key signs the request
    pub signer_iri: String,
    /// Serialized activity JSON
    pub payload: String,
    /// Attempts made so far
    pub attempts: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub status: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(inbox_iri: String, signer_iri: String, payload: String) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new().0,
            inbox_iri,
            signer_iri,
            payload,
            attempts: 0,
            next_attempt_at: now,
            status: DeliveryStatus::Pending.as_str().to_string(),
            last_error: None,
            created_at: now,
        }
    }
}
