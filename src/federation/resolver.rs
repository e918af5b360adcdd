//! Actor resolution
//!
//! Resolves actors and their inboxes and keys, locally through the store
//! and remotely by dereferencing actor documents.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::key_cache::PublicKeyCache;
use super::signature::{extract_actor_domain, validate_resolved_host_ips};
use crate::config::AppConfig;
use crate::data::{Actor, RelationshipStore};
use crate::error::AppError;

/// Accept header for dereferencing ActivityPub objects
pub const ACTIVITY_STREAMS_ACCEPT: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Remote actor document, reduced to the fields federation uses
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteActor {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub outbox: Option<String>,
    #[serde(default)]
    pub followers: Option<String>,
    #[serde(default)]
    pub following: Option<String>,
    #[serde(default)]
    pub icon: Option<serde_json::Value>,
    #[serde(default)]
    pub public_key: Option<RemotePublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePublicKey {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub public_key_pem: String,
}

impl RemoteActor {
    /// Avatar URL from `icon`, which may be an Image, a URL or a list of either
    pub fn avatar_url(&self) -> Option<String> {
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

    pub fn display_name(&self) -> Option<String> {
        self.name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.preferred_username.clone())
    }
}

/// Actor resolver
///
/// Shared by the dispatcher (key lookup), the delivery engine (inbox
/// lookup) and the services.
pub struct ActorResolver {
    store: Arc<dyn RelationshipStore>,
    http_client: reqwest::Client,
    key_cache: PublicKeyCache,
    base_url: String,
    allow_private_hosts: bool,
}

impl ActorResolver {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        http_client: reqwest::Client,
        base_url: String,
        allow_private_hosts: bool,
        key_ttl: Duration,
    ) -> Self {
        Self {
            store,
            http_client,
            key_cache: PublicKeyCache::new(key_ttl),
            base_url: base_url.trim_end_matches('/').to_string(),
            allow_private_hosts,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn RelationshipStore>,
        http_client: reqwest::Client,
    ) -> Self {
        Self::new(
            store,
            http_client,
            config.server.base_url(),
            config.federation.allow_private_hosts,
            Duration::from_secs(config.federation.public_key_ttl_seconds),
        )
    }

    pub fn store(&self) -> &Arc<dyn RelationshipStore> {
        &self.store
    }

    /// Whether an IRI lives on this instance
    pub fn is_local(&self, iri: &str) -> bool {
        iri.strip_prefix(&self.base_url)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || rest.starts_with('#'))
    }

    // =========================================================================
    // Local lookups
    // =========================================================================

    pub async fn local_actor_by_iri(&self, iri: &str) -> Result<Option<Actor>, AppError> {
        self.store.get_actor_by_iri(iri).await
    }

    pub async fn local_actor_by_user_id(&self, id: &str) -> Result<Option<Actor>, AppError> {
        self.store.get_actor_by_user_id(id).await
    }

    pub async fn local_actor_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Actor>, AppError> {
        self.store.get_actor_by_username(username).await
    }

    // =========================================================================
    // Remote lookups
    // =========================================================================

    /// Inbox IRI for an actor, or None if it cannot be determined.
    ///
    /// Local actors resolve to `<actor>/inbox` without a network call.
    pub async fn fetch_inbox(&self, actor_iri: &str) -> Option<String> {
        if self.is_local(actor_iri) {
            return Some(format!("{}/inbox", actor_iri.trim_end_matches('/')));
        }

        match self.fetch_actor(actor_iri).await {
            Ok(actor) => Some(actor.inbox),
            Err(error) => {
                tracing::warn!(actor = %actor_iri, %error, "Could not resolve inbox");
                None
            }
        }
    }

    /// Dereference a remote actor document.
    pub async fn fetch_actor(&self, actor_iri: &str) -> Result<RemoteActor, AppError> {
        let document = self.fetch_object(actor_iri).await?;
        serde_json::from_value(document)
            .map_err(|e| AppError::Federation(format!("Failed to parse actor: {}", e)))
    }

    /// Dereference any ActivityPub object as raw JSON.
    pub async fn fetch_object(&self, iri: &str) -> Result<serde_json::Value, AppError> {
        let url = self.guard_url(iri).await?;

        let started = Instant::now();
        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::ACCEPT, ACTIVITY_STREAMS_ACCEPT)
            .send()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to fetch {}: {}", iri, e)))?;
        crate::metrics::FEDERATION_REQUEST_DURATION_SECONDS
            .with_label_values(&["fetch"])
            .observe(started.elapsed().as_secs_f64());

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Failed to fetch {}: HTTP {}",
                iri,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", iri, e)))
    }

    /// Author IRI of a note, from the store or by fetching the note.
    pub async fn note_author(&self, note_iri: &str) -> Option<String> {
        match self.store.get_note_by_iri(note_iri).await {
            Ok(Some(note)) => return Some(note.author_iri),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(note = %note_iri, %error, "Note lookup failed");
                return None;
            }
        }

        if self.is_local(note_iri) {
            return None;
        }

        match self.fetch_object(note_iri).await {
            Ok(document) => document
                .get("attributedTo")
                .and_then(super::activity::first_iri),
            Err(error) => {
                tracing::warn!(note = %note_iri, %error, "Could not fetch reply target");
                None
            }
        }
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Public key PEM for a keyId.
    ///
    /// # Errors
    /// Any failure, network included, is `PublicKeyFetchFailed`.
    pub async fn public_key(&self, key_id: &str) -> Result<String, AppError> {
        let actor_iri = key_id.split('#').next().unwrap_or(key_id);

        if self.is_local(actor_iri) {
            return match self.store.get_actor_by_iri(actor_iri).await {
                Ok(Some(actor)) => Ok(actor.public_key_pem),
                Ok(None) => Err(AppError::PublicKeyFetchFailed(format!(
                    "Unknown local actor {}",
                    actor_iri
                ))),
                Err(e) => Err(AppError::PublicKeyFetchFailed(e.to_string())),
            };
        }

        self.key_cache
            .get_or_fetch(key_id, || self.fetch_public_key(key_id, actor_iri))
            .await
    }

    pub async fn invalidate_key(&self, key_id: &str) {
        self.key_cache.invalidate(key_id).await;
    }

    async fn fetch_public_key(&self, key_id: &str, actor_iri: &str) -> Result<String, AppError> {
        let actor = self
            .fetch_actor(actor_iri)
            .await
            .map_err(|e| AppError::PublicKeyFetchFailed(e.to_string()))?;

        let public_key = actor.public_key.ok_or_else(|| {
            AppError::PublicKeyFetchFailed("Missing publicKey in actor".to_string())
        })?;

        // A fragment keyId must be exactly the advertised key.
        if key_id.contains('#') && public_key.id != key_id {
            return Err(AppError::PublicKeyFetchFailed(
                "Signature keyId does not match actor public key id".to_string(),
            ));
        }

        Ok(public_key.public_key_pem)
    }

    async fn guard_url(&self, iri: &str) -> Result<url::Url, AppError> {
        let url = url::Url::parse(iri)
            .map_err(|e| AppError::Validation(format!("Invalid IRI {}: {}", iri, e)))?;

        if self.allow_private_hosts {
            return Ok(url);
        }

        let host = extract_actor_domain(iri)?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AppError::Validation("Missing port in actor URL".to_string()))?;
        // Resolve before fetching so public-looking names that point inside are refused.
        validate_resolved_host_ips(&host, port).await?;

        Ok(url)
    }
}
