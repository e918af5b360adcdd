//! Account service
//!
//! Registration and profile operations for local actors.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::data::{Actor, EntityId, RelationshipStore};
use crate::error::AppError;
use crate::federation::{ACTOR_KEY_BITS, encrypt_private_key, generate_keypair};

const MAX_USERNAME_LEN: usize = 30;

fn validate_username(username: &str) -> Result<(), AppError> {
    let valid_chars = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if username.is_empty() || username.len() > MAX_USERNAME_LEN || !valid_chars {
        return Err(AppError::Validation(format!(
            "username must be 1-{} characters of A-Z, a-z, 0-9 or _",
            MAX_USERNAME_LEN
        )));
    }
    Ok(())
}

fn normalize_optional_text(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Account service
pub struct AccountService {
    store: Arc<dyn RelationshipStore>,
    server: ServerConfig,
    key_encryption_key: Arc<Vec<u8>>,
    key_bits: usize,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        server: ServerConfig,
        key_encryption_key: Vec<u8>,
    ) -> Self {
        Self {
            store,
            server,
            key_encryption_key: Arc::new(key_encryption_key),
            key_bits: ACTOR_KEY_BITS,
        }
    }

    /// Override the RSA modulus size for new actors.
    pub fn with_key_bits(mut self, key_bits: usize) -> Self {
        self.key_bits = key_bits;
        self
    }

    /// Get a local actor by username
    pub async fn get(&self, username: &str) -> Result<Actor, AppError> {
        self.store
            .get_actor_by_username(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", username)))
    }

    /// Register a new local actor
    ///
    /// Generates an RSA key pair and stores the private half encrypted.
    ///
    /// # Errors
    /// `Validation` for a malformed username, `Duplicate` if it is taken
    pub async fn register(
        &self,
        username: &str,
        display_name: Option<&str>,
    ) -> Result<Actor, AppError> {
        let username = username.trim();
        validate_username(username)?;

        // Fast-path guard before expensive key generation.
        if self.store.get_actor_by_username(username).await?.is_some() {
            return Err(AppError::Duplicate(format!("username {} is taken", username)));
        }

        let key_bits = self.key_bits;
        let keypair = tokio::task::spawn_blocking(move || generate_keypair(key_bits))
            .await
            .map_err(|e| AppError::Internal(e.into()))??;
        let encrypted_private_key =
            encrypt_private_key(&self.key_encryption_key, &keypair.private_key_pem)?;

        let iri = self.server.actor_iri(username);
        let now = chrono::Utc::now();
        let actor = Actor {
            id: EntityId::new().0,
            username: username.to_string(),
            display_name: display_name
                .and_then(normalize_optional_text)
                .or_else(|| Some(username.to_string())),
            summary: None,
            avatar_url: None,
            inbox_iri: format!("{}/inbox", iri),
            outbox_iri: format!("{}/outbox", iri),
            followers_iri: format!("{}/followers", iri),
            following_iri: format!("{}/following", iri),
            iri,
            public_key_pem: keypair.public_key_pem,
            encrypted_private_key,
            muted_iris: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        if !self.store.insert_actor(&actor).await? {
            return Err(AppError::Duplicate(format!("username {} is taken", username)));
        }

        tracing::info!(actor = %actor.iri, "Registered actor");
        Ok(actor)
    }

    /// Update profile fields; `None` leaves a field as is.
    pub async fn update_profile(
        &self,
        username: &str,
        display_name: Option<&str>,
        summary: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<Actor, AppError> {
        let actor = self.get(username).await?;

        let display_name = display_name.and_then(normalize_optional_text);
        let summary = summary.map(|s| html_escape::encode_text(s.trim()).into_owned());
        let avatar_url = avatar_url.and_then(normalize_optional_text);
        if let Some(url) = &avatar_url {
            url::Url::parse(url)
                .map_err(|e| AppError::Validation(format!("Invalid avatar URL: {}", e)))?;
        }

        self.store
            .update_actor_profile(
                &actor.iri,
                display_name.as_deref(),
                summary.as_deref(),
                avatar_url.as_deref(),
            )
            .await?;

        self.get(username).await
    }

    /// Mute another actor
    pub async fn mute(&self, username: &str, target_iri: &str) -> Result<Actor, AppError> {
        let actor = self.get(username).await?;
        if actor.iri == target_iri {
            return Err(AppError::Validation("cannot mute yourself".to_string()));
        }
        if actor.has_muted(target_iri) {
            return Ok(actor);
        }

        let mut muted = actor.muted_iris.clone();
        muted.push(target_iri.to_string());
        self.store.set_muted_iris(&actor.iri, &muted).await?;
        self.get(username).await
    }

    /// Unmute another actor; unmuting an actor that is not muted is a no-op.
    pub async fn unmute(&self, username: &str, target_iri: &str) -> Result<Actor, AppError> {
        let actor = self.get(username).await?;
        if !actor.has_muted(target_iri) {
            return Ok(actor);
        }

        let muted: Vec<String> = actor
            .muted_iris
            .iter()
            .filter(|iri| iri.as_str() != target_iri)
            .cloned()
            .collect();
        self.store.set_muted_iris(&actor.iri, &muted).await?;
        self.get(username).await
    }

    /// Delete an account: its notes, then its edges, then the actor.
    ///
    /// # Returns
    /// Number of notes removed
    pub async fn delete_account(&self, username: &str) -> Result<u64, AppError> {
        let actor = self.get(username).await?;
        let removed = self
            .store
            .delete_actor_cascade(&actor.iri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", username)))?;

        tracing::info!(actor = %actor.iri, notes = removed, "Deleted account");
        Ok(removed)
    }
}
