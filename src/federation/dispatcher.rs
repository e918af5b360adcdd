//! Inbound activity dispatch
//!
//! Authenticates an inbox POST, then applies the activity's effect to the
//! store. Nothing is written before the signature verifies. Each effect
//! applies at most once; duplicates are rejected by the store's
//! uniqueness constraints and reported as 400.

use chrono::Utc;
use std::sync::Arc;

use super::activity::{ActivityFields, InboundActivity, InlineObject, ObjectRef, actor_iri};
use super::factory;
use super::resolver::ActorResolver;
use super::signature::{VerifiedSignature, verify_request};
use crate::data::{Actor, EntityId, FollowEdge, LikeEdge, Note, NoteAuthor, RelationshipStore};
use crate::error::AppError;

/// The parts of an inbox request the dispatcher needs
#[derive(Debug, Clone, Copy)]
pub struct InboxRequest<'a> {
    pub method: &'a str,
    /// Path and query, as signed
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

/// Whether a media-type header value names an ActivityPub JSON type
fn is_activity_media_type(value: &str) -> bool {
    value.split(',').any(|part| {
        let essence = part.split(';').next().unwrap_or("").trim();
        essence.eq_ignore_ascii_case("application/activity+json")
            || essence.eq_ignore_ascii_case("application/ld+json")
    })
}

/// `Accept` must declare an ActivityPub type; `Content-Type` is checked
/// when it does not.
fn check_media_type(headers: &http::HeaderMap) -> Result<(), AppError> {
    let declares = |name: http::header::HeaderName| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(is_activity_media_type)
    };

    if declares(http::header::ACCEPT) || declares(http::header::CONTENT_TYPE) {
        Ok(())
    } else {
        Err(AppError::Validation(
            "Request must declare application/activity+json".to_string(),
        ))
    }
}

fn required_id(fields: &ActivityFields, kind: &str) -> Result<String, AppError> {
    fields
        .id
        .clone()
        .ok_or_else(|| AppError::Validation(format!("Missing id in {}", kind)))
}

fn object_iri(object: &ObjectRef, kind: &str) -> Result<String, AppError> {
    object
        .iri()
        .map(str::to_string)
        .ok_or_else(|| AppError::Validation(format!("Missing object id in {}", kind)))
}

/// Activity dispatcher
pub struct ActivityDispatcher {
    store: Arc<dyn RelationshipStore>,
    resolver: Arc<ActorResolver>,
}

impl ActivityDispatcher {
    pub fn new(store: Arc<dyn RelationshipStore>, resolver: Arc<ActorResolver>) -> Self {
        Self { store, resolver }
    }

    /// Process one inbox POST addressed to `inbox_owner`.
    ///
    /// # Returns
    /// The Accept activity to return to the sender.
    ///
    /// # Errors
    /// 400 for malformed, unauthenticated, duplicate or unsupported
    /// activities; 404 when the target of a Like, Undo or Delete is unknown.
    pub async fn dispatch(
        &self,
        inbox_owner: &Actor,
        request: InboxRequest<'_>,
    ) -> Result<serde_json::Value, AppError> {
        let result = self.dispatch_inner(inbox_owner, request).await;

        let (kind, outcome) = match &result {
            Ok((kind, _)) => (*kind, "accepted"),
            Err(error) => ("unknown", error.status_and_type().1),
        };
        crate::metrics::ACTIVITIES_RECEIVED
            .with_label_values(&[kind, outcome])
            .inc();

        result.map(|(_, accept)| accept)
    }

    async fn dispatch_inner(
        &self,
        inbox_owner: &Actor,
        request: InboxRequest<'_>,
    ) -> Result<(&'static str, serde_json::Value), AppError> {
        check_media_type(request.headers)?;

        let document: serde_json::Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid JSON body: {}", e)))?;
        let claimed_actor = actor_iri(&document)?;

        let verified = verify_request(
            request.method,
            request.path,
            request.headers,
            request.body,
            &claimed_actor,
            &self.resolver,
        )
        .await?;

        let activity = InboundActivity::parse(&document)?;
        tracing::info!(
            activity_type = activity.kind(),
            activity_id = activity.fields().id.as_deref().unwrap_or(""),
            actor = %verified.actor_iri,
            inbox = %inbox_owner.iri,
            "Processing inbound activity"
        );

        match &activity {
            InboundActivity::Follow(fields) => self.handle_follow(fields, &verified).await?,
            InboundActivity::Create(fields) => self.handle_create(fields, &verified).await?,
            InboundActivity::Like(fields) => self.handle_like(fields, &verified).await?,
            InboundActivity::Undo(fields) => self.handle_undo(fields, &verified).await?,
            InboundActivity::Delete(fields) => self.handle_delete(fields, &verified).await?,
        }

        let accept = factory::accept(&inbox_owner.iri, document);
        let accept = serde_json::to_value(&accept).map_err(|e| AppError::Internal(e.into()))?;
        Ok((activity.kind(), accept))
    }

    // =========================================================================
    // Activity type handlers
    // =========================================================================

    async fn handle_follow(
        &self,
        fields: &ActivityFields,
        verified: &VerifiedSignature,
    ) -> Result<(), AppError> {
        let activity_iri = required_id(fields, "Follow")?;
        let target = object_iri(&fields.object, "Follow")?;

        let followee = self.store.get_actor_by_iri(&target).await?.ok_or_else(|| {
            AppError::Validation(format!("Follow target {} is not a local actor", target))
        })?;

        let edge = FollowEdge {
            activity_iri,
            follower_iri: verified.actor_iri.clone(),
            followee_iri: followee.iri.clone(),
            created_at: Utc::now(),
        };
        if !self.store.create_follow(&edge).await? {
            return Err(AppError::Duplicate(format!(
                "{} already follows {}",
                edge.follower_iri, edge.followee_iri
            )));
        }
        tracing::info!(follower = %edge.follower_iri, followee = %edge.followee_iri, "Follow stored");

        Ok(())
    }

    async fn handle_create(
        &self,
        fields: &ActivityFields,
        verified: &VerifiedSignature,
    ) -> Result<(), AppError> {
        let object = match fields.object.inline() {
            Some(object) if object.is_kind("Note") => object,
            Some(object) => {
                return Err(AppError::Validation(format!(
                    "Unsupported object type: {}",
                    object.kind.as_deref().unwrap_or("none")
                )));
            }
            None => {
                return Err(AppError::Validation(
                    "Unsupported object type: Create must embed the object".to_string(),
                ));
            }
        };

        let note_iri = object
            .id
            .clone()
            .ok_or_else(|| AppError::Validation("Missing id in Note".to_string()))?;

        if let Some(author) = object.attributed_to_iri() {
            if author != verified.actor_iri {
                return Err(AppError::Validation(format!(
                    "Note attributedTo {} does not match actor {}",
                    author, verified.actor_iri
                )));
            }
        }

        if self.store.get_note_by_iri(&note_iri).await?.is_some() {
            return Err(AppError::Duplicate(format!("Note {} already exists", note_iri)));
        }

        let note = Note {
            id: EntityId::new().0,
            iri: note_iri.clone(),
            author_iri: verified.actor_iri.clone(),
            content: ammonia::clean(object.content.as_deref().unwrap_or("")),
            published: object.published.unwrap_or_else(Utc::now),
            in_reply_to: object.in_reply_to_iri(),
            to: object.to.clone(),
            cc: object.cc.clone(),
            attachments: object.attachments(),
            reply_count: 0,
            is_local: false,
        };
        let author = self.note_author(&note_iri, &fields.actor, verified).await;

        if !self.store.create_note(&note, &author).await? {
            return Err(AppError::Duplicate(format!("Note {} already exists", note_iri)));
        }

        if let Some(parent) = &note.in_reply_to {
            if self.store.increment_reply_count(parent).await? {
                tracing::debug!(parent = %parent, "Reply count incremented");
            }
        }

        tracing::info!(note = %note_iri, author = %verified.actor_iri, "Note stored");
        Ok(())
    }

    /// Author display fields: the inline actor when present, otherwise the
    /// fetched actor document. Failure to fetch leaves them empty.
    async fn note_author(
        &self,
        note_iri: &str,
        actor: &ObjectRef,
        verified: &VerifiedSignature,
    ) -> NoteAuthor {
        if let Some(InlineObject {
            name,
            preferred_username,
            ..
        }) = actor.inline()
        {
            if name.is_some() || preferred_username.is_some() {
                return NoteAuthor {
                    note_iri: note_iri.to_string(),
                    display_name: name.clone().or_else(|| preferred_username.clone()),
                    avatar_url: actor.inline().and_then(InlineObject::icon_url),
                };
            }
        }

        match self.resolver.fetch_actor(&verified.actor_iri).await {
            Ok(remote) => NoteAuthor {
                note_iri: note_iri.to_string(),
                display_name: remote.display_name(),
                avatar_url: remote.avatar_url(),
            },
            Err(error) => {
                tracing::debug!(actor = %verified.actor_iri, %error, "Author profile unavailable");
                NoteAuthor {
                    note_iri: note_iri.to_string(),
                    ..NoteAuthor::default()
                }
            }
        }
    }

    async fn handle_like(
        &self,
        fields: &ActivityFields,
        verified: &VerifiedSignature,
    ) -> Result<(), AppError> {
        let activity_iri = required_id(fields, "Like")?;
        let note_iri = object_iri(&fields.object, "Like")?;

        if self.store.get_note_by_iri(&note_iri).await?.is_none() {
            return Err(AppError::NotFound(format!("Note {}", note_iri)));
        }

        let edge = LikeEdge {
            activity_iri,
            actor_iri: verified.actor_iri.clone(),
            note_iri,
            created_at: Utc::now(),
        };
        if !self.store.create_like(&edge).await? {
            return Err(AppError::Duplicate(format!(
                "{} already liked {}",
                edge.actor_iri, edge.note_iri
            )));
        }

        tracing::info!(actor = %edge.actor_iri, note = %edge.note_iri, "Like stored");
        Ok(())
    }

    async fn handle_undo(
        &self,
        fields: &ActivityFields,
        verified: &VerifiedSignature,
    ) -> Result<(), AppError> {
        match &fields.object {
            ObjectRef::Object(inner) if inner.is_kind("Follow") => {
                let follow_iri = inner
                    .id
                    .clone()
                    .ok_or_else(|| AppError::Validation("Missing id in undone Follow".to_string()))?;
                let followee = inner
                    .object
                    .as_ref()
                    .and_then(ObjectRef::iri)
                    .ok_or_else(|| {
                        AppError::Validation("Missing object in undone Follow".to_string())
                    })?;
                self.undo_follow(&follow_iri, &verified.actor_iri, followee)
                    .await
            }
            ObjectRef::Object(inner) if inner.is_kind("Like") => {
                let like_iri = inner
                    .id
                    .clone()
                    .ok_or_else(|| AppError::Validation("Missing id in undone Like".to_string()))?;
                self.undo_like(&like_iri, &verified.actor_iri).await
            }
            ObjectRef::Iri(activity_iri) => {
                if let Some(edge) = self.store.find_follow_by_activity(activity_iri).await? {
                    return self
                        .undo_follow(activity_iri, &verified.actor_iri, &edge.followee_iri)
                        .await;
                }
                if !self.store.find_likes_by_activity(activity_iri).await?.is_empty() {
                    return self.undo_like(activity_iri, &verified.actor_iri).await;
                }
                Err(AppError::NotFound(format!("Activity {}", activity_iri)))
            }
            ObjectRef::Object(inner) => Err(AppError::Validation(format!(
                "Unsupported Undo object type: {}",
                inner.kind.as_deref().unwrap_or("none")
            ))),
        }
    }

    async fn undo_follow(
        &self,
        follow_iri: &str,
        follower: &str,
        followee: &str,
    ) -> Result<(), AppError> {
        if !self
            .store
            .delete_follow(follow_iri, follower, followee)
            .await?
        {
            return Err(AppError::Validation(format!(
                "No Follow {} from {} to {}",
                follow_iri, follower, followee
            )));
        }
        tracing::info!(follower = %follower, followee = %followee, "Follow removed");
        Ok(())
    }

    async fn undo_like(&self, like_iri: &str, actor: &str) -> Result<(), AppError> {
        let likes = self.store.find_likes_by_activity(like_iri).await?;
        let like = match likes.as_slice() {
            [] => return Err(AppError::NotFound(format!("Like {}", like_iri))),
            [like] => like,
            _ => {
                return Err(AppError::Validation(format!(
                    "Ambiguous Like {}",
                    like_iri
                )));
            }
        };

        if like.actor_iri != actor {
            return Err(AppError::Validation(format!(
                "Like {} does not belong to {}",
                like_iri, actor
            )));
        }

        self.store.delete_like(like_iri).await?;
        tracing::info!(actor = %actor, note = %like.note_iri, "Like removed");
        Ok(())
    }

    async fn handle_delete(
        &self,
        fields: &ActivityFields,
        verified: &VerifiedSignature,
    ) -> Result<(), AppError> {
        let note_iri = object_iri(&fields.object, "Delete")?;

        let notes = self.store.find_notes_by_iri(&note_iri).await?;
        let note = match notes.as_slice() {
            [] => return Err(AppError::NotFound(format!("Note {}", note_iri))),
            [note] => note,
            _ => {
                return Err(AppError::Validation(format!(
                    "Ambiguous Note {}",
                    note_iri
                )));
            }
        };

        if note.author_iri != verified.actor_iri {
            return Err(AppError::Validation(format!(
                "{} is not the author of {}",
                verified.actor_iri, note_iri
            )));
        }

        self.store.delete_note(&note_iri).await?;
        tracing::info!(note = %note_iri, "Note deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue};

    #[test]
    fn media_type_accepts_activity_and_ld_json() {
        assert!(is_activity_media_type("application/activity+json"));
        assert!(is_activity_media_type(
            "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(is_activity_media_type("text/html, application/activity+json"));
        assert!(!is_activity_media_type("application/json"));
    }

    #[test]
    fn media_type_falls_back_to_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("*/*"));
        assert!(check_media_type(&headers).is_err());

        headers.insert(
            "content-type",
            HeaderValue::from_static("application/activity+json"),
        );
        assert!(check_media_type(&headers).is_ok());
    }
}
