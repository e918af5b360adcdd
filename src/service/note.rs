//! Note service
//!
//! Outbox side of federation: publishes notes, follows and likes on behalf
//! of local actors and hands the resulting activities to the delivery engine.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::data::{
    Actor, Attachment, EntityId, FollowEdge, LikeEdge, Note, NoteAuthor, RelationshipStore,
    Visibility,
};
use crate::error::AppError;
use crate::federation::factory::{self, NoteDraft};
use crate::federation::{
    ActorResolver, DeliveryEngine, DeliveryResult, OutboundActivity, OutboundKind,
};

/// Maximum note length in characters
pub const MAX_NOTE_CHARS: usize = 5000;

/// Outcome of a local action together with its background delivery.
///
/// Dropping `delivery` detaches it; awaiting it yields one result per inbox.
pub struct WithDelivery<T> {
    pub value: T,
    pub delivery: JoinHandle<Vec<DeliveryResult>>,
}

/// Input for [`NoteService::publish`]
#[derive(Debug, Clone, Default)]
pub struct PublishNote {
    /// Plain text; escaped into HTML
    pub content: String,
    /// "public" or "followers"
    pub visibility: String,
    pub in_reply_to: Option<String>,
    pub attachments: Vec<Attachment>,
}

fn render_content(text: &str) -> String {
    let escaped = html_escape::encode_text(text.trim());
    format!("<p>{}</p>", escaped.replace('\n', "<br>"))
}

/// Note service
pub struct NoteService {
    store: Arc<dyn RelationshipStore>,
    resolver: Arc<ActorResolver>,
    delivery: DeliveryEngine,
}

impl NoteService {
    pub fn new(
        store: Arc<dyn RelationshipStore>,
        resolver: Arc<ActorResolver>,
        delivery: DeliveryEngine,
    ) -> Self {
        Self {
            store,
            resolver,
            delivery,
        }
    }

    async fn local_actor(&self, username: &str) -> Result<Actor, AppError> {
        self.store
            .get_actor_by_username(username)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", username)))
    }

    fn no_delivery() -> JoinHandle<Vec<DeliveryResult>> {
        tokio::spawn(async { Vec::new() })
    }

    fn spawn_to_actor(
        &self,
        activity: OutboundActivity,
        signer: Actor,
        target: String,
    ) -> JoinHandle<Vec<DeliveryResult>> {
        let delivery = self.delivery.clone();
        tokio::spawn(async move { delivery.deliver_to_actor(&activity, &signer, &target).await })
    }

    /// Author of a note, local store first.
    async fn author_of(&self, note_iri: &str) -> Result<String, AppError> {
        self.resolver
            .note_author(note_iri)
            .await
            .ok_or_else(|| AppError::NotFound(format!("Note {}", note_iri)))
    }

    /// Publish a note and deliver its Create to followers.
    ///
    /// A reply is addressed to the parent's author and also delivered to
    /// that author's inbox.
    pub async fn publish(
        &self,
        username: &str,
        input: PublishNote,
    ) -> Result<WithDelivery<Note>, AppError> {
        let actor = self.local_actor(username).await?;

        if input.content.trim().is_empty() {
            return Err(AppError::Validation("Note content cannot be empty".to_string()));
        }
        if input.content.chars().count() > MAX_NOTE_CHARS {
            return Err(AppError::Validation(format!(
                "Note content exceeds {} characters",
                MAX_NOTE_CHARS
            )));
        }
        let visibility = Visibility::parse(&input.visibility).ok_or_else(|| {
            AppError::Validation(format!("Unknown visibility: {}", input.visibility))
        })?;
        for attachment in &input.attachments {
            url::Url::parse(&attachment.url)
                .map_err(|e| AppError::Validation(format!("Invalid attachment URL: {}", e)))?;
        }

        let reply_to_author = match input.in_reply_to.as_deref() {
            Some(parent) => {
                let author = self.resolver.note_author(parent).await;
                if author.is_none() {
                    tracing::warn!(parent = %parent, "Could not resolve reply parent author");
                }
                author
            }
            None => None,
        };

        let content = render_content(&input.content);
        let (note, create) = factory::create_note(
            EntityId::new(),
            NoteDraft {
                actor_iri: &actor.iri,
                followers_iri: &actor.followers_iri,
                content: &content,
                visibility,
                in_reply_to: input.in_reply_to.as_deref(),
                reply_to_author: reply_to_author.as_deref(),
                attachments: input.attachments,
            },
        );

        let author = NoteAuthor {
            note_iri: note.iri.clone(),
            display_name: actor.display_name.clone(),
            avatar_url: actor.avatar_url.clone(),
        };
        if !self.store.create_note(&note, &author).await? {
            return Err(AppError::Duplicate(format!("Note {} already exists", note.iri)));
        }
        if let Some(parent) = &note.in_reply_to {
            self.store.increment_reply_count(parent).await?;
        }
        tracing::info!(note = %note.iri, visibility = visibility.as_str(), "Published note");

        // Local parent authors already see the reply in the shared store.
        let remote_parent_author = reply_to_author.filter(|iri| !self.resolver.is_local(iri));
        let delivery = self.delivery.clone();
        let handle = tokio::spawn(async move {
            delivery
                .deliver_to_followers(&create, &actor, remote_parent_author.as_deref())
                .await
        });

        Ok(WithDelivery {
            value: note,
            delivery: handle,
        })
    }

    /// Delete one of the actor's own notes and deliver a Delete.
    pub async fn delete(
        &self,
        username: &str,
        note_iri: &str,
    ) -> Result<WithDelivery<()>, AppError> {
        let actor = self.local_actor(username).await?;
        let note = self
            .store
            .get_note_by_iri(note_iri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Note {}", note_iri)))?;
        if note.author_iri != actor.iri {
            return Err(AppError::Forbidden);
        }

        self.store.delete_note(&note.iri).await?;
        tracing::info!(note = %note.iri, "Deleted note");

        let activity = factory::delete(&actor.iri, &note);
        let delivery = self.delivery.clone();
        let handle =
            tokio::spawn(async move { delivery.deliver_to_followers(&activity, &actor, None).await });

        Ok(WithDelivery {
            value: (),
            delivery: handle,
        })
    }

    /// Follow an actor. Returns the Follow activity IRI.
    pub async fn follow(
        &self,
        username: &str,
        target_iri: &str,
    ) -> Result<WithDelivery<String>, AppError> {
        let actor = self.local_actor(username).await?;
        if actor.iri == target_iri {
            return Err(AppError::Validation("cannot follow yourself".to_string()));
        }
        if self.resolver.is_local(target_iri)
            && self.store.get_actor_by_iri(target_iri).await?.is_none()
        {
            return Err(AppError::NotFound(format!("Actor {}", target_iri)));
        }

        let edge = FollowEdge {
            activity_iri: factory::activity_iri(&actor.iri, OutboundKind::Follow),
            follower_iri: actor.iri.clone(),
            followee_iri: target_iri.to_string(),
            created_at: Utc::now(),
        };
        if !self.store.create_follow(&edge).await? {
            return Err(AppError::Duplicate(format!("Already following {}", target_iri)));
        }
        tracing::info!(follower = %actor.iri, followee = %target_iri, "Follow stored");

        let delivery = if self.resolver.is_local(target_iri) {
            Self::no_delivery()
        } else {
            let activity = factory::follow(edge.activity_iri.clone(), &actor.iri, target_iri);
            self.spawn_to_actor(activity, actor, target_iri.to_string())
        };

        Ok(WithDelivery {
            value: edge.activity_iri,
            delivery,
        })
    }

    /// Undo a follow.
    pub async fn unfollow(
        &self,
        username: &str,
        target_iri: &str,
    ) -> Result<WithDelivery<()>, AppError> {
        let actor = self.local_actor(username).await?;
        let edge = self
            .store
            .find_follow(&actor.iri, target_iri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Not following {}", target_iri)))?;

        self.store
            .delete_follow(&edge.activity_iri, &edge.follower_iri, &edge.followee_iri)
            .await?;
        tracing::info!(follower = %actor.iri, followee = %target_iri, "Follow removed");

        let delivery = if self.resolver.is_local(target_iri) {
            Self::no_delivery()
        } else {
            let inner = factory::follow(edge.activity_iri, &actor.iri, target_iri);
            let undo = factory::undo(&actor.iri, inner);
            self.spawn_to_actor(undo, actor, target_iri.to_string())
        };

        Ok(WithDelivery {
            value: (),
            delivery,
        })
    }

    /// Like a note. Returns the Like activity IRI.
    pub async fn like(
        &self,
        username: &str,
        note_iri: &str,
    ) -> Result<WithDelivery<String>, AppError> {
        let actor = self.local_actor(username).await?;
        let author = self.author_of(note_iri).await?;

        let edge = LikeEdge {
            activity_iri: factory::activity_iri(&actor.iri, OutboundKind::Like),
            actor_iri: actor.iri.clone(),
            note_iri: note_iri.to_string(),
            created_at: Utc::now(),
        };
        if !self.store.create_like(&edge).await? {
            return Err(AppError::Duplicate(format!("Already liked {}", note_iri)));
        }

        let delivery = if self.resolver.is_local(&author) {
            Self::no_delivery()
        } else {
            let activity = factory::like(edge.activity_iri.clone(), &actor.iri, note_iri, &author);
            self.spawn_to_actor(activity, actor, author)
        };

        Ok(WithDelivery {
            value: edge.activity_iri,
            delivery,
        })
    }

    /// Undo a like.
    pub async fn unlike(
        &self,
        username: &str,
        note_iri: &str,
    ) -> Result<WithDelivery<()>, AppError> {
        let actor = self.local_actor(username).await?;
        let edge = self
            .store
            .find_like(&actor.iri, note_iri)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Not liked: {}", note_iri)))?;
        let author = self.author_of(note_iri).await?;

        self.store.delete_like(&edge.activity_iri).await?;

        let delivery = if self.resolver.is_local(&author) {
            Self::no_delivery()
        } else {
            let inner = factory::like(edge.activity_iri, &actor.iri, note_iri, &author);
            let undo = factory::undo(&actor.iri, inner);
            self.spawn_to_actor(undo, actor, author)
        };

        Ok(WithDelivery {
            value: (),
            delivery,
        })
    }

    /// Search stored note content.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<Note>, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.store.search_notes(query, limit.clamp(1, 100)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::data::{Database, PUBLIC_COLLECTION};
    use crate::federation::{KEY_ENCRYPTION_KEY_BYTES, encrypt_private_key, generate_keypair};
    use tempfile::TempDir;

    const KEK: [u8; KEY_ENCRYPTION_KEY_BYTES] = [9; KEY_ENCRYPTION_KEY_BYTES];
    const BASE: &str = "https://local.example";

    struct Fixture {
        service: NoteService,
        store: Arc<Database>,
        _temp_dir: TempDir,
    }

    fn local_actor(username: &str) -> Actor {
        let keypair = generate_keypair(1024).unwrap();
        let iri = format!("{}/users/{}", BASE, username);
        let now = Utc::now();
        Actor {
            id: EntityId::new().0,
            username: username.to_string(),
            display_name: Some(username.to_string()),
            summary: None,
            avatar_url: None,
            inbox_iri: format!("{}/inbox", iri),
            outbox_iri: format!("{}/outbox", iri),
            followers_iri: format!("{}/followers", iri),
            following_iri: format!("{}/following", iri),
            iri,
            public_key_pem: keypair.public_key_pem,
            encrypted_private_key: encrypt_private_key(&KEK, &keypair.private_key_pem).unwrap(),
            muted_iris: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            Database::connect(&temp_dir.path().join("test.db"))
                .await
                .unwrap(),
        );
        let dyn_store: Arc<dyn RelationshipStore> = store.clone();
        let resolver = Arc::new(ActorResolver::new(
            dyn_store.clone(),
            reqwest::Client::new(),
            BASE.to_string(),
            false,
            std::time::Duration::from_secs(60),
        ));
        let delivery = DeliveryEngine::new(
            dyn_store.clone(),
            resolver.clone(),
            reqwest::Client::new(),
            DeliveryConfig::default(),
            KEK.to_vec(),
        );

        for username in ["alice", "bob"] {
            store.insert_actor(&local_actor(username)).await.unwrap();
        }

        Fixture {
            service: NoteService::new(dyn_store, resolver, delivery),
            store,
            _temp_dir: temp_dir,
        }
    }

    fn text(content: &str, visibility: &str) -> PublishNote {
        PublishNote {
            content: content.to_string(),
            visibility: visibility.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn content_is_escaped() {
        assert_eq!(
            render_content("<script>x</script>\nline"),
            "<p>&lt;script&gt;x&lt;/script&gt;<br>line</p>"
        );
    }

    #[tokio::test]
    async fn publish_public_note() {
        let fx = fixture().await;
        let published = fx
            .service
            .publish("alice", text("hello world", "public"))
            .await
            .unwrap();

        let note = published.value;
        assert!(note.iri.starts_with("https://local.example/users/alice/notes/"));
        assert_eq!(note.to, vec![PUBLIC_COLLECTION.to_string()]);
        assert_eq!(
            note.cc,
            vec!["https://local.example/users/alice/followers".to_string()]
        );
        assert!(published.delivery.await.unwrap().is_empty());

        let stored = fx.store.get_note_by_iri(&note.iri).await.unwrap().unwrap();
        assert!(stored.is_local);
        assert_eq!(fx.service.search("world", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn publish_validates_input() {
        let fx = fixture().await;

        for input in [
            text("   ", "public"),
            text(&"x".repeat(MAX_NOTE_CHARS + 1), "public"),
            text("hi", "direct"),
        ] {
            match fx.service.publish("alice", input).await {
                Err(AppError::Validation(_)) => {}
                Err(other) => panic!("expected validation error, got: {other:?}"),
                Ok(_) => panic!("expected validation error"),
            }
        }
        assert!(
            fx.service
                .publish("alice", text(&"x".repeat(MAX_NOTE_CHARS), "public"))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn followers_only_reply_is_addressed_to_parent_author() {
        let fx = fixture().await;
        let parent = fx
            .service
            .publish("bob", text("parent", "public"))
            .await
            .unwrap()
            .value;

        let mut reply = text("reply", "followers");
        reply.in_reply_to = Some(parent.iri.clone());
        let reply = fx.service.publish("alice", reply).await.unwrap().value;

        assert_eq!(reply.to, vec!["https://local.example/users/bob".to_string()]);
        assert!(reply.cc.is_empty());
        let parent = fx.store.get_note_by_iri(&parent.iri).await.unwrap().unwrap();
        assert_eq!(parent.reply_count, 1);
    }

    #[tokio::test]
    async fn only_author_can_delete() {
        let fx = fixture().await;
        let note = fx
            .service
            .publish("alice", text("mine", "public"))
            .await
            .unwrap()
            .value;

        assert!(matches!(
            fx.service.delete("bob", &note.iri).await,
            Err(AppError::Forbidden)
        ));
        fx.service.delete("alice", &note.iri).await.unwrap();
        assert!(fx.store.get_note_by_iri(&note.iri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_follow_and_unfollow() {
        let fx = fixture().await;
        let bob = "https://local.example/users/bob";

        fx.service.follow("alice", bob).await.unwrap();
        assert!(matches!(
            fx.service.follow("alice", bob).await,
            Err(AppError::Duplicate(_))
        ));
        assert_eq!(fx.store.count_followers(bob).await.unwrap(), 1);

        fx.service.unfollow("alice", bob).await.unwrap();
        assert_eq!(fx.store.count_followers(bob).await.unwrap(), 0);
        assert!(matches!(
            fx.service.unfollow("alice", bob).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn like_is_deduplicated() {
        let fx = fixture().await;
        let note = fx
            .service
            .publish("bob", text("likeable", "public"))
            .await
            .unwrap()
            .value;

        fx.service.like("alice", &note.iri).await.unwrap();
        assert!(matches!(
            fx.service.like("alice", &note.iri).await,
            Err(AppError::Duplicate(_))
        ));
        assert!(
            fx.store
                .is_liked("https://local.example/users/alice", &note.iri)
                .await
                .unwrap()
        );

        fx.service.unlike("alice", &note.iri).await.unwrap();
        assert!(
            !fx.store
                .is_liked("https://local.example/users/alice", &note.iri)
                .await
                .unwrap()
        );
    }
}
