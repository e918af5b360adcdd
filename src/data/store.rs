//! Relationship store contract
//!
//! The federation core reads and writes actors, notes and edges only
//! through this trait. Implementations must enforce uniqueness themselves
//! (Follow/Like activity IRIs, Follow pairs, Like pairs, Note IRIs) so that
//! concurrent duplicate deliveries cannot both succeed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Actor, DeliveryJob, FollowEdge, LikeEdge, Note, NoteAuthor};
use crate::error::AppError;

#[async_trait]
pub trait RelationshipStore: Send + Sync {
    // =========================================================================
    // Actors
    // =========================================================================

    async fn get_actor_by_iri(&self, iri: &str) -> Result<Option<Actor>, AppError>;

    async fn get_actor_by_user_id(&self, id: &str) -> Result<Option<Actor>, AppError>;

    async fn get_actor_by_username(&self, username: &str) -> Result<Option<Actor>, AppError>;

    /// Insert a new actor. Returns false when the username or IRI is taken.
    async fn insert_actor(&self, actor: &Actor) -> Result<bool, AppError>;

    /// Update profile fields. `None` leaves a field unchanged.
    async fn update_actor_profile(
        &self,
        iri: &str,
        display_name: Option<&str>,
        summary: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Replace the muted-actor list.
    async fn set_muted_iris(&self, iri: &str, muted: &[String]) -> Result<bool, AppError>;

    /// Delete an actor, its notes first, then its edges.
    ///
    /// Returns the number of notes removed, or None if the actor did not exist.
    async fn delete_actor_cascade(&self, iri: &str) -> Result<Option<u64>, AppError>;

    // =========================================================================
    // Follow edges
    // =========================================================================

    /// Insert a Follow edge. Returns false if the activity IRI or the
    /// (follower, followee) pair already exists.
    async fn create_follow(&self, edge: &FollowEdge) -> Result<bool, AppError>;

    /// Remove the edge matching activity, follower and followee.
    async fn delete_follow(
        &self,
        activity_iri: &str,
        follower_iri: &str,
        followee_iri: &str,
    ) -> Result<bool, AppError>;

    async fn find_follow_by_activity(
        &self,
        activity_iri: &str,
    ) -> Result<Option<FollowEdge>, AppError>;

    async fn find_follow(
        &self,
        follower_iri: &str,
        followee_iri: &str,
    ) -> Result<Option<FollowEdge>, AppError>;

    async fn get_follower_iris(&self, followee_iri: &str) -> Result<Vec<String>, AppError>;

    async fn count_followers(&self, followee_iri: &str) -> Result<i64, AppError>;

    async fn count_following(&self, follower_iri: &str) -> Result<i64, AppError>;

    // =========================================================================
    // Like edges
    // =========================================================================

    /// Insert a Like edge. Returns false if the activity IRI or the
    /// (actor, note) pair already exists.
    async fn create_like(&self, edge: &LikeEdge) -> Result<bool, AppError>;

    async fn find_likes_by_activity(&self, activity_iri: &str)
    -> Result<Vec<LikeEdge>, AppError>;

    async fn find_like(&self, actor_iri: &str, note_iri: &str)
    -> Result<Option<LikeEdge>, AppError>;

    async fn delete_like(&self, activity_iri: &str) -> Result<bool, AppError>;

    async fn is_liked(&self, actor_iri: &str, note_iri: &str) -> Result<bool, AppError> {
        Ok(self.find_like(actor_iri, note_iri).await?.is_some())
    }

    // =========================================================================
    // Notes
    // =========================================================================

    /// Insert a note with its author sub-record and search-index entry in
    /// one transaction. Returns false if a note with the same IRI exists.
    async fn create_note(&self, note: &Note, author: &NoteAuthor) -> Result<bool, AppError>;

    async fn get_note_by_iri(&self, iri: &str) -> Result<Option<Note>, AppError>;

    async fn find_notes_by_iri(&self, iri: &str) -> Result<Vec<Note>, AppError>;

    async fn get_note_author(&self, note_iri: &str) -> Result<Option<NoteAuthor>, AppError>;

    /// Remove a note together with its sub-record, index entry and likes.
    async fn delete_note(&self, iri: &str) -> Result<bool, AppError>;

    async fn increment_reply_count(&self, iri: &str) -> Result<bool, AppError>;

    async fn count_notes_by_author(&self, author_iri: &str) -> Result<i64, AppError>;

    /// Full-text lookup over indexed note content.
    async fn search_notes(&self, query: &str, limit: i64) -> Result<Vec<Note>, AppError>;

    // =========================================================================
    // Delivery queue
    // =========================================================================

    async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), AppError>;

    async fn record_delivery_failure(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError>;

    async fn complete_delivery(&self, id: &str) -> Result<(), AppError>;

    async fn abandon_delivery(&self, id: &str, attempts: i64, error: &str)
    -> Result<(), AppError>;

    async fn pending_deliveries(&self, limit: i64) -> Result<Vec<DeliveryJob>, AppError>;

    async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryJob>, AppError>;

    async fn count_abandoned_deliveries(&self) -> Result<i64, AppError>;

    /// Delete abandoned jobs created before `older_than`.
    async fn prune_abandoned_deliveries(&self, older_than: DateTime<Utc>)
    -> Result<u64, AppError>;
}
