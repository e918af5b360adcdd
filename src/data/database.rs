//! SQLite database operations
//!
//! The SQLite implementation of [`RelationshipStore`].
//! Uniqueness of edges and notes is enforced by the schema; inserts use
//! `INSERT OR IGNORE` and report whether a row was written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use super::store::RelationshipStore;
use crate::error::AppError;

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
}

#[derive(sqlx::FromRow)]
struct ActorRow {
    id: String,
    iri: String,
    username: String,
    display_name: Option<String>,
    summary: Option<String>,
    avatar_url: Option<String>,
    inbox_iri: String,
    outbox_iri: String,
    followers_iri: String,
    following_iri: String,
    public_key_pem: String,
    encrypted_private_key: String,
    muted_iris: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ActorRow> for Actor {
    fn from(row: ActorRow) -> Self {
        Actor {
            id: row.id,
            iri: row.iri,
            username: row.username,
            display_name: row.display_name,
            summary: row.summary,
            avatar_url: row.avatar_url,
            inbox_iri: row.inbox_iri,
            outbox_iri: row.outbox_iri,
            followers_iri: row.followers_iri,
            following_iri: row.following_iri,
            public_key_pem: row.public_key_pem,
            encrypted_private_key: row.encrypted_private_key,
            muted_iris: parse_json_column(&row.muted_iris, "actors.muted_iris"),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct NoteRow {
    id: String,
    iri: String,
    author_iri: String,
    content: String,
    published: DateTime<Utc>,
    in_reply_to: Option<String>,
    audience_to: String,
    audience_cc: String,
    attachments: String,
    reply_count: i64,
    is_local: bool,
}

impl From<NoteRow> for Note {
    fn from(row: NoteRow) -> Self {
        Note {
            id: row.id,
            iri: row.iri,
            author_iri: row.author_iri,
            content: row.content,
            published: row.published,
            in_reply_to: row.in_reply_to,
            to: parse_json_column(&row.audience_to, "notes.audience_to"),
            cc: parse_json_column(&row.audience_cc, "notes.audience_cc"),
            attachments: parse_json_column(&row.attachments, "notes.attachments"),
            reply_count: row.reply_count,
            is_local: row.is_local,
        }
    }
}

fn parse_json_column<T: DeserializeOwned + Default>(raw: &str, column: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|error| {
        tracing::warn!(%error, column, "Ignoring malformed JSON column");
        T::default()
    })
}

fn to_json_column<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string(value).map_err(|e| AppError::Internal(e.into()))
}

/// Plain text stored in the search index
fn index_body(content: &str) -> String {
    ammonia::Builder::empty()
        .clean(content)
        .to_string()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

const NOTE_COLUMNS: &str = "id, iri, author_iri, content, published, in_reply_to, \
     audience_to, audience_cc, attachments, reply_count, is_local";

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist.
    /// Runs pending migrations automatically.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            AppError::from(e)
        })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }
}

#[async_trait]
impl RelationshipStore for Database {
    // =========================================================================
    // Actors
    // =========================================================================

    async fn get_actor_by_iri(&self, iri: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query_as::<_, ActorRow>("SELECT * FROM actors WHERE iri = ?")
            .bind(iri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Actor::from))
    }

    async fn get_actor_by_user_id(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query_as::<_, ActorRow>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Actor::from))
    }

    async fn get_actor_by_username(&self, username: &str) -> Result<Option<Actor>, AppError> {
        let row = sqlx::query_as::<_, ActorRow>("SELECT * FROM actors WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Actor::from))
    }

    async fn insert_actor(&self, actor: &Actor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO actors (
                id, iri, username, display_name, summary, avatar_url,
                inbox_iri, outbox_iri, followers_iri, following_iri,
                public_key_pem, encrypted_private_key, muted_iris,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.iri)
        .bind(&actor.username)
        .bind(&actor.display_name)
        .bind(&actor.summary)
        .bind(&actor.avatar_url)
        .bind(&actor.inbox_iri)
        .bind(&actor.outbox_iri)
        .bind(&actor.followers_iri)
        .bind(&actor.following_iri)
        .bind(&actor.public_key_pem)
        .bind(&actor.encrypted_private_key)
        .bind(to_json_column(&actor.muted_iris)?)
        .bind(actor.created_at)
        .bind(actor.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_actor_profile(
        &self,
        iri: &str,
        display_name: Option<&str>,
        summary: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE actors SET
                display_name = COALESCE(?, display_name),
                summary = COALESCE(?, summary),
                avatar_url = COALESCE(?, avatar_url),
                updated_at = ?
            WHERE iri = ?
            "#,
        )
        .bind(display_name)
        .bind(summary)
        .bind(avatar_url)
        .bind(Utc::now())
        .bind(iri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_muted_iris(&self, iri: &str, muted: &[String]) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE actors SET muted_iris = ?, updated_at = ? WHERE iri = ?")
            .bind(to_json_column(&muted)?)
            .bind(Utc::now())
            .bind(iri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_actor_cascade(&self, iri: &str) -> Result<Option<u64>, AppError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM actors WHERE iri = ?")
            .bind(iri)
            .fetch_one(&mut *tx)
            .await?;
        if exists == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        // Notes first, with everything hanging off them.
        sqlx::query(
            "DELETE FROM likes WHERE note_iri IN (SELECT iri FROM notes WHERE author_iri = ?)",
        )
        .bind(iri)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM note_search WHERE note_iri IN (SELECT iri FROM notes WHERE author_iri = ?)",
        )
        .bind(iri)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM note_authors WHERE note_iri IN (SELECT iri FROM notes WHERE author_iri = ?)",
        )
        .bind(iri)
        .execute(&mut *tx)
        .await?;
        let notes = sqlx::query("DELETE FROM notes WHERE author_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM follows WHERE follower_iri = ? OR followee_iri = ?")
            .bind(iri)
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM likes WHERE actor_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM delivery_jobs WHERE signer_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM actors WHERE iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(notes))
    }

    // =========================================================================
    // Follow edges
    // =========================================================================

    async fn create_follow(&self, edge: &FollowEdge) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO follows (activity_iri, follower_iri, followee_iri, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&edge.activity_iri)
        .bind(&edge.follower_iri)
        .bind(&edge.followee_iri)
        .bind(edge.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_follow(
        &self,
        activity_iri: &str,
        follower_iri: &str,
        followee_iri: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM follows WHERE activity_iri = ? AND follower_iri = ? AND followee_iri = ?",
        )
        .bind(activity_iri)
        .bind(follower_iri)
        .bind(followee_iri)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_follow_by_activity(
        &self,
        activity_iri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>("SELECT * FROM follows WHERE activity_iri = ?")
            .bind(activity_iri)
            .fetch_optional(&self.pool)
            .await?;

        Ok(edge)
    }

    async fn find_follow(
        &self,
        follower_iri: &str,
        followee_iri: &str,
    ) -> Result<Option<FollowEdge>, AppError> {
        let edge = sqlx::query_as::<_, FollowEdge>(
            "SELECT * FROM follows WHERE follower_iri = ? AND followee_iri = ?",
        )
        .bind(follower_iri)
        .bind(followee_iri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(edge)
    }

    async fn get_follower_iris(&self, followee_iri: &str) -> Result<Vec<String>, AppError> {
        let followers = sqlx::query_scalar::<_, String>(
            "SELECT follower_iri FROM follows WHERE followee_iri = ? ORDER BY created_at",
        )
        .bind(followee_iri)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    async fn count_followers(&self, followee_iri: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE followee_iri = ?")
                .bind(followee_iri)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn count_following(&self, follower_iri: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM follows WHERE follower_iri = ?")
                .bind(follower_iri)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    // =========================================================================
    // Like edges
    // =========================================================================

    async fn create_like(&self, edge: &LikeEdge) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO likes (activity_iri, actor_iri, note_iri, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&edge.activity_iri)
        .bind(&edge.actor_iri)
        .bind(&edge.note_iri)
        .bind(edge.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_likes_by_activity(
        &self,
        activity_iri: &str,
    ) -> Result<Vec<LikeEdge>, AppError> {
        let edges = sqlx::query_as::<_, LikeEdge>("SELECT * FROM likes WHERE activity_iri = ?")
            .bind(activity_iri)
            .fetch_all(&self.pool)
            .await?;

        Ok(edges)
    }

    async fn find_like(
        &self,
        actor_iri: &str,
        note_iri: &str,
    ) -> Result<Option<LikeEdge>, AppError> {
        let edge = sqlx::query_as::<_, LikeEdge>(
            "SELECT * FROM likes WHERE actor_iri = ? AND note_iri = ?",
        )
        .bind(actor_iri)
        .bind(note_iri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(edge)
    }

    async fn delete_like(&self, activity_iri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM likes WHERE activity_iri = ?")
            .bind(activity_iri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Notes
    // =========================================================================

    async fn create_note(&self, note: &Note, author: &NoteAuthor) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO notes (
                id, iri, author_iri, content, published, in_reply_to,
                audience_to, audience_cc, attachments, reply_count, is_local
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&note.id)
        .bind(&note.iri)
        .bind(&note.author_iri)
        .bind(&note.content)
        .bind(note.published)
        .bind(&note.in_reply_to)
        .bind(to_json_column(&note.to)?)
        .bind(to_json_column(&note.cc)?)
        .bind(to_json_column(&note.attachments)?)
        .bind(note.reply_count)
        .bind(note.is_local)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT OR REPLACE INTO note_authors (note_iri, display_name, avatar_url) VALUES (?, ?, ?)",
        )
        .bind(&note.iri)
        .bind(&author.display_name)
        .bind(&author.avatar_url)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT OR REPLACE INTO note_search (note_iri, body) VALUES (?, ?)")
            .bind(&note.iri)
            .bind(index_body(&note.content))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_note_by_iri(&self, iri: &str) -> Result<Option<Note>, AppError> {
        let row = sqlx::query_as::<_, NoteRow>(&format!(
            "SELECT {} FROM notes WHERE iri = ?",
            NOTE_COLUMNS
        ))
        .bind(iri)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Note::from))
    }

    async fn find_notes_by_iri(&self, iri: &str) -> Result<Vec<Note>, AppError> {
        let rows = sqlx::query_as::<_, NoteRow>(&format!(
            "SELECT {} FROM notes WHERE iri = ?",
            NOTE_COLUMNS
        ))
        .bind(iri)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Note::from).collect())
    }

    async fn get_note_author(&self, note_iri: &str) -> Result<Option<NoteAuthor>, AppError> {
        let author =
            sqlx::query_as::<_, NoteAuthor>("SELECT * FROM note_authors WHERE note_iri = ?")
                .bind(note_iri)
                .fetch_optional(&self.pool)
                .await?;

        Ok(author)
    }

    async fn delete_note(&self, iri: &str) -> Result<bool, AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM likes WHERE note_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM note_search WHERE note_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM note_authors WHERE note_iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM notes WHERE iri = ?")
            .bind(iri)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn increment_reply_count(&self, iri: &str) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE notes SET reply_count = reply_count + 1 WHERE iri = ?")
            .bind(iri)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_notes_by_author(&self, author_iri: &str) -> Result<i64, AppError> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM notes WHERE author_iri = ?")
                .bind(author_iri)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn search_notes(&self, query: &str, limit: i64) -> Result<Vec<Note>, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let pattern = format!("%{}%", escape_like(query));
        let rows = sqlx::query_as::<_, NoteRow>(
            r#"
            SELECT n.id, n.iri, n.author_iri, n.content, n.published, n.in_reply_to,
                   n.audience_to, n.audience_cc, n.attachments, n.reply_count, n.is_local
            FROM notes n
            JOIN note_search s ON s.note_iri = n.iri
            WHERE s.body LIKE ? ESCAPE '\'
            ORDER BY n.published DESC
            LIMIT ?
            "#,
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Note::from).collect())
    }

    // =========================================================================
    // Delivery queue
    // =========================================================================

    async fn enqueue_delivery(&self, job: &DeliveryJob) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (
                id, inbox_iri, signer_iri, payload, attempts,
                next_attempt_at, status, last_error, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.inbox_iri)
        .bind(&job.signer_iri)
        .bind(&job.payload)
        .bind(job.attempts)
        .bind(job.next_attempt_at)
        .bind(&job.status)
        .bind(&job.last_error)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_delivery_failure(
        &self,
        id: &str,
        attempts: i64,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_jobs SET attempts = ?, next_attempt_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(next_attempt_at)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete_delivery(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn abandon_delivery(
        &self,
        id: &str,
        attempts: i64,
        error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_jobs SET status = ?, attempts = ?, last_error = ? WHERE id = ?",
        )
        .bind(DeliveryStatus::Abandoned.as_str())
        .bind(attempts)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn pending_deliveries(&self, limit: i64) -> Result<Vec<DeliveryJob>, AppError> {
        let jobs = sqlx::query_as::<_, DeliveryJob>(
            "SELECT * FROM delivery_jobs WHERE status = ? ORDER BY next_attempt_at LIMIT ?",
        )
        .bind(DeliveryStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryJob>, AppError> {
        let job = sqlx::query_as::<_, DeliveryJob>("SELECT * FROM delivery_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn count_abandoned_deliveries(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_jobs WHERE status = ?")
            .bind(DeliveryStatus::Abandoned.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    async fn prune_abandoned_deliveries(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM delivery_jobs WHERE status = ? AND created_at < ?")
            .bind(DeliveryStatus::Abandoned.as_str())
            .bind(older_than)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
