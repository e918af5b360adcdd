//! ActivityPub endpoints
//!
//! - Actor document
//! - Inbox (activity receiving)
//! - Public note documents
//! - Outbox/Followers/Following collections (counts only)

use axum::body::Bytes;
use axum::{
    Router,
    extract::{OriginalUri, Path, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use http::{HeaderMap, Method};

use crate::AppState;
use crate::data::{Actor, PUBLIC_COLLECTION, RelationshipStore};
use crate::error::AppError;
use crate::federation::InboxRequest;
use crate::federation::activity::{ACTIVITY_STREAMS_CONTEXT, NoteObject};

const ACTIVITY_JSON: &str = "application/activity+json";
const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor document
/// - GET, POST /users/:username/inbox - Personal inbox
/// - GET /users/:username/notes/:id - Public note
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", get(inbox_collection).post(inbox))
        .route("/users/:username/notes/:id", get(note))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
}

fn activity_json(value: serde_json::Value) -> Response {
    ([(CONTENT_TYPE, ACTIVITY_JSON)], Json(value)).into_response()
}

async fn local_actor(state: &AppState, username: &str) -> Result<Actor, AppError> {
    state
        .resolver
        .local_actor_by_username(username)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {}", username)))
}

fn count_only_collection(id: &str, total_items: i64) -> serde_json::Value {
    serde_json::json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollection",
        "id": id,
        "totalItems": total_items,
    })
}

/// Person document for a local actor
fn person_document(actor: &Actor) -> serde_json::Value {
    serde_json::json!({
        "@context": [ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT],
        "type": "Person",
        "id": actor.iri,
        "preferredUsername": actor.username,
        "name": actor.display_name.clone().unwrap_or_else(|| actor.username.clone()),
        "summary": actor.summary.clone().unwrap_or_default(),
        "inbox": actor.inbox_iri,
        "outbox": actor.outbox_iri,
        "followers": actor.followers_iri,
        "following": actor.following_iri,
        "url": actor.iri,
        "publicKey": {
            "id": actor.key_id(),
            "owner": actor.iri,
            "publicKeyPem": actor.public_key_pem
        },
        "icon": actor.avatar_url.as_ref().map(|url| serde_json::json!({
            "type": "Image",
            "url": url
        })),
    })
}

/// GET /users/:username
///
/// Content-Type: application/activity+json
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    Ok(activity_json(person_document(&actor)))
}

/// GET /users/:username/inbox
///
/// Inbox contents are not exposed; always an empty collection.
async fn inbox_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    Ok(activity_json(serde_json::json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollection",
        "id": actor.inbox_iri,
        "totalItems": 0,
        "orderedItems": [],
    })))
}

/// POST /users/:username/inbox
///
/// Verifies and applies an incoming activity; responds with an Accept.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let owner = local_actor(&state, &username).await?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let accept = state
        .dispatcher
        .dispatch(
            &owner,
            InboxRequest {
                method: method.as_str(),
                path,
                headers: &headers,
                body: &body,
            },
        )
        .await?;

    Ok(activity_json(accept))
}

/// GET /users/:username/notes/:id
///
/// Only publicly addressed notes are served; requests are unauthenticated.
async fn note(
    State(state): State<AppState>,
    Path((username, id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let note_iri = format!("{}/notes/{}", actor.iri, id);

    let note = state
        .db
        .get_note_by_iri(&note_iri)
        .await?
        .filter(|note| note.to.iter().chain(&note.cc).any(|iri| iri == PUBLIC_COLLECTION))
        .ok_or_else(|| AppError::NotFound(format!("Note {}", note_iri)))?;

    let mut document = serde_json::to_value(NoteObject::from(&note))
        .map_err(|e| AppError::Internal(e.into()))?;
    document["@context"] = serde_json::Value::from(ACTIVITY_STREAMS_CONTEXT);
    Ok(activity_json(document))
}

/// GET /users/:username/outbox
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let total = state.db.count_notes_by_author(&actor.iri).await?;
    Ok(activity_json(count_only_collection(&actor.outbox_iri, total)))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let total = state.db.count_followers(&actor.iri).await?;
    Ok(activity_json(count_only_collection(&actor.followers_iri, total)))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_actor(&state, &username).await?;
    let total = state.db.count_following(&actor.iri).await?;
    Ok(activity_json(count_only_collection(&actor.following_iri, total)))
}
