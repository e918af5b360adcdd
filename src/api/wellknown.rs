//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{generate_webfinger_response, host_matches, parse_acct_resource};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
///
/// 404 when the host is not this instance or the user is unknown.
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let (username, host) = parse_acct_resource(&query.resource).ok_or_else(|| {
        AppError::Validation(format!("Invalid acct resource: {}", query.resource))
    })?;

    if !host_matches(host, &state.config.server.domain) {
        return Err(AppError::NotFound(format!("Resource {}", query.resource)));
    }

    let actor = state
        .resolver
        .local_actor_by_username(username)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Resource {}", query.resource)))?;

    let jrd = generate_webfinger_response(&actor.username, &state.config.server.domain, &actor.iri);
    Ok(([(CONTENT_TYPE, "application/jrd+json")], Json(jrd)).into_response())
}
