//! notefed - the federation core of an ActivityPub server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actor, inbox, collections)        │
//! │  - WebFinger, health, metrics                               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Service / Federation Layer                   │
//! │  - Accounts and notes (outbox side)                         │
//! │  - Signatures, dispatch, resolution, delivery               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - RelationshipStore contract                               │
//! │  - SQLite (sqlx) implementation and delivery queue          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Account and note operations for local actors
//! - `federation`: ActivityPub federation handling
//! - `data`: Store contract and SQLite implementation
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

/// Maximum accepted request body (inbox POSTs)
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Application state shared across all handlers
///
/// Cloned for each request; everything inside is shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// SQLite store
    pub db: Arc<data::Database>,

    /// HTTP client for federation
    pub http_client: reqwest::Client,

    /// Actor/object resolution and public key cache
    pub resolver: Arc<federation::ActorResolver>,

    /// Outbound delivery
    pub delivery: federation::DeliveryEngine,

    /// Inbound activity handling
    pub dispatcher: Arc<federation::ActivityDispatcher>,

    pub accounts: Arc<service::AccountService>,
    pub notes: Arc<service::NoteService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build HTTP client
    /// 3. Wire resolver, delivery and dispatcher
    /// 4. Build services
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let key_encryption_key = config.key_encryption_key()?;

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        let store: Arc<dyn data::RelationshipStore> = db.clone();
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Initialize HTTP client
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("notefed/", env!("CARGO_PKG_VERSION")))
            .timeout(config.federation.delivery.request_timeout())
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        // 3. Federation components
        let resolver = Arc::new(federation::ActorResolver::from_config(
            &config,
            store.clone(),
            http_client.clone(),
        ));
        let delivery = federation::DeliveryEngine::new(
            store.clone(),
            resolver.clone(),
            http_client.clone(),
            config.federation.delivery.clone(),
            key_encryption_key.clone(),
        );
        let dispatcher = Arc::new(federation::ActivityDispatcher::new(
            store.clone(),
            resolver.clone(),
        ));

        // 4. Services
        let accounts = Arc::new(service::AccountService::new(
            store.clone(),
            config.server.clone(),
            key_encryption_key,
        ));
        let notes = Arc::new(service::NoteService::new(
            store,
            resolver.clone(),
            delivery.clone(),
        ));

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            http_client,
            resolver,
            delivery,
            dispatcher,
            accounts,
            notes,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
