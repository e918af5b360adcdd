//! Common test utilities for E2E tests
//!
//! Each `TestServer` is a full instance on `127.0.0.1:<random port>`, so two
//! of them can federate with each other.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use notefed::data::Actor;
use notefed::federation::{KEY_ENCRYPTION_KEY_BYTES, decrypt_private_key, sign_request};
use notefed::service::AccountService;
use notefed::{AppState, config};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const TEST_KEK: [u8; KEY_ENCRYPTION_KEY_BYTES] = [42; KEY_ENCRYPTION_KEY_BYTES];
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    accounts: AccountService,
}

impl TestServer {
    /// Create a new test server instance
    pub async fn new() -> Self {
        Self::with_retry_delay(Duration::from_millis(50)).await
    }

    /// Create a test server whose delivery retries back off from `base`.
    pub async fn with_retry_delay(base: Duration) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first: actor IRIs embed the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig { path: db_path },
            federation: config::FederationConfig {
                allow_private_hosts: true,
                public_key_ttl_seconds: 60,
                delivery: config::DeliveryConfig {
                    retry_base_delay_ms: base.as_millis() as u64,
                    request_timeout_seconds: 2,
                    ..config::DeliveryConfig::default()
                },
            },
            security: config::SecurityConfig {
                key_encryption_key: BASE64.encode(TEST_KEK),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let state = AppState::new(config.clone()).await.unwrap();
        // Smaller keys keep registration fast in tests.
        let accounts =
            AccountService::new(state.db.clone(), config.server.clone(), TEST_KEK.to_vec())
                .with_key_bits(1024);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = notefed::build_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
            accounts,
        }
    }

    /// Get base URL for requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn actor_iri(&self, username: &str) -> String {
        self.url(&format!("/users/{}", username))
    }

    /// Register a local actor
    pub async fn register(&self, username: &str) -> Actor {
        self.accounts.register(username, None).await.unwrap()
    }

    /// POST an activity to `inbox_url`, signed as `signer`.
    pub async fn signed_post(
        &self,
        signer: &Actor,
        inbox_url: &str,
        activity: &serde_json::Value,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        self.signed_post_bytes(signer, inbox_url, body).await
    }

    pub async fn signed_post_bytes(
        &self,
        signer: &Actor,
        inbox_url: &str,
        body: Vec<u8>,
    ) -> reqwest::Response {
        let signed = sign_request(inbox_url, &body, &private_key_of(signer), &signer.key_id())
            .unwrap();
        self.client
            .post(inbox_url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Accept", ACTIVITY_JSON)
            .header("Date", signed.date)
            .header("Digest", signed.digest)
            .header("Signature", signed.signature)
            .body(body)
            .send()
            .await
            .unwrap()
    }
}

pub fn private_key_of(actor: &Actor) -> String {
    decrypt_private_key(&TEST_KEK, &actor.encrypted_private_key).unwrap()
}

/// An inbox that records when each request arrived and answers with a
/// fixed status.
pub struct RecordingInbox {
    pub url: String,
    pub hits: Arc<Mutex<Vec<Instant>>>,
}

impl RecordingInbox {
    pub async fn start(status: StatusCode) -> Self {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let recorded = hits.clone();

        let app = axum::Router::new().route(
            "/inbox",
            axum::routing::post(move || {
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                    status
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}/inbox", addr),
            hits,
        }
    }

    pub fn hits(&self) -> Vec<Instant> {
        self.hits.lock().unwrap().clone()
    }
}

/// An inbox URL nothing listens on.
pub async fn unreachable_inbox() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}/inbox", addr)
}
