//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Actor IRI for a local username
    pub fn actor_iri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Allow fetching actors on loopback/private hosts.
    ///
    /// Only meant for local development and tests.
    #[serde(default)]
    pub allow_private_hosts: bool,
    /// Public key cache TTL in seconds (default: 3600)
    pub public_key_ttl_seconds: u64,
    pub delivery: DeliveryConfig,
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Total attempts per destination, including the first (default: 3)
    pub max_attempts: u32,
    /// Base retry delay; attempt `n` waits `n * base` (default: 1000)
    pub retry_base_delay_ms: u64,
    /// Per-request timeout in seconds (default: 5)
    pub request_timeout_seconds: u64,
    /// Maximum deliveries in flight (default: 10)
    pub max_concurrent: usize,
    /// Resume pending jobs from the persisted queue at startup
    #[serde(default = "default_resume_on_startup")]
    pub resume_on_startup: bool,
    /// Hours an abandoned job is kept before pruning (default: 168)
    #[serde(default = "default_abandoned_retention_hours")]
    pub abandoned_retention_hours: u64,
}

fn default_resume_on_startup() -> bool {
    true
}

fn default_abandoned_retention_hours() -> u64 {
    168
}

impl DeliveryConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            request_timeout_seconds: 5,
            max_concurrent: 10,
            resume_on_startup: true,
            abandoned_retention_hours: default_abandoned_retention_hours(),
        }
    }
}

/// Key-at-rest configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte key used to encrypt actor private keys.
    pub key_encryption_key: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (NOTEFED__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/notefed.db")?
            .set_default("federation.allow_private_hosts", false)?
            .set_default("federation.public_key_ttl_seconds", 3600)?
            .set_default("federation.delivery.max_attempts", 3)?
            .set_default("federation.delivery.retry_base_delay_ms", 1000)?
            .set_default("federation.delivery.request_timeout_seconds", 5)?
            .set_default("federation.delivery.max_concurrent", 10)?
            .set_default("federation.delivery.resume_on_startup", true)?
            .set_default("federation.delivery.abandoned_retention_hours", 168)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (NOTEFED__*)
            .add_source(
                Environment::with_prefix("NOTEFED")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Decode the key-encryption key.
    pub fn key_encryption_key(&self) -> Result<Vec<u8>, crate::error::AppError> {
        use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

        let key = BASE64
            .decode(self.security.key_encryption_key.trim())
            .map_err(|e| {
                crate::error::AppError::Config(format!(
                    "security.key_encryption_key must be base64: {}",
                    e
                ))
            })?;
        if key.len() != crate::federation::KEY_ENCRYPTION_KEY_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "security.key_encryption_key must decode to {} bytes",
                crate::federation::KEY_ENCRYPTION_KEY_BYTES
            )));
        }
        Ok(key)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        self.key_encryption_key()?;

        if self.federation.delivery.max_attempts == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.federation.delivery.max_concurrent == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery.max_concurrent must be at least 1".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            let host = normalized_server_host(&self.server.domain);
            tracing::warn!(
                host = %host,
                protocol = %self.server.protocol,
                "Running federation on a local domain"
            );
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.federation.allow_private_hosts {
            tracing::warn!("federation.allow_private_hosts is enabled; SSRF guard is disabled");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
