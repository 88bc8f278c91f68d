use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("Configuration source error: {0}")]
    Source(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub webhook: WebhookConfig,
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub accounts: Vec<AccountBinding>,
}

impl AppConfig {
    /// Load configuration from defaults and environment variables
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_layered(None, "HOOKLINE")
    }

    /// Load configuration from an optional file with environment overrides.
    ///
    /// Sources are layered in order: built-in defaults, the file (skipped when
    /// it does not exist), then `{prefix}__SECTION__KEY` environment variables.
    pub fn load_layered(path: Option<&Path>, prefix: &str) -> Result<Self, ConfigLoadError> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("webhook.app_secret", "")?
            .set_default("webhook.verify_token", "")?
            .set_default(
                "webhook.signature_tolerance_seconds",
                default_signature_tolerance_seconds(),
            )?
            .set_default(
                "ingestion.persistence_timeout_ms",
                default_persistence_timeout_ms() as i64,
            )?
            .set_default("ingestion.dispatch_timeout_ms", default_dispatch_timeout_ms() as i64)?
            .set_default(
                "ingestion.max_processing_attempts",
                default_max_processing_attempts() as i64,
            )?
            .set_default("ingestion.retry_batch_limit", default_retry_batch_limit() as i64)?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run safely with
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.webhook.app_secret.trim().is_empty() {
            return Err(ConfigLoadError::Invalid(
                "webhook.app_secret must be set".to_string(),
            ));
        }
        if self.webhook.verify_token.trim().is_empty() {
            return Err(ConfigLoadError::Invalid(
                "webhook.verify_token must be set".to_string(),
            ));
        }
        if self.ingestion.max_processing_attempts == 0 {
            return Err(ConfigLoadError::Invalid(
                "ingestion.max_processing_attempts must be at least 1".to_string(),
            ));
        }
        if self.ingestion.retry_batch_limit == 0 {
            return Err(ConfigLoadError::Invalid(
                "ingestion.retry_batch_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Provider-facing trust configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret used for `X-Hub-Signature-256` and signed requests
    pub app_secret: String,
    /// Token the provider echoes during the subscription handshake
    pub verify_token: String,
    #[serde(default = "default_signature_tolerance_seconds")]
    pub signature_tolerance_seconds: i64,
}

impl WebhookConfig {
    pub fn new(app_secret: impl Into<String>, verify_token: impl Into<String>) -> Self {
        Self {
            app_secret: app_secret.into(),
            verify_token: verify_token.into(),
            signature_tolerance_seconds: default_signature_tolerance_seconds(),
        }
    }
}

fn default_signature_tolerance_seconds() -> i64 {
    300 // 5 minutes
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_persistence_timeout_ms")]
    pub persistence_timeout_ms: u64,
    #[serde(default = "default_dispatch_timeout_ms")]
    pub dispatch_timeout_ms: u64,
    #[serde(default = "default_max_processing_attempts")]
    pub max_processing_attempts: u32,
    #[serde(default = "default_retry_batch_limit")]
    pub retry_batch_limit: usize,
}

impl IngestionConfig {
    pub fn persistence_timeout(&self) -> Duration {
        Duration::from_millis(self.persistence_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            persistence_timeout_ms: default_persistence_timeout_ms(),
            dispatch_timeout_ms: default_dispatch_timeout_ms(),
            max_processing_attempts: default_max_processing_attempts(),
            retry_batch_limit: default_retry_batch_limit(),
        }
    }
}

fn default_persistence_timeout_ms() -> u64 {
    5_000
}

fn default_dispatch_timeout_ms() -> u64 {
    30_000
}

fn default_max_processing_attempts() -> u32 {
    3
}

fn default_retry_batch_limit() -> usize {
    100
}

/// Static mapping from a provider account to an internal account and its owner
#[derive(Debug, Clone, Deserialize)]
pub struct AccountBinding {
    pub provider_account_id: String,
    pub account_id: String,
    pub owner_id: String,
}
