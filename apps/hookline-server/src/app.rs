//! Application state and initialization

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use hookline_core::AppConfig;
use hookline_webhook::{
    EventHandler, InMemoryWebhookStore, StaticAccountDirectory, WebhookState, WebhookStore,
};

use crate::cli::Args;
use crate::server::Server;

/// Business-event handler used until a downstream consumer is plugged in.
///
/// Loads the event and records it in the process log.
pub struct LoggingEventHandler {
    store: Arc<dyn WebhookStore>,
}

impl LoggingEventHandler {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle(&self, event_id: &str) -> hookline_webhook::Result<()> {
        let event = self
            .store
            .get_event(event_id)
            .await?
            .ok_or_else(|| hookline_webhook::WebhookError::NotFound(event_id.to_string()))?;

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            account_id = ?event.account_id,
            object_id = ?event.object_id,
            "Handled webhook event"
        );
        Ok(())
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub webhooks: Arc<WebhookState>,
}

impl AppState {
    /// Wire the pipeline with the in-memory store and static account bindings
    pub fn new(config: AppConfig) -> Self {
        info!(
            accounts = config.accounts.len(),
            "Initializing application components"
        );

        let store: Arc<dyn WebhookStore> = Arc::new(InMemoryWebhookStore::default());
        let accounts = Arc::new(StaticAccountDirectory::from_bindings(&config.accounts));
        let handler = Arc::new(LoggingEventHandler::new(store.clone()));

        let webhooks = WebhookState::build(
            &config.webhook,
            &config.ingestion,
            store,
            accounts,
            handler,
        );

        Self {
            config: Arc::new(config),
            webhooks: Arc::new(webhooks),
        }
    }
}

/// Main application
pub struct App {
    state: AppState,
}

impl App {
    /// Build the application with all dependencies
    pub async fn build(args: Args) -> Result<Self> {
        args.validate().context("Invalid command line arguments")?;

        let mut config = AppConfig::load_layered(Some(args.config.as_path()), "HOOKLINE")
            .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
        if let Some(port) = args.port {
            config.server.port = port;
        }

        Ok(Self {
            state: AppState::new(config),
        })
    }

    /// Run the application
    pub async fn run(self) -> Result<()> {
        info!("Starting server");
        info!(
            "HTTP address: {}:{}",
            self.state.config.server.host, self.state.config.server.port
        );

        let server = Server::new(self.state)?;
        server.run().await?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    use hookline_core::{AccountBinding, IngestionConfig, ServerConfig, WebhookConfig};

    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        webhook: WebhookConfig::new("app-secret", "verify-me"),
        ingestion: IngestionConfig::default(),
        accounts: vec![AccountBinding {
            provider_account_id: "17841400000000".to_string(),
            account_id: "acct-1".to_string(),
            owner_id: "owner-1".to_string(),
        }],
    }
}
