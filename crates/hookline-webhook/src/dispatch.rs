//! Detached dispatch to the business-event handler
//!
//! Every dispatch runs on its own task with a deadline and always ends in
//! either `mark_processed` or `mark_failed`. Handler errors, timeouts and
//! panics are converted into ledger updates and never escape the task.

use crate::{
    events::{LogLevel, WebhookLog},
    ledger::RetryLedger,
    store::WebhookStore,
    Result,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default deadline for a single handler invocation
pub const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Downstream consumer of validated, deduplicated events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event_id: &str) -> Result<()>;
}

/// Final state of one dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed,
    Failed(String),
}

/// Spawns handler invocations and records their outcome
#[derive(Clone)]
pub struct EventDispatcher {
    handler: Arc<dyn EventHandler>,
    ledger: Arc<RetryLedger>,
    store: Arc<dyn WebhookStore>,
    timeout: Duration,
}

impl EventDispatcher {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        ledger: Arc<RetryLedger>,
        store: Arc<dyn WebhookStore>,
    ) -> Self {
        Self {
            handler,
            ledger,
            store,
            timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn a detached dispatch; the handle may be dropped
    pub fn dispatch(&self, event_id: String) -> JoinHandle<DispatchOutcome> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(event_id).await })
    }

    async fn run(&self, event_id: String) -> DispatchOutcome {
        debug!(event_id = %event_id, "Dispatching event");

        let handler = self.handler.clone();
        let id = event_id.clone();
        let mut task = tokio::spawn(async move { handler.handle(&id).await });

        let result = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join_error)) if join_error.is_panic() => Err("handler panicked".to_string()),
            Ok(Err(join_error)) => Err(format!("handler task failed: {}", join_error)),
            Err(_) => {
                task.abort();
                Err(format!("handler timed out after {:?}", self.timeout))
            }
        };

        let result = match result {
            Ok(()) => self
                .ledger
                .mark_processed(&event_id)
                .await
                .map_err(|e| format!("failed to mark event processed: {}", e)),
            Err(message) => Err(message),
        };

        match result {
            Ok(()) => {
                info!(event_id = %event_id, "Event processed");
                DispatchOutcome::Processed
            }
            Err(message) => {
                warn!(event_id = %event_id, error = %message, "Event dispatch failed");
                if let Err(e) = self.ledger.mark_failed(&event_id, &message).await {
                    error!(event_id = %event_id, error = %e, "Failed to record dispatch failure");
                }
                let log = WebhookLog::new(LogLevel::Error, "Event dispatch failed")
                    .with_event(event_id.clone())
                    .with_context(json!({ "error": message }));
                if let Err(e) = self.store.append_log(log).await {
                    error!(event_id = %event_id, error = %e, "Failed to append webhook log");
                }
                DispatchOutcome::Failed(message)
            }
        }
    }
}
