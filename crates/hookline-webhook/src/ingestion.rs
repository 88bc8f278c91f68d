//! Ingestion coordinator
//!
//! Per delivery: verify the signature over the raw bytes, classify every
//! `changes[]`/`messaging[]` item, check for a previous delivery of the same
//! identity, persist, and hand new events to the detached dispatcher.
//! Items are independent: one item failing to persist leaves its siblings
//! untouched.

use crate::{
    accounts::AccountDirectory,
    classifier::{classify, ClassifiedEvent},
    dispatch::{DispatchOutcome, EventDispatcher},
    events::{LogLevel, NewWebhookEvent, WebhookLog},
    signature::SignatureVerifier,
    store::WebhookStore,
    Result, TrustError, WebhookError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default deadline for a single store call
pub const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to one delivery item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// New event persisted and queued for dispatch
    Accepted { event_id: String, dedup_key: String },
    /// Redelivery; audit row written, no dispatch
    Duplicate {
        event_id: String,
        original_id: String,
        dedup_key: String,
    },
    /// Not classifiable; nothing persisted
    Skipped,
    /// Persistence failed for this item only
    Failed {
        dedup_key: Option<String>,
        error: String,
    },
}

/// Per-delivery summary returned once every item has been handled
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReceipt {
    pub received_at: DateTime<Utc>,
    pub outcomes: Vec<ItemOutcome>,
}

impl IngestionReceipt {
    pub fn accepted_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ItemOutcome::Accepted { event_id, .. } => Some(event_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn duplicate_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Duplicate { .. }))
    }

    pub fn skipped_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Skipped))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(o)).count()
    }
}

/// One classifiable candidate pulled out of a delivery
#[derive(Debug, Clone)]
struct DeliveryItem {
    provider_account_id: Option<String>,
    node: Value,
}

/// Orchestrates verify → classify → dedup → persist → dispatch
pub struct IngestionCoordinator {
    store: Arc<dyn WebhookStore>,
    accounts: Arc<dyn AccountDirectory>,
    dispatcher: EventDispatcher,
    verifier: SignatureVerifier,
    app_secret: String,
    persistence_timeout: Duration,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        accounts: Arc<dyn AccountDirectory>,
        dispatcher: EventDispatcher,
        app_secret: impl Into<String>,
    ) -> Self {
        Self {
            store,
            accounts,
            dispatcher,
            verifier: SignatureVerifier::new(),
            app_secret: app_secret.into(),
            persistence_timeout: DEFAULT_PERSISTENCE_TIMEOUT,
        }
    }

    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_persistence_timeout(mut self, timeout: Duration) -> Self {
        self.persistence_timeout = timeout;
        self
    }

    /// Ingest a delivery, then spawn dispatch for accepted events without
    /// waiting on it.
    pub async fn receive(&self, signature_header: Option<&str>, raw_body: &[u8]) -> Result<IngestionReceipt> {
        let receipt = self.ingest(signature_header, raw_body).await?;
        // Detached: the handles are dropped and the response does not wait.
        drop(self.dispatch_accepted(&receipt));
        Ok(receipt)
    }

    /// Verify and persist a delivery. Nothing is dispatched.
    pub async fn ingest(&self, signature_header: Option<&str>, raw_body: &[u8]) -> Result<IngestionReceipt> {
        if !self.verifier.verify(signature_header, raw_body, &self.app_secret) {
            return Err(TrustError::SignatureInvalid.reject());
        }

        let payload: Value = serde_json::from_slice(raw_body)
            .map_err(|e| WebhookError::InvalidPayload(format!("body is not JSON: {}", e)))?;

        let received_at = Utc::now();
        let items = extract_items(&payload);
        let object = payload.get("object").and_then(Value::as_str).unwrap_or("unknown");
        debug!(
            object = %object,
            items = items.len(),
            "Received webhook delivery"
        );

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            outcomes.push(self.ingest_item(item, received_at).await);
        }

        let receipt = IngestionReceipt {
            received_at,
            outcomes,
        };
        info!(
            accepted = receipt.accepted_ids().len(),
            duplicates = receipt.duplicate_count(),
            skipped = receipt.skipped_count(),
            failed = receipt.failed_count(),
            "Webhook delivery ingested"
        );
        Ok(receipt)
    }

    /// Spawn dispatch for every accepted event in `receipt`
    pub fn dispatch_accepted(&self, receipt: &IngestionReceipt) -> Vec<JoinHandle<DispatchOutcome>> {
        receipt
            .accepted_ids()
            .into_iter()
            .map(|id| self.dispatcher.dispatch(id))
            .collect()
    }

    async fn ingest_item(&self, item: DeliveryItem, received_at: DateTime<Utc>) -> ItemOutcome {
        let Some(classified) = classify(&item.node) else {
            let field = item.node.get("field").and_then(Value::as_str).unwrap_or("-");
            debug!(field = %field, "Skipping unclassifiable webhook item");
            return ItemOutcome::Skipped;
        };

        let dedup_key = classified.dedup_key();
        match self.persist(&item, &classified, &dedup_key, received_at).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(dedup_key = %dedup_key, error = %e, "Failed to ingest webhook item");
                let log = WebhookLog::new(LogLevel::Error, "Failed to ingest webhook item")
                    .with_context(json!({ "dedup_key": dedup_key, "error": e.to_string() }));
                if let Err(log_error) = self.store.append_log(log).await {
                    warn!(error = %log_error, "Failed to append webhook log");
                }
                ItemOutcome::Failed {
                    dedup_key: Some(dedup_key),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn persist(
        &self,
        item: &DeliveryItem,
        classified: &ClassifiedEvent,
        dedup_key: &str,
        received_at: DateTime<Utc>,
    ) -> Result<ItemOutcome> {
        let existing = self
            .with_deadline("find_event_by_dedup_key", self.store.find_event_by_dedup_key(dedup_key))
            .await?;

        if let Some(original) = existing {
            let duplicate = NewWebhookEvent::duplicate_of(&original, item.node.clone(), received_at);
            let saved = self
                .with_deadline("insert_event", self.store.insert_event(duplicate))
                .await?;

            info!(
                event_id = %saved.id,
                original_id = %original.id,
                dedup_key = %dedup_key,
                "Duplicate webhook delivery"
            );
            self.append_log(
                WebhookLog::new(LogLevel::Info, "Duplicate webhook delivery")
                    .with_event(saved.id.clone())
                    .with_context(json!({ "duplicate_of": original.id, "dedup_key": dedup_key })),
            )
            .await;

            return Ok(ItemOutcome::Duplicate {
                event_id: saved.id,
                original_id: original.id,
                dedup_key: dedup_key.to_string(),
            });
        }

        let account_id = self.resolve_account(item.provider_account_id.as_deref()).await;
        let event = NewWebhookEvent {
            event_type: classified.event_type,
            dedup_key: dedup_key.to_string(),
            account_id: account_id.clone(),
            object_type: classified.object_type.clone(),
            object_id: classified.object_id.clone(),
            sender_id: classified.sender_id.clone(),
            sender_username: classified.sender_username.clone(),
            payload: item.node.clone(),
            is_duplicate: false,
            duplicate_of: None,
        };
        let saved = self
            .with_deadline("insert_event", self.store.insert_event(event))
            .await?;

        if let Some(account_id) = &account_id {
            let counted = self
                .with_deadline(
                    "increment_subscription_counters",
                    self.store.increment_subscription_counters(account_id, received_at),
                )
                .await;
            if let Err(e) = counted {
                warn!(account_id = %account_id, error = %e, "Failed to update subscription counters");
            }
        }

        info!(
            event_id = %saved.id,
            event_type = %saved.event_type,
            account_id = ?account_id,
            "Accepted webhook event"
        );
        Ok(ItemOutcome::Accepted {
            event_id: saved.id,
            dedup_key: dedup_key.to_string(),
        })
    }

    /// Best effort: lookup failures leave the event unowned
    async fn resolve_account(&self, provider_account_id: Option<&str>) -> Option<String> {
        let provider_account_id = provider_account_id?;
        match self
            .with_deadline("resolve_account", self.accounts.resolve_account(provider_account_id))
            .await
        {
            Ok(account_id) => {
                if account_id.is_none() {
                    debug!(provider_account_id = %provider_account_id, "No account for provider id");
                }
                account_id
            }
            Err(e) => {
                warn!(provider_account_id = %provider_account_id, error = %e, "Account lookup failed");
                None
            }
        }
    }

    async fn append_log(&self, log: WebhookLog) {
        if let Err(e) = self.store.append_log(log).await {
            warn!(error = %e, "Failed to append webhook log");
        }
    }

    /// A timeout is a persistence failure, never an empty result
    async fn with_deadline<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.persistence_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(WebhookError::PersistenceFailure(format!(
                "{} timed out after {:?}",
                operation, self.persistence_timeout
            ))),
        }
    }
}

/// Flatten `entry[].changes[]` and `entry[].messaging[]` into items
fn extract_items(payload: &Value) -> Vec<DeliveryItem> {
    let Some(entries) = payload.get("entry").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut items = Vec::new();
    for entry in entries {
        let provider_account_id = match entry.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        for key in ["changes", "messaging"] {
            if let Some(nodes) = entry.get(key).and_then(Value::as_array) {
                items.extend(nodes.iter().map(|node| DeliveryItem {
                    provider_account_id: provider_account_id.clone(),
                    node: node.clone(),
                }));
            }
        }
    }
    items
}
