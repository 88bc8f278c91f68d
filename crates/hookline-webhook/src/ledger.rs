//! Retry bookkeeping
//!
//! Records dispatch outcomes and answers which failed events may be
//! re-driven. Re-driving itself belongs to an outside dispatcher.

use crate::{store::WebhookStore, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Attempts after which an event stops being retry-eligible
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default cap on ids returned by one eligibility query
pub const DEFAULT_RETRY_LIMIT: usize = 100;

/// Ledger of processing attempts per event
pub struct RetryLedger {
    store: Arc<dyn WebhookStore>,
    max_attempts: u32,
    batch_limit: usize,
}

impl RetryLedger {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Unprocessed, non-duplicate events below the attempt ceiling, oldest first
    pub async fn retry_eligible(&self, account_id: &str, limit: usize) -> Result<Vec<String>> {
        self.store
            .list_retry_eligible(account_id, self.max_attempts, limit)
            .await
    }

    /// Zero the attempts and clear the error of the given events
    pub async fn reset_for_retry(&self, event_ids: &[String]) -> Result<u64> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let reset = self.store.reset_processing_attempts(event_ids).await?;
        info!(requested = event_ids.len(), reset = reset, "Reset events for retry");
        Ok(reset)
    }

    /// Re-arm up to the batch limit of eligible events; returns how many
    pub async fn retry_failed_events(&self, account_id: &str) -> Result<u64> {
        let eligible = self.retry_eligible(account_id, self.batch_limit).await?;
        self.reset_for_retry(&eligible).await
    }

    pub async fn mark_processed(&self, event_id: &str) -> Result<()> {
        self.store.mark_processed(event_id, Utc::now()).await
    }

    pub async fn mark_failed(&self, event_id: &str, error: &str) -> Result<()> {
        self.store.mark_failed(event_id, error).await
    }
}
