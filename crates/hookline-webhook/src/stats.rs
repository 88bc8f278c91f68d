//! Per-account event statistics

use crate::{
    events::WebhookEventType,
    ledger::DEFAULT_MAX_ATTEMPTS,
    store::{EventFilter, WebhookStore},
    Result,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Aggregate counts for one account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookStats {
    pub total_events: u64,
    pub processed_events: u64,
    /// Unprocessed originals, including those out of retries
    pub pending_events: u64,
    /// Unprocessed originals at or past the attempt ceiling
    pub failed_events: u64,
    pub duplicate_events: u64,
    pub by_type: BTreeMap<WebhookEventType, u64>,
}

/// Computes [`WebhookStats`] with storage-side counts
pub struct StatsAggregator {
    store: Arc<dyn WebhookStore>,
    max_attempts: u32,
}

impl StatsAggregator {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub async fn stats(&self, account_id: &str) -> Result<WebhookStats> {
        let pending_filter = EventFilter::all().processed(false).duplicate(false);

        let total_events = self.store.count_events(account_id, &EventFilter::all()).await?;
        let processed_events = self
            .store
            .count_events(account_id, &EventFilter::all().processed(true))
            .await?;
        let pending_events = self.store.count_events(account_id, &pending_filter).await?;
        let failed_events = self
            .store
            .count_events(account_id, &pending_filter.min_attempts(self.max_attempts))
            .await?;
        let duplicate_events = self
            .store
            .count_events(account_id, &EventFilter::all().duplicate(true))
            .await?;
        let by_type = self
            .store
            .count_events_by_type(account_id)
            .await?
            .into_iter()
            .collect();

        Ok(WebhookStats {
            total_events,
            processed_events,
            pending_events,
            failed_events,
            duplicate_events,
            by_type,
        })
    }
}
