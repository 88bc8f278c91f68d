//! Persistence collaborator
//!
//! [`WebhookStore`] is the only way the pipeline touches durable state.
//! [`InMemoryWebhookStore`] backs the server binary and the tests.

use crate::{
    events::{
        NewWebhookEvent, WebhookEvent, WebhookEventType, WebhookLog, WebhookSubscription,
    },
    signature::{compare_digests, SubtleComparator},
    Result, WebhookError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Maximum page size for event listings
pub const MAX_PAGE_SIZE: u32 = 100;

/// Row predicate used by counting queries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub processed: Option<bool>,
    pub is_duplicate: Option<bool>,
    pub min_attempts: Option<u32>,
    pub event_type: Option<WebhookEventType>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn processed(mut self, processed: bool) -> Self {
        self.processed = Some(processed);
        self
    }

    pub fn duplicate(mut self, is_duplicate: bool) -> Self {
        self.is_duplicate = Some(is_duplicate);
        self
    }

    pub fn min_attempts(mut self, attempts: u32) -> Self {
        self.min_attempts = Some(attempts);
        self
    }

    pub fn event_type(mut self, event_type: WebhookEventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn matches(&self, event: &WebhookEvent) -> bool {
        self.processed.map_or(true, |p| event.processed == p)
            && self.is_duplicate.map_or(true, |d| event.is_duplicate == d)
            && self
                .min_attempts
                .map_or(true, |a| event.processing_attempts >= a)
            && self.event_type.map_or(true, |t| event.event_type == t)
    }
}

/// Paginated listing request
#[derive(Debug, Clone, Deserialize)]
pub struct EventQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    pub event_type: Option<WebhookEventType>,
    pub processed: Option<bool>,
}

impl EventQuery {
    /// 1-based page, per-page clamped to `1..=MAX_PAGE_SIZE`
    pub fn normalized(&self) -> (u32, u32) {
        (self.page.max(1), self.per_page.clamp(1, MAX_PAGE_SIZE))
    }

    pub fn filter(&self) -> EventFilter {
        EventFilter {
            processed: self.processed,
            event_type: self.event_type,
            ..EventFilter::default()
        }
    }
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            per_page: default_per_page(),
            event_type: None,
            processed: None,
        }
    }
}

fn default_page() -> u32 {
    1
}

fn default_per_page() -> u32 {
    20
}

/// One page of events, newest first
#[derive(Debug, Clone, Serialize)]
pub struct EventPage {
    pub events: Vec<WebhookEvent>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
}

/// Persistence trait for events, subscriptions and logs
#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Look up the original event carrying `dedup_key`
    async fn find_event_by_dedup_key(&self, dedup_key: &str) -> Result<Option<WebhookEvent>>;

    /// Insert a new event row, assigning its id
    async fn insert_event(&self, event: NewWebhookEvent) -> Result<WebhookEvent>;

    /// Get event by ID
    async fn get_event(&self, id: &str) -> Result<Option<WebhookEvent>>;

    /// Set `processed` and `processed_at`
    async fn mark_processed(&self, id: &str, processed_at: DateTime<Utc>) -> Result<()>;

    /// Increment attempts and record the error
    async fn mark_failed(&self, id: &str, error: &str) -> Result<()>;

    /// Ids of unprocessed originals below `max_attempts`, oldest first
    async fn list_retry_eligible(
        &self,
        account_id: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Zero attempts and clear errors on unprocessed originals; returns rows touched
    async fn reset_processing_attempts(&self, ids: &[String]) -> Result<u64>;

    /// Count an account's events matching `filter`
    async fn count_events(&self, account_id: &str, filter: &EventFilter) -> Result<u64>;

    /// Count an account's events per type
    async fn count_events_by_type(&self, account_id: &str) -> Result<HashMap<WebhookEventType, u64>>;

    /// List an account's events, newest first
    async fn list_events(&self, account_id: &str, query: &EventQuery) -> Result<EventPage>;

    /// Insert or replace the subscription for its account
    async fn upsert_subscription(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription>;

    /// Get the subscription for an account
    async fn get_subscription(&self, account_id: &str) -> Result<Option<WebhookSubscription>>;

    /// Atomically bump `events_received_count` and `last_event_received_at`
    async fn increment_subscription_counters(
        &self,
        account_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Atomically bump `subscription_errors` and record `last_error`
    async fn record_subscription_error(&self, account_id: &str, error: &str) -> Result<()>;

    /// Active subscription registered with `verify_token`, if any
    async fn find_active_subscription_by_token(
        &self,
        verify_token: &str,
    ) -> Result<Option<WebhookSubscription>>;

    /// Stamp `last_verified_at` on active subscriptions using `verify_token`
    async fn mark_subscriptions_verified(
        &self,
        verify_token: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Append a diagnostic log row
    async fn append_log(&self, log: WebhookLog) -> Result<()>;
}

/// In-memory store with a bounded log trail
pub struct InMemoryWebhookStore {
    events: DashMap<String, WebhookEvent>,
    by_dedup_key: DashMap<String, String>,
    insertion_order: RwLock<Vec<String>>,
    subscriptions: DashMap<String, WebhookSubscription>,
    logs: RwLock<VecDeque<WebhookLog>>,
    max_logs: usize,
}

impl InMemoryWebhookStore {
    pub fn new(max_logs: usize) -> Self {
        Self {
            events: DashMap::new(),
            by_dedup_key: DashMap::new(),
            insertion_order: RwLock::new(Vec::new()),
            subscriptions: DashMap::new(),
            logs: RwLock::new(VecDeque::new()),
            max_logs,
        }
    }

    /// Snapshot of the retained log rows, oldest first
    pub fn logs(&self) -> Vec<WebhookLog> {
        self.logs.read().iter().cloned().collect()
    }

    /// Snapshot of every event row in insertion order
    pub fn events(&self) -> Vec<WebhookEvent> {
        self.insertion_order
            .read()
            .iter()
            .filter_map(|id| self.events.get(id).map(|e| e.clone()))
            .collect()
    }

    fn account_events(&self, account_id: &str) -> Vec<WebhookEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.account_id.as_deref() == Some(account_id))
            .collect()
    }
}

impl Default for InMemoryWebhookStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl WebhookStore for InMemoryWebhookStore {
    async fn find_event_by_dedup_key(&self, dedup_key: &str) -> Result<Option<WebhookEvent>> {
        let Some(id) = self.by_dedup_key.get(dedup_key).map(|id| id.clone()) else {
            return Ok(None);
        };
        Ok(self.events.get(&id).map(|e| e.clone()))
    }

    async fn insert_event(&self, event: NewWebhookEvent) -> Result<WebhookEvent> {
        let event = event.into_event(Utc::now());
        let id = event.id.clone();

        // First writer keeps the index; a racing second original is still stored.
        self.by_dedup_key
            .entry(event.dedup_key.clone())
            .or_insert_with(|| id.clone());
        self.events.insert(id.clone(), event.clone());
        self.insertion_order.write().push(id);

        Ok(event)
    }

    async fn get_event(&self, id: &str) -> Result<Option<WebhookEvent>> {
        Ok(self.events.get(id).map(|e| e.clone()))
    }

    async fn mark_processed(&self, id: &str, processed_at: DateTime<Utc>) -> Result<()> {
        let mut event = self
            .events
            .get_mut(id)
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;
        if event.is_duplicate {
            return Err(WebhookError::InvalidPayload(format!(
                "duplicate event {} cannot be processed",
                id
            )));
        }
        event.processed = true;
        event.processed_at = Some(processed_at);
        event.updated_at = processed_at;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut event = self
            .events
            .get_mut(id)
            .ok_or_else(|| WebhookError::NotFound(id.to_string()))?;
        event.processing_attempts = event.processing_attempts.saturating_add(1);
        event.last_processing_error = Some(error.to_string());
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn list_retry_eligible(
        &self,
        account_id: &str,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<String>> {
        let ids = self
            .account_events(account_id)
            .into_iter()
            .filter(|e| e.is_retry_eligible(max_attempts))
            .take(limit)
            .map(|e| e.id)
            .collect();
        Ok(ids)
    }

    async fn reset_processing_attempts(&self, ids: &[String]) -> Result<u64> {
        let now = Utc::now();
        let mut reset = 0u64;
        for id in ids {
            if let Some(mut event) = self.events.get_mut(id) {
                if event.processed || event.is_duplicate {
                    continue;
                }
                event.processing_attempts = 0;
                event.last_processing_error = None;
                event.updated_at = now;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn count_events(&self, account_id: &str, filter: &EventFilter) -> Result<u64> {
        let count = self
            .events
            .iter()
            .filter(|e| e.account_id.as_deref() == Some(account_id) && filter.matches(&e))
            .count();
        Ok(count as u64)
    }

    async fn count_events_by_type(&self, account_id: &str) -> Result<HashMap<WebhookEventType, u64>> {
        let mut counts = HashMap::new();
        for event in self.events.iter() {
            if event.account_id.as_deref() == Some(account_id) {
                *counts.entry(event.event_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn list_events(&self, account_id: &str, query: &EventQuery) -> Result<EventPage> {
        let (page, per_page) = query.normalized();
        let filter = query.filter();

        let matching: Vec<_> = self
            .account_events(account_id)
            .into_iter()
            .rev()
            .filter(|e| filter.matches(e))
            .collect();
        let total = matching.len() as u64;

        let offset = (page as usize - 1) * per_page as usize;
        let events = matching
            .into_iter()
            .skip(offset)
            .take(per_page as usize)
            .collect();

        Ok(EventPage {
            events,
            total,
            page,
            per_page,
        })
    }

    async fn upsert_subscription(&self, subscription: WebhookSubscription) -> Result<WebhookSubscription> {
        self.subscriptions
            .insert(subscription.account_id.clone(), subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(&self, account_id: &str) -> Result<Option<WebhookSubscription>> {
        Ok(self.subscriptions.get(account_id).map(|s| s.clone()))
    }

    async fn increment_subscription_counters(
        &self,
        account_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<()> {
        // The shard write lock makes this a single atomic update.
        match self.subscriptions.get_mut(account_id) {
            Some(mut subscription) => {
                subscription.events_received_count += 1;
                subscription.last_event_received_at = Some(received_at);
                subscription.updated_at = received_at;
            }
            None => debug!(account_id = %account_id, "No subscription to count event against"),
        }
        Ok(())
    }

    async fn record_subscription_error(&self, account_id: &str, error: &str) -> Result<()> {
        if let Some(mut subscription) = self.subscriptions.get_mut(account_id) {
            subscription.subscription_errors += 1;
            subscription.last_error = Some(error.to_string());
            subscription.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_active_subscription_by_token(
        &self,
        verify_token: &str,
    ) -> Result<Option<WebhookSubscription>> {
        if verify_token.is_empty() {
            return Ok(None);
        }
        Ok(self
            .subscriptions
            .iter()
            .find(|s| s.is_active && token_matches(&s.verify_token, verify_token))
            .map(|s| s.clone()))
    }

    async fn mark_subscriptions_verified(
        &self,
        verify_token: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut stamped = 0u64;
        for mut subscription in self.subscriptions.iter_mut() {
            if subscription.is_active && token_matches(&subscription.verify_token, verify_token) {
                subscription.last_verified_at = Some(verified_at);
                subscription.updated_at = verified_at;
                stamped += 1;
            }
        }
        Ok(stamped)
    }

    async fn append_log(&self, log: WebhookLog) -> Result<()> {
        let mut logs = self.logs.write();
        logs.push_back(log);
        while logs.len() > self.max_logs {
            logs.pop_front();
        }
        Ok(())
    }
}

fn token_matches(stored: &str, presented: &str) -> bool {
    compare_digests(&SubtleComparator, stored.as_bytes(), presented.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogLevel;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn new_event(key: &str, account: Option<&str>, event_type: WebhookEventType) -> NewWebhookEvent {
        NewWebhookEvent {
            event_type,
            dedup_key: key.to_string(),
            account_id: account.map(String::from),
            object_type: None,
            object_id: None,
            sender_id: None,
            sender_username: None,
            payload: json!({}),
            is_duplicate: false,
            duplicate_of: None,
        }
    }

    fn subscription(account_id: &str, token: &str) -> WebhookSubscription {
        let now = Utc::now();
        WebhookSubscription {
            account_id: account_id.to_string(),
            subscription_fields: BTreeSet::new(),
            callback_url: "https://example.com/webhooks".to_string(),
            verify_token: token.to_string(),
            is_active: true,
            last_verified_at: None,
            last_event_received_at: None,
            events_received_count: 0,
            subscription_errors: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_by_dedup_key() {
        let store = InMemoryWebhookStore::default();
        let inserted = store
            .insert_event(new_event("comment_c1_u1", Some("a1"), WebhookEventType::Comment))
            .await
            .unwrap();

        let found = store.find_event_by_dedup_key("comment_c1_u1").await.unwrap();
        assert_eq!(found.unwrap().id, inserted.id);
        assert!(store.find_event_by_dedup_key("comment_c2_u1").await.unwrap().is_none());
        assert!(store.get_event(&inserted.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_racing_originals_keep_first_index_entry() {
        let store = InMemoryWebhookStore::default();
        let first = store
            .insert_event(new_event("k", Some("a1"), WebhookEventType::Comment))
            .await
            .unwrap();
        store
            .insert_event(new_event("k", Some("a1"), WebhookEventType::Comment))
            .await
            .unwrap();

        assert_eq!(store.events().len(), 2);
        let found = store.find_event_by_dedup_key("k").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_mark_processed_and_failed() {
        let store = InMemoryWebhookStore::default();
        let event = store
            .insert_event(new_event("k1", Some("a1"), WebhookEventType::Message))
            .await
            .unwrap();

        store.mark_failed(&event.id, "handler down").await.unwrap();
        store.mark_failed(&event.id, "handler still down").await.unwrap();
        let failed = store.get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(failed.processing_attempts, 2);
        assert_eq!(failed.last_processing_error.as_deref(), Some("handler still down"));

        let at = Utc::now();
        store.mark_processed(&event.id, at).await.unwrap();
        let processed = store.get_event(&event.id).await.unwrap().unwrap();
        assert!(processed.processed);
        assert_eq!(processed.processed_at, Some(at));

        assert!(matches!(
            store.mark_failed("missing", "x").await,
            Err(WebhookError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicates_are_never_marked_processed() {
        let store = InMemoryWebhookStore::default();
        let original = store
            .insert_event(new_event("k", Some("a1"), WebhookEventType::Comment))
            .await
            .unwrap();
        let duplicate = store
            .insert_event(NewWebhookEvent::duplicate_of(&original, json!({}), Utc::now()))
            .await
            .unwrap();

        assert!(store.mark_processed(&duplicate.id, Utc::now()).await.is_err());
        let stored = store.get_event(&duplicate.id).await.unwrap().unwrap();
        assert!(!stored.processed);
    }

    #[tokio::test]
    async fn test_retry_eligible_oldest_first_and_limited() {
        let store = InMemoryWebhookStore::default();
        let mut ids = Vec::new();
        for i in 0..5 {
            let event = store
                .insert_event(new_event(&format!("k{}", i), Some("a1"), WebhookEventType::Comment))
                .await
                .unwrap();
            ids.push(event.id);
        }
        for _ in 0..3 {
            store.mark_failed(&ids[1], "boom").await.unwrap();
        }
        store
            .insert_event(new_event("other", Some("a2"), WebhookEventType::Comment))
            .await
            .unwrap();

        let eligible = store.list_retry_eligible("a1", 3, 10).await.unwrap();
        assert_eq!(eligible, vec![ids[0].clone(), ids[2].clone(), ids[3].clone(), ids[4].clone()]);

        let limited = store.list_retry_eligible("a1", 3, 2).await.unwrap();
        assert_eq!(limited, vec![ids[0].clone(), ids[2].clone()]);
    }

    #[tokio::test]
    async fn test_reset_skips_processed_and_duplicates() {
        let store = InMemoryWebhookStore::default();
        let failed = store
            .insert_event(new_event("k1", Some("a1"), WebhookEventType::Comment))
            .await
            .unwrap();
        let done = store
            .insert_event(new_event("k2", Some("a1"), WebhookEventType::Comment))
            .await
            .unwrap();
        store.mark_failed(&failed.id, "boom").await.unwrap();
        store.mark_failed(&done.id, "boom").await.unwrap();
        store.mark_processed(&done.id, Utc::now()).await.unwrap();

        let reset = store
            .reset_processing_attempts(&[failed.id.clone(), done.id.clone(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let stored = store.get_event(&failed.id).await.unwrap().unwrap();
        assert_eq!(stored.processing_attempts, 0);
        assert!(stored.last_processing_error.is_none());
    }

    #[tokio::test]
    async fn test_counts_and_listing() {
        let store = InMemoryWebhookStore::default();
        for i in 0..3 {
            store
                .insert_event(new_event(&format!("c{}", i), Some("a1"), WebhookEventType::Comment))
                .await
                .unwrap();
        }
        let message = store
            .insert_event(new_event("m", Some("a1"), WebhookEventType::Message))
            .await
            .unwrap();
        store.mark_processed(&message.id, Utc::now()).await.unwrap();

        assert_eq!(store.count_events("a1", &EventFilter::all()).await.unwrap(), 4);
        assert_eq!(
            store
                .count_events("a1", &EventFilter::all().processed(true))
                .await
                .unwrap(),
            1
        );
        let by_type = store.count_events_by_type("a1").await.unwrap();
        assert_eq!(by_type.get(&WebhookEventType::Comment), Some(&3));

        let query = EventQuery {
            page: 1,
            per_page: 2,
            ..EventQuery::default()
        };
        let page = store.list_events("a1", &query).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.events.len(), 2);
        // Newest first
        assert_eq!(page.events[0].id, message.id);

        let second = store
            .list_events("a1", &EventQuery { page: 2, ..query.clone() })
            .await
            .unwrap();
        assert_eq!(second.events.len(), 2);

        let comments_only = EventQuery {
            event_type: Some(WebhookEventType::Comment),
            ..EventQuery::default()
        };
        assert_eq!(store.list_events("a1", &comments_only).await.unwrap().total, 3);
    }

    #[test]
    fn test_query_normalization() {
        let query = EventQuery {
            page: 0,
            per_page: 10_000,
            event_type: None,
            processed: None,
        };
        assert_eq!(query.normalized(), (1, MAX_PAGE_SIZE));
    }

    #[tokio::test]
    async fn test_subscription_counters() {
        let store = InMemoryWebhookStore::default();
        store.upsert_subscription(subscription("a1", "tok")).await.unwrap();

        let at = Utc::now();
        store.increment_subscription_counters("a1", at).await.unwrap();
        store.increment_subscription_counters("a1", at).await.unwrap();
        store.increment_subscription_counters("unknown", at).await.unwrap();
        store.record_subscription_error("a1", "callback unreachable").await.unwrap();

        let stored = store.get_subscription("a1").await.unwrap().unwrap();
        assert_eq!(stored.events_received_count, 2);
        assert_eq!(stored.last_event_received_at, Some(at));
        assert_eq!(stored.subscription_errors, 1);
        assert_eq!(stored.last_error.as_deref(), Some("callback unreachable"));
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = std::sync::Arc::new(InMemoryWebhookStore::default());
        store.upsert_subscription(subscription("a1", "tok")).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .increment_subscription_counters("a1", Utc::now())
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stored = store.get_subscription("a1").await.unwrap().unwrap();
        assert_eq!(stored.events_received_count, 50);
    }

    #[tokio::test]
    async fn test_mark_subscriptions_verified() {
        let store = InMemoryWebhookStore::default();
        store.upsert_subscription(subscription("a1", "tok")).await.unwrap();
        store.upsert_subscription(subscription("a2", "other")).await.unwrap();

        let stamped = store.mark_subscriptions_verified("tok", Utc::now()).await.unwrap();
        assert_eq!(stamped, 1);
        assert!(store.get_subscription("a1").await.unwrap().unwrap().last_verified_at.is_some());
        assert!(store.get_subscription("a2").await.unwrap().unwrap().last_verified_at.is_none());
    }

    #[tokio::test]
    async fn test_find_active_subscription_by_token() {
        let store = InMemoryWebhookStore::default();
        store.upsert_subscription(subscription("a1", "tok")).await.unwrap();
        let mut inactive = subscription("a2", "dormant");
        inactive.is_active = false;
        store.upsert_subscription(inactive).await.unwrap();

        let found = store.find_active_subscription_by_token("tok").await.unwrap();
        assert_eq!(found.map(|s| s.account_id).as_deref(), Some("a1"));
        assert!(store.find_active_subscription_by_token("dormant").await.unwrap().is_none());
        assert!(store.find_active_subscription_by_token("to").await.unwrap().is_none());
        assert!(store.find_active_subscription_by_token("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_log_trail_is_bounded() {
        let store = InMemoryWebhookStore::new(2);
        for i in 0..3 {
            store
                .append_log(WebhookLog::new(LogLevel::Info, format!("entry {}", i)))
                .await
                .unwrap();
        }
        let logs = store.logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "entry 1");
    }
}
