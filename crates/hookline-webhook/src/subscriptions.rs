//! Webhook subscription management

use crate::{
    events::WebhookSubscription,
    store::WebhookStore,
    Result, WebhookError,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

/// Create/update request for an account's subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub fields: Vec<String>,
    pub callback_url: String,
    /// Generated when omitted on creation; kept when omitted on update
    pub verify_token: Option<String>,
}

impl SubscriptionRequest {
    fn validate(&self) -> Result<()> {
        if self.fields.iter().all(|f| f.trim().is_empty()) {
            return Err(WebhookError::InvalidPayload(
                "at least one subscription field is required".to_string(),
            ));
        }
        if !(self.callback_url.starts_with("https://") || self.callback_url.starts_with("http://")) {
            return Err(WebhookError::InvalidPayload(format!(
                "invalid callback URL: {}",
                self.callback_url
            )));
        }
        if self.verify_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(WebhookError::InvalidPayload(
                "verify token must not be blank".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate a verify token: 32 random bytes, hex-encoded
pub fn generate_verify_token() -> String {
    let token: [u8; 32] = rand::thread_rng().gen();
    hex::encode(token)
}

/// Upserts one subscription per account
pub struct SubscriptionManager {
    store: Arc<dyn WebhookStore>,
}

impl SubscriptionManager {
    pub fn new(store: Arc<dyn WebhookStore>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, account_id: &str, request: SubscriptionRequest) -> Result<WebhookSubscription> {
        request.validate()?;

        let now = Utc::now();
        let fields: BTreeSet<String> = request
            .fields
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        let subscription = match self.store.get_subscription(account_id).await? {
            Some(existing) => WebhookSubscription {
                subscription_fields: fields,
                callback_url: request.callback_url,
                verify_token: request.verify_token.unwrap_or(existing.verify_token.clone()),
                is_active: true,
                updated_at: now,
                ..existing
            },
            None => WebhookSubscription {
                account_id: account_id.to_string(),
                subscription_fields: fields,
                callback_url: request.callback_url,
                verify_token: request.verify_token.unwrap_or_else(generate_verify_token),
                is_active: true,
                last_verified_at: None,
                last_event_received_at: None,
                events_received_count: 0,
                subscription_errors: 0,
                last_error: None,
                created_at: now,
                updated_at: now,
            },
        };

        let saved = self.store.upsert_subscription(subscription).await?;
        info!(
            account_id = %account_id,
            fields = ?saved.subscription_fields,
            "Upserted webhook subscription"
        );
        Ok(saved)
    }

    pub async fn get(&self, account_id: &str) -> Result<WebhookSubscription> {
        self.store
            .get_subscription(account_id)
            .await?
            .ok_or_else(|| WebhookError::NotFound(format!("subscription for {}", account_id)))
    }
}
