//! Inbound HTTP surface
//!
//! Provider-facing routes (handshake, deliveries, signed requests) and the
//! owner-scoped admin routes over subscriptions, retries and statistics.

use crate::{
    accounts::AccountDirectory,
    dispatch::{EventDispatcher, EventHandler},
    events::WebhookSubscription,
    handshake::HandshakeQuery,
    ingestion::IngestionCoordinator,
    ledger::RetryLedger,
    signature::{compare_digests, SubtleComparator},
    signed_request::{SignedPayloadCodec, SignedRequestPayload},
    stats::{StatsAggregator, WebhookStats},
    store::{EventPage, EventQuery, WebhookStore},
    subscriptions::{SubscriptionManager, SubscriptionRequest},
    Result, TrustError, WebhookError,
};
use axum::{
    body::Bytes,
    extract::{rejection::FormRejection, Form, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hookline_core::{
    IngestionConfig, WebhookConfig, LEGACY_SIGNATURE_HEADER, SIGNATURE_HEADER, USER_ID_HEADER,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared state for webhook routes
pub struct WebhookState {
    verify_token: String,
    app_secret: String,
    store: Arc<dyn WebhookStore>,
    accounts: Arc<dyn AccountDirectory>,
    coordinator: IngestionCoordinator,
    codec: SignedPayloadCodec,
    ledger: Arc<RetryLedger>,
    stats: StatsAggregator,
    subscriptions: SubscriptionManager,
}

impl WebhookState {
    /// Wire the pipeline from configuration and its three collaborators
    pub fn build(
        webhook: &WebhookConfig,
        ingestion: &IngestionConfig,
        store: Arc<dyn WebhookStore>,
        accounts: Arc<dyn AccountDirectory>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let ledger = Arc::new(
            RetryLedger::new(store.clone())
                .with_max_attempts(ingestion.max_processing_attempts)
                .with_batch_limit(ingestion.retry_batch_limit),
        );
        let dispatcher = EventDispatcher::new(handler, ledger.clone(), store.clone())
            .with_timeout(ingestion.dispatch_timeout());
        let coordinator = IngestionCoordinator::new(
            store.clone(),
            accounts.clone(),
            dispatcher,
            webhook.app_secret.clone(),
        )
        .with_persistence_timeout(ingestion.persistence_timeout());

        Self {
            verify_token: webhook.verify_token.clone(),
            app_secret: webhook.app_secret.clone(),
            coordinator,
            codec: SignedPayloadCodec::new().with_tolerance(webhook.signature_tolerance_seconds),
            stats: StatsAggregator::new(store.clone())
                .with_max_attempts(ingestion.max_processing_attempts),
            subscriptions: SubscriptionManager::new(store.clone()),
            ledger,
            store,
            accounts,
        }
    }

    pub fn store(&self) -> &Arc<dyn WebhookStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &IngestionCoordinator {
        &self.coordinator
    }

    /// Challenge to echo when the presented token is the configured one or
    /// belongs to an active subscription
    async fn answer_handshake(&self, query: &HandshakeQuery) -> Option<String> {
        let presented = query.verify_token.as_deref().unwrap_or_default();
        if presented.is_empty()
            || compare_digests(&SubtleComparator, self.verify_token.as_bytes(), presented.as_bytes())
        {
            return query.answer(&self.verify_token);
        }

        let expected = match self.store.find_active_subscription_by_token(presented).await {
            Ok(Some(subscription)) => {
                debug!(account_id = %subscription.account_id, "Handshake token belongs to subscription");
                subscription.verify_token
            }
            Ok(None) => self.verify_token.clone(),
            Err(e) => {
                warn!(error = %e, "Subscription token lookup failed");
                self.verify_token.clone()
            }
        };
        query.answer(&expected)
    }

    /// The caller must be the owner of `account_id`
    async fn authorize(&self, headers: &HeaderMap, account_id: &str) -> Result<()> {
        let caller = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty());
        let Some(caller) = caller else {
            warn!(account_id = %account_id, "Admin request without caller identity");
            return Err(WebhookError::Forbidden);
        };

        match self.accounts.owner_of(account_id).await? {
            Some(owner) if owner == caller => Ok(()),
            _ => {
                warn!(account_id = %account_id, caller = %caller, "Caller does not own account");
                Err(WebhookError::Forbidden)
            }
        }
    }
}

/// Create Axum router for webhook and admin routes
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks", get(verify_subscription).post(receive_webhook))
        .route("/auth/signed-request", post(validate_signed_request))
        .route(
            "/admin/accounts/:account_id/subscription",
            get(get_subscription).put(upsert_subscription),
        )
        .route("/admin/accounts/:account_id/retry", post(retry_failed))
        .route("/admin/accounts/:account_id/stats", get(account_stats))
        .route("/admin/accounts/:account_id/events", get(list_events))
        .with_state(state)
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            WebhookError::Rejected => (StatusCode::UNAUTHORIZED, "request rejected".to_string()),
            WebhookError::InvalidPayload(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            WebhookError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
            WebhookError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            WebhookError::PersistenceFailure(_)
            | WebhookError::DispatchFailed(_)
            | WebhookError::Serialization(_) => {
                error!(error = %self, "Webhook request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Answer the provider's subscription challenge
async fn verify_subscription(
    State(state): State<Arc<WebhookState>>,
    Query(query): Query<HandshakeQuery>,
) -> Response {
    let Some(challenge) = state.answer_handshake(&query).await else {
        debug!(reason = TrustError::HandshakeMismatch.kind(), "Handshake failed");
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };

    if let Some(token) = query.verify_token.as_deref() {
        match state.store.mark_subscriptions_verified(token, Utc::now()).await {
            Ok(count) => debug!(subscriptions = count, "Stamped subscription verification"),
            Err(e) => warn!(error = %e, "Failed to stamp subscription verification"),
        }
    }

    (StatusCode::OK, challenge).into_response()
}

/// Verify, persist and acknowledge a delivery
async fn receive_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    if let Some(legacy) = headers.get(LEGACY_SIGNATURE_HEADER) {
        debug!(legacy_signature = ?legacy, "Ignoring legacy signature header");
    }

    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let receipt = state.coordinator.receive(signature, &body).await?;

    debug!(items = receipt.outcomes.len(), "Acknowledging webhook delivery");
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct SignedRequestForm {
    #[serde(default)]
    signed_request: Option<String>,
}

/// Validate a `signed_request` form post and echo its payload
async fn validate_signed_request(
    State(state): State<Arc<WebhookState>>,
    form: std::result::Result<Form<SignedRequestForm>, FormRejection>,
) -> Result<Json<SignedRequestPayload>> {
    let signed_request = match form {
        Ok(Form(SignedRequestForm {
            signed_request: Some(value),
        })) => value,
        Ok(_) => {
            return Err(TrustError::MalformedInput("missing signed_request".to_string()).reject())
        }
        Err(rejection) => return Err(TrustError::MalformedInput(rejection.body_text()).reject()),
    };

    let payload = state.codec.validate(&signed_request, &state.app_secret)?;
    info!(issued_at = payload.issued_at, "Signed request validated");
    Ok(Json(payload))
}

/// Subscription body; the verify token is returned so the owner can register it
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    #[serde(flatten)]
    pub subscription: WebhookSubscription,
    pub verify_token: String,
}

impl From<WebhookSubscription> for SubscriptionResponse {
    fn from(subscription: WebhookSubscription) -> Self {
        let verify_token = subscription.verify_token.clone();
        Self {
            subscription,
            verify_token,
        }
    }
}

async fn upsert_subscription(
    State(state): State<Arc<WebhookState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>> {
    state.authorize(&headers, &account_id).await?;
    let subscription = state.subscriptions.upsert(&account_id, request).await?;
    Ok(Json(subscription.into()))
}

async fn get_subscription(
    State(state): State<Arc<WebhookState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<WebhookSubscription>> {
    state.authorize(&headers, &account_id).await?;
    Ok(Json(state.subscriptions.get(&account_id).await?))
}

async fn retry_failed(
    State(state): State<Arc<WebhookState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>> {
    state.authorize(&headers, &account_id).await?;
    let retried = state.ledger.retry_failed_events(&account_id).await?;
    Ok(Json(json!({ "retried": retried })))
}

async fn account_stats(
    State(state): State<Arc<WebhookState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<WebhookStats>> {
    state.authorize(&headers, &account_id).await?;
    Ok(Json(state.stats.stats(&account_id).await?))
}

async fn list_events(
    State(state): State<Arc<WebhookState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<EventQuery>,
) -> Result<Json<EventPage>> {
    state.authorize(&headers, &account_id).await?;
    Ok(Json(state.store.list_events(&account_id, &query).await?))
}
