//! Integration tests for the hookline-webhook router.

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use hookline_core::{IngestionConfig, WebhookConfig};
use hookline_webhook::{
    create_webhook_router, sign_body, EventHandler, InMemoryWebhookStore, SignedPayloadCodec,
    StaticAccountDirectory, WebhookError, WebhookEvent, WebhookState,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";
const VERIFY_TOKEN: &str = "verify-me";
const OWNER: &str = "owner-1";

struct Handler {
    fail: bool,
}

#[async_trait]
impl EventHandler for Handler {
    async fn handle(&self, _event_id: &str) -> hookline_webhook::Result<()> {
        if self.fail {
            Err(WebhookError::DispatchFailed("downstream unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

fn setup(fail: bool) -> (Router, Arc<InMemoryWebhookStore>) {
    let store = Arc::new(InMemoryWebhookStore::default());
    let accounts = StaticAccountDirectory::new().with_account("17841400000000", "acct-1", OWNER);
    let state = WebhookState::build(
        &WebhookConfig::new(SECRET, VERIFY_TOKEN),
        &IngestionConfig::default(),
        store.clone(),
        Arc::new(accounts),
        Arc::new(Handler { fail }),
    );
    (create_webhook_router(Arc::new(state)), store)
}

fn comment_delivery(comment_id: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "object": "instagram",
        "entry": [{
            "id": "17841400000000",
            "time": 1700000000,
            "changes": [{
                "field": "comments",
                "value": {
                    "comment_id": comment_id,
                    "text": "nice shot",
                    "from": {"id": "u-42", "username": "alice"}
                }
            }]
        }]
    }))
    .unwrap()
}

fn signed_post(body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhooks")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("x-hub-signature-256", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

fn admin(method: &str, uri: &str, user: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", user);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn deliver(router: &Router, comment_id: &str) -> StatusCode {
    let body = comment_delivery(comment_id);
    let signature = sign_body(&body, SECRET).unwrap();
    send(router, signed_post(body, Some(signature))).await.0
}

/// Poll until the detached dispatch has recorded an outcome
async fn wait_for(store: &InMemoryWebhookStore, done: impl Fn(&WebhookEvent) -> bool) {
    for _ in 0..200 {
        if store.events().iter().filter(|e| !e.is_duplicate).all(&done) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatch did not settle");
}

// ==================== Handshake ====================

#[tokio::test]
async fn test_handshake_echoes_challenge() {
    let (router, _) = setup(false);
    let request = Request::builder()
        .uri("/webhooks?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"1158201444");
}

#[tokio::test]
async fn test_handshake_failures_are_forbidden() {
    let (router, _) = setup(false);
    for uri in [
        "/webhooks?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=abc",
        "/webhooks?hub.mode=unsubscribe&hub.verify_token=verify-me&hub.challenge=abc",
        "/webhooks?hub.verify_token=verify-me&hub.challenge=abc",
        "/webhooks?hub.mode=subscribe&hub.verify_token=verify-me",
    ] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(&router, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{}", uri);
        assert_eq!(body, b"Forbidden");
    }
}

#[tokio::test]
async fn test_handshake_stamps_matching_subscription() {
    let (router, _) = setup(false);
    let (status, _) = send_json(
        &router,
        admin(
            "PUT",
            "/admin/accounts/acct-1/subscription",
            OWNER,
            Some(json!({
                "fields": ["comments", "messages"],
                "callback_url": "https://hooks.example.com/webhooks",
                "verify_token": VERIFY_TOKEN
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .uri("/webhooks?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=ok")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, request).await.0, StatusCode::OK);

    let (_, subscription) = send_json(
        &router,
        admin("GET", "/admin/accounts/acct-1/subscription", OWNER, None),
    )
    .await;
    assert!(subscription["last_verified_at"].is_string());
    assert!(subscription.get("verify_token").is_none());
}

#[tokio::test]
async fn test_handshake_accepts_generated_subscription_token() {
    let (router, _) = setup(false);
    let (status, created) = send_json(
        &router,
        admin(
            "PUT",
            "/admin/accounts/acct-1/subscription",
            OWNER,
            Some(json!({
                "fields": ["comments"],
                "callback_url": "https://hooks.example.com/webhooks"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = created["verify_token"].as_str().unwrap().to_string();
    assert_ne!(token, VERIFY_TOKEN);

    let request = Request::builder()
        .uri(format!(
            "/webhooks?hub.mode=subscribe&hub.verify_token={}&hub.challenge=42",
            token
        ))
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"42");

    let (_, subscription) = send_json(
        &router,
        admin("GET", "/admin/accounts/acct-1/subscription", OWNER, None),
    )
    .await;
    assert!(subscription["last_verified_at"].is_string());

    // A near-miss of the generated token is still refused
    let request = Request::builder()
        .uri(format!(
            "/webhooks?hub.mode=subscribe&hub.verify_token={}&hub.challenge=42",
            &token[..token.len() - 1]
        ))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&router, request).await.0, StatusCode::FORBIDDEN);
}

// ==================== Deliveries ====================

#[tokio::test]
async fn test_signed_delivery_is_acknowledged_and_processed() {
    let (router, store) = setup(false);

    let body = comment_delivery("c-1");
    let signature = sign_body(&body, SECRET).unwrap();
    let (status, ack) = send_json(&router, signed_post(body, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack, json!({"status": "ok"}));

    wait_for(&store, |e| e.processed).await;
    let events = store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].dedup_key, "comment_c-1_u-42");
    assert_eq!(events[0].account_id.as_deref(), Some("acct-1"));
    assert!(events[0].processed_at.is_some());
}

#[tokio::test]
async fn test_unsigned_or_forged_delivery_is_rejected() {
    let (router, store) = setup(false);
    let body = comment_delivery("c-1");

    let forged = sign_body(&body, "attacker-secret").unwrap();
    for signature in [None, Some("sha256=deadbeef".to_string()), Some(forged), Some("garbage".to_string())] {
        let (status, error) = send_json(&router, signed_post(body.clone(), signature)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(error, json!({"error": "request rejected"}));
    }
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn test_reserialized_body_fails_verification() {
    let (router, store) = setup(false);
    let raw = br#"{"object":"instagram","entry":[{"id":"17841400000000","changes":[]}]}"#.to_vec();
    let signature = sign_body(&raw, SECRET).unwrap();

    // Same JSON value, different bytes
    let reordered = br#"{"entry":[{"changes":[],"id":"17841400000000"}],"object":"instagram"}"#.to_vec();
    let (status, _) = send(&router, signed_post(reordered, Some(signature.clone()))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&router, signed_post(raw, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(store.events().is_empty());
}

#[tokio::test]
async fn test_signed_garbage_is_bad_request() {
    let (router, _) = setup(false);
    let body = b"{not json".to_vec();
    let signature = sign_body(&body, SECRET).unwrap();
    let (status, _) = send(&router, signed_post(body, Some(signature))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_redelivery_counts_as_duplicate() {
    let (router, store) = setup(false);
    assert_eq!(deliver(&router, "c-1").await, StatusCode::OK);
    wait_for(&store, |e| e.processed).await;
    assert_eq!(deliver(&router, "c-1").await, StatusCode::OK);

    let (status, stats) = send_json(&router, admin("GET", "/admin/accounts/acct-1/stats", OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_events"], 2);
    assert_eq!(stats["processed_events"], 1);
    assert_eq!(stats["duplicate_events"], 1);
    assert_eq!(stats["by_type"]["comment"], 2);

    let duplicate = store.events().into_iter().find(|e| e.is_duplicate).unwrap();
    assert!(!duplicate.processed);
    assert_eq!(duplicate.processing_attempts, 0);
}

// ==================== Signed requests ====================

fn signed_request_form(value: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/auth/signed-request")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(format!("signed_request={}", value)))
        .unwrap()
}

fn user_fields() -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("user_id".to_string(), json!("218471"));
    fields
}

#[tokio::test]
async fn test_signed_request_round_trip() {
    let (router, _) = setup(false);
    let codec = SignedPayloadCodec::new();
    let signed = codec
        .encode(user_fields(), Utc::now().timestamp(), SECRET)
        .unwrap();

    let (status, payload) = send_json(&router, signed_request_form(&signed)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["algorithm"], "HMAC-SHA256");
    assert_eq!(payload["user_id"], "218471");
}

#[tokio::test]
async fn test_signed_request_failures_are_uniform() {
    let (router, _) = setup(false);
    let codec = SignedPayloadCodec::new();
    let stale = codec
        .encode(user_fields(), Utc::now().timestamp() - 3600, SECRET)
        .unwrap();
    let wrong_secret = codec
        .encode(user_fields(), Utc::now().timestamp(), "other")
        .unwrap();

    for value in [stale.as_str(), wrong_secret.as_str(), "no-dot", ""] {
        let (status, error) = send_json(&router, signed_request_form(value)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{:?}", value);
        assert_eq!(error, json!({"error": "request rejected"}));
    }

    let missing = Request::builder()
        .method("POST")
        .uri("/auth/signed-request")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("other=1"))
        .unwrap();
    assert_eq!(send(&router, missing).await.0, StatusCode::UNAUTHORIZED);
}

// ==================== Admin ====================

#[tokio::test]
async fn test_admin_routes_require_owner() {
    let (router, _) = setup(false);
    for (method, uri) in [
        ("GET", "/admin/accounts/acct-1/stats"),
        ("GET", "/admin/accounts/acct-1/events"),
        ("POST", "/admin/accounts/acct-1/retry"),
        ("GET", "/admin/accounts/acct-1/subscription"),
    ] {
        let (status, _) = send(&router, admin(method, uri, "someone-else", None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{} {}", method, uri);
    }
}

#[tokio::test]
async fn test_subscription_upsert_generates_token() {
    let (router, _) = setup(false);
    let request = json!({
        "fields": ["comments"],
        "callback_url": "https://hooks.example.com/webhooks"
    });

    let (status, created) = send_json(
        &router,
        admin("PUT", "/admin/accounts/acct-1/subscription", OWNER, Some(request.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = created["verify_token"].as_str().unwrap().to_string();
    assert_eq!(token.len(), 64);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

    let (_, updated) = send_json(
        &router,
        admin("PUT", "/admin/accounts/acct-1/subscription", OWNER, Some(request)),
    )
    .await;
    assert_eq!(updated["verify_token"], token.as_str());

    let (status, _) = send(
        &router,
        admin(
            "PUT",
            "/admin/accounts/acct-1/subscription",
            OWNER,
            Some(json!({"fields": [], "callback_url": "ftp://nope"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_missing_subscription_is_not_found() {
    let (router, _) = setup(false);
    let (status, _) = send(&router, admin("GET", "/admin/accounts/acct-1/subscription", OWNER, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_failed_events_are_rearmed_by_retry() {
    let (router, store) = setup(true);
    assert_eq!(deliver(&router, "c-1").await, StatusCode::OK);
    assert_eq!(deliver(&router, "c-2").await, StatusCode::OK);
    wait_for(&store, |e| e.processing_attempts == 1).await;

    let (_, stats) = send_json(&router, admin("GET", "/admin/accounts/acct-1/stats", OWNER, None)).await;
    assert_eq!(stats["pending_events"], 2);
    assert_eq!(stats["processed_events"], 0);

    let (status, body) = send_json(&router, admin("POST", "/admin/accounts/acct-1/retry", OWNER, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"retried": 2}));
    assert!(store
        .events()
        .iter()
        .all(|e| e.processing_attempts == 0 && e.last_processing_error.is_none()));
}

#[tokio::test]
async fn test_event_listing_paginates_and_filters() {
    let (router, store) = setup(false);
    for id in ["c-1", "c-2", "c-3"] {
        assert_eq!(deliver(&router, id).await, StatusCode::OK);
    }
    wait_for(&store, |e| e.processed).await;

    let (status, page) = send_json(
        &router,
        admin("GET", "/admin/accounts/acct-1/events?page=1&per_page=2&event_type=comment", OWNER, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 3);
    assert_eq!(page["events"].as_array().unwrap().len(), 2);

    let (_, unprocessed) = send_json(
        &router,
        admin("GET", "/admin/accounts/acct-1/events?processed=false", OWNER, None),
    )
    .await;
    assert_eq!(unprocessed["total"], 0);
}
