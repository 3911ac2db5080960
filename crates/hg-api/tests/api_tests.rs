//! API Endpoint Tests
//!
//! Tests for:
//! - Webhook intake status codes (accepted, duplicate, rejected, throttled)
//! - Gateway and provider health
//! - Operator disable/enable and incidents

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use hg_api::{create_router, AppState};
use hg_broadcast::RealtimeBroadcastHub;
use hg_common::{ManualClock, MemoryAuditSink, ProviderConfig, SignatureScheme};
use hg_config::{BroadcastSettings, ConfigStore, GuardConfig};
use hg_coordinator::{Collaborators, EventHandler, HandlerError, WebhookCoordinator};
use hg_guard::ReplayAndRateGuard;
use hg_health::ServiceHealthRegistry;
use hg_store::MemoryStore;
use hg_verify::{HmacSha256Hex, SchemeVerifier, SignatureVerifier, SigningInput};

const SECRET: &str = "whsec";
const PROXY: &str = "10.0.0.5";

struct AcceptAll;

#[async_trait]
impl EventHandler for AcceptAll {
    async fn handle_verified_event(&self, _: &str, _: &str, _: &Value) -> Result<(), HandlerError> {
        Ok(())
    }
}

fn create_test_app() -> (axum::Router, Arc<WebhookCoordinator>) {
    let clock = Arc::new(ManualClock::at_unix(1_700_000_040));
    let mut config = GuardConfig::default()
        .with_provider(ProviderConfig::new("shop", SignatureScheme::HmacSha256Hex, SECRET).with_rate_limit(60, 3))
        .with_provider(
            ProviderConfig::new("payments", SignatureScheme::HmacSha256Hex, SECRET)
                .with_critical_event_types(["charge.failed"]),
        )
        .with_provider(
            ProviderConfig::new("ledger", SignatureScheme::HmacSha256Hex, SECRET).with_required_fields(["data.amount"]),
        );
    config.server.trusted_proxies = vec![PROXY.parse().unwrap()];
    let config = Arc::new(ConfigStore::new(config).unwrap());
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let audit = Arc::new(MemoryAuditSink::new());

    let coordinator = WebhookCoordinator::new(Collaborators {
        config: config.clone(),
        verifier: Arc::new(SignatureVerifier::new(config.clone(), clock.clone())),
        guard: Arc::new(ReplayAndRateGuard::new(store.clone(), audit.clone(), clock.clone())),
        health: Arc::new(ServiceHealthRegistry::new(config.clone(), audit.clone(), clock.clone())),
        hub: Arc::new(RealtimeBroadcastHub::new(BroadcastSettings::default(), clock.clone())),
        handler: Arc::new(AcceptAll),
        audit,
        store,
        clock,
    });

    (create_router(AppState::new(coordinator.clone())), coordinator)
}

fn webhook(provider_id: &str, body: &str) -> Request<Body> {
    let signature = HmacSha256Hex
        .sign(&SigningInput::payload(body.as_bytes()), SECRET.as_bytes())
        .unwrap();
    Request::builder()
        .method(Method::POST)
        .uri(format!("/webhooks/{}", provider_id))
        .header("content-type", "application/json")
        .header("x-signature", signature)
        .header("x-forwarded-for", "198.51.100.4")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Same delivery arriving over a TCP connection from `peer`
fn webhook_via(provider_id: &str, body: &str, peer: &str, forwarded_for: &str) -> Request<Body> {
    let mut request = webhook(provider_id, body);
    request.headers_mut().insert("x-forwarded-for", forwarded_for.parse().unwrap());
    let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(addr));
    request
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_webhook_accepted_then_duplicate() {
    let (app, _) = create_test_app();

    let response = app.clone().oneshot(webhook("shop", r#"{"id":"ord_1"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["eventId"], "ord_1");
    assert_eq!(body["processing"], "queued");

    let response = app.oneshot(webhook("shop", r#"{"id":"ord_1"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "duplicate");
}

#[tokio::test]
async fn test_critical_webhook_returns_outcome() {
    let (app, _) = create_test_app();

    let response = app
        .oneshot(webhook("payments", r#"{"id":"ch_1","type":"charge.failed"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["processing"], "immediate");
    assert_eq!(body["outcome"]["success"], true);
}

#[tokio::test]
async fn test_bad_signature_is_unauthorized() {
    let (app, _) = create_test_app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhooks/shop")
        .header("x-signature", "00ff")
        .body(Body::from(r#"{"id":"ord_1"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "SECURITY_VIOLATION");
    assert_eq!(body["message"], "webhook rejected");
}

#[tokio::test]
async fn test_unknown_provider_is_not_found() {
    let (app, _) = create_test_app();
    let response = app.oneshot(webhook("nobody", r#"{"id":"x"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_payload_shape_failures() {
    let (app, _) = create_test_app();

    let response = app
        .clone()
        .oneshot(webhook("ledger", r#"{"id":"tx_1","data":{}}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "VALIDATION_FAILED");
    assert!(body["message"].as_str().unwrap().contains("data.amount"));

    // Not an object: treated as a security rejection
    let response = app.oneshot(webhook("ledger", "[1,2,3]")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rate_limited_with_retry_after() {
    let (app, _) = create_test_app();

    for n in 0..3 {
        let body = format!(r#"{{"id":"ord_{}"}}"#, n);
        let response = app.clone().oneshot(webhook("shop", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app.oneshot(webhook("shop", r#"{"id":"ord_9"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()["retry-after"], "60");
}

#[tokio::test]
async fn test_forged_forwarded_for_does_not_escape_rate_limit() {
    let (app, _) = create_test_app();

    let mut accepted = 0;
    let mut throttled = 0;
    for n in 0..10 {
        let body = format!(r#"{{"id":"ord_{}"}}"#, n);
        let forged = format!("203.0.113.{}", n);
        let response = app
            .clone()
            .oneshot(webhook_via("shop", &body, "198.51.100.77", &forged))
            .await
            .unwrap();
        match response.status() {
            StatusCode::ACCEPTED => accepted += 1,
            StatusCode::TOO_MANY_REQUESTS => throttled += 1,
            other => panic!("unexpected status {}", other),
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(throttled, 7);
}

#[tokio::test]
async fn test_trusted_proxy_forwards_client_address() {
    let (app, _) = create_test_app();

    // Two clients behind the same proxy get their own budgets
    for client in ["203.0.113.1", "203.0.113.2"] {
        for n in 0..3 {
            let body = format!(r#"{{"id":"{}-{}"}}"#, client, n);
            let forwarded = format!("1.2.3.4, {}", client);
            let response = app.clone().oneshot(webhook_via("shop", &body, PROXY, &forwarded)).await.unwrap();
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }
    }

    // Varying the caller-written leftmost hop does not reset the budget
    let response = app
        .oneshot(webhook_via("shop", r#"{"id":"extra"}"#, PROXY, "9.9.9.9, 203.0.113.1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_gateway_health_reports_drain() {
    let (app, coordinator) = create_test_app();

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "UP");
    assert_eq!(body["pools"].as_array().unwrap().len(), 2);

    coordinator.shutdown().await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(response).await["status"], "DRAINING");

    let response = app.oneshot(webhook("shop", r#"{"id":"late"}"#)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_operator_disable_and_enable() {
    let (app, _) = create_test_app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/providers/shop/disable?actor=oncall")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "disabled");

    let request = Request::builder().uri("/api/health/providers").body(Body::empty()).unwrap();
    let statuses = json_body(app.clone().oneshot(request).await.unwrap()).await;
    let shop = statuses
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["providerId"] == "shop")
        .cloned()
        .unwrap();
    assert_eq!(shop["status"], "disabled");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/providers/shop/enable")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(json_body(response).await["status"], "healthy");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/providers/ghost/disable")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_incidents_listing() {
    let (app, _) = create_test_app();

    let request = Request::builder().uri("/api/incidents").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(json_body(response).await.as_array().unwrap().is_empty());

    let request = Request::builder().uri("/api/incidents?state=all").body(Body::empty()).unwrap();
    assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);

    let request = Request::builder().uri("/api/incidents?state=bogus").body(Body::empty()).unwrap();
    assert_eq!(app.oneshot(request).await.unwrap().status(), StatusCode::BAD_REQUEST);
}
