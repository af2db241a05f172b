//! HTTP server for the relay.
//!
//! This module implements the HTTP server that:
//! - Accepts payment webhooks, verifies their signatures and ingests them
//! - Provides a health check for liveness probes
//!
//! # Endpoints
//!
//! - `POST /webhooks/{provider}` - Accepts a provider delivery (returns 200)
//! - `GET /health` - Returns 200 if the server is running and the database answers

use std::sync::Arc;

pub mod health;
pub mod webhook;

pub use health::health_handler;
pub use webhook::webhook_handler;

use crate::db::Database;
use crate::webhooks::{PaymentIngestor, ProviderRegistry};

/// Shared application state.
///
/// This is passed to all handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: ProviderRegistry,
    ingestor: PaymentIngestor,
    db: Database,

    /// Scheme and authority providers post to, e.g. `https://relay.example.com`.
    /// Square signs the full URL, so behind a proxy the request's own
    /// `Host` is not enough.
    public_base_url: Option<String>,
}

impl AppState {
    /// Creates a new `AppState`.
    ///
    /// A blank `public_base_url` is treated as unset; a trailing slash is
    /// dropped.
    pub fn new(
        registry: ProviderRegistry,
        ingestor: PaymentIngestor,
        db: Database,
        public_base_url: Option<String>,
    ) -> Self {
        let public_base_url = public_base_url
            .map(|u| u.trim().trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());
        AppState {
            inner: Arc::new(AppStateInner {
                registry,
                ingestor,
                db,
                public_base_url,
            }),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn ingestor(&self) -> &PaymentIngestor {
        &self.inner.ingestor
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn public_base_url(&self) -> Option<&str> {
        self.inner.public_base_url.as_deref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/webhooks/{provider}", post(webhook_handler))
        .route("/health", get(health_handler))
        .with_state(app_state)
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::outbox::OutboxStore;
    use crate::payments::{PaymentStatus, PaymentStore};
    use crate::test_utils::Fixture;
    use crate::types::LeadId;
    use crate::webhooks::signature::{
        SQUARE_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER, compute_square_signature,
        compute_stripe_signature, format_stripe_header,
    };
    use crate::webhooks::{CorrelationMetadata, SquareProvider, StripeProvider};

    const SQUARE_KEY: &[u8] = b"square-key";
    const STRIPE_SECRET: &[u8] = b"whsec_test";
    const BASE_URL: &str = "https://relay.test";

    fn test_app_state(fx: &Fixture) -> AppState {
        let registry = ProviderRegistry::new()
            .register(Arc::new(SquareProvider::new(SQUARE_KEY)))
            .register(Arc::new(StripeProvider::new(STRIPE_SECRET)));
        AppState::new(registry, fx.ingestor(), fx.db.clone(), Some(BASE_URL.to_string()))
    }

    /// Provider metadata maps carry strings only, so absent fields are omitted.
    fn metadata_json(meta: &CorrelationMetadata) -> serde_json::Value {
        let fields = [
            ("org_id", &meta.org_id),
            ("lead_id", &meta.lead_id),
            ("booking_intent_id", &meta.booking_intent_id),
        ];
        let map: serde_json::Map<String, serde_json::Value> = fields
            .into_iter()
            .filter_map(|(k, v)| v.clone().map(|v| (k.to_string(), json!(v))))
            .collect();
        serde_json::Value::Object(map)
    }

    fn square_body(event_id: &str, meta: &CorrelationMetadata) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_id": event_id,
            "type": "payment.updated",
            "data": {"object": {"payment": {
                "id": "sq_pay_1",
                "status": "COMPLETED",
                "amount_money": {"amount": 5000, "currency": "USD"},
                "metadata": metadata_json(meta),
            }}}
        }))
        .unwrap()
    }

    fn square_request(key: &[u8], body: Vec<u8>) -> Request<Body> {
        let signature = compute_square_signature(key, &format!("{BASE_URL}/webhooks/square"), &body);
        Request::builder()
            .method("POST")
            .uri("/webhooks/square")
            .header("content-type", "application/json")
            .header(SQUARE_SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    fn stripe_request(secret: &[u8], body: Vec<u8>) -> Request<Body> {
        let ts = Utc::now().timestamp();
        let signature = compute_stripe_signature(secret, ts, &body);
        Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("content-type", "application/json")
            .header(STRIPE_SIGNATURE_HEADER, format_stripe_header(ts, &signature))
            .body(Body::from(body))
            .unwrap()
    }

    async fn pending_outbox(fx: &Fixture) -> u64 {
        OutboxStore::new(fx.db.clone()).count_pending().await.unwrap()
    }

    // ─── Health endpoint tests ───

    #[tokio::test]
    async fn health_returns_200() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    // ─── Webhook endpoint tests ───

    #[tokio::test]
    async fn square_valid_returns_200_and_writes_outbox() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let request = square_request(SQUARE_KEY, square_body("sq_evt_1", &fx.metadata()));
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pending_outbox(&fx).await, 1);
        let payment = PaymentStore::new(fx.db.clone()).get(fx.payment_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.provider_ref.as_deref(), Some("sq_pay_1"));
    }

    #[tokio::test]
    async fn square_replay_returns_200_without_second_entry() {
        let fx = Fixture::new().await;
        let state = test_app_state(&fx);
        let body = square_body("sq_evt_2", &fx.metadata());

        let first = build_router(state.clone())
            .oneshot(square_request(SQUARE_KEY, body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = build_router(state)
            .oneshot(square_request(SQUARE_KEY, body))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(pending_outbox(&fx).await, 1);
    }

    #[tokio::test]
    async fn square_bad_signature_returns_401() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let request = square_request(b"wrong-key", square_body("sq_evt_3", &fx.metadata()));
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(pending_outbox(&fx).await, 0);
    }

    #[tokio::test]
    async fn square_signature_uses_forwarded_host_without_base_url() {
        let fx = Fixture::new().await;
        let registry = ProviderRegistry::new().register(Arc::new(SquareProvider::new(SQUARE_KEY)));
        let app = build_router(AppState::new(registry, fx.ingestor(), fx.db.clone(), None));

        let body = square_body("sq_evt_4", &fx.metadata());
        let signature =
            compute_square_signature(SQUARE_KEY, "https://proxy.test/webhooks/square", &body);
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/square")
            .header("host", "internal:8080")
            .header("x-forwarded-proto", "https")
            .header("x-forwarded-host", "proxy.test")
            .header(SQUARE_SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stripe_bad_signature_returns_403() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let body = serde_json::to_vec(&json!({"id": "evt_s1", "type": "checkout.session.completed"})).unwrap();
        let response = app.oneshot(stripe_request(b"whsec_other", body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn stripe_ignored_type_returns_200() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let body = serde_json::to_vec(&json!({"id": "evt_s2", "type": "payment_intent.created"})).unwrap();
        let response = app.oneshot(stripe_request(STRIPE_SECRET, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pending_outbox(&fx).await, 0);
    }

    #[tokio::test]
    async fn stripe_completed_session_returns_200() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));
        let meta = fx.metadata();

        let body = serde_json::to_vec(&json!({
            "id": "evt_s3",
            "type": "checkout.session.completed",
            "created": Utc::now().timestamp(),
            "data": {"object": {
                "id": "cs_1",
                "payment_intent": "pi_1",
                "amount_total": 5000,
                "payment_status": "paid",
                "metadata": metadata_json(&meta),
            }}
        }))
        .unwrap();
        let response = app.oneshot(stripe_request(STRIPE_SECRET, body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pending_outbox(&fx).await, 1);
    }

    #[tokio::test]
    async fn unknown_provider_returns_404() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/paypal")
            .body(Body::from("{}"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_returns_400() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let response = app
            .oneshot(square_request(SQUARE_KEY, b"{not json".to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unreconciled_payment_returns_200() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));

        let response = app
            .oneshot(square_request(
                SQUARE_KEY,
                square_body("sq_evt_5", &CorrelationMetadata::default()),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pending_outbox(&fx).await, 0);
    }

    #[tokio::test]
    async fn unknown_lead_returns_404() {
        let fx = Fixture::new().await;
        let app = build_router(test_app_state(&fx));
        let mut meta = fx.metadata();
        meta.lead_id = Some(LeadId::new_v4().to_string());

        let response = app
            .oneshot(square_request(SQUARE_KEY, square_body("sq_evt_6", &meta)))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(pending_outbox(&fx).await, 0);
    }
}
