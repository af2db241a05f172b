//! Health check endpoint for liveness probes.
//!
//! Returns 200 OK when the server is running and the database answers a
//! trivial query. Intended for load balancers and orchestration systems.

use axum::extract::State;
use axum::http::StatusCode;
use tracing::warn;

use super::AppState;

/// Health check handler.
///
/// # Example
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// Content-Type: text/plain
///
/// OK
/// ```
pub async fn health_handler(State(app_state): State<AppState>) -> (StatusCode, &'static str) {
    match app_state.db().ping().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(e) => {
            warn!(error = %e, "Health check database ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}
