use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Public Router Module
///
/// Endpoints reachable without a session.
///
/// `GET /materials/{id}` is the deep-link target printed QR codes may carry; its shape
/// must not change while such codes are in the field.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /health
        // Liveness probe for the load balancer.
        .route("/health", get(|| async { "ok" }))
        // GET /materials/{id}
        // Read-only record page, the scan target.
        .route("/materials/{id}", get(handlers::get_public_material))
        // GET /materials/{id}/qr.svg
        // Re-renders the QR symbol of an existing material.
        .route("/materials/{id}/qr.svg", get(handlers::get_material_qr))
        // POST /logout
        .route("/logout", post(handlers::logout))
        // POST /password-reset
        .route("/password-reset", post(handlers::request_password_reset))
}
