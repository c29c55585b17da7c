use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, put},
};

/// Vendor Router Module
///
/// Mounted under `/vendor` behind the vendor gate. Every listing and edit is scoped to
/// the signed-in vendor's own materials.
pub fn vendor_routes() -> Router<AppState> {
    Router::new()
        // GET/POST /vendor/materials
        .route(
            "/materials",
            get(handlers::list_vendor_materials).post(handlers::create_material),
        )
        // GET /vendor/materials/feed
        // Server-Sent Events; the subscription ends when the client disconnects.
        .route("/materials/feed", get(handlers::vendor_material_feed))
        // PUT /vendor/materials/{id}
        .route("/materials/{id}", put(handlers::update_vendor_material))
}
