use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Admin Router Module
///
/// Mounted under `/admin` behind the admin gate. Materials are read-only here; the only
/// write is account provisioning.
pub fn admin_routes() -> Router<AppState> {
    Router::new()
        // GET /admin/stats
        .route("/stats", get(handlers::get_admin_stats))
        // GET /admin/materials
        // Every material, newest first.
        .route("/materials", get(handlers::list_all_materials))
        // GET /admin/materials/feed
        .route("/materials/feed", get(handlers::admin_material_feed))
        // POST /admin/users
        // Creates the identity-provider account and its role profile.
        .route("/users", post(handlers::register_user))
}
