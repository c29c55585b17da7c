use crate::{AppState, handlers};
use axum::{
    Router,
    routing::{get, post},
};

/// Staff Router Module
///
/// The depot and track sections expose the same routes; they differ only in the gate
/// they are mounted behind (`/depot` or `/track`).
pub fn staff_routes() -> Router<AppState> {
    Router::new()
        // POST /{section}/scan
        // Body is the raw scanner string: a bare identifier or a record deep link.
        .route("/scan", post(handlers::scan_material))
        // GET/PATCH /{section}/materials/{id}
        // Manual lookup, and receipt or installation details merged into the record.
        .route(
            "/materials/{id}",
            get(handlers::get_staff_material).patch(handlers::patch_staff_material),
        )
}
