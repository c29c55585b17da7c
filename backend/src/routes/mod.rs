/// Router Module Index
///
/// One module per audience. Every protected section is mounted through [`gated`], which
/// puts the session gate in front of the section's routes and only then adds the
/// section's login endpoint, so the login form itself stays reachable.

/// Unauthenticated routes: health, the public record page, logout, password reset.
pub mod public;

/// Vendor section: register and edit own materials.
pub mod vendor;

/// Depot and track sections: scan, look up and annotate any material.
pub mod staff;

/// Admin section: read-only oversight and account provisioning.
pub mod admin;

use axum::{
    Json, Router,
    extract::State,
    middleware,
    routing::{get, post},
};
use axum_extra::extract::cookie::CookieJar;

use crate::{
    AppState,
    gate::{Guard, SectionGate, enforce},
    handlers,
    models::{LoginRequest, Role},
};

/// Wraps a section's routes in the gate for `role` and adds `/login` and `/me`.
pub fn gated(role: Role, routes: Router<AppState>, state: &AppState) -> Router<AppState> {
    let gate = SectionGate::new(Guard::for_role(role), state.clone());

    routes
        // GET /{section}/me
        // Who the gate let in. Handy for the front-end's session check.
        .route("/me", get(handlers::current_profile))
        .route_layer(middleware::from_fn_with_state(gate, enforce))
        // POST /{section}/login
        // Added after the gate layer, so it is not gated.
        .route(
            "/login",
            post(
                move |state: State<AppState>, jar: CookieJar, body: Json<LoginRequest>| {
                    handlers::login(role, state, jar, body)
                },
            ),
        )
}
