use axum::{Router, extract::FromRef, http::HeaderName};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Identifier codec and the lookup flow built on it.
pub mod codec;
pub mod resolve;

// Session handling: cookies, the role gate, the identity provider.
pub mod auth;
pub mod gate;
pub mod identity;

// Material lifecycle, camera scanning and live list updates.
pub mod feed;
pub mod materials;
pub mod scan;

// Infrastructure.
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod storage;

pub mod routes;
use models::Role;
use routes::{admin, gated, public, staff, vendor};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use error::AppError;
pub use feed::MaterialFeed;
pub use identity::{IdentityState, MockIdentityProvider, SupabaseIdentity};
pub use repository::{InMemoryRepository, PostgresRepository, RepositoryState};
pub use storage::{MockStorageService, S3StorageClient, StorageState};

/// ApiDoc
///
/// OpenAPI document for every route, served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_public_material, handlers::get_material_qr, handlers::login,
        handlers::logout, handlers::request_password_reset, handlers::current_profile,
        handlers::list_vendor_materials, handlers::create_material,
        handlers::update_vendor_material, handlers::vendor_material_feed,
        handlers::scan_material, handlers::get_staff_material, handlers::patch_staff_material,
        handlers::list_all_materials, handlers::admin_material_feed, handlers::get_admin_stats,
        handlers::register_user
    ),
    components(
        schemas(
            models::MaterialRecord, models::CreateMaterialRequest, models::MaterialPatch,
            models::ScanRequest, models::LoginRequest, models::LoginResponse,
            models::PasswordResetRequest, models::RegisterUserRequest, models::UserProfile,
            models::DashboardStats, models::Role, feed::MaterialEvent, error::ErrorBody,
        )
    ),
    tags(
        (name = "vimarsha", description = "Vimarsha track-fittings portal API")
    )
)]
struct ApiDoc;

/// AppState
///
/// Everything a request may need, shared by all handlers and the section gates.
/// Cloning is cheap: every service sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Document store holding materials and role profiles.
    pub repo: RepositoryState,
    /// Sign-in, sign-out and token verification.
    pub identity: IdentityState,
    /// Archive for rendered QR images.
    pub storage: StorageState,
    /// Live material changes for list views.
    pub feed: MaterialFeed,
    pub config: AppConfig,
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for RepositoryState {
    fn from_ref(app_state: &AppState) -> RepositoryState {
        app_state.repo.clone()
    }
}

impl FromRef<AppState> for IdentityState {
    fn from_ref(app_state: &AppState) -> IdentityState {
        app_state.identity.clone()
    }
}

impl FromRef<AppState> for StorageState {
    fn from_ref(app_state: &AppState) -> StorageState {
        app_state.storage.clone()
    }
}

impl FromRef<AppState> for MaterialFeed {
    fn from_ref(app_state: &AppState) -> MaterialFeed {
        app_state.feed.clone()
    }
}

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

/// create_router
///
/// Assembles the public routes and the four gated sections, then wraps everything in
/// the request-id, tracing and CORS layers.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");

    let base_router = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(public::public_routes())
        // Each section sits behind its own gate; see `routes::gated`.
        .nest(
            Role::Vendor.section_path(),
            gated(Role::Vendor, vendor::vendor_routes(), &state),
        )
        .nest(
            Role::Depot.section_path(),
            gated(Role::Depot, staff::staff_routes(), &state),
        )
        .nest(
            Role::Track.section_path(),
            gated(Role::Track, staff::staff_routes(), &state),
        )
        .nest(
            Role::Admin.section_path(),
            gated(Role::Admin, admin::admin_routes(), &state),
        )
        .with_state(state);

    base_router
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for one request, tagged with its `x-request-id` so every log line of the request
/// correlates.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
