use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
};
use axum_extra::extract::cookie::CookieJar;
use futures::{Stream, StreamExt, future};
use uuid::Uuid;

use crate::{
    AppState,
    auth::{AuthUser, SessionCredentials, end_session, start_session},
    codec::{self, MaterialId},
    error::{AppError, ErrorBody},
    feed::{MaterialEvent, MaterialFeed},
    materials,
    models::{
        CreateMaterialRequest, DashboardStats, LoginRequest, LoginResponse, MaterialPatch,
        MaterialRecord, PasswordResetRequest, RegisterUserRequest, Role, ScanRequest, User,
        UserProfile,
    },
    repository::with_timeout,
    resolve::resolve,
};

const STAFF_ROLES: [Role; 2] = [Role::Depot, Role::Track];

fn material_id(raw: String) -> Result<MaterialId, AppError> {
    Ok(MaterialId::new(raw)?)
}

fn require_email(email: &str) -> Result<(), AppError> {
    if email.trim().is_empty() || !email.contains('@') {
        return Err(AppError::Validation("a valid email address is required".into()));
    }
    Ok(())
}

// --- Public ---

/// get_public_material
///
/// [Public Route] The scan target printed codes deep-link to. Read-only; no session needed.
#[utoipa::path(
    get,
    path = "/materials/{id}",
    params(("id" = String, Path, description = "Material identifier")),
    responses(
        (status = 200, description = "Material record", body = MaterialRecord),
        (status = 404, description = "No such material", body = ErrorBody),
        (status = 422, description = "Malformed record", body = ErrorBody),
        (status = 503, description = "Store unreachable, retry", body = ErrorBody)
    )
)]
pub async fn get_public_material(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MaterialRecord>, AppError> {
    let id = material_id(id)?;
    let record = resolve(state.repo.as_ref(), &id, state.config.store_timeout).await?;
    Ok(Json(record))
}

/// get_material_qr
///
/// [Public Route] Renders the QR symbol of an existing material as SVG, for reprinting.
#[utoipa::path(
    get,
    path = "/materials/{id}/qr.svg",
    params(("id" = String, Path, description = "Material identifier")),
    responses(
        (status = 200, description = "QR symbol", content_type = "image/svg+xml", body = String),
        (status = 404, description = "No such material", body = ErrorBody)
    )
)]
pub async fn get_material_qr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = material_id(id)?;
    resolve(state.repo.as_ref(), &id, state.config.store_timeout).await?;
    let svg = codec::encode(&id)?.to_svg();
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg))
}

/// login
///
/// [Public Route] Signs in to one role's section. The role comes from the route the form
/// was posted to, not from the client. A valid account whose stored role does not match
/// the section is signed straight back out.
#[utoipa::path(
    post,
    path = "/{section}/login",
    params(("section" = Role, Path, description = "Section being signed in to")),
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Signed in; session cookies set", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 403, description = "Account belongs to another section", body = ErrorBody)
    )
)]
pub async fn login(
    section: Role,
    State(state): State<AppState>,
    jar: CookieJar,
    Json(payload): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    require_email(&payload.email)?;
    let session = state
        .identity
        .sign_in(payload.email.trim(), &payload.password)
        .await?;

    let profile = with_timeout(
        state.config.store_timeout,
        state.repo.get_user(session.user_id),
    )
    .await?;

    let user = match profile {
        Some(user) if user.role == section => user,
        other => {
            tracing::warn!(
                user_id = %session.user_id,
                found = ?other.map(|u| u.role),
                section = %section,
                "login to the wrong section"
            );
            if let Err(e) = state.identity.sign_out(&session.access_token).await {
                tracing::warn!(error = %e, "sign-out after rejected login failed");
            }
            return Err(AppError::PermissionDenied);
        }
    };

    tracing::info!(user_id = %user.id, role = %user.role, "signed in");
    let jar = start_session(jar, &session.access_token, &state.config);
    Ok((
        jar,
        Json(LoginResponse {
            redirect_to: section.section_path().to_string(),
            expires_in: session.expires_in,
            user: user.into(),
        }),
    ))
}

/// logout
///
/// [Public Route] Revokes the session at the identity provider (best-effort) and clears
/// the session cookies. Always succeeds.
#[utoipa::path(
    post,
    path = "/logout",
    responses((status = 204, description = "Signed out"))
)]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    let credentials = SessionCredentials::from_request(&headers, &jar);
    if let Some(token) = credentials.token() {
        if let Err(e) = state.identity.sign_out(token).await {
            tracing::warn!(error = %e, "sign-out at identity provider failed");
        }
    }
    (end_session(jar), StatusCode::NO_CONTENT)
}

/// request_password_reset
///
/// [Public Route] Asks the identity provider to mail a reset link. Answers 202 whether or
/// not the address has an account.
#[utoipa::path(
    post,
    path = "/password-reset",
    request_body = PasswordResetRequest,
    responses(
        (status = 202, description = "Reset requested"),
        (status = 503, description = "Identity provider unreachable", body = ErrorBody)
    )
)]
pub async fn request_password_reset(
    State(state): State<AppState>,
    Json(payload): Json<PasswordResetRequest>,
) -> Result<StatusCode, AppError> {
    require_email(&payload.email)?;
    match state
        .identity
        .send_password_reset(payload.email.trim())
        .await
    {
        Ok(()) => {}
        Err(crate::identity::IdentityError::Rejected(reason)) => {
            tracing::info!(reason = %reason, "password reset rejected by provider");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(StatusCode::ACCEPTED)
}

// --- Vendor ---

/// list_vendor_materials
///
/// [Vendor Route] The vendor's own materials, newest first.
#[utoipa::path(
    get,
    path = "/vendor/materials",
    responses((status = 200, description = "My materials", body = [MaterialRecord]))
)]
pub async fn list_vendor_materials(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<MaterialRecord>>, AppError> {
    user.require(Role::Vendor)?;
    Ok(Json(materials::list_materials(&state, Some(user.id)).await?))
}

/// create_material
///
/// [Vendor Route] Registers a fitting. The identifier, QR symbol and hash are generated
/// here; the client only supplies the descriptive attributes.
#[utoipa::path(
    post,
    path = "/vendor/materials",
    request_body = CreateMaterialRequest,
    responses(
        (status = 201, description = "Registered", body = MaterialRecord),
        (status = 400, description = "Missing attributes", body = ErrorBody)
    )
)]
pub async fn create_material(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<CreateMaterialRequest>,
) -> Result<(StatusCode, Json<MaterialRecord>), AppError> {
    user.require(Role::Vendor)?;
    let record = materials::create_material(&state, &user, payload).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// update_vendor_material
///
/// [Vendor Route] Edits one of the vendor's own materials. Protected fields are ignored.
#[utoipa::path(
    put,
    path = "/vendor/materials/{id}",
    params(("id" = String, Path, description = "Material identifier")),
    request_body = MaterialPatch,
    responses(
        (status = 200, description = "Updated", body = MaterialRecord),
        (status = 403, description = "Not the owner", body = ErrorBody),
        (status = 404, description = "No such material", body = ErrorBody)
    )
)]
pub async fn update_vendor_material(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<MaterialPatch>,
) -> Result<Json<MaterialRecord>, AppError> {
    user.require(Role::Vendor)?;
    let id = material_id(id)?;
    Ok(Json(
        materials::update_material(&state, &id, patch, Some(user.id)).await?,
    ))
}

/// vendor_material_feed
///
/// [Vendor Route] Live changes to the vendor's own materials as Server-Sent Events.
#[utoipa::path(
    get,
    path = "/vendor/materials/feed",
    responses((status = 200, description = "Event stream", content_type = "text/event-stream", body = MaterialEvent))
)]
pub async fn vendor_material_feed(
    user: AuthUser,
    State(feed): State<MaterialFeed>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    user.require(Role::Vendor)?;
    Ok(material_sse(&feed, Some(user.id)))
}

// --- Depot / Track ---

/// scan_material
///
/// [Depot/Track Route] Resolves a raw scanner payload, bare identifier or deep link.
#[utoipa::path(
    post,
    path = "/{section}/scan",
    params(("section" = Role, Path, description = "depot or track")),
    request_body = ScanRequest,
    responses(
        (status = 200, description = "Resolved record", body = MaterialRecord),
        (status = 400, description = "Empty payload", body = ErrorBody),
        (status = 404, description = "No such material", body = ErrorBody),
        (status = 503, description = "Store unreachable, retry", body = ErrorBody)
    )
)]
pub async fn scan_material(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<MaterialRecord>, AppError> {
    user.require_any(&STAFF_ROLES)?;
    let id = codec::decode_payload(&payload.payload)?;
    tracing::debug!(material_id = %id, "scan payload decoded");
    let record = resolve(state.repo.as_ref(), &id, state.config.store_timeout).await?;
    Ok(Json(record))
}

/// get_staff_material
///
/// [Depot/Track Route] A record looked up by identifier, for manual entry.
#[utoipa::path(
    get,
    path = "/{section}/materials/{id}",
    params(
        ("section" = Role, Path, description = "depot or track"),
        ("id" = String, Path, description = "Material identifier")
    ),
    responses(
        (status = 200, description = "Material record", body = MaterialRecord),
        (status = 404, description = "No such material", body = ErrorBody)
    )
)]
pub async fn get_staff_material(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MaterialRecord>, AppError> {
    user.require_any(&STAFF_ROLES)?;
    let id = material_id(id)?;
    Ok(Json(
        resolve(state.repo.as_ref(), &id, state.config.store_timeout).await?,
    ))
}

/// patch_staff_material
///
/// [Depot/Track Route] Adds receipt or installation details to any record.
#[utoipa::path(
    patch,
    path = "/{section}/materials/{id}",
    params(
        ("section" = Role, Path, description = "depot or track"),
        ("id" = String, Path, description = "Material identifier")
    ),
    request_body = MaterialPatch,
    responses(
        (status = 200, description = "Updated", body = MaterialRecord),
        (status = 400, description = "Nothing editable in the payload", body = ErrorBody),
        (status = 404, description = "No such material", body = ErrorBody)
    )
)]
pub async fn patch_staff_material(
    user: AuthUser,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<MaterialPatch>,
) -> Result<Json<MaterialRecord>, AppError> {
    user.require_any(&STAFF_ROLES)?;
    let id = material_id(id)?;
    Ok(Json(
        materials::update_material(&state, &id, patch, None).await?,
    ))
}

// --- Admin ---

/// list_all_materials
///
/// [Admin Route] Every material in the system, newest first. Read-only.
#[utoipa::path(
    get,
    path = "/admin/materials",
    responses((status = 200, description = "All materials", body = [MaterialRecord]))
)]
pub async fn list_all_materials(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<Vec<MaterialRecord>>, AppError> {
    user.require(Role::Admin)?;
    Ok(Json(materials::list_materials(&state, None).await?))
}

/// admin_material_feed
///
/// [Admin Route] Live changes to every material as Server-Sent Events.
#[utoipa::path(
    get,
    path = "/admin/materials/feed",
    responses((status = 200, description = "Event stream", content_type = "text/event-stream", body = MaterialEvent))
)]
pub async fn admin_material_feed(
    user: AuthUser,
    State(feed): State<MaterialFeed>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    user.require(Role::Admin)?;
    Ok(material_sse(&feed, None))
}

/// get_admin_stats
///
/// [Admin Route] Dashboard counters.
#[utoipa::path(
    get,
    path = "/admin/stats",
    responses((status = 200, description = "Stats", body = DashboardStats))
)]
pub async fn get_admin_stats(
    user: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<DashboardStats>, AppError> {
    user.require(Role::Admin)?;
    let stats = with_timeout(state.config.store_timeout, state.repo.get_stats()).await?;
    Ok(Json(stats))
}

/// register_user
///
/// [Admin Route] Provisions a staff or vendor account.
///
/// *Flow*: creates the account at the identity provider, then mirrors its id into the
/// `profiles` table with the chosen role. The profile is what the session gate reads.
#[utoipa::path(
    post,
    path = "/admin/users",
    request_body = RegisterUserRequest,
    responses(
        (status = 201, description = "Registered", body = UserProfile),
        (status = 400, description = "Rejected by the identity provider", body = ErrorBody)
    )
)]
pub async fn register_user(
    user: AuthUser,
    State(state): State<AppState>,
    Json(payload): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<UserProfile>), AppError> {
    user.require(Role::Admin)?;
    require_email(&payload.email)?;
    if payload.password.is_empty() {
        return Err(AppError::Validation("a password is required".into()));
    }

    let email = payload.email.trim().to_string();
    let id: Uuid = state.identity.sign_up(&email, &payload.password).await?;

    let created = with_timeout(
        state.config.store_timeout,
        state.repo.create_user(User {
            id,
            email,
            role: payload.role,
        }),
    )
    .await?;

    tracing::info!(user_id = %created.id, role = %created.role, admin_id = %user.id, "user provisioned");
    Ok((StatusCode::CREATED, Json(created.into())))
}

/// Streams feed events as SSE, optionally only those for one vendor's materials.
fn material_sse(
    feed: &MaterialFeed,
    vendor: Option<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let vendor = vendor.map(|id| id.to_string());
    let events = feed.subscribe().filter_map(move |event| {
        let visible = match &vendor {
            Some(v) => event.record().vendor_id.as_deref() == Some(v.as_str()),
            None => true,
        };
        let sse = visible
            .then(|| Event::default().event(event.kind()).json_data(&event))
            .and_then(|built| {
                built
                    .inspect_err(|e| tracing::error!(error = %e, "feed event serialization failed"))
                    .ok()
            })
            .map(Ok);
        future::ready(sse)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

/// current_profile
///
/// [Section Route] The signed-in user as the gate resolved them. Mounted in every section.
#[utoipa::path(
    get,
    path = "/{section}/me",
    params(("section" = Role, Path, description = "Section the session was checked against")),
    responses((status = 200, description = "Current user", body = UserProfile))
)]
pub async fn current_profile(user: AuthUser) -> Json<UserProfile> {
    Json(UserProfile {
        id: user.id,
        email: user.email,
        role: user.role,
    })
}
