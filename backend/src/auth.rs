use axum::{
    extract::FromRequestParts,
    http::{HeaderMap, header, request::Parts},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use uuid::Uuid;

use crate::{
    config::{AppConfig, Env},
    error::AppError,
    models::{Role, User},
};

/// Navigation hint set at login and cleared at logout. Never an authorization source.
pub const SESSION_MARKER_COOKIE: &str = "vimarsha_session";

/// HttpOnly cookie carrying the identity provider's access token.
pub const SESSION_TOKEN_COOKIE: &str = "vimarsha_token";

/// Development bypass header, honoured only in `Env::Local`.
pub const DEV_USER_HEADER: &str = "x-user-id";

/// AuthUser
///
/// The identity the session gate resolved for this request: the provider's user id and
/// the role freshly read from the store. Handlers take it as an argument; the gate is the
/// only place that creates one from a live request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

impl From<User> for AuthUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            role: user.role,
        }
    }
}

impl AuthUser {
    /// Handler-level role check, a second line behind the section gate.
    pub fn require(&self, role: Role) -> Result<(), AppError> {
        self.require_any(&[role])
    }

    pub fn require_any(&self, roles: &[Role]) -> Result<(), AppError> {
        if roles.contains(&self.role) {
            Ok(())
        } else {
            tracing::warn!(user_id = %self.id, role = %self.role, "role check failed in handler");
            Err(AppError::PermissionDenied)
        }
    }
}

/// AuthUser Extractor
///
/// Reads the identity the gate middleware attached to the request. A protected handler
/// mounted without a gate therefore always rejects with 401 rather than running
/// unauthenticated.
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// SessionCredentials
///
/// Everything a request presents that might identify a session.
#[derive(Debug, Clone, Default)]
pub struct SessionCredentials {
    pub bearer: Option<String>,
    pub token_cookie: Option<String>,
    pub marker: bool,
    pub dev_user: Option<Uuid>,
}

impl SessionCredentials {
    pub fn from_request(headers: &HeaderMap, jar: &CookieJar) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);

        let dev_user = headers
            .get(DEV_USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok());

        Self {
            bearer,
            token_cookie: jar
                .get(SESSION_TOKEN_COOKIE)
                .map(|cookie| cookie.value().to_string()),
            marker: jar.get(SESSION_MARKER_COOKIE).is_some(),
            dev_user,
        }
    }

    /// The access token, preferring an explicit `Authorization` header.
    pub fn token(&self) -> Option<&str> {
        self.bearer.as_deref().or(self.token_cookie.as_deref())
    }

    /// Cheap pre-check: nothing at all suggests a session.
    pub fn obviously_signed_out(&self) -> bool {
        self.bearer.is_none() && !self.marker
    }
}

/// Writes the session marker and token cookies after a successful login.
pub fn start_session(jar: CookieJar, access_token: &str, config: &AppConfig) -> CookieJar {
    let max_age = time::Duration::seconds(config.session_ttl_secs as i64);
    let secure = config.env == Env::Production;

    let marker = Cookie::build((SESSION_MARKER_COOKIE, "1"))
        .path("/")
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(max_age);

    let token = Cookie::build((SESSION_TOKEN_COOKIE, access_token.to_string()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(max_age);

    jar.add(marker).add(token)
}

/// Clears both session cookies.
pub fn end_session(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(SESSION_MARKER_COOKIE).path("/"))
        .remove(Cookie::build(SESSION_TOKEN_COOKIE).path("/"))
}
