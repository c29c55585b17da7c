use axum::http::{HeaderMap, HeaderValue, header};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use uuid::Uuid;
use vimarsha_portal::{
    AppConfig, AppError, MockIdentityProvider,
    auth::{
        AuthUser, DEV_USER_HEADER, SESSION_MARKER_COOKIE, SESSION_TOKEN_COOKIE,
        SessionCredentials, end_session, start_session,
    },
    config::Env,
    identity::{IdentityError, IdentityProvider, issue_token, verify_token},
    models::Role,
};

const SECRET: &str = "super-secure-test-secret-value-local";

// --- Tokens ---

#[test]
fn test_issued_token_verifies() {
    let id = Uuid::new_v4();
    let token = issue_token(SECRET, id, Some("a@example.com".into()), 60).unwrap();

    let claims = verify_token(&token, SECRET).unwrap();

    assert_eq!(claims.sub, id);
    assert_eq!(claims.email.as_deref(), Some("a@example.com"));
}

#[test]
fn test_token_with_wrong_secret_is_invalid() {
    let token = issue_token(SECRET, Uuid::new_v4(), None, 60).unwrap();
    assert_eq!(
        verify_token(&token, "another-secret").unwrap_err(),
        IdentityError::InvalidSession
    );
}

#[test]
fn test_expired_token_is_invalid() {
    // Backdated well past the default 60s leeway.
    let id = Uuid::new_v4();
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = vimarsha_portal::identity::Claims {
        sub: id,
        iat: now - 7200,
        exp: now - 3600,
        email: None,
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    assert!(verify_token(&token, SECRET).is_err());
}

// --- Mock provider ---

#[tokio::test]
async fn test_mock_provider_sign_in() {
    let provider = MockIdentityProvider::new(SECRET);
    let id = Uuid::new_v4();
    provider.add_account("depot@example.com", "pw", id).await;

    let session = provider.sign_in("depot@example.com", "pw").await.unwrap();
    assert_eq!(session.user_id, id);
    assert_eq!(provider.current_user(&session.access_token).unwrap().sub, id);

    let wrong = provider.sign_in("depot@example.com", "nope").await;
    assert_eq!(wrong.unwrap_err(), IdentityError::InvalidCredentials);
}

#[tokio::test]
async fn test_mock_provider_rejects_duplicate_sign_up() {
    let provider = MockIdentityProvider::new(SECRET);
    provider.sign_up("x@example.com", "pw").await.unwrap();

    let err = provider.sign_up("x@example.com", "pw").await.unwrap_err();

    assert!(matches!(err, IdentityError::Rejected(_)));
    assert!(matches!(AppError::from(err), AppError::Validation(_)));
}

#[tokio::test]
async fn test_unreachable_provider_is_transient() {
    let provider = MockIdentityProvider::new_failing(SECRET);
    let err = provider.sign_in("a@example.com", "pw").await.unwrap_err();
    assert!(matches!(AppError::from(err), AppError::Transient(_)));
}

// --- Credentials ---

#[test]
fn test_credentials_prefer_bearer_header() {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_static("Bearer header-token"),
    );
    let jar = CookieJar::new()
        .add(Cookie::new(SESSION_MARKER_COOKIE, "1"))
        .add(Cookie::new(SESSION_TOKEN_COOKIE, "cookie-token"));

    let credentials = SessionCredentials::from_request(&headers, &jar);

    assert_eq!(credentials.token(), Some("header-token"));
    assert!(credentials.marker);
    assert!(!credentials.obviously_signed_out());
}

#[test]
fn test_credentials_without_marker_or_bearer_are_signed_out() {
    let jar = CookieJar::new().add(Cookie::new(SESSION_TOKEN_COOKIE, "cookie-token"));
    let credentials = SessionCredentials::from_request(&HeaderMap::new(), &jar);
    assert!(credentials.obviously_signed_out());
}

#[test]
fn test_dev_user_header_is_parsed() {
    let id = Uuid::new_v4();
    let mut headers = HeaderMap::new();
    headers.insert(DEV_USER_HEADER, HeaderValue::from_str(&id.to_string()).unwrap());

    let credentials = SessionCredentials::from_request(&headers, &CookieJar::new());

    assert_eq!(credentials.dev_user, Some(id));
}

// --- Cookies ---

#[test]
fn test_session_cookies_round_trip() {
    let config = AppConfig {
        env: Env::Production,
        ..AppConfig::default()
    };

    let jar = start_session(CookieJar::new(), "tok", &config);
    let marker = jar.get(SESSION_MARKER_COOKIE).unwrap();
    let token = jar.get(SESSION_TOKEN_COOKIE).unwrap();

    assert_eq!(marker.value(), "1");
    assert_ne!(marker.http_only(), Some(true));
    assert_eq!(token.value(), "tok");
    assert_eq!(token.http_only(), Some(true));
    assert_eq!(token.secure(), Some(true));
    assert_eq!(token.path(), Some("/"));

    let cleared = end_session(jar);
    assert!(cleared.get(SESSION_MARKER_COOKIE).is_none());
    assert!(cleared.get(SESSION_TOKEN_COOKIE).is_none());
}

// --- Role checks ---

#[test]
fn test_handler_role_check() {
    let user = AuthUser {
        id: Uuid::new_v4(),
        email: "t@example.com".into(),
        role: Role::Track,
    };

    assert!(user.require(Role::Track).is_ok());
    assert!(user.require_any(&[Role::Depot, Role::Track]).is_ok());
    assert!(matches!(
        user.require(Role::Admin),
        Err(AppError::PermissionDenied)
    ));
}
