use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;
use vimarsha_portal::{
    AppConfig, AppError, AppState, InMemoryRepository, MaterialFeed, MockIdentityProvider,
    MockStorageService,
    auth::{SESSION_MARKER_COOKIE, SESSION_TOKEN_COOKIE, SessionCredentials},
    config::Env,
    create_router,
    gate::{GateContext, GateState, Guard},
    identity::IdentityState,
    models::{Role, User},
    repository::RepositoryState,
    storage::StorageState,
};

struct Harness {
    repo: Arc<InMemoryRepository>,
    identity: Arc<MockIdentityProvider>,
    config: AppConfig,
}

impl Harness {
    fn new(env: Env) -> Self {
        let config = AppConfig {
            env,
            ..AppConfig::default()
        };
        Self {
            repo: Arc::new(InMemoryRepository::new()),
            identity: Arc::new(MockIdentityProvider::new(&config.jwt_secret)),
            config,
        }
    }

    fn ctx(&self) -> GateContext<'_> {
        GateContext {
            repo: self.repo.as_ref(),
            identity: self.identity.as_ref(),
            env: &self.config.env,
            store_timeout: self.config.store_timeout,
        }
    }

    async fn user(&self, role: Role) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: format!("{role}@example.com"),
            role,
        };
        self.repo.seed_user(user.clone()).await;
        user
    }

    fn state(&self) -> AppState {
        AppState {
            repo: self.repo.clone() as RepositoryState,
            identity: self.identity.clone() as IdentityState,
            storage: Arc::new(MockStorageService::new()) as StorageState,
            feed: MaterialFeed::default(),
            config: self.config.clone(),
        }
    }
}

fn bearer(token: &str) -> SessionCredentials {
    SessionCredentials {
        bearer: Some(token.to_string()),
        ..SessionCredentials::default()
    }
}

fn cookies(token: &str) -> SessionCredentials {
    SessionCredentials {
        token_cookie: Some(token.to_string()),
        marker: true,
        ..SessionCredentials::default()
    }
}

// --- State machine ---

#[tokio::test]
async fn test_no_session_redirects_to_section_login() {
    let h = Harness::new(Env::Production);

    for role in Role::ALL {
        let state = Guard::for_role(role)
            .mount()
            .settle(&SessionCredentials::default(), &h.ctx())
            .await
            .unwrap();
        assert_eq!(state, GateState::Redirecting(role.login_path().to_string()));
    }
}

#[tokio::test]
async fn test_token_cookie_without_marker_is_treated_as_signed_out() {
    let h = Harness::new(Env::Production);
    let user = h.user(Role::Depot).await;
    let token = h.identity.token_for(user.id).unwrap();
    let credentials = SessionCredentials {
        token_cookie: Some(token),
        ..SessionCredentials::default()
    };

    let state = Guard::for_role(Role::Depot)
        .mount()
        .settle(&credentials, &h.ctx())
        .await
        .unwrap();

    assert_eq!(state, GateState::Redirecting("/depot/login".into()));
}

#[tokio::test]
async fn test_marker_alone_is_not_trusted() {
    let h = Harness::new(Env::Production);
    let credentials = SessionCredentials {
        marker: true,
        ..SessionCredentials::default()
    };

    let state = Guard::for_role(Role::Track)
        .mount()
        .settle(&credentials, &h.ctx())
        .await
        .unwrap();

    assert_eq!(state, GateState::Redirecting("/track/login".into()));
}

#[tokio::test]
async fn test_invalid_token_redirects() {
    let h = Harness::new(Env::Production);

    let state = Guard::for_role(Role::Vendor)
        .mount()
        .settle(&cookies("not-a-jwt"), &h.ctx())
        .await
        .unwrap();

    assert_eq!(state, GateState::Redirecting("/vendor/login".into()));
    assert!(h.identity.signed_out_tokens().await.is_empty());
}

#[tokio::test]
async fn test_matching_role_is_allowed() {
    let h = Harness::new(Env::Production);
    let user = h.user(Role::Vendor).await;
    let token = h.identity.token_for(user.id).unwrap();

    let state = Guard::for_role(Role::Vendor)
        .mount()
        .settle(&cookies(&token), &h.ctx())
        .await
        .unwrap();

    match state {
        GateState::Allowed(auth) => {
            assert_eq!(auth.id, user.id);
            assert_eq!(auth.role, Role::Vendor);
        }
        other => panic!("expected Allowed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_role_mismatch_signs_out_and_redirects() {
    let h = Harness::new(Env::Production);
    let user = h.user(Role::Vendor).await;
    let token = h.identity.token_for(user.id).unwrap();

    let state = Guard::for_role(Role::Admin)
        .mount()
        .settle(&bearer(&token), &h.ctx())
        .await
        .unwrap();

    assert_eq!(state, GateState::Redirecting("/admin/login".into()));
    assert_eq!(h.identity.signed_out_tokens().await, vec![token]);
}

#[tokio::test]
async fn test_role_is_reread_from_store() {
    let h = Harness::new(Env::Production);
    let mut user = h.user(Role::Depot).await;
    let token = h.identity.token_for(user.id).unwrap();

    // Role changed after the token was issued.
    user.role = Role::Track;
    h.repo.seed_user(user).await;

    let state = Guard::for_role(Role::Depot)
        .mount()
        .settle(&bearer(&token), &h.ctx())
        .await
        .unwrap();

    assert_eq!(state, GateState::Redirecting("/depot/login".into()));
}

#[tokio::test]
async fn test_missing_profile_signs_out() {
    let h = Harness::new(Env::Production);
    let token = h.identity.token_for(Uuid::new_v4()).unwrap();

    let state = Guard::for_role(Role::Track)
        .mount()
        .settle(&bearer(&token), &h.ctx())
        .await
        .unwrap();

    assert_eq!(state, GateState::Redirecting("/track/login".into()));
    assert_eq!(h.identity.signed_out_tokens().await.len(), 1);
}

#[tokio::test]
async fn test_store_failure_is_transient_and_keeps_session() {
    let h = Harness::new(Env::Production);
    let user = h.user(Role::Vendor).await;
    let token = h.identity.token_for(user.id).unwrap();
    h.repo.set_failing(true);

    let result = Guard::for_role(Role::Vendor)
        .mount()
        .settle(&bearer(&token), &h.ctx())
        .await;

    assert!(matches!(result, Err(AppError::Transient(_))));
    assert!(h.identity.signed_out_tokens().await.is_empty());
}

#[tokio::test]
async fn test_dev_bypass_only_in_local() {
    let local = Harness::new(Env::Local);
    let user = local.user(Role::Admin).await;
    let credentials = SessionCredentials {
        dev_user: Some(user.id),
        ..SessionCredentials::default()
    };

    let allowed = Guard::for_role(Role::Admin)
        .mount()
        .settle(&credentials, &local.ctx())
        .await
        .unwrap();
    assert!(matches!(allowed, GateState::Allowed(_)));

    let wrong_section = Guard::for_role(Role::Vendor)
        .mount()
        .settle(&credentials, &local.ctx())
        .await
        .unwrap();
    assert_eq!(wrong_section, GateState::Redirecting("/vendor/login".into()));

    let prod = Harness::new(Env::Production);
    prod.repo.seed_user(user).await;
    let ignored = Guard::for_role(Role::Admin)
        .mount()
        .settle(&credentials, &prod.ctx())
        .await
        .unwrap();
    assert_eq!(ignored, GateState::Redirecting("/admin/login".into()));
}

// --- Middleware ---

#[tokio::test]
async fn test_gated_route_redirects_before_handler_runs() {
    let h = Harness::new(Env::Production);
    // A failing store would turn any handler call into a 503.
    h.repo.set_failing(true);
    let app = create_router(h.state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/vendor/materials")
                .header(
                    header::COOKIE,
                    format!("{SESSION_MARKER_COOKIE}=1; {SESSION_TOKEN_COOKIE}=expired"),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response.headers().get(header::LOCATION).unwrap(),
        "/vendor/login"
    );
    // Stale session cookies are cleared on the way out.
    let cleared: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert!(cleared.iter().any(|c| c.starts_with(SESSION_MARKER_COOKIE)));
    assert!(cleared.iter().any(|c| c.starts_with(SESSION_TOKEN_COOKIE)));
}

#[tokio::test]
async fn test_login_route_is_not_gated() {
    let h = Harness::new(Env::Production);
    let app = create_router(h.state());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/depot/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"email":"nobody@example.com","password":"x"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_gated_route_with_cookie_session_reaches_handler() {
    let h = Harness::new(Env::Production);
    let user = h.user(Role::Depot).await;
    let token = h.identity.token_for(user.id).unwrap();
    let app = create_router(h.state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/depot/me")
                .header(
                    header::COOKIE,
                    format!("{SESSION_MARKER_COOKIE}=1; {SESSION_TOKEN_COOKIE}={token}"),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let profile: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(profile["id"], user.id.to_string());
    assert_eq!(profile["role"], "depot");
}

#[tokio::test]
async fn test_transient_gate_failure_is_503_with_retry_after() {
    let h = Harness::new(Env::Production);
    let user = h.user(Role::Admin).await;
    let token = h.identity.token_for(user.id).unwrap();
    h.repo.set_failing(true);
    let app = create_router(h.state());

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/stats")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
}
