use reqwest::{StatusCode, header};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use uuid::Uuid;
use vimarsha_portal::{
    AppConfig, AppState, InMemoryRepository, MaterialFeed, MockIdentityProvider,
    MockStorageService,
    auth::{SESSION_MARKER_COOKIE, SESSION_TOKEN_COOKIE},
    config::Env,
    create_router,
    identity::IdentityState,
    models::{Role, User},
    repository::RepositoryState,
    storage::StorageState,
};

pub struct TestApp {
    pub address: String,
    pub repo: Arc<InMemoryRepository>,
    pub identity: Arc<MockIdentityProvider>,
    pub feed: MaterialFeed,
    pub client: reqwest::Client,
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Creates an account at the mock provider plus its role profile.
    async fn account(&self, role: Role, password: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: format!("{}-{}@example.com", role, Uuid::new_v4()),
            role,
        };
        self.identity
            .add_account(&user.email, password, user.id)
            .await;
        self.repo.seed_user(user.clone()).await;
        user
    }

    fn bearer(&self, user: &User) -> String {
        format!("Bearer {}", self.identity.token_for(user.id).unwrap())
    }
}

async fn spawn_app() -> TestApp {
    let config = AppConfig {
        env: Env::Production,
        ..AppConfig::default()
    };
    let repo = Arc::new(InMemoryRepository::new());
    let identity = Arc::new(MockIdentityProvider::new(&config.jwt_secret));
    let feed = MaterialFeed::default();

    let state = AppState {
        repo: repo.clone() as RepositoryState,
        identity: identity.clone() as IdentityState,
        storage: Arc::new(MockStorageService::new()) as StorageState,
        feed: feed.clone(),
        config,
    };
    let router = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind port");
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    // Redirects are asserted on, never followed.
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestApp {
        address,
        repo,
        identity,
        feed,
        client,
    }
}

fn material_body() -> Value {
    json!({
        "manufacturerName": "Rail Fittings Ltd",
        "manufacturerId": "RFL-01",
        "fittingType": "GFN Liner",
        "drawingNumber": "RDSO/T-3706",
        "materialSpecs": "Glass-filled nylon 66",
        "weight": "0.12",
        "gauge": "1676",
        "manufacturingDate": "2026-02-11",
        "expectedLife": "8",
        "batchNumber": "B-14",
        "poNumber": "PO-31"
    })
}

fn set_cookies(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

// --- Public ---

#[tokio::test]
async fn test_health_check() {
    let app = spawn_app().await;

    let response = app.client.get(app.url("/health")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_public_record_not_found_is_json_error() {
    let app = spawn_app().await;

    let response = app
        .client
        .get(app.url("/materials/NOPE000"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_public_record_with_store_down_is_retryable() {
    let app = spawn_app().await;
    app.repo.set_failing(true);

    let response = app
        .client
        .get(app.url("/materials/AB12345"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "transient");
    assert_eq!(body["retryable"], true);
}

// --- Session ---

#[tokio::test]
async fn test_login_sets_session_cookies() {
    let app = spawn_app().await;
    let vendor = app.account(Role::Vendor, "s3cret").await;

    let response = app
        .client
        .post(app.url("/vendor/login"))
        .json(&json!({ "email": vendor.email, "password": "s3cret" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let cookies = set_cookies(&response);
    let marker = cookies
        .iter()
        .find(|c| c.starts_with(SESSION_MARKER_COOKIE))
        .expect("marker cookie");
    let token = cookies
        .iter()
        .find(|c| c.starts_with(SESSION_TOKEN_COOKIE))
        .expect("token cookie");
    assert!(!marker.contains("HttpOnly"));
    assert!(token.contains("HttpOnly"));
    assert!(token.contains("Secure"));

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["redirect_to"], "/vendor");
    assert_eq!(body["user"]["role"], "vendor");
}

#[tokio::test]
async fn test_login_to_wrong_section_is_forbidden_and_signed_out() {
    let app = spawn_app().await;
    let depot = app.account(Role::Depot, "pw").await;

    let response = app
        .client
        .post(app.url("/admin/login"))
        .json(&json!({ "email": depot.email, "password": "pw" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(set_cookies(&response).is_empty());
    assert_eq!(app.identity.signed_out_tokens().await.len(), 1);
}

#[tokio::test]
async fn test_login_with_wrong_password_is_unauthorized() {
    let app = spawn_app().await;
    let track = app.account(Role::Track, "right").await;

    let response = app
        .client
        .post(app.url("/track/login"))
        .json(&json!({ "email": track.email, "password": "wrong" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_logout_revokes_and_clears_cookies() {
    let app = spawn_app().await;
    let vendor = app.account(Role::Vendor, "pw").await;
    let token = app.identity.token_for(vendor.id).unwrap();

    let response = app
        .client
        .post(app.url("/logout"))
        .header(
            header::COOKIE,
            format!("{SESSION_MARKER_COOKIE}=1; {SESSION_TOKEN_COOKIE}={token}"),
        )
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(set_cookies(&response).len(), 2);
    assert_eq!(app.identity.signed_out_tokens().await, vec![token]);
}

#[tokio::test]
async fn test_password_reset_is_accepted() {
    let app = spawn_app().await;

    let response = app
        .client
        .post(app.url("/password-reset"))
        .json(&json!({ "email": "someone@example.com" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        app.identity.reset_requests().await,
        vec!["someone@example.com".to_string()]
    );
}

// --- Material lifecycle ---

#[tokio::test]
async fn test_vendor_create_then_public_lookup_and_staff_scan() {
    let app = spawn_app().await;
    let vendor = app.account(Role::Vendor, "pw").await;
    let depot = app.account(Role::Depot, "pw").await;

    // Vendor registers a fitting.
    let response = app
        .client
        .post(app.url("/vendor/materials"))
        .header(header::AUTHORIZATION, app.bearer(&vendor))
        .json(&material_body())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created: Value = response.json().await.unwrap();
    let id = created["materialId"].as_str().unwrap().to_string();

    // The public deep link resolves without a session.
    let public: Value = app
        .client
        .get(app.url(&format!("/materials/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(public["fittingType"], "GFN Liner");

    // The QR symbol can be re-rendered.
    let qr = app
        .client
        .get(app.url(&format!("/materials/{id}/qr.svg")))
        .send()
        .await
        .unwrap();
    assert_eq!(qr.status(), StatusCode::OK);
    assert_eq!(qr.headers()[header::CONTENT_TYPE], "image/svg+xml");
    assert_eq!(qr.text().await.unwrap(), created["qrCode"].as_str().unwrap());

    // Depot scans the printed deep link.
    let scanned = app
        .client
        .post(app.url("/depot/scan"))
        .header(header::AUTHORIZATION, app.bearer(&depot))
        .json(&json!({ "payload": format!("https://vimarsha.example/materials/{id}") }))
        .send()
        .await
        .unwrap();
    assert_eq!(scanned.status(), StatusCode::OK);
    let record: Value = scanned.json().await.unwrap();
    assert_eq!(record["materialId"], id.as_str());

    // Depot records receipt.
    let patched: Value = app
        .client
        .patch(app.url(&format!("/depot/materials/{id}")))
        .header(header::AUTHORIZATION, app.bearer(&depot))
        .json(&json!({ "depotReceiptStatus": "received", "materialId": "HIJACK1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["depotReceiptStatus"], "received");
    assert_eq!(patched["materialId"], id.as_str());
}

#[tokio::test]
async fn test_empty_scan_payload_is_bad_request() {
    let app = spawn_app().await;
    let track = app.account(Role::Track, "pw").await;

    let response = app
        .client
        .post(app.url("/track/scan"))
        .header(header::AUTHORIZATION, app.bearer(&track))
        .json(&json!({ "payload": "   " }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "empty_payload");
}

#[tokio::test]
async fn test_vendor_cannot_reach_staff_section() {
    let app = spawn_app().await;
    let vendor = app.account(Role::Vendor, "pw").await;

    let response = app
        .client
        .post(app.url("/depot/scan"))
        .header(header::AUTHORIZATION, app.bearer(&vendor))
        .json(&json!({ "payload": "AB12345" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/depot/login");
    assert_eq!(app.identity.signed_out_tokens().await.len(), 1);
}

#[tokio::test]
async fn test_admin_provisions_user_and_reads_stats() {
    let app = spawn_app().await;
    let admin = app.account(Role::Admin, "pw").await;

    let response = app
        .client
        .post(app.url("/admin/users"))
        .header(header::AUTHORIZATION, app.bearer(&admin))
        .json(&json!({ "email": "new.depot@example.com", "password": "pw", "role": "depot" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let profile: Value = response.json().await.unwrap();
    assert_eq!(profile["role"], "depot");

    // The new account can sign in to its own section.
    let login = app
        .client
        .post(app.url("/depot/login"))
        .json(&json!({ "email": "new.depot@example.com", "password": "pw" }))
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::OK);

    let stats: Value = app
        .client
        .get(app.url("/admin/stats"))
        .header(header::AUTHORIZATION, app.bearer(&admin))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total_users"], 2);
    assert_eq!(stats["total_materials"], 0);
}

// --- Live feed ---

#[tokio::test]
async fn test_vendor_feed_streams_own_changes_and_cancels_on_disconnect() {
    let app = spawn_app().await;
    let vendor = app.account(Role::Vendor, "pw").await;
    let other = app.account(Role::Vendor, "pw").await;

    let mut feed = app
        .client
        .get(app.url("/vendor/materials/feed"))
        .header(header::AUTHORIZATION, app.bearer(&vendor))
        .send()
        .await
        .unwrap();
    assert_eq!(feed.status(), StatusCode::OK);
    assert_eq!(app.feed.active_subscribers(), 1);

    // Another vendor's material is filtered out; the own one comes through.
    for user in [&other, &vendor] {
        let response = app
            .client
            .post(app.url("/vendor/materials"))
            .header(header::AUTHORIZATION, app.bearer(user))
            .json(&material_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let chunk = tokio::time::timeout(Duration::from_secs(5), feed.chunk())
        .await
        .expect("event within timeout")
        .unwrap()
        .expect("stream open");
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: created"));
    assert!(text.contains(&vendor.id.to_string()));
    assert!(!text.contains(&other.id.to_string()));

    drop(feed);
    let mut cancelled = false;
    for _ in 0..500 {
        if app.feed.active_subscribers() == 0 {
            cancelled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cancelled, "subscription should end with the connection");
}
