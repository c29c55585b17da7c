use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{
    DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;

/// Claims
///
/// The subset of the provider's access-token payload the portal relies on. Tokens are
/// verified locally against the shared signing secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The user's id, also the primary key of their profile row.
    pub sub: Uuid,
    pub exp: usize,
    pub iat: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// IdentitySession
///
/// A live session as issued by the provider on sign-in.
#[derive(Debug, Clone)]
pub struct IdentitySession {
    pub access_token: String,
    pub expires_in: u64,
    pub user_id: Uuid,
    pub email: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("session is missing, invalid or expired")]
    InvalidSession,
    #[error("identity provider rejected the request: {0}")]
    Rejected(String),
    #[error("identity provider unreachable: {0}")]
    Unavailable(String),
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::InvalidCredentials | IdentityError::InvalidSession => {
                AppError::Unauthorized
            }
            IdentityError::Rejected(reason) => AppError::Validation(reason),
            IdentityError::Unavailable(cause) => AppError::Transient(cause),
        }
    }
}

/// IdentityProvider Contract
///
/// Everything the portal needs from the external identity service: credential sign-in
/// and sign-out, the current-session accessor, password-reset dispatch and account
/// creation for admin provisioning.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, IdentityError>;

    /// Creates an account and returns the provider's user id.
    async fn sign_up(&self, email: &str, password: &str) -> Result<Uuid, IdentityError>;

    /// Revokes the session behind `access_token`.
    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError>;

    async fn send_password_reset(&self, email: &str) -> Result<(), IdentityError>;

    /// Current-session accessor: validates the token and returns its claims.
    fn current_user(&self, access_token: &str) -> Result<Claims, IdentityError>;
}

/// IdentityState
///
/// The concrete type used to share the identity client across the application state.
pub type IdentityState = Arc<dyn IdentityProvider>;

/// verify_token
///
/// Decodes and validates an access token. Expiry is always enforced; the audience claim
/// is not, since provider tokens carry `authenticated` and locally issued ones carry none.
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, IdentityError> {
    let decoding_key = DecodingKey::from_secret(secret.as_bytes());

    let mut validation = Validation::default();
    validation.validate_exp = true;
    validation.validate_aud = false;

    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => {
            if matches!(e.kind(), ErrorKind::ExpiredSignature) {
                tracing::debug!("rejected expired access token");
            }
            Err(IdentityError::InvalidSession)
        }
    }
}

/// issue_token
///
/// Signs an HS256 access token for `sub`, valid for `ttl_secs`.
pub fn issue_token(
    secret: &str,
    sub: Uuid,
    email: Option<String>,
    ttl_secs: u64,
) -> Result<String, IdentityError> {
    let now = Utc::now().timestamp().max(0) as usize;
    let claims = Claims {
        sub,
        iat: now,
        exp: now + ttl_secs as usize,
        email,
    };
    let key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::default(), &claims, &key)
        .map_err(|e| IdentityError::Rejected(format!("token signing failed: {e}")))
}

// --- Supabase (GoTrue) Implementation ---

#[derive(Deserialize)]
struct GoTrueUser {
    id: Uuid,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct GoTrueSession {
    access_token: String,
    expires_in: u64,
    user: GoTrueUser,
}

/// The signup endpoint returns either the bare user or a session wrapping it,
/// depending on whether email confirmation is enabled.
#[derive(Deserialize)]
struct GoTrueSignUp {
    #[serde(default)]
    id: Option<Uuid>,
    #[serde(default)]
    user: Option<GoTrueUser>,
}

/// SupabaseIdentity
///
/// Talks to the provider's REST auth API with the project's anon key.
#[derive(Clone)]
pub struct SupabaseIdentity {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    jwt_secret: String,
}

impl SupabaseIdentity {
    pub fn new(base_url: &str, api_key: &str, jwt_secret: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            jwt_secret: jwt_secret.to_string(),
        }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }
}

fn unreachable(e: reqwest::Error) -> IdentityError {
    IdentityError::Unavailable(e.to_string())
}

#[async_trait]
impl IdentityProvider for SupabaseIdentity {
    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, IdentityError> {
        let response = self
            .client
            .post(self.auth_url("token?grant_type=password"))
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IdentityError::Unavailable(format!("sign-in returned {status}")));
        }
        if !status.is_success() {
            return Err(IdentityError::InvalidCredentials);
        }

        let session = response
            .json::<GoTrueSession>()
            .await
            .map_err(|e| IdentityError::Rejected(format!("unexpected sign-in response: {e}")))?;

        Ok(IdentitySession {
            access_token: session.access_token,
            expires_in: session.expires_in,
            user_id: session.user.id,
            email: session.user.email.unwrap_or_else(|| email.to_string()),
        })
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Uuid, IdentityError> {
        let response = self
            .client
            .post(self.auth_url("signup"))
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IdentityError::Unavailable(format!("signup returned {status}")));
        }
        if !status.is_success() {
            // Existing email, weak password and similar.
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::Rejected(body));
        }

        let created = response
            .json::<GoTrueSignUp>()
            .await
            .map_err(|e| IdentityError::Rejected(format!("unexpected signup response: {e}")))?;

        created
            .id
            .or(created.user.map(|u| u.id))
            .ok_or_else(|| IdentityError::Rejected("signup response carried no user id".into()))
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError> {
        let response = self
            .client
            .post(self.auth_url("logout"))
            .header("apikey", &self.api_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IdentityError::Unavailable(format!("logout returned {status}")));
        }
        // An already-revoked session is not a failure of sign-out.
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), IdentityError> {
        let response = self
            .client
            .post(self.auth_url("recover"))
            .header("apikey", &self.api_key)
            .json(&serde_json::json!({ "email": email }))
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(IdentityError::Unavailable(format!("recover returned {status}")));
        }
        if !status.is_success() {
            return Err(IdentityError::Rejected(format!("recover returned {status}")));
        }
        Ok(())
    }

    fn current_user(&self, access_token: &str) -> Result<Claims, IdentityError> {
        verify_token(access_token, &self.jwt_secret)
    }
}

// --- Mock Implementation (Local & Tests) ---

/// MockIdentityProvider
///
/// Holds accounts in memory and signs real HS256 tokens with the configured secret, so
/// the gate's token verification runs unmodified against it. Records every sign-out and
/// reset request for assertions.
pub struct MockIdentityProvider {
    jwt_secret: String,
    token_ttl: u64,
    accounts: Mutex<HashMap<String, (String, Uuid)>>,
    signed_out: Mutex<Vec<String>>,
    reset_requests: Mutex<Vec<String>>,
    /// When true, every network-shaped call fails as unreachable.
    pub should_fail: bool,
}

impl MockIdentityProvider {
    pub fn new(jwt_secret: &str) -> Self {
        Self {
            jwt_secret: jwt_secret.to_string(),
            token_ttl: 3600,
            accounts: Mutex::new(HashMap::new()),
            signed_out: Mutex::new(Vec::new()),
            reset_requests: Mutex::new(Vec::new()),
            should_fail: false,
        }
    }

    pub fn new_failing(jwt_secret: &str) -> Self {
        Self {
            should_fail: true,
            ..Self::new(jwt_secret)
        }
    }

    pub async fn add_account(&self, email: &str, password: &str, id: Uuid) {
        self.accounts
            .lock()
            .await
            .insert(email.to_string(), (password.to_string(), id));
    }

    /// Issues a valid token for `id` without a credential check.
    pub fn token_for(&self, id: Uuid) -> Result<String, IdentityError> {
        issue_token(&self.jwt_secret, id, None, self.token_ttl)
    }

    pub async fn signed_out_tokens(&self) -> Vec<String> {
        self.signed_out.lock().await.clone()
    }

    pub async fn reset_requests(&self) -> Vec<String> {
        self.reset_requests.lock().await.clone()
    }

    fn check(&self) -> Result<(), IdentityError> {
        if self.should_fail {
            return Err(IdentityError::Unavailable("simulated provider outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn sign_in(&self, email: &str, password: &str) -> Result<IdentitySession, IdentityError> {
        self.check()?;
        let accounts = self.accounts.lock().await;
        let (stored_password, id) = accounts
            .get(email)
            .ok_or(IdentityError::InvalidCredentials)?;
        if stored_password != password {
            return Err(IdentityError::InvalidCredentials);
        }
        let access_token =
            issue_token(&self.jwt_secret, *id, Some(email.to_string()), self.token_ttl)?;
        Ok(IdentitySession {
            access_token,
            expires_in: self.token_ttl,
            user_id: *id,
            email: email.to_string(),
        })
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Uuid, IdentityError> {
        self.check()?;
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(email) {
            return Err(IdentityError::Rejected("email already registered".into()));
        }
        let id = Uuid::new_v4();
        accounts.insert(email.to_string(), (password.to_string(), id));
        Ok(id)
    }

    async fn sign_out(&self, access_token: &str) -> Result<(), IdentityError> {
        self.check()?;
        self.signed_out.lock().await.push(access_token.to_string());
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), IdentityError> {
        self.check()?;
        self.reset_requests.lock().await.push(email.to_string());
        Ok(())
    }

    fn current_user(&self, access_token: &str) -> Result<Claims, IdentityError> {
        verify_token(access_token, &self.jwt_secret)
    }
}
