//! Session gate: one parameterized guard for every protected section.
//!
//! Per request the gate runs a small state machine, `Checking -> {Allowed, Redirecting}`.
//! [`Checking`] is consumed by [`Checking::settle`], so a settled request can never go
//! back to checking, and the protected handler only runs once the state is `Allowed`.

use std::time::Duration;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;

use crate::{
    AppState,
    auth::{AuthUser, SessionCredentials, end_session},
    config::Env,
    error::AppError,
    identity::IdentityProvider,
    models::Role,
    repository::{Repository, with_timeout},
};

/// Guard
///
/// Configuration of one protected section: who may enter, and where everyone else goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    pub required_role: Role,
    pub login_path: &'static str,
}

impl Guard {
    pub const fn new(required_role: Role, login_path: &'static str) -> Self {
        Self {
            required_role,
            login_path,
        }
    }

    /// The guard for a role's own section, redirecting to that section's login.
    pub fn for_role(role: Role) -> Self {
        Self::new(role, role.login_path())
    }

    /// Enters the `Checking` state for one request.
    pub fn mount(&self) -> Checking {
        Checking { guard: *self }
    }
}

/// GateState
///
/// Terminal states of a gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Allowed(AuthUser),
    Redirecting(String),
}

/// GateContext
///
/// The collaborators a check needs, borrowed from the application state.
pub struct GateContext<'a> {
    pub repo: &'a dyn Repository,
    pub identity: &'a dyn IdentityProvider,
    pub env: &'a Env,
    pub store_timeout: Duration,
}

/// Checking
///
/// The initial state. Holds nothing the caller can render.
#[derive(Debug)]
pub struct Checking {
    guard: Guard,
}

impl Checking {
    fn allow(self, user: AuthUser) -> GateState {
        GateState::Allowed(user)
    }

    fn redirect(self) -> GateState {
        GateState::Redirecting(self.guard.login_path.to_string())
    }

    /// settle
    ///
    /// Runs the check to a terminal state:
    ///
    /// 1. nothing suggests a session (no bearer header, no marker): redirect at once;
    /// 2. the access token must verify with the identity provider, else redirect;
    /// 3. the role is re-read from the store; a missing profile or wrong role revokes the
    ///    session at the provider and redirects;
    /// 4. otherwise allow.
    ///
    /// A store failure in step 3 is returned as `Transient` rather than settled, so a
    /// flaky connection never signs anybody out.
    pub async fn settle(
        self,
        credentials: &SessionCredentials,
        ctx: &GateContext<'_>,
    ) -> Result<GateState, AppError> {
        let required = self.guard.required_role;

        if *ctx.env == Env::Local {
            if let Some(dev_user) = credentials.dev_user {
                let profile = with_timeout(ctx.store_timeout, ctx.repo.get_user(dev_user)).await?;
                return Ok(match profile {
                    Some(user) if user.role == required => self.allow(user.into()),
                    _ => {
                        tracing::info!(user_id = %dev_user, required = %required, "dev bypass rejected");
                        self.redirect()
                    }
                });
            }
        }

        if credentials.obviously_signed_out() {
            tracing::debug!(required = %required, "no session marker, redirecting to login");
            return Ok(self.redirect());
        }

        // The marker alone is never trusted.
        let Some(token) = credentials.token() else {
            tracing::debug!("session marker without token, redirecting to login");
            return Ok(self.redirect());
        };

        let claims = match ctx.identity.current_user(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::info!(error = %e, "access token rejected, redirecting to login");
                return Ok(self.redirect());
            }
        };

        let profile = with_timeout(ctx.store_timeout, ctx.repo.get_user(claims.sub)).await?;

        match profile {
            Some(user) if user.role == required => {
                tracing::debug!(user_id = %user.id, role = %user.role, "gate allowed");
                Ok(self.allow(user.into()))
            }
            other => {
                tracing::warn!(
                    user_id = %claims.sub,
                    found = ?other.map(|u| u.role),
                    required = %required,
                    "role mismatch, revoking session"
                );
                if let Err(e) = ctx.identity.sign_out(token).await {
                    tracing::warn!(error = %e, "session revocation failed");
                }
                Ok(self.redirect())
            }
        }
    }
}

/// SectionGate
///
/// Middleware state: the section's guard plus the application state it checks against.
#[derive(Clone)]
pub struct SectionGate {
    pub guard: Guard,
    pub state: AppState,
}

impl SectionGate {
    pub fn new(guard: Guard, state: AppState) -> Self {
        Self { guard, state }
    }
}

/// enforce
///
/// Middleware wrapping every route of a protected section. Only an `Allowed` check
/// reaches the inner handler, with the resolved [`AuthUser`] attached to the request.
/// A redirect also clears any session cookies the client still holds.
pub async fn enforce(
    State(gate): State<SectionGate>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = SessionCredentials::from_request(request.headers(), &jar);
    let ctx = GateContext {
        repo: gate.state.repo.as_ref(),
        identity: gate.state.identity.as_ref(),
        env: &gate.state.config.env,
        store_timeout: gate.state.config.store_timeout,
    };

    match gate.guard.mount().settle(&credentials, &ctx).await {
        Ok(GateState::Allowed(user)) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Ok(GateState::Redirecting(target)) => {
            (end_session(jar), Redirect::to(&target)).into_response()
        }
        Err(e) => e.into_response(),
    }
}
