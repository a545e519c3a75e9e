//! # Authentication
//!
//! Bearer token middleware that resolves every request to a
//! [`CallerIdentity`].
//!
//! ## Token Format
//!
//! ```text
//! Bearer {kind}:{user_id}:{secret}    kind = member | arbiter | system
//! ```
//!
//! The secret is shared by the deployment; `user_id` must be a UUID. The
//! role a member holds on a particular job (client, freelancer or visitor)
//! is resolved per job from the job itself, never from the token.
//!
//! ## Development Mode
//!
//! When no token is configured, authentication is disabled and the identity
//! is taken from the `x-user-id` and `x-role` headers. Without `x-user-id`
//! the caller is the system.

use axum::extract::Request;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gig_core::{Actor, Rejection, Role, UserId};
use gig_state::Job;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::ToSchema;
use zeroize::Zeroizing;

use crate::error::{AppError, ErrorBody, ErrorDetail};

/// Header carrying the user id when authentication is disabled.
pub const DEV_USER_HEADER: &str = "x-user-id";
/// Header carrying the caller kind when authentication is disabled.
pub const DEV_ROLE_HEADER: &str = "x-role";

// ── SecretToken ─────────────────────────────────────────────────────────────

/// A credential wiped from memory on drop. `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretToken(Zeroizing<String>);

impl SecretToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the raw secret.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretToken([REDACTED])")
    }
}

// ── CallerIdentity ──────────────────────────────────────────────────────────

/// Platform-level kind of caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CallerKind {
    /// A marketplace user. Client or freelancer depending on the job.
    Member,
    /// A dispute arbiter.
    Arbiter,
    /// Scheduler, operator tooling or the engine itself.
    System,
}

impl CallerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Arbiter => "arbiter",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for CallerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" | "client" | "freelancer" => Ok(Self::Member),
            "arbiter" => Ok(Self::Arbiter),
            "system" => Ok(Self::System),
            other => Err(format!("unknown caller kind: {other}")),
        }
    }
}

/// Identity of the authenticated caller, injected by [`auth_middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallerIdentity {
    pub kind: CallerKind,
    /// `None` only for the anonymous system identity of development mode.
    pub user_id: Option<UserId>,
}

impl CallerIdentity {
    pub fn member(user: UserId) -> Self {
        Self {
            kind: CallerKind::Member,
            user_id: Some(user),
        }
    }

    pub fn arbiter(user: UserId) -> Self {
        Self {
            kind: CallerKind::Arbiter,
            user_id: Some(user),
        }
    }

    pub fn system() -> Self {
        Self {
            kind: CallerKind::System,
            user_id: None,
        }
    }

    /// The user behind the request, required for member actions.
    pub fn require_user(&self) -> Result<UserId, AppError> {
        self.user_id
            .ok_or_else(|| AppError::Unauthorized("request carries no user identity".into()))
    }

    /// Require a marketplace member acting for themselves.
    pub fn require_member(&self, action: &str) -> Result<UserId, AppError> {
        let user = self.require_user()?;
        match self.kind {
            CallerKind::Member => Ok(user),
            CallerKind::Arbiter => Err(Rejection::forbidden(action, Role::Arbiter).into()),
            CallerKind::System => Err(Rejection::forbidden(action, Role::System).into()),
        }
    }

    /// Resolve the actor this caller is on `job`.
    pub fn actor_on(&self, job: &Job) -> Actor {
        match (self.kind, self.user_id) {
            (CallerKind::Member, Some(user)) => job.actor_for(user),
            (CallerKind::Arbiter, Some(user)) => Actor::arbiter(user),
            _ => Actor::system(),
        }
    }

    /// Require system authority (sweeps, acknowledgments, retries).
    pub fn require_system(&self) -> Result<(), AppError> {
        match self.kind {
            CallerKind::System => Ok(()),
            other => Err(AppError::Forbidden(format!(
                "system authority required, caller is '{}'",
                other.as_str()
            ))),
        }
    }
}

#[axum::async_trait]
impl<S: Send + Sync> axum::extract::FromRequestParts<S> for CallerIdentity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CallerIdentity>()
            .copied()
            .ok_or_else(|| AppError::Unauthorized("no caller identity in request context".into()))
    }
}

// ── Auth Configuration ──────────────────────────────────────────────────────

/// Auth configuration injected into request extensions.
#[derive(Clone, Default)]
pub struct AuthConfig {
    pub token: Option<SecretToken>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

// ── Token Validation ────────────────────────────────────────────────────────

/// Constant-time comparison of bearer secrets.
fn constant_time_token_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}

/// Parse a `{kind}:{user_id}:{secret}` bearer token.
pub fn parse_bearer_token(provided: &str, expected_secret: &str) -> Result<CallerIdentity, String> {
    let parts: Vec<&str> = provided.splitn(3, ':').collect();
    let [kind, user, secret] = parts.as_slice() else {
        return Err("invalid token format, expected {kind}:{user_id}:{secret}".into());
    };
    if !constant_time_token_eq(secret, expected_secret) {
        return Err("invalid bearer token".into());
    }
    let kind: CallerKind = kind.parse()?;
    let user_id = if user.is_empty() {
        None
    } else {
        Some(
            user.parse::<UserId>()
                .map_err(|e| format!("invalid user_id: {e}"))?,
        )
    };
    if user_id.is_none() && kind != CallerKind::System {
        return Err(format!("{} tokens must name a user", kind.as_str()));
    }
    Ok(CallerIdentity { kind, user_id })
}

/// Identity from development headers.
fn dev_identity(headers: &HeaderMap) -> Result<CallerIdentity, String> {
    let user = headers
        .get(DEV_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());
    let Some(user) = user else {
        return Ok(CallerIdentity::system());
    };
    let user_id = user
        .parse::<UserId>()
        .map_err(|e| format!("invalid {DEV_USER_HEADER}: {e}"))?;
    let kind = match headers.get(DEV_ROLE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => raw.parse()?,
        None => CallerKind::Member,
    };
    Ok(CallerIdentity {
        kind,
        user_id: Some(user_id),
    })
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Validate the bearer token and inject the caller identity.
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    let config = request
        .extensions()
        .get::<AuthConfig>()
        .cloned()
        .unwrap_or_default();

    let identity = match config.token {
        Some(expected) => {
            let auth_header = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            match auth_header {
                Some(value) if value.starts_with("Bearer ") => {
                    parse_bearer_token(&value[7..], expected.expose())
                }
                Some(_) => Err("authorization header must use Bearer scheme".to_string()),
                None => Err("missing authorization header".to_string()),
            }
        }
        None => dev_identity(request.headers()),
    };

    match identity {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(msg) => {
            tracing::warn!(reason = %msg, "authentication failed");
            unauthorized_response(&msg)
        }
    }
}

fn unauthorized_response(message: &str) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            code: "UNAUTHORIZED".to_string(),
            message: message.to_string(),
            details: None,
        },
    };
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::middleware::from_fn;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn whoami(caller: CallerIdentity) -> String {
        format!(
            "{}:{}",
            caller.kind.as_str(),
            caller.user_id.map(|u| u.to_string()).unwrap_or_default()
        )
    }

    fn test_app(token: Option<&str>) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .layer(from_fn(auth_middleware))
            .layer(axum::Extension(AuthConfig {
                token: token.map(SecretToken::new),
            }))
    }

    async fn call(app: Router, headers: &[(&str, &str)]) -> (StatusCode, String) {
        let mut builder = Request::builder().uri("/whoami");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn member_token_resolves_identity() {
        let user = UserId::new();
        let token = format!("Bearer member:{user}:s3cret");
        let (status, body) = call(test_app(Some("s3cret")), &[("Authorization", &token)]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("member:{user}"));
    }

    #[tokio::test]
    async fn wrong_secret_and_missing_header_are_unauthorized() {
        let user = UserId::new();
        let token = format!("Bearer member:{user}:nope");
        let (status, body) = call(test_app(Some("s3cret")), &[("Authorization", &token)]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let err: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(err["error"]["code"], "UNAUTHORIZED");

        let (status, body) = call(test_app(Some("s3cret")), &[]).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("missing"));
    }

    #[tokio::test]
    async fn basic_scheme_is_refused() {
        let (status, body) = call(
            test_app(Some("s3cret")),
            &[("Authorization", "Basic dXNlcjpwYXNz")],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("Bearer scheme"));
    }

    #[tokio::test]
    async fn dev_mode_reads_headers() {
        let user = UserId::new();
        let (status, body) = call(
            test_app(None),
            &[(DEV_USER_HEADER, &user.to_string()), (DEV_ROLE_HEADER, "arbiter")],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, format!("arbiter:{user}"));

        let (status, body) = call(test_app(None), &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "system:");
    }

    #[test]
    fn token_parsing_rules() {
        let user = UserId::new();
        let id = parse_bearer_token(&format!("arbiter:{user}:k"), "k").unwrap();
        assert_eq!(id, CallerIdentity::arbiter(user));
        assert_eq!(parse_bearer_token("system::k", "k").unwrap(), CallerIdentity::system());
        assert!(parse_bearer_token("member::k", "k").unwrap_err().contains("must name a user"));
        assert!(parse_bearer_token("root::k", "k").unwrap_err().contains("unknown caller kind"));
        assert!(parse_bearer_token("member:not-a-uuid:k", "k").unwrap_err().contains("invalid user_id"));
        assert!(parse_bearer_token("k", "k").is_err());
    }

    #[test]
    fn constant_time_eq_rejects_prefix_and_empty() {
        assert!(constant_time_token_eq("secret", "secret"));
        assert!(!constant_time_token_eq("sec", "secret"));
        assert!(!constant_time_token_eq("", "secret"));
    }

    #[test]
    fn secret_token_debug_is_redacted() {
        let t = SecretToken::new("hunter2");
        assert_eq!(t.expose(), "hunter2");
        assert!(!format!("{t:?}").contains("hunter2"));
    }

    #[test]
    fn actor_resolution_per_job() {
        use gig_core::{Amount, Role};
        use gig_state::{BudgetBounds, NewJob};
        let client = UserId::new();
        let job = Job::create(
            client,
            NewJob {
                title: "t".into(),
                description: "d".into(),
                category: "c".into(),
                budget: BudgetBounds::new(Amount::from_major(1).unwrap(), Amount::from_major(2).unwrap()).unwrap(),
                currency: "USD".into(),
                bidding_closes_at: None,
            },
            chrono::Utc::now(),
        )
        .unwrap();
        assert_eq!(CallerIdentity::member(client).actor_on(&job).role, Role::Client);
        assert_eq!(CallerIdentity::member(UserId::new()).actor_on(&job).role, Role::Visitor);
        assert_eq!(CallerIdentity::arbiter(UserId::new()).actor_on(&job).role, Role::Arbiter);
        assert_eq!(CallerIdentity::system().actor_on(&job).role, Role::System);
    }
}
