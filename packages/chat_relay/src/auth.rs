//! Authentication: bearer login tokens (or the equivalent session cookie).
//!
//! With auth disabled, loopback callers run as the seeded local user, so the
//! rest of the server can always rely on an [`AuthUser`] being present.

use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::db::LOCAL_USER_ID;
use crate::error::ChatError;
use crate::models::User;
use crate::repository::ChatRepository;

/// Name of the cookie carrying the login token for browser clients.
pub const SESSION_COOKIE: &str = "relay_session";

// =============================================================================
// AuthUser
// =============================================================================

/// Authenticated user, populated by [`auth_middleware`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
}

impl AuthUser {
    /// The identity every request runs as when auth is disabled.
    pub fn local() -> Self {
        AuthUser {
            user_id: LOCAL_USER_ID.into(),
            username: "local".into(),
            display_name: "Local".into(),
        }
    }
}

impl From<User> for AuthUser {
    fn from(user: User) -> Self {
        AuthUser {
            user_id: user.id,
            username: user.username,
            display_name: user.display_name,
        }
    }
}

// =============================================================================
// Auth State (shared across middleware and handlers)
// =============================================================================

#[derive(Clone)]
pub struct AuthState {
    pub repository: Arc<ChatRepository>,
    pub auth_config: Arc<AuthConfig>,
}

// =============================================================================
// Auth Middleware
// =============================================================================

/// Resolve the caller and stash an [`AuthUser`] in the request extensions.
///
/// 1. Public routes (health, metrics, login) → pass through
/// 2. Auth disabled, loopback caller → `AuthUser::local()`
/// 3. Valid bearer token or session cookie → that user
/// 4. Everything else → 401
///
/// Requests without `ConnectInfo` (in-process callers) count as loopback.
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if is_public_route(&path) {
        return next.run(request).await;
    }

    if !auth_state.auth_config.enabled {
        let is_remote = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .is_some_and(|ci| !ci.0.ip().is_loopback());
        if is_remote {
            return ChatError::Unauthorized.into_response();
        }
        request.extensions_mut().insert(AuthUser::local());
        return next.run(request).await;
    }

    let Some(token) = extract_token(request.headers()) else {
        return ChatError::Unauthorized.into_response();
    };

    match auth_state.repository.lookup_token(&token).await {
        Ok(Some(user)) => {
            request.extensions_mut().insert(AuthUser::from(user));
            next.run(request).await
        }
        Ok(None) => ChatError::Unauthorized.into_response(),
        Err(e) => ChatError::Internal(e).into_response(),
    }
}

fn is_public_route(path: &str) -> bool {
    path == "/health" || path.starts_with("/health/") || path == "/metrics" || path == "/api/auth/login"
}

/// Login token from `Authorization: Bearer …`, falling back to the session cookie.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}

// =============================================================================
// Routes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: AuthUser,
}

pub fn auth_routes() -> Router<AuthState> {
    Router::new()
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/me", get(me_handler))
}

async fn login_handler(
    State(state): State<AuthState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ChatError> {
    let Some(user) = state
        .repository
        .verify_user_password(&req.username, &req.password)
        .await?
    else {
        warn!(username = %req.username, "Failed login attempt");
        return Err(ChatError::Unauthorized);
    };

    let ttl = state.auth_config.session_ttl_secs;
    let token = state.repository.issue_token(&user.id, ttl as i64).await?;
    info!(username = %user.username, "User logged in");

    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={ttl}");
    let body = LoginResponse {
        token,
        user: AuthUser::from(user),
    };
    Ok(([(header::SET_COOKIE, cookie)], Json(body)).into_response())
}

async fn logout_handler(State(state): State<AuthState>, headers: HeaderMap) -> Result<Response, ChatError> {
    if let Some(token) = extract_token(&headers) {
        state.repository.revoke_token(&token).await?;
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]).into_response())
}

async fn me_handler(user: AuthUser) -> Json<AuthUser> {
    Json(user)
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Extract AuthUser from request extensions (set by middleware).
/// Returns 401 if not present.
impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ChatError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(ChatError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers;
    use axum::http::HeaderValue;
    use tower::ServiceExt;

    fn app(state: &crate::AppState) -> Router {
        let auth_state = AuthState {
            repository: state.repository.clone(),
            auth_config: state.auth_config.clone(),
        };
        Router::new()
            .route("/api/private", get(|user: AuthUser| async move { user.username }))
            .route("/health", get(|| async { "ok" }))
            .merge(auth_routes())
            .layer(axum::middleware::from_fn_with_state(
                auth_state.clone(),
                auth_middleware,
            ))
            .with_state(auth_state)
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get_request(uri: &str) -> axum::http::request::Builder {
        Request::builder().method("GET").uri(uri)
    }

    #[test]
    fn public_routes() {
        assert!(is_public_route("/health"));
        assert!(is_public_route("/health/live"));
        assert!(is_public_route("/metrics"));
        assert!(is_public_route("/api/auth/login"));
        assert!(!is_public_route("/api/auth/logout"));
        assert!(!is_public_route("/api/chat"));
        assert!(!is_public_route("/api/sessions"));
    }

    #[test]
    fn token_from_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn token_from_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; relay_session=tok; other=1"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("tok"));
    }

    #[test]
    fn no_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        assert!(extract_token(&headers).is_none());
        headers.insert(header::COOKIE, HeaderValue::from_static("relay_session="));
        assert!(extract_token(&headers).is_none());
    }

    #[tokio::test]
    async fn disabled_auth_runs_as_local_user() {
        let (state, _tmp) = test_helpers::test_app_state().await;
        let response = app(&state)
            .oneshot(get_request("/api/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "local");
    }

    #[tokio::test]
    async fn disabled_auth_rejects_remote_callers() {
        let (state, _tmp) = test_helpers::test_app_state().await;
        let from = |addr: &str| {
            let mut request = get_request("/api/private").body(Body::empty()).unwrap();
            let addr: SocketAddr = addr.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(addr));
            request
        };

        let response = app(&state).oneshot(from("127.0.0.1:50000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app(&state).oneshot(from("192.168.1.20:50000")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn enabled_auth_requires_token() {
        let (state, _tmp, _user, _token) = test_helpers::test_app_state_with_auth().await;
        let response = app(&state)
            .oneshot(get_request("/api/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&state)
            .oneshot(
                get_request("/api/private")
                    .header(header::AUTHORIZATION, "Bearer not-a-real-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn enabled_auth_accepts_token_and_cookie() {
        let (state, _tmp, _user, token) = test_helpers::test_app_state_with_auth().await;

        let response = app(&state)
            .oneshot(
                get_request("/api/private")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "alice");

        let response = app(&state)
            .oneshot(
                get_request("/api/private")
                    .header(header::COOKIE, format!("{SESSION_COOKIE}={token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn public_routes_skip_auth() {
        let (state, _tmp, _user, _token) = test_helpers::test_app_state_with_auth().await;
        let response = app(&state)
            .oneshot(get_request("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn login_then_logout() {
        let (state, _tmp, _user, _token) = test_helpers::test_app_state_with_auth().await;

        let login = |password: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/auth/login")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"username": "alice", "password": password}).to_string(),
                ))
                .unwrap()
        };

        let response = app(&state).oneshot(login("wrong")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(&state).oneshot(login("wonderland")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(cookie.starts_with("relay_session="));
        assert!(cookie.contains("HttpOnly"));
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        let token = body["token"].as_str().unwrap().to_string();
        assert_eq!(body["user"]["username"], "alice");
        assert_eq!(body["user"]["displayName"], "Alice");

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/auth/logout")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // Revoked token no longer works
        let response = app(&state)
            .oneshot(
                get_request("/api/private")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn from_user() {
        let user = User::new("bob", "Bob", "hash".into());
        let id = user.id.clone();
        let auth = AuthUser::from(user);
        assert_eq!(auth.user_id, id);
        assert_eq!(auth.display_name, "Bob");
        assert_eq!(AuthUser::local().user_id, LOCAL_USER_ID);
    }
}
