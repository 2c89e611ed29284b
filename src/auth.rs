//! Access gate: every route except the anonymous ones needs a valid
//! session cookie. Without one the browser is sent to the provider.

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{header, request::Parts, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::GateSettings;
use crate::error::AuthError;
use crate::openid::{unix_now, FlowEngine, IdentityClaims, TokenSet};
use crate::session::{cookies, Session, SessionManager, SessionToken};

/// Shared state of the auth routes and the gate middleware.
#[derive(Clone)]
pub struct AuthState {
    pub engine: Arc<FlowEngine>,
    pub policy: Arc<RoutePolicy>,
    pub gate: Arc<GateSettings>,
}

impl AuthState {
    pub fn new(engine: Arc<FlowEngine>, gate: GateSettings) -> Self {
        Self {
            policy: Arc::new(RoutePolicy::new(&gate)),
            gate: Arc::new(gate),
            engine,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.engine.sessions()
    }
}

/// Which paths skip the session check.
#[derive(Debug)]
pub struct RoutePolicy {
    anonymous: Vec<String>,
    auth_paths: Vec<String>,
}

impl RoutePolicy {
    pub fn new(gate: &GateSettings) -> Self {
        Self {
            anonymous: gate.anonymous_routes.clone(),
            auth_paths: vec![
                gate.login_path.clone(),
                gate.callback_path.clone(),
                gate.logout_path.clone(),
            ],
        }
    }

    /// Anonymous routes match as prefixes on a segment boundary, so `/health`
    /// covers `/health/live` but not `/healthz`.
    pub fn allows_anonymous(&self, path: &str) -> bool {
        self.auth_paths.iter().any(|p| p == path)
            || self.anonymous.iter().any(|prefix| {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .map_or(false, |rest| prefix.ends_with('/') || rest.starts_with('/'))
            })
    }
}

/// The signed-in user, put into the request by [`gate`].
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub session_id: Uuid,
    pub claims: IdentityClaims,
    pub expires_at: i64,
    #[serde(skip)]
    tokens: TokenSet,
}

impl Identity {
    /// Tokens saved with the session, for calling APIs on the user's behalf.
    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }
}

impl From<Session> for Identity {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.session_id,
            claims: session.claims,
            expires_at: session.expires_at,
            tokens: session.tokens,
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(AuthError::SessionInvalid)
    }
}

pub async fn gate(
    State(state): State<AuthState>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let path = request.uri().path();
    if state.policy.allows_anonymous(path) {
        return next.run(request).await;
    }

    let return_to = request
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str())
        .to_string();
    let sessions = state.sessions();
    let cookie_name = sessions.settings().cookie_name.as_str();

    let Some(token) = cookies::read(&jar, cookie_name).map(SessionToken::from) else {
        return challenge(&state, &return_to).await;
    };
    // Lapsed tokens still pass when a refresh token can carry the session.
    let session = match sessions.resume(&token) {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!("{}: {}", e, return_to);
            let jar = cookies::clear(jar, cookie_name);
            return (jar, challenge(&state, &return_to).await).into_response();
        }
    };

    let lapsed = session.is_expired_at(unix_now());
    let (session, jar) = if lapsed || sessions.needs_refresh(&session) {
        match sessions.refresh(&session).await {
            Ok((session, token)) => {
                let jar = store_session(jar, sessions, &session, &token);
                (session, Some(jar))
            }
            Err(_) => {
                let jar = cookies::clear(jar, cookie_name);
                return (jar, challenge(&state, &return_to).await).into_response();
            }
        }
    } else {
        (session, None)
    };

    request.extensions_mut().insert(Identity::from(session));
    let response = next.run(request).await;
    match jar {
        Some(jar) => (jar, response).into_response(),
        None => response,
    }
}

/// Starts a login that comes back to `return_to`.
pub async fn challenge(state: &AuthState, return_to: &str) -> Response {
    match state.engine.begin_login(return_to).await {
        Ok(redirect) => found(redirect.url.as_str()),
        Err(e) => e.into_response(),
    }
}

/// Writes the sealed session. The cookie lives as long as the session can
/// still be used or refreshed.
pub fn store_session(
    jar: CookieJar,
    sessions: &SessionManager,
    session: &Session,
    token: &SessionToken,
) -> CookieJar {
    let settings = sessions.settings();
    let max_age = time::Duration::seconds((sessions.cookie_expiry(session) - unix_now()).max(0));
    cookies::write(
        jar,
        &settings.cookie_name,
        token.as_str(),
        max_age,
        settings.secure_cookie,
    )
}

/// `302 Found`. axum's `Redirect::to` answers 303.
pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

/// Only local absolute paths are accepted as a post-login destination.
pub fn sanitize_return_to(raw: Option<&str>) -> String {
    match raw {
        Some(path)
            if path.starts_with('/')
                && !path.starts_with("//")
                && !path.starts_with("/\\")
                && !path.chars().any(char::is_control) =>
        {
            path.to_string()
        }
        _ => "/".to_string(),
    }
}
