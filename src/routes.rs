use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;

use crate::auth::{challenge, found, sanitize_return_to, store_session, AuthState};
use crate::config::GateSettings;
use crate::openid::CallbackParams;
use crate::session::{cookies, SessionToken};

/// Login, callback and logout, mounted at the configured paths.
pub fn routes(gate: &GateSettings) -> Router<AuthState> {
    Router::new()
        .route(&gate.login_path, get(login))
        .route(&gate.callback_path, get(callback))
        .route(&gate.logout_path, get(logout).post(logout))
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    return_to: Option<String>,
}

async fn login(State(state): State<AuthState>, Query(params): Query<LoginParams>) -> Response {
    let return_to = sanitize_return_to(params.return_to.as_deref());
    challenge(&state, &return_to).await
}

async fn callback(
    State(state): State<AuthState>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.engine.handle_callback(params).await {
        Ok(outcome) => {
            let jar = store_session(jar, state.sessions(), &outcome.session, &outcome.token);
            let target = sanitize_return_to(Some(outcome.return_to.as_str()));
            (jar, found(&target)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn logout(State(state): State<AuthState>, jar: CookieJar) -> Response {
    let sessions = state.sessions();
    let cookie_name = sessions.settings().cookie_name.as_str();

    let session = cookies::read(&jar, cookie_name)
        .map(SessionToken::from)
        .and_then(|token| sessions.resume(&token).ok());
    let end_session = match session {
        Some(session) => sessions.terminate(&session).await,
        None => None,
    };

    let jar = cookies::clear(jar, cookie_name);
    let location = end_session.map_or_else(|| "/".to_string(), String::from);
    (jar, found(&location)).into_response()
}
