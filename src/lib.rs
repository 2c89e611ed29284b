use axum::{middleware::from_fn_with_state, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod error;
pub mod openid;
pub mod routes;
pub mod session;

pub use auth::{AuthState, Identity};
pub use config::Settings;
pub use error::AuthError;

use openid::cache::CacheOptions;
use openid::{FlowEngine, IdTokenValidator, KeyCache, ProviderClient, StateStore};
use session::SessionManager;

/// Builds the gated application. Fails when the provider's discovery
/// document or keys cannot be loaded.
pub async fn app(settings: Settings) -> Result<Router, AuthError> {
    let Settings {
        oidc, session, gate, ..
    } = settings;
    let oidc = Arc::new(oidc);

    let http = reqwest::Client::builder()
        .timeout(oidc.http_timeout)
        .build()
        .map_err(|e| AuthError::Internal(e.to_string()))?;

    let keys = Arc::new(KeyCache::new(
        http.clone(),
        oidc.discovery_url(),
        oidc.issuer(),
        CacheOptions {
            ttl: oidc.metadata_ttl,
            min_refresh_interval: oidc.min_refresh_interval,
        },
    ));
    keys.init().await?;
    if let Some(interval) = oidc.refresh_interval {
        keys.clone().spawn_refresh(interval);
    }

    let validator = Arc::new(IdTokenValidator::new(
        keys,
        oidc.client_id.clone(),
        oidc.signing_algorithms.clone(),
        oidc.clock_skew,
    ));
    let client = ProviderClient::new(http, oidc.client_id.clone(), oidc.client_secret.clone());
    let states = Arc::new(StateStore::new(
        oidc.login_ttl,
        oidc.max_pending_logins,
        oidc.redirect_uri.as_str(),
        &oidc.scopes,
    ));
    states.clone().spawn_sweeper(oidc.login_ttl);

    let sessions = Arc::new(SessionManager::new(
        session,
        client.clone(),
        validator.clone(),
        oidc.post_logout_redirect_uri.clone(),
    ));
    let engine = Arc::new(FlowEngine::new(oidc, states, client, validator, sessions));
    let state = AuthState::new(engine, gate);

    Ok(Router::new()
        .route("/", get(protected))
        .route("/health", get(health))
        .merge(routes::routes(&state.gate))
        .layer(from_fn_with_state(state.clone(), auth::gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn health() -> &'static str {
    "OK"
}

async fn protected(identity: Identity) -> Json<Identity> {
    Json(identity)
}
