//! The authorization-code login, from the redirect to the provider up to an
//! established session.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use super::claims::ClaimMap;
use super::client::{ProviderClient, TokenSet};
use super::state::{ConsumeError, StateStore};
use super::unix_now;
use super::validation::IdTokenValidator;
use crate::config::OidcSettings;
use crate::error::AuthError;
use crate::session::{Session, SessionManager, SessionToken};

/// Progress of a single login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    Unauthenticated,
    RedirectIssued,
    CallbackReceived,
    TokenExchanged,
    ClaimsValidated,
    SessionEstablished,
    Failed,
}

impl LoginState {
    /// Legal transitions: one step forward, or to `Failed` from anything
    /// that is not terminal.
    pub fn can_advance_to(self, next: LoginState) -> bool {
        use LoginState::*;
        match (self, next) {
            (SessionEstablished, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Unauthenticated, RedirectIssued)
            | (RedirectIssued, CallbackReceived)
            | (CallbackReceived, TokenExchanged)
            | (TokenExchanged, ClaimsValidated)
            | (ClaimsValidated, SessionEstablished) => true,
            _ => false,
        }
    }
}

struct Attempt {
    state: LoginState,
}

impl Attempt {
    fn start() -> Self {
        Self {
            state: LoginState::Unauthenticated,
        }
    }

    /// The callback arrives on a fresh request; the redirect step happened
    /// in an earlier one.
    fn received() -> Self {
        Self {
            state: LoginState::CallbackReceived,
        }
    }

    fn advance(&mut self, next: LoginState) {
        debug_assert!(self.state.can_advance_to(next), "{:?} -> {:?}", self.state, next);
        tracing::trace!(from = ?self.state, to = ?next, "login attempt");
        self.state = next;
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        let stage = self.state;
        self.advance(LoginState::Failed);
        match &err {
            AuthError::InvalidToken(reason) | AuthError::InvalidState(reason) => {
                tracing::warn!(
                    target: "security",
                    ?stage,
                    kind = err.kind(),
                    %reason,
                    "login rejected"
                )
            }
            AuthError::ProviderDenied { error, description } => {
                tracing::info!(?stage, %error, ?description, "provider denied login")
            }
            other => tracing::error!(?stage, kind = other.kind(), error = %other, "login failed"),
        }
        err
    }
}

/// Query string the provider sends back to the callback.
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug)]
pub struct LoginRedirect {
    pub url: Url,
    pub state: String,
}

pub struct LoginOutcome {
    pub session: Session,
    pub token: SessionToken,
    pub return_to: String,
}

pub struct FlowEngine {
    settings: Arc<OidcSettings>,
    states: Arc<StateStore>,
    client: ProviderClient,
    validator: Arc<IdTokenValidator>,
    claims: ClaimMap,
    sessions: Arc<SessionManager>,
}

impl FlowEngine {
    pub fn new(
        settings: Arc<OidcSettings>,
        states: Arc<StateStore>,
        client: ProviderClient,
        validator: Arc<IdTokenValidator>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let claims =
            ClaimMap::new(settings.name_claim.clone()).with_overrides(&settings.claim_map);
        Self {
            settings,
            states,
            client,
            validator,
            claims,
            sessions,
        }
    }

    pub fn states(&self) -> &Arc<StateStore> {
        &self.states
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Opens a login attempt and returns the provider URL to redirect to.
    /// `return_to` must already be a local path.
    pub async fn begin_login(&self, return_to: &str) -> Result<LoginRedirect, AuthError> {
        let mut attempt = Attempt::start();
        match self.authorization_redirect(return_to).await {
            Ok(redirect) => {
                attempt.advance(LoginState::RedirectIssued);
                Ok(redirect)
            }
            Err(e) => Err(attempt.fail(e)),
        }
    }

    async fn authorization_redirect(&self, return_to: &str) -> Result<LoginRedirect, AuthError> {
        let metadata = self.validator.keys().get_metadata().await?;
        let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
            AuthError::ProviderUnreachable(format!("bad authorization_endpoint: {e}"))
        })?;

        let request = self.states.issue(return_to);
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &request.redirect_uri)
            .append_pair("scope", &request.requested_scopes.join(" "))
            .append_pair("state", &request.state)
            .append_pair("nonce", &request.nonce)
            .append_pair("code_challenge", &request.code_challenge)
            .append_pair("code_challenge_method", "S256");

        tracing::debug!(state = %request.state, return_to, "redirecting to identity provider");
        Ok(LoginRedirect {
            url,
            state: request.state,
        })
    }

    /// Completes a login from the provider's callback. On success the new
    /// session is already sealed; nothing is stored on failure.
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
    ) -> Result<LoginOutcome, AuthError> {
        let mut attempt = Attempt::received();
        let result = self.complete(&mut attempt, params).await;
        result.map_err(|e| attempt.fail(e))
    }

    async fn complete(
        &self,
        attempt: &mut Attempt,
        params: CallbackParams,
    ) -> Result<LoginOutcome, AuthError> {
        if let Some(error) = params.error {
            // Burn the state so the attempt cannot be resumed.
            if let Some(state) = params.state.as_deref() {
                let _ = self.states.consume(state);
            }
            return Err(AuthError::ProviderDenied {
                error,
                description: params.error_description,
            });
        }

        let state = params
            .state
            .ok_or_else(|| AuthError::InvalidState("state missing".into()))?;
        let code = params
            .code
            .ok_or_else(|| AuthError::InvalidState("code missing".into()))?;
        let request = self.states.consume(&state).map_err(|e| match e {
            ConsumeError::Expired => AuthError::InvalidState("login attempt expired".into()),
            ConsumeError::NotFound => AuthError::InvalidState("unknown or replayed state".into()),
        })?;

        let metadata = self.validator.keys().get_metadata().await?;
        let response = self
            .client
            .exchange_code(
                &metadata.token_endpoint,
                &code,
                &request.code_verifier,
                &request.redirect_uri,
            )
            .await?;
        attempt.advance(LoginState::TokenExchanged);

        let id_token = response
            .id_token
            .clone()
            .ok_or_else(|| AuthError::InvalidToken("token response has no id_token".into()))?;
        let id_claims = self.validator.validate(&id_token, Some(&request.nonce)).await?;

        let userinfo = match (&metadata.userinfo_endpoint, self.settings.use_userinfo) {
            (Some(endpoint), true) => {
                Some(self.client.userinfo(endpoint, &response.access_token).await?)
            }
            _ => None,
        };
        let identity = self.claims.resolve(&id_claims, userinfo.as_ref())?;
        attempt.advance(LoginState::ClaimsValidated);

        let now = unix_now();
        let id_token_exp = id_claims.get("exp").and_then(Value::as_i64).unwrap_or(now);
        let tokens = TokenSet::from_response(response, id_token, id_token_exp, now);
        let (session, token) = self.sessions.establish(identity, tokens)?;
        attempt.advance(LoginState::SessionEstablished);

        tracing::info!(
            session_id = %session.session_id,
            subject = %session.claims.subject,
            "login completed"
        );
        Ok(LoginOutcome {
            session,
            token,
            return_to: request.return_to,
        })
    }
}
