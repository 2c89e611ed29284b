use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::AuthError;

/// Token endpoint reply, as sent by the provider.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
}

/// Tokens kept in the session once the code exchange succeeded.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expiry: i64,
    pub issued_at: i64,
}

impl TokenSet {
    /// Builds the set from a token response. `id_token_exp` is the `exp` of
    /// the validated ID token, used when the response has no `expires_in`.
    pub fn from_response(
        response: TokenResponse,
        id_token: String,
        id_token_exp: i64,
        now: i64,
    ) -> Self {
        let expiry = response
            .expires_in
            .map(|secs| now + secs)
            .unwrap_or(id_token_exp);
        Self {
            id_token,
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expiry,
            issued_at: now,
        }
    }
}

impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("expiry", &self.expiry)
            .field("issued_at", &self.issued_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport failure or timeout.
    #[error("{operation}: {detail}")]
    Unreachable {
        operation: &'static str,
        detail: String,
    },
    /// The provider answered with an error status.
    #[error("{operation} rejected with {status}: {error}")]
    Rejected {
        operation: &'static str,
        status: u16,
        error: String,
    },
}

impl From<ClientError> for AuthError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Unreachable { .. } => AuthError::ProviderUnreachable(e.to_string()),
            ClientError::Rejected { .. } => AuthError::InvalidToken(e.to_string()),
        }
    }
}

/// Server-to-server calls made on behalf of the registered client.
#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
}

impl ProviderClient {
    pub fn new(
        http: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            client_id: client_id.into(),
            client_secret,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, ClientError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        self.token_request(token_endpoint, "token exchange", &params).await
    }

    pub async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse, ClientError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(token_endpoint, "refresh grant", &params).await
    }

    pub async fn userinfo(
        &self,
        userinfo_endpoint: &str,
        access_token: &str,
    ) -> Result<Map<String, Value>, ClientError> {
        let operation = "userinfo";
        let response = self
            .http
            .get(userinfo_endpoint)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let response = ensure_success(response, operation).await?;
        response
            .json::<Map<String, Value>>()
            .await
            .map_err(|e| transport_error(operation, e))
    }

    async fn token_request(
        &self,
        token_endpoint: &str,
        operation: &'static str,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, ClientError> {
        let mut form: Vec<(&str, &str)> = params.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let response = ensure_success(response, operation).await?;
        let tokens = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| transport_error(operation, e))?;
        tracing::trace!(?tokens, "{} succeeded", operation);
        Ok(tokens)
    }
}

fn transport_error(operation: &'static str, e: reqwest::Error) -> ClientError {
    ClientError::Unreachable {
        operation,
        detail: e.to_string(),
    }
}

/// Returns the response on 2xx, otherwise the OAuth `error` code (never the body).
async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error = response
        .json::<TokenErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| "unknown_error".into());
    Err(ClientError::Rejected {
        operation,
        status: status.as_u16(),
        error,
    })
}
