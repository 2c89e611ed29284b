//! Authenticated sessions. The whole session is sealed into the cookie, so
//! the server keeps nothing but a list of sessions revoked before expiry.

pub mod cookies;
pub mod seal;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc};
use tokio::sync::Mutex;
use url::Url;
use uuid::Uuid;

use crate::config::SessionSettings;
use crate::error::AuthError;
use crate::openid::validation::unverified_subject;
use crate::openid::{unix_now, IdTokenValidator, IdentityClaims, ProviderClient, TokenSet};
use seal::Sealer;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub claims: IdentityClaims,
    pub tokens: TokenSet,
    /// Unix seconds, like the other timestamps.
    pub created_at: i64,
    pub last_validated_at: i64,
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("subject", &self.claims.subject)
            .field("tokens", &self.tokens)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Opaque cookie value carrying a sealed [`Session`].
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session cookie is not valid")]
    Invalid,
    #[error("session expired")]
    Expired,
}

impl From<SessionError> for AuthError {
    fn from(_: SessionError) -> Self {
        AuthError::SessionInvalid
    }
}

/// How long the outcome of a refresh is handed to requests that still carry
/// the cookie it replaced.
const REFRESH_REUSE_SECS: i64 = 60;

/// One refresh grant for one presented cookie. Requests that carry the same
/// cookie wait on the mutex and reuse the outcome.
struct RefreshSlot {
    reuse_until: i64,
    outcome: Mutex<Option<(Session, SessionToken)>>,
}

pub struct SessionManager {
    settings: SessionSettings,
    sealer: Sealer,
    /// Session id -> cookie expiry, kept until the cookie would have expired anyway.
    revoked: DashMap<Uuid, i64>,
    /// Keyed by session id and the `issued_at` of the tokens being replaced.
    refreshes: DashMap<(Uuid, i64), Arc<RefreshSlot>>,
    client: ProviderClient,
    validator: Arc<IdTokenValidator>,
    post_logout_redirect_uri: Option<Url>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        client: ProviderClient,
        validator: Arc<IdTokenValidator>,
        post_logout_redirect_uri: Option<Url>,
    ) -> Self {
        let sealer = Sealer::new(&settings.key);
        Self {
            settings,
            sealer,
            revoked: DashMap::new(),
            refreshes: DashMap::new(),
            client,
            validator,
            post_logout_redirect_uri,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Creates a session for identity claims that were validated together
    /// with `tokens.id_token`.
    pub fn establish(
        &self,
        claims: IdentityClaims,
        tokens: TokenSet,
    ) -> Result<(Session, SessionToken), AuthError> {
        if unverified_subject(&tokens.id_token).as_deref() != Some(claims.subject.as_str()) {
            return Err(AuthError::InvalidToken(
                "id_token subject differs from identity".into(),
            ));
        }

        let now = unix_now();
        let lifetime = self.settings.lifetime.as_secs() as i64;
        let session = Session {
            session_id: Uuid::new_v4(),
            expires_at: (now + lifetime).min(tokens.expiry),
            claims,
            tokens,
            created_at: now,
            last_validated_at: now,
        };
        let token = self.seal(&session)?;
        Ok((session, token))
    }

    /// Opens a session cookie. Anything tampered, sealed with another key or
    /// revoked is `Invalid`.
    pub fn validate(&self, token: &SessionToken) -> Result<Session, SessionError> {
        let mut session = self.open(token)?;
        let now = unix_now();
        if session.is_expired_at(now) {
            return Err(SessionError::Expired);
        }
        session.last_validated_at = now;
        Ok(session)
    }

    /// Opens a session whose tokens lapsed but which is still inside its
    /// absolute lifetime and holds a refresh token. Such a session is only
    /// good for [`SessionManager::refresh`].
    pub fn renewable(&self, token: &SessionToken) -> Result<Session, SessionError> {
        let session = self.open(token)?;
        if session.tokens.refresh_token.is_none()
            || self.absolute_expiry(&session) <= unix_now()
        {
            return Err(SessionError::Expired);
        }
        Ok(session)
    }

    /// [`SessionManager::validate`], falling back to
    /// [`SessionManager::renewable`] when only the tokens have lapsed.
    pub fn resume(&self, token: &SessionToken) -> Result<Session, SessionError> {
        match self.validate(token) {
            Err(SessionError::Expired) => self.renewable(token),
            other => other,
        }
    }

    /// When the cookie should disappear from the browser. Sessions that can
    /// be refreshed outlive their tokens up to the absolute lifetime.
    pub fn cookie_expiry(&self, session: &Session) -> i64 {
        if session.tokens.refresh_token.is_some() {
            self.absolute_expiry(session)
        } else {
            session.expires_at
        }
    }

    fn absolute_expiry(&self, session: &Session) -> i64 {
        session.created_at + self.settings.lifetime.as_secs() as i64
    }

    fn open(&self, token: &SessionToken) -> Result<Session, SessionError> {
        let session: Session = self.sealer.open(token.as_str()).ok_or_else(|| {
            tracing::warn!(target: "security", "session cookie failed to open");
            SessionError::Invalid
        })?;
        if self.revoked.contains_key(&session.session_id) {
            tracing::warn!(
                target: "security",
                session_id = %session.session_id,
                "revoked session presented"
            );
            return Err(SessionError::Invalid);
        }
        Ok(session)
    }

    /// True when the tokens expire within the refresh window and a refresh
    /// token is at hand.
    pub fn needs_refresh(&self, session: &Session) -> bool {
        let window = self.settings.refresh_before.as_secs() as i64;
        session.tokens.refresh_token.is_some() && session.tokens.expiry - window <= unix_now()
    }

    /// Runs the refresh grant. Any failure revokes the session.
    ///
    /// Concurrent calls for the same cookie share one grant, so providers
    /// that rotate refresh tokens never see the old one twice.
    pub async fn refresh(&self, session: &Session) -> Result<(Session, SessionToken), AuthError> {
        let now = unix_now();
        self.refreshes.retain(|_, slot| slot.reuse_until > now);
        let slot = self
            .refreshes
            .entry((session.session_id, session.tokens.issued_at))
            .or_insert_with(|| {
                Arc::new(RefreshSlot {
                    reuse_until: now + REFRESH_REUSE_SECS,
                    outcome: Mutex::new(None),
                })
            })
            .clone();

        let mut outcome = slot.outcome.lock().await;
        if self.is_revoked(&session.session_id) {
            return Err(AuthError::RefreshFailed("session revoked".into()));
        }
        if let Some(refreshed) = outcome.as_ref() {
            return Ok(refreshed.clone());
        }

        match self.try_refresh(session).await {
            Ok(refreshed) => {
                tracing::debug!(session_id = %session.session_id, "session refreshed");
                *outcome = Some(refreshed.clone());
                Ok(refreshed)
            }
            Err(reason) => {
                tracing::warn!(
                    target: "security",
                    session_id = %session.session_id,
                    %reason,
                    "refresh failed, session revoked"
                );
                self.revoke(session);
                Err(AuthError::RefreshFailed(reason.to_string()))
            }
        }
    }

    async fn try_refresh(&self, session: &Session) -> Result<(Session, SessionToken), AuthError> {
        let refresh_token = session
            .tokens
            .refresh_token
            .as_deref()
            .ok_or_else(|| AuthError::RefreshFailed("no refresh token".into()))?;

        let metadata = self.validator.keys().get_metadata().await?;
        let response = self
            .client
            .refresh(&metadata.token_endpoint, refresh_token)
            .await?;

        let now = unix_now();
        let (id_token, id_token_exp) = match response.id_token.clone() {
            Some(id_token) => {
                let claims = self.validator.validate(&id_token, None).await?;
                if claims.get("sub").and_then(Value::as_str) != Some(session.claims.subject.as_str())
                {
                    return Err(AuthError::InvalidToken("refreshed subject differs".into()));
                }
                let exp = claims.get("exp").and_then(Value::as_i64).unwrap_or(now);
                (id_token, exp)
            }
            // No new ID token: assume the access token lives as long as the last one.
            None => {
                let previous = session.tokens.expiry - session.tokens.issued_at;
                (session.tokens.id_token.clone(), now + previous.max(0))
            }
        };

        let mut tokens = TokenSet::from_response(response, id_token, id_token_exp, now);
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = session.tokens.refresh_token.clone();
        }

        let lifetime = self.settings.lifetime.as_secs() as i64;
        let refreshed = Session {
            session_id: session.session_id,
            claims: session.claims.clone(),
            expires_at: (session.created_at + lifetime).min(tokens.expiry),
            tokens,
            created_at: session.created_at,
            last_validated_at: now,
        };
        let token = self.seal(&refreshed)?;
        Ok((refreshed, token))
    }

    /// Ends the session locally. Returns the provider's end-session URL when
    /// it advertises one.
    pub async fn terminate(&self, session: &Session) -> Option<Url> {
        self.revoke(session);
        tracing::info!(session_id = %session.session_id, "session terminated");

        let metadata = match self.validator.keys().get_metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("end session skipped: {}", e);
                return None;
            }
        };
        let mut url = Url::parse(metadata.end_session_endpoint.as_deref()?).ok()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("id_token_hint", &session.tokens.id_token)
                .append_pair("client_id", self.client.client_id());
            if let Some(uri) = &self.post_logout_redirect_uri {
                query.append_pair("post_logout_redirect_uri", uri.as_str());
            }
        }
        Some(url)
    }

    pub fn is_revoked(&self, session_id: &Uuid) -> bool {
        self.revoked.contains_key(session_id)
    }

    fn revoke(&self, session: &Session) {
        let now = unix_now();
        self.revoked.retain(|_, expires_at| *expires_at > now);
        self.revoked.insert(session.session_id, self.cookie_expiry(session));
    }

    fn seal(&self, session: &Session) -> Result<SessionToken, AuthError> {
        self.sealer.seal(session).map(SessionToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openid::cache::CacheOptions;
    use crate::openid::KeyCache;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::Algorithm;
    use std::{collections::BTreeMap, time::Duration};

    fn manager(lifetime: Duration) -> SessionManager {
        let keys = KeyCache::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9/.well-known/openid-configuration",
            "http://127.0.0.1:9",
            CacheOptions {
                ttl: Duration::from_secs(60),
                min_refresh_interval: Duration::ZERO,
            },
        );
        let validator = IdTokenValidator::new(
            Arc::new(keys),
            "client",
            vec![Algorithm::RS256],
            Duration::from_secs(300),
        );
        let mut settings = SessionSettings::new([7u8; 32]);
        settings.lifetime = lifetime;
        SessionManager::new(
            settings,
            ProviderClient::new(reqwest::Client::new(), "client", None),
            Arc::new(validator),
            None,
        )
    }

    fn identity(subject: &str) -> IdentityClaims {
        IdentityClaims {
            subject: subject.into(),
            name: Some("Ada".into()),
            email: None,
            issuer: "http://127.0.0.1:9".into(),
            raw: BTreeMap::new(),
        }
    }

    fn tokens(subject: &str, expiry: i64, refresh: Option<&str>) -> TokenSet {
        let body = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{subject}"}}"#));
        TokenSet {
            id_token: format!("e30.{body}.sig"),
            access_token: "at".into(),
            refresh_token: refresh.map(str::to_string),
            expiry,
            issued_at: unix_now(),
        }
    }

    #[test]
    fn established_session_validates_to_same_subject() {
        let sessions = manager(Duration::from_secs(3_600));
        let (session, token) = sessions
            .establish(identity("user-42"), tokens("user-42", unix_now() + 600, None))
            .unwrap();
        let opened = sessions.validate(&token).unwrap();
        assert_eq!(opened.claims.subject, "user-42");
        assert_eq!(opened.session_id, session.session_id);
        assert!(!token.as_str().contains("user-42"));
    }

    #[test]
    fn expiry_is_the_earlier_of_lifetime_and_tokens() {
        let sessions = manager(Duration::from_secs(3_600));
        let now = unix_now();
        let (session, _) = sessions
            .establish(identity("s"), tokens("s", now + 600, None))
            .unwrap();
        assert!(session.expires_at <= now + 600 + 1);

        let (session, _) = sessions
            .establish(identity("s"), tokens("s", now + 86_400, None))
            .unwrap();
        assert!(session.expires_at <= unix_now() + 3_600);
    }

    #[test]
    fn mismatched_subject_is_refused() {
        let sessions = manager(Duration::from_secs(3_600));
        let err = sessions
            .establish(identity("user-42"), tokens("someone-else", unix_now() + 600, None))
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[test]
    fn tampered_cookie_is_invalid() {
        let sessions = manager(Duration::from_secs(3_600));
        let (_, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() + 600, None))
            .unwrap();
        let mut raw = token.as_str().to_string();
        let last = raw.pop().unwrap();
        raw.push(if last == 'A' { 'B' } else { 'A' });
        assert_eq!(
            sessions.validate(&SessionToken::from(raw)),
            Err(SessionError::Invalid)
        );
    }

    #[test]
    fn cookie_from_another_key_is_invalid() {
        let (_, token) = manager(Duration::from_secs(60))
            .establish(identity("s"), tokens("s", unix_now() + 600, None))
            .unwrap();
        let mut other = manager(Duration::from_secs(60));
        other.sealer = Sealer::new(&[8u8; 32]);
        assert_eq!(other.validate(&token), Err(SessionError::Invalid));
    }

    #[test]
    fn past_expiry_is_expired() {
        let sessions = manager(Duration::from_secs(3_600));
        let (_, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() - 1, None))
            .unwrap();
        assert_eq!(sessions.validate(&token), Err(SessionError::Expired));
    }

    #[tokio::test]
    async fn terminated_session_no_longer_validates() {
        let sessions = manager(Duration::from_secs(3_600));
        let (session, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() + 600, None))
            .unwrap();
        // Provider unreachable here, so no end-session URL.
        assert_eq!(sessions.terminate(&session).await, None);
        assert!(sessions.is_revoked(&session.session_id));
        assert_eq!(sessions.validate(&token), Err(SessionError::Invalid));
    }

    #[test]
    fn refresh_needed_only_near_expiry_with_refresh_token() {
        let sessions = manager(Duration::from_secs(3_600));
        let now = unix_now();
        let (soon, _) = sessions
            .establish(identity("s"), tokens("s", now + 30, Some("rt")))
            .unwrap();
        assert!(sessions.needs_refresh(&soon));

        let (later, _) = sessions
            .establish(identity("s"), tokens("s", now + 600, Some("rt")))
            .unwrap();
        assert!(!sessions.needs_refresh(&later));

        let (no_rt, _) = sessions
            .establish(identity("s"), tokens("s", now + 30, None))
            .unwrap();
        assert!(!sessions.needs_refresh(&no_rt));
    }

    #[test]
    fn lapsed_session_with_refresh_token_is_renewable() {
        let sessions = manager(Duration::from_secs(3_600));
        let (session, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() - 1, Some("rt")))
            .unwrap();
        assert_eq!(sessions.validate(&token), Err(SessionError::Expired));
        let renewable = sessions.renewable(&token).unwrap();
        assert_eq!(renewable.session_id, session.session_id);
        assert_eq!(sessions.resume(&token).unwrap().session_id, session.session_id);
        assert_eq!(sessions.cookie_expiry(&session), session.created_at + 3_600);
    }

    #[test]
    fn lapsed_session_without_refresh_token_stays_expired() {
        let sessions = manager(Duration::from_secs(3_600));
        let (session, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() - 1, None))
            .unwrap();
        assert_eq!(sessions.renewable(&token), Err(SessionError::Expired));
        assert_eq!(sessions.resume(&token), Err(SessionError::Expired));
        assert_eq!(sessions.cookie_expiry(&session), session.expires_at);
    }

    #[test]
    fn renewal_ends_with_the_absolute_lifetime() {
        let sessions = manager(Duration::ZERO);
        let (_, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() + 600, Some("rt")))
            .unwrap();
        assert_eq!(sessions.renewable(&token), Err(SessionError::Expired));
    }

    #[tokio::test]
    async fn revoked_lapsed_session_is_not_renewable() {
        let sessions = manager(Duration::from_secs(3_600));
        let (session, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() - 1, Some("rt")))
            .unwrap();
        sessions.terminate(&session).await;
        assert_eq!(sessions.resume(&token), Err(SessionError::Invalid));
    }

    #[tokio::test]
    async fn failed_refresh_revokes() {
        let sessions = manager(Duration::from_secs(3_600));
        let (session, token) = sessions
            .establish(identity("s"), tokens("s", unix_now() + 30, Some("rt")))
            .unwrap();
        let err = sessions.refresh(&session).await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert!(err.requires_login());
        assert_eq!(sessions.validate(&token), Err(SessionError::Invalid));
    }
}
