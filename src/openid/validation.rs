use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};

use super::cache::KeyCache;
use super::unix_now;
use crate::error::AuthError;

/// Checks ID tokens against the provider's published keys and the client
/// registration: signature, `iss`, `aud`, `azp`, `exp`, `iat` and `nonce`.
pub struct IdTokenValidator {
    keys: Arc<KeyCache>,
    client_id: String,
    algorithms: Vec<Algorithm>,
    clock_skew: Duration,
}

impl IdTokenValidator {
    pub fn new(
        keys: Arc<KeyCache>,
        client_id: impl Into<String>,
        algorithms: Vec<Algorithm>,
        clock_skew: Duration,
    ) -> Self {
        Self {
            keys,
            client_id: client_id.into(),
            algorithms,
            clock_skew,
        }
    }

    pub fn keys(&self) -> &Arc<KeyCache> {
        &self.keys
    }

    /// Returns the token's claims when every check passes. `expected_nonce`
    /// is `None` only for ID tokens returned by a refresh grant.
    pub async fn validate(
        &self,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<Map<String, Value>, AuthError> {
        let header = decode_header(id_token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed header: {e}")))?;
        if !self.algorithms.contains(&header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "algorithm {:?} not accepted",
                header.alg
            )));
        }

        let metadata = self.keys.get_metadata().await?;
        let key = self.keys.get_signing_key(header.kid.as_deref()).await?;
        if !key.accepts(header.alg) {
            return Err(AuthError::InvalidToken(format!(
                "key {:?} cannot verify {:?}",
                key.kid, header.alg
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[metadata.issuer.as_str()]);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.clock_skew.as_secs();

        let claims = decode::<Map<String, Value>>(id_token, &key.key, &validation)
            .map_err(|e| AuthError::InvalidToken(format!("{:?}", e.kind())))?
            .claims;

        self.check_claims(&claims, expected_nonce)?;
        Ok(claims)
    }

    fn check_claims(
        &self,
        claims: &Map<String, Value>,
        expected_nonce: Option<&str>,
    ) -> Result<(), AuthError> {
        let skew = self.clock_skew.as_secs() as i64;
        if let Some(iat) = claims.get("iat").and_then(Value::as_i64) {
            if iat > unix_now() + skew {
                return Err(AuthError::InvalidToken("issued in the future".into()));
            }
        }

        // Several audiences: the authorized party has to be this client.
        if let Some(Value::Array(audiences)) = claims.get("aud") {
            if audiences.len() > 1
                && claims.get("azp").and_then(Value::as_str) != Some(self.client_id.as_str())
            {
                return Err(AuthError::InvalidToken("azp does not name this client".into()));
            }
        }

        if claims
            .get("sub")
            .and_then(Value::as_str)
            .map_or(true, str::is_empty)
        {
            return Err(AuthError::InvalidToken("sub claim missing".into()));
        }

        if let Some(expected) = expected_nonce {
            if claims.get("nonce").and_then(Value::as_str) != Some(expected) {
                return Err(AuthError::InvalidToken("nonce mismatch".into()));
            }
        }
        Ok(())
    }
}

/// Reads `sub` from an ID token without checking it. Only for comparing a
/// token that was validated earlier against the identity stored with it.
pub(crate) fn unverified_subject(id_token: &str) -> Option<String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Map<String, Value> = serde_json::from_slice(&bytes).ok()?;
    claims.get("sub")?.as_str().map(str::to_string)
}
