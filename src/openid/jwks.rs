use jsonwebtoken::{jwk, jwk::AlgorithmParameters, Algorithm, DecodingKey};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, str::FromStr, sync::Arc};

use super::cache::KeyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFamily {
    Rsa,
    Ec,
}

impl KeyFamily {
    pub fn supports(self, alg: Algorithm) -> bool {
        use Algorithm::*;
        match self {
            KeyFamily::Rsa => matches!(alg, RS256 | RS384 | RS512 | PS256 | PS384 | PS512),
            KeyFamily::Ec => matches!(alg, ES256 | ES384),
        }
    }
}

/// One verification key from the provider's JWKS.
pub struct SigningKey {
    pub kid: Option<String>,
    /// `alg` pinned by the JWK, if any.
    pub algorithm: Option<Algorithm>,
    pub family: KeyFamily,
    pub key: DecodingKey,
}

impl SigningKey {
    pub fn accepts(&self, alg: Algorithm) -> bool {
        self.family.supports(alg) && self.algorithm.map_or(true, |pinned| pinned == alg)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("family", &self.family)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct KeySet {
    keyed: HashMap<String, Arc<SigningKey>>,
    unkeyed: Vec<Arc<SigningKey>>,
}

impl KeySet {
    /// Looks a key up by id. A token without `kid` is only matched when the
    /// set holds exactly one key.
    pub fn find(&self, kid: Option<&str>) -> Option<Arc<SigningKey>> {
        match kid {
            Some(kid) => self.keyed.get(kid).cloned(),
            None if self.len() == 1 => self
                .keyed
                .values()
                .chain(self.unkeyed.iter())
                .next()
                .cloned(),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.keyed.len() + self.unkeyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Deserialize)]
struct Jwks {
    keys: Vec<Value>,
}

pub async fn decoding_keys(client: &reqwest::Client, jwks_uri: &str) -> Result<KeySet, KeyError> {
    let jwks = client
        .get(jwks_uri)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| KeyError::Unreachable(format!("{jwks_uri}: {e}")))?
        .json::<Jwks>()
        .await
        .map_err(|e| KeyError::Unreachable(format!("{jwks_uri}: {e}")))?;
    let keys = jwks_to_decoding_keys(&jwks.keys);
    if keys.is_empty() {
        return Err(KeyError::Unreachable(format!(
            "{jwks_uri}: no usable signing keys"
        )));
    }
    Ok(keys)
}

/// Converts raw JWKs into verification keys. Encryption keys, symmetric
/// keys and entries this crate cannot parse are skipped rather than failing
/// the whole set.
pub fn jwks_to_decoding_keys(jwks: &[Value]) -> KeySet {
    let mut set = KeySet::default();
    for raw in jwks {
        if raw.get("use").and_then(Value::as_str) == Some("enc") {
            continue;
        }
        let jwk: jwk::Jwk = match serde_json::from_value(raw.clone()) {
            Ok(jwk) => jwk,
            Err(e) => {
                tracing::debug!("skipping unparsable jwk: {}", e);
                continue;
            }
        };
        let (family, decoding_key) = match jwk.algorithm {
            AlgorithmParameters::RSA(ref rsa) => (
                KeyFamily::Rsa,
                DecodingKey::from_rsa_components(&rsa.n, &rsa.e),
            ),
            AlgorithmParameters::EllipticCurve(ref ec) => (
                KeyFamily::Ec,
                DecodingKey::from_ec_components(&ec.x, &ec.y),
            ),
            _ => continue,
        };
        let Ok(key) = decoding_key else {
            continue;
        };
        let algorithm = raw
            .get("alg")
            .and_then(Value::as_str)
            .and_then(|alg| Algorithm::from_str(alg).ok());
        let signing_key = Arc::new(SigningKey {
            kid: jwk.common.key_id.clone(),
            algorithm,
            family,
            key,
        });
        match jwk.common.key_id {
            Some(kid) => {
                set.keyed.insert(kid, signing_key);
            }
            None => set.unkeyed.push(signing_key),
        }
    }
    set
}
