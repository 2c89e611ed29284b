use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::AuthError;

lazy_static! {
    /// Provider claim name -> internal claim name. Claims not listed keep
    /// the name the provider gave them.
    static ref DEFAULT_CLAIM_MAP: HashMap<&'static str, &'static str> = [
        ("sub", "sub"),
        ("name", "name"),
        ("email", "email"),
        ("email_verified", "email_verified"),
        ("preferred_username", "username"),
        ("given_name", "given_name"),
        ("family_name", "family_name"),
        ("picture", "picture"),
    ]
    .into_iter()
    .collect();

    /// Protocol claims that say nothing about the user.
    static ref PROTOCOL_CLAIMS: HashSet<&'static str> = [
        "aud", "azp", "acr", "amr", "at_hash", "c_hash", "exp", "iat", "nbf",
        "nonce", "auth_time", "sid", "ver",
    ]
    .into_iter()
    .collect();
}

/// The authenticated user, resolved once per session and never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub subject: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub issuer: String,
    /// Every user claim under its internal name.
    pub raw: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ClaimMap {
    names: HashMap<String, String>,
    name_claim: String,
}

impl ClaimMap {
    /// Default table; `name_claim` is the provider claim shown as the user's name.
    pub fn new(name_claim: impl Into<String>) -> Self {
        Self {
            names: DEFAULT_CLAIM_MAP
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            name_claim: name_claim.into(),
        }
    }

    pub fn with_overrides<'a, I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = &'a (String, String)>,
    {
        for (from, to) in overrides {
            self.names.insert(from.clone(), to.clone());
        }
        self
    }

    pub fn internal_name<'a>(&'a self, provider_claim: &'a str) -> &'a str {
        self.names
            .get(provider_claim)
            .map(String::as_str)
            .unwrap_or(provider_claim)
    }

    /// Merges validated ID token claims with optional userinfo claims and
    /// applies the mapping table.
    ///
    /// ID token claims always win; userinfo only fills in what the ID token
    /// lacks. A userinfo `sub` that differs from the ID token's is rejected.
    pub fn resolve(
        &self,
        id_token: &Map<String, Value>,
        userinfo: Option<&Map<String, Value>>,
    ) -> Result<IdentityClaims, AuthError> {
        let subject = id_token
            .get("sub")
            .and_then(Value::as_str)
            .filter(|sub| !sub.is_empty())
            .ok_or_else(|| AuthError::InvalidToken("id token has no sub".into()))?
            .to_string();
        let issuer = id_token
            .get("iss")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut merged = id_token.clone();
        if let Some(userinfo) = userinfo {
            match userinfo.get("sub").and_then(Value::as_str) {
                Some(sub) if sub == subject => {}
                other => {
                    return Err(AuthError::InvalidToken(format!(
                        "userinfo sub {other:?} does not match id token"
                    )))
                }
            }
            for (claim, value) in userinfo {
                merged.entry(claim.clone()).or_insert_with(|| value.clone());
            }
        }

        let display_name = merged
            .get(&self.name_claim)
            .and_then(Value::as_str)
            .map(str::to_string);
        let email = merged.get("email").and_then(Value::as_str).map(str::to_string);

        let raw = merged
            .into_iter()
            .filter(|(claim, _)| claim != "iss" && !PROTOCOL_CLAIMS.contains(claim.as_str()))
            .map(|(claim, value)| (self.internal_name(&claim).to_string(), value))
            .collect();

        Ok(IdentityClaims {
            subject,
            name: display_name,
            email,
            issuer,
            raw,
        })
    }
}
