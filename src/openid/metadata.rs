use serde::Deserialize;
use std::sync::Arc;

use super::cache::KeyError;
use super::jwks::KeySet;

/// Discovery document fields the relying party uses, plus the signing keys
/// published at `jwks_uri`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(skip)]
    pub signing_keys: Arc<KeySet>,
}

impl ProviderMetadata {
    fn check(&self, expected_issuer: &str) -> Result<(), KeyError> {
        let mandatory = [
            &self.issuer,
            &self.authorization_endpoint,
            &self.token_endpoint,
            &self.jwks_uri,
        ];
        if mandatory.iter().any(|field| field.trim().is_empty()) {
            return Err(KeyError::Unreachable(
                "discovery document is missing mandatory fields".into(),
            ));
        }
        if self.issuer.trim_end_matches('/') != expected_issuer.trim_end_matches('/') {
            return Err(KeyError::Unreachable(format!(
                "discovery issuer {} does not match authority {}",
                self.issuer, expected_issuer
            )));
        }
        Ok(())
    }
}

/// Fetches the discovery document and the JWKS it points at.
pub async fn fetch_metadata(
    client: &reqwest::Client,
    discovery_url: &str,
    expected_issuer: &str,
) -> Result<ProviderMetadata, KeyError> {
    let mut metadata = client
        .get(discovery_url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| KeyError::Unreachable(format!("{discovery_url}: {e}")))?
        .json::<ProviderMetadata>()
        .await
        .map_err(|e| KeyError::Unreachable(format!("{discovery_url}: {e}")))?;
    metadata.check(expected_issuer)?;

    let keys = super::jwks::decoding_keys(client, &metadata.jwks_uri).await?;
    metadata.signing_keys = Arc::new(keys);
    Ok(metadata)
}
