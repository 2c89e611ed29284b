//! OpenID Connect relying-party core: provider metadata and signing keys,
//! pending logins, the provider HTTP client, ID token validation, claim
//! mapping and the login flow that ties them together.

pub mod cache;
pub mod claims;
pub mod client;
pub mod flow;
pub mod jwks;
pub mod metadata;
pub mod state;
pub mod validation;

pub use cache::{KeyCache, KeyError};
pub use claims::{ClaimMap, IdentityClaims};
pub use client::{ClientError, ProviderClient, TokenResponse, TokenSet};
pub use flow::{CallbackParams, FlowEngine, LoginOutcome, LoginRedirect, LoginState};
pub use metadata::ProviderMetadata;
pub use state::{AuthorizationRequest, ConsumeError, StateStore};
pub use validation::IdTokenValidator;

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
