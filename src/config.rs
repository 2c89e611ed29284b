use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::Algorithm;
use rand::RngCore;
use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Provider and client registration. Mirrors the `OpenIDConnectSettings`
/// section the web application is configured with.
#[derive(Clone)]
pub struct OidcSettings {
    pub authority: Url,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Url,
    pub scopes: Vec<String>,
    pub use_userinfo: bool,
    pub post_logout_redirect_uri: Option<Url>,
    pub signing_algorithms: Vec<Algorithm>,
    pub name_claim: String,
    /// `provider claim -> internal claim` pairs layered over the default table.
    pub claim_map: Vec<(String, String)>,
    pub http_timeout: Duration,
    pub clock_skew: Duration,
    pub metadata_ttl: Duration,
    /// Lower bound between two refreshes forced by an unknown key id.
    pub min_refresh_interval: Duration,
    /// Periodic key refresh; `None` leaves refreshing to TTL and key misses.
    pub refresh_interval: Option<Duration>,
    pub login_ttl: Duration,
    pub max_pending_logins: usize,
}

impl OidcSettings {
    pub fn new(authority: Url, client_id: impl Into<String>, redirect_uri: Url) -> Self {
        Self {
            authority,
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri,
            scopes: vec!["openid".into(), "profile".into()],
            use_userinfo: true,
            post_logout_redirect_uri: None,
            signing_algorithms: vec![Algorithm::RS256],
            name_claim: "name".into(),
            claim_map: Vec::new(),
            http_timeout: Duration::from_secs(10),
            clock_skew: Duration::from_secs(300),
            metadata_ttl: Duration::from_secs(24 * 60 * 60),
            min_refresh_interval: Duration::from_secs(10),
            refresh_interval: None,
            login_ttl: Duration::from_secs(10 * 60),
            max_pending_logins: 10_000,
        }
    }

    /// `<authority>/.well-known/openid-configuration`
    pub fn discovery_url(&self) -> String {
        format!(
            "{}/.well-known/openid-configuration",
            self.authority.as_str().trim_end_matches('/')
        )
    }

    /// Issuer every discovery document and ID token must carry.
    pub fn issuer(&self) -> &str {
        self.authority.as_str().trim_end_matches('/')
    }
}

impl fmt::Debug for OidcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcSettings")
            .field("authority", &self.authority.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("scopes", &self.scopes)
            .field("use_userinfo", &self.use_userinfo)
            .field("signing_algorithms", &self.signing_algorithms)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct SessionSettings {
    pub key: [u8; 32],
    pub cookie_name: String,
    pub lifetime: Duration,
    pub secure_cookie: bool,
    /// Refresh tokens this long before they expire.
    pub refresh_before: Duration,
}

impl SessionSettings {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key,
            cookie_name: "oidc_session".into(),
            lifetime: Duration::from_secs(8 * 60 * 60),
            secure_cookie: true,
            refresh_before: Duration::from_secs(60),
        }
    }

    /// Fresh random key. Sessions sealed with it do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(key)
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("key", &"<redacted>")
            .field("cookie_name", &self.cookie_name)
            .field("lifetime", &self.lifetime)
            .field("secure_cookie", &self.secure_cookie)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GateSettings {
    /// Path prefixes reachable without a session.
    pub anonymous_routes: Vec<String>,
    pub login_path: String,
    pub callback_path: String,
    pub logout_path: String,
}

impl GateSettings {
    pub fn new(callback_path: impl Into<String>) -> Self {
        Self {
            anonymous_routes: vec!["/health".into()],
            login_path: "/login".into(),
            callback_path: callback_path.into(),
            logout_path: "/logout".into(),
        }
    }
}

/// Everything the process needs, loaded once at start-up and never mutated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub oidc: OidcSettings,
    pub session: SessionSettings,
    pub gate: GateSettings,
    pub listen_addr: SocketAddr,
}

impl Settings {
    /// Settings with defaults for everything but the client registration.
    /// The callback path is taken from `redirect_uri`.
    pub fn new(authority: Url, client_id: impl Into<String>, redirect_uri: Url) -> Self {
        let gate = GateSettings::new(redirect_uri.path());
        Self {
            oidc: OidcSettings::new(authority, client_id, redirect_uri),
            session: SessionSettings::ephemeral(),
            gate,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let authority = parse_url("OIDC_AUTHORITY", &required("OIDC_AUTHORITY")?)?;
        let client_id = required("OIDC_CLIENT_ID")?;
        let redirect_uri = parse_url("OIDC_REDIRECT_URI", &required("OIDC_REDIRECT_URI")?)?;

        let mut settings = Settings::new(authority, client_id, redirect_uri);

        let oidc = &mut settings.oidc;
        oidc.client_secret = var("OIDC_CLIENT_SECRET");
        if let Some(scopes) = var("OIDC_SCOPES") {
            oidc.scopes = split_list(&scopes);
        }
        oidc.use_userinfo = parsed("OIDC_USERINFO", oidc.use_userinfo)?;
        if let Some(uri) = var("OIDC_POST_LOGOUT_REDIRECT_URI") {
            oidc.post_logout_redirect_uri = Some(parse_url("OIDC_POST_LOGOUT_REDIRECT_URI", &uri)?);
        }
        if let Some(algs) = var("OIDC_SIGNING_ALGS") {
            oidc.signing_algorithms = split_list(&algs)
                .iter()
                .map(|alg| Algorithm::from_str(alg))
                .collect::<Result<_, _>>()
                .map_err(|e| ConfigError::Invalid {
                    name: "OIDC_SIGNING_ALGS",
                    reason: e.to_string(),
                })?;
        }
        if let Some(name_claim) = var("OIDC_NAME_CLAIM") {
            oidc.name_claim = name_claim;
        }
        if let Some(map) = var("OIDC_CLAIM_MAP") {
            oidc.claim_map = parse_claim_map(&map)?;
        }
        oidc.http_timeout = positive_seconds("OIDC_HTTP_TIMEOUT_SECS", oidc.http_timeout)?;
        oidc.clock_skew = seconds("OIDC_CLOCK_SKEW_SECS", oidc.clock_skew)?;
        oidc.metadata_ttl = seconds("OIDC_METADATA_TTL_SECS", oidc.metadata_ttl)?;
        oidc.login_ttl = positive_seconds("OIDC_LOGIN_TTL_SECS", oidc.login_ttl)?;
        if var("OIDC_REFRESH_INTERVAL_SECS").is_some() {
            oidc.refresh_interval = Some(positive_seconds(
                "OIDC_REFRESH_INTERVAL_SECS",
                Duration::ZERO,
            )?);
        }

        let session = &mut settings.session;
        match var("SESSION_KEY") {
            Some(key) => session.key = decode_key(&key)?,
            None => tracing::warn!("SESSION_KEY not set, sessions will not survive a restart"),
        }
        if let Some(name) = var("SESSION_COOKIE_NAME") {
            session.cookie_name = name;
        }
        session.lifetime = positive_seconds("SESSION_LIFETIME_SECS", session.lifetime)?;
        session.secure_cookie = parsed("SESSION_SECURE_COOKIE", session.secure_cookie)?;

        if let Some(routes) = var("ANONYMOUS_ROUTES") {
            settings.gate.anonymous_routes = split_list(&routes);
        }
        settings.listen_addr = parsed("LISTEN_ADDR", settings.listen_addr)?;

        Ok(settings)
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    var(name).ok_or(ConfigError::Missing(name))
}

fn parsed<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match var(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn seconds(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parsed(name, default.as_secs()).map(Duration::from_secs)
}

/// Like [`seconds`], for lifetimes and periods where zero makes no sense.
fn positive_seconds(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match seconds(name, default)? {
        Duration::ZERO => Err(ConfigError::Invalid {
            name,
            reason: "must be at least 1 second".into(),
        }),
        duration => Ok(duration),
    }
}

fn parse_url(name: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_claim_map(value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((from, to)) if !from.is_empty() && !to.is_empty() => {
                Ok((from.to_string(), to.to_string()))
            }
            _ => Err(ConfigError::Invalid {
                name: "OIDC_CLAIM_MAP",
                reason: format!("expected provider=internal, got {pair}"),
            }),
        })
        .collect()
}

fn decode_key(value: &str) -> Result<[u8; 32], ConfigError> {
    let value = value.trim();
    [STANDARD.decode(value).ok(), URL_SAFE_NO_PAD.decode(value).ok()]
        .into_iter()
        .flatten()
        .find_map(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
        .ok_or(ConfigError::Invalid {
            name: "SESSION_KEY",
            reason: "must be 32 bytes, base64 or base64url encoded".into(),
        })
}
