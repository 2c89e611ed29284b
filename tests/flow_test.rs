use jsonwebtoken::Algorithm;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use oidc_session::openid::cache::CacheOptions;
use oidc_session::openid::{IdTokenValidator, KeyCache, KeyError};
use oidc_session::{AuthError, Settings};

mod common;
use common::*;

fn key_cache(idp: &Idp, ttl: Duration) -> Arc<KeyCache> {
    throttled_key_cache(idp, ttl, Duration::ZERO)
}

fn throttled_key_cache(
    idp: &Idp,
    ttl: Duration,
    min_refresh_interval: Duration,
) -> Arc<KeyCache> {
    Arc::new(KeyCache::new(
        reqwest::Client::new(),
        idp.discovery_url(),
        idp.issuer(),
        CacheOptions {
            ttl,
            min_refresh_interval,
        },
    ))
}

/// How many times the provider served its JWKS.
async fn jwks_fetches(idp: &Idp) -> usize {
    idp.server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/jwks")
        .count()
}

fn validator(keys: Arc<KeyCache>) -> IdTokenValidator {
    IdTokenValidator::new(
        keys,
        CLIENT_ID,
        vec![Algorithm::RS256],
        Duration::from_secs(60),
    )
}

#[tokio::test]
async fn valid_id_token_is_accepted() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::from_secs(3600));
    keys.init().await.unwrap();

    let token = sign(KID, PRIVATE_PEM, &idp.id_claims("n-1"));
    let claims = validator(keys).validate(&token, Some("n-1")).await.unwrap();
    assert_eq!(claims["sub"], SUBJECT);
}

#[tokio::test]
async fn rotated_key_is_picked_up_on_unknown_kid() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::from_secs(3600));
    keys.init().await.unwrap();

    idp.server.reset().await;
    idp.publish(&[ROTATED_KID]).await;

    let token = sign(ROTATED_KID, ROTATED_PEM, &idp.id_claims("n-1"));
    let claims = validator(keys.clone())
        .validate(&token, Some("n-1"))
        .await
        .unwrap();
    assert_eq!(claims["sub"], SUBJECT);

    // The old key is gone with the refresh.
    let stale = sign(KID, PRIVATE_PEM, &idp.id_claims("n-1"));
    let err = validator(keys).validate(&stale, Some("n-1")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)));
}

#[tokio::test]
async fn cached_keys_survive_provider_outage() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::ZERO);
    keys.init().await.unwrap();

    idp.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&idp.server)
        .await;

    let metadata = keys.get_metadata().await.unwrap();
    assert_eq!(metadata.issuer, idp.issuer());
    let token = sign(KID, PRIVATE_PEM, &idp.id_claims("n-1"));
    assert!(validator(keys).validate(&token, Some("n-1")).await.is_ok());
}

#[tokio::test]
async fn unknown_kid_refresh_is_throttled() {
    let idp = Idp::start().await;
    let keys = throttled_key_cache(&idp, Duration::from_secs(3600), Duration::from_secs(60));
    keys.init().await.unwrap();
    assert_eq!(jwks_fetches(&idp).await, 1);

    for _ in 0..2 {
        let err = keys.get_signing_key(Some("never-published")).await.unwrap_err();
        assert!(matches!(err, KeyError::NotFound { .. }));
    }
    assert_eq!(jwks_fetches(&idp).await, 1);
}

#[tokio::test]
async fn concurrent_unknown_kids_share_one_fetch() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::from_secs(3600));
    keys.init().await.unwrap();

    let (first, second) = tokio::join!(
        keys.get_signing_key(Some("never-published")),
        keys.get_signing_key(Some("never-published")),
    );
    assert!(matches!(first, Err(KeyError::NotFound { .. })));
    assert!(matches!(second, Err(KeyError::NotFound { .. })));
    assert_eq!(jwks_fetches(&idp).await, 2);
}

#[tokio::test]
async fn failed_refresh_backs_off() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::ZERO);
    keys.init().await.unwrap();

    idp.server.reset().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&idp.server)
        .await;

    // The second call lands inside the backoff window and is served from cache.
    for _ in 0..2 {
        let metadata = keys.get_metadata().await.unwrap();
        assert_eq!(metadata.issuer, idp.issuer());
    }
}

#[tokio::test]
async fn periodic_refresh_picks_up_rotation() {
    let idp = Idp::start().await;
    let keys = throttled_key_cache(&idp, Duration::from_secs(3600), Duration::from_secs(3600));
    keys.init().await.unwrap();

    idp.server.reset().await;
    idp.publish(&[ROTATED_KID]).await;

    // Throttled, so an unknown kid alone does not reach the provider.
    let err = keys.get_signing_key(Some(ROTATED_KID)).await.unwrap_err();
    assert!(matches!(err, KeyError::NotFound { .. }));

    let task = keys.clone().spawn_refresh(Duration::from_millis(50));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let key = keys.get_signing_key(Some(ROTATED_KID)).await.unwrap();
    assert_eq!(key.kid.as_deref(), Some(ROTATED_KID));
    task.abort();
}

#[tokio::test]
async fn cold_start_without_provider_fails() {
    let settings = Settings::new(
        Url::parse("http://127.0.0.1:9").unwrap(),
        CLIENT_ID,
        Url::parse(REDIRECT_URI).unwrap(),
    );
    let err = oidc_session::app(settings).await.unwrap_err();
    assert!(matches!(err, AuthError::ProviderUnreachable(_)));
}

#[tokio::test]
async fn discovery_for_another_issuer_is_refused() {
    let idp = Idp::start().await;
    let keys = Arc::new(KeyCache::new(
        reqwest::Client::new(),
        idp.discovery_url(),
        "https://someone-else.example",
        CacheOptions {
            ttl: Duration::from_secs(60),
            min_refresh_interval: Duration::ZERO,
        },
    ));
    assert!(matches!(keys.init().await, Err(KeyError::Unreachable(_))));
}

#[tokio::test]
async fn wrong_audience_is_rejected() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::from_secs(3600));
    keys.init().await.unwrap();

    let mut claims = idp.id_claims("n-1");
    claims["aud"] = json!("another-client");
    let token = sign(KID, PRIVATE_PEM, &claims);
    let err = validator(keys).validate(&token, Some("n-1")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)));
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::from_secs(3600));
    keys.init().await.unwrap();

    let mut claims = idp.id_claims("n-1");
    claims["iat"] = json!(now() - 7200);
    claims["exp"] = json!(now() - 3600);
    let token = sign(KID, PRIVATE_PEM, &claims);
    let err = validator(keys).validate(&token, Some("n-1")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)));
}

#[tokio::test]
async fn wrong_issuer_is_rejected() {
    let idp = Idp::start().await;
    let keys = key_cache(&idp, Duration::from_secs(3600));
    keys.init().await.unwrap();

    let mut claims = idp.id_claims("n-1");
    claims["iss"] = json!("https://someone-else.example");
    let token = sign(KID, PRIVATE_PEM, &claims);
    let err = validator(keys).validate(&token, Some("n-1")).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidToken(_)));
}
