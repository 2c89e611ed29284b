#![allow(dead_code)]

use axum::{body::Body, http, http::Request, response::Response};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::{collections::HashMap, time::Duration};
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oidc_session::Settings;

pub const CLIENT_ID: &str = "web-client";
pub const REDIRECT_URI: &str = "http://app.test/signin-oidc";
pub const SUBJECT: &str = "user-42";

pub const KID: &str = "key-1";
pub const PRIVATE_PEM: &[u8] = include_bytes!("../fixtures/rsa_private.pem");
const MODULUS: &str = "7tqemZQ53o6jsIVmHWsmz9m8h9AA5Al8lQ7tPx00kNzrsxsbzHQfHSqHz92cf8MnNkKonESmp-E6v-RF_ex2-uM_fcw5cH0JK8LsV8bWEQLV3o0bPVRJ3VmjAB4FGiGJHAzMibKv3gjrFma9GKXlQj0kzIMQoifvYPigpJD5ve3DAm1zC5biWEgBjzX68G8up5R96ARxhv7QvEd4CDWu1RsfPGZF4ZT0zdJSPb7g_XaIbLw8LmO1kBaYLyw2_hyOLuh9SCrsxSrMUScHW_zm3CjkDICaeHO3IMKig-3_EK1_162FYnJeHURHDAbx4i2td9xvac0OalscT5x_Q2WtZQ";

pub const ROTATED_KID: &str = "key-2";
pub const ROTATED_PEM: &[u8] = include_bytes!("../fixtures/rsa_rotated.pem");
const ROTATED_MODULUS: &str = "4Z8hZkUz2MXLr96p_6yimhKL92PSTqP0jbiPmTwWV5r8uKdIoEgyM8hEbXQo7O6cQVipLi0HW2BsSDX0CSx_JLruFmRygc01rEpPJ2F0MyuS3R2iOURhTD66hjI60nICaLpvIvlL1yBE8Ba174-XSEq18paS56EtBvFXVRX42YLYepNI78KrwEscJNC4I7jMgI9rxERnQnRfr4SkOeTiH5sKJIQYP7-C2GqCviDUANHOxNLiJZWl0Hrv06HS7ZXRyhFG2EENASvIVaeU5PzVWRH7Hoa2JJjpTQfn_iAY8SRQRJA_7hyTDW_mxXewfOs1_H_960Uj38SnfCVwnjWfPw";

pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

pub fn rsa_jwk(kid: &str) -> Value {
    let n = if kid == ROTATED_KID {
        ROTATED_MODULUS
    } else {
        MODULUS
    };
    json!({"kty": "RSA", "use": "sig", "alg": "RS256", "kid": kid, "n": n, "e": "AQAB"})
}

pub fn sign(kid: &str, pem: &[u8], claims: &Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(&header, claims, &EncodingKey::from_rsa_pem(pem).unwrap()).unwrap()
}

/// Identity provider double serving discovery, keys, token and userinfo.
pub struct Idp {
    pub server: MockServer,
}

impl Idp {
    pub async fn start() -> Self {
        let idp = Self {
            server: MockServer::start().await,
        };
        idp.publish(&[KID]).await;
        idp
    }

    pub fn issuer(&self) -> String {
        self.server.uri()
    }

    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.issuer())
    }

    /// Mounts discovery and a JWKS holding `kids`.
    pub async fn publish(&self, kids: &[&str]) {
        let issuer = self.issuer();
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "issuer": issuer,
                "authorization_endpoint": format!("{issuer}/authorize"),
                "token_endpoint": format!("{issuer}/token"),
                "userinfo_endpoint": format!("{issuer}/userinfo"),
                "jwks_uri": format!("{issuer}/jwks"),
                "end_session_endpoint": format!("{issuer}/logout"),
                "response_types_supported": ["code"],
                "id_token_signing_alg_values_supported": ["RS256"],
            })))
            .mount(&self.server)
            .await;

        let keys: Vec<Value> = kids.iter().map(|kid| rsa_jwk(kid)).collect();
        Mock::given(method("GET"))
            .and(path("/jwks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "keys": keys })))
            .mount(&self.server)
            .await;

        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sub": SUBJECT,
                "email": "ada@example.com",
                "name": "Someone Else",
            })))
            .mount(&self.server)
            .await;
    }

    pub fn settings(&self) -> Settings {
        let mut settings = Settings::new(
            Url::parse(&self.issuer()).unwrap(),
            CLIENT_ID,
            Url::parse(REDIRECT_URI).unwrap(),
        );
        settings.oidc.client_secret = Some("s3cret".into());
        settings.oidc.min_refresh_interval = Duration::ZERO;
        settings
    }

    pub fn id_claims(&self, nonce: &str) -> Value {
        json!({
            "iss": self.issuer(),
            "sub": SUBJECT,
            "aud": CLIENT_ID,
            "exp": now() + 600,
            "iat": now(),
            "nonce": nonce,
            "name": "Ada Lovelace",
        })
    }

    /// Answers the code exchange for `code` with the given ID token.
    pub async fn mount_code_exchange(&self, code: &str, id_token: &str, expires_in: i64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains(format!("code={code}")))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "token_type": "Bearer",
                "expires_in": expires_in,
                "refresh_token": "refresh-1",
                "id_token": id_token,
            })))
            .expect(1)
            .mount(&self.server)
            .await;
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub fn get_with_cookie(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .header(http::header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap()
}

pub fn location(response: &Response) -> String {
    response.headers()[http::header::LOCATION]
        .to_str()
        .unwrap()
        .to_string()
}

/// Query parameters of the provider redirect a login produced.
pub fn login_params(response: &Response) -> HashMap<String, String> {
    Url::parse(&location(response))
        .unwrap()
        .query_pairs()
        .into_owned()
        .collect()
}

/// `Cookie` header value a browser would send back after `response`.
pub fn cookie_header(response: &Response) -> String {
    response
        .headers()
        .get_all(http::header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .filter(|pair| !pair.ends_with('='))
        .collect::<Vec<_>>()
        .join("; ")
}

pub async fn body_json(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
