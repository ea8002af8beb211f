//! OAuth access tokens for Firestore, minted from a service account key.
//!
//! A signed RS256 assertion is exchanged at the key's `token_uri` for a
//! bearer token, which is cached until shortly before it expires.

use std::fmt;
use std::sync::Mutex;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::StoreError;

const DATASTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
/// Tokens this close to expiry are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a Google service account key file that signing needs.
#[derive(Clone, PartialEq, Deserialize)]
pub struct ServiceAccountKey {
    pub project_id: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Claims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: i64,
}

pub struct ServiceAccountTokens {
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    client: Client,
    cached: Mutex<Option<AccessToken>>,
}

impl ServiceAccountTokens {
    /// Fails when the private key is not a valid RSA PEM.
    pub fn new(key: ServiceAccountKey, client: Client) -> Result<Self, StoreError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StoreError::Credentials(format!("invalid private_key: {}", e)))?;
        Ok(Self {
            key,
            signing_key,
            client,
            cached: Mutex::new(None),
        })
    }

    /// A bearer token valid for at least [`REFRESH_MARGIN_SECS`].
    pub fn token(&self) -> Result<String, StoreError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now().timestamp();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - REFRESH_MARGIN_SECS > now {
                return Ok(token.value.clone());
            }
        }

        let token = self.exchange(now)?;
        log::debug!("Obtained Firestore access token for {}", self.key.client_email);
        *cached = Some(token.clone());
        Ok(token.value)
    }

    pub(crate) fn assertion(&self, now: i64) -> Result<String, StoreError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let claims = Claims {
            iss: self.key.client_email.clone(),
            scope: DATASTORE_SCOPE.to_string(),
            aud: self.key.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };
        jsonwebtoken::encode(&header, &claims, &self.signing_key)
            .map_err(|e| StoreError::Credentials(format!("could not sign assertion: {}", e)))
    }

    fn exchange(&self, now: i64) -> Result<AccessToken, StoreError> {
        let assertion = self.assertion(now)?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::TokenExchange {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let body: TokenResponse = response.json()?;
        Ok(AccessToken {
            value: body.access_token,
            expires_at: now + body.expires_in,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub const PRIVATE_KEY: &str = include_str!("../../testdata/test_service_account_key.pem");
    pub const PUBLIC_KEY: &str = include_str!("../../testdata/test_service_account_key.pub.pem");

    /// Service account key JSON whose token endpoint is `token_uri`.
    pub fn key_json(token_uri: &str) -> String {
        serde_json::json!({
            "type": "service_account",
            "project_id": "glaucoma-app",
            "private_key_id": "key-1",
            "private_key": PRIVATE_KEY,
            "client_email": "diagnosis@glaucoma-app.iam.gserviceaccount.com",
            "token_uri": token_uri,
        })
        .to_string()
    }

    pub fn key(token_uri: &str) -> ServiceAccountKey {
        serde_json::from_str(&key_json(token_uri)).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};
    use mockito::Matcher;

    #[test]
    fn assertion_is_signed_for_the_token_endpoint() {
        let tokens = ServiceAccountTokens::new(key("https://oauth2.example/token"), Client::new()).unwrap();
        let now = Utc::now().timestamp();
        let jwt = tokens.assertion(now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&["https://oauth2.example/token"]);
        let decoded = jsonwebtoken::decode::<Claims>(
            &jwt,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.header.kid.as_deref(), Some("key-1"));
        assert_eq!(decoded.claims.iss, "diagnosis@glaucoma-app.iam.gserviceaccount.com");
        assert_eq!(decoded.claims.scope, DATASTORE_SCOPE);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[test]
    fn rejects_a_private_key_that_is_not_pem() {
        let mut bad = key(DEFAULT_TOKEN_URI);
        bad.private_key = "not a key".into();
        assert!(matches!(
            ServiceAccountTokens::new(bad, Client::new()),
            Err(StoreError::Credentials(_))
        ));
    }

    #[test]
    fn exchanges_once_and_reuses_the_cached_token() {
        let mut server = mockito::Server::new();
        let exchange = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded("grant_type".into(), JWT_BEARER_GRANT.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "ya29.fresh", "expires_in": 3599, "token_type": "Bearer"}"#)
            .expect(1)
            .create();

        let tokens = ServiceAccountTokens::new(key(&format!("{}/token", server.url())), Client::new()).unwrap();
        assert_eq!(tokens.token().unwrap(), "ya29.fresh");
        assert_eq!(tokens.token().unwrap(), "ya29.fresh");
        exchange.assert();
    }

    #[test]
    fn refreshes_tokens_that_are_about_to_expire() {
        let mut server = mockito::Server::new();
        let exchange = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "ya29.short", "expires_in": 30}"#)
            .expect(2)
            .create();

        let tokens = ServiceAccountTokens::new(key(&format!("{}/token", server.url())), Client::new()).unwrap();
        tokens.token().unwrap();
        tokens.token().unwrap();
        exchange.assert();
    }

    #[test]
    fn rejected_exchange_is_reported() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create();

        let tokens = ServiceAccountTokens::new(key(&format!("{}/token", server.url())), Client::new()).unwrap();
        match tokens.token() {
            Err(StoreError::TokenExchange { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("expected a token exchange error, got {:?}", other.map(|_| ())),
        }
    }
}
