//! Identity-provider token verification.
//!
//! No teacher precedent for OIDC itself; the trait boundary mirrors how the
//! teacher isolates external services behind a small async trait (compare
//! `embedding::Embedder`). A real deployment plugs in whatever IdP the
//! operator runs (Auth0, Okta, Keycloak, ...) by implementing `IdentityProvider`.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Claims this crate cares about, not the full OIDC claim set.
#[derive(Debug, Clone)]
pub struct IdpClaims {
    pub subject: String,
    pub email: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verifies a bearer token presented by a client and returns the
    /// resolved subject/email, or `Error::Unauthorized` if the token does
    /// not verify.
    async fn verify(&self, bearer_token: &str) -> Result<IdpClaims>;
}

/// Verifies tokens against an OIDC userinfo endpoint. Accepts whatever the
/// endpoint returns as long as it carries `sub` and `email` and, when an
/// audience is configured, an `aud` claim that includes it.
pub struct OidcVerifier {
    client: reqwest::Client,
    userinfo_url: String,
    audience: Option<String>,
}

impl OidcVerifier {
    pub fn new(issuer: &str, audience: Option<String>) -> Self {
        let userinfo_url = format!("{}/userinfo", issuer.trim_end_matches('/'));
        Self {
            client: reqwest::Client::new(),
            userinfo_url,
            audience,
        }
    }
}

#[async_trait]
impl IdentityProvider for OidcVerifier {
    async fn verify(&self, bearer_token: &str) -> Result<IdpClaims> {
        let response = self
            .client
            .get(&self.userinfo_url)
            .bearer_auth(bearer_token)
            .send()
            .await
            .map_err(|e| Error::Transient(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(Error::Unauthorized);
        }
        if !response.status().is_success() {
            return Err(Error::Transient(format!("idp returned {}", response.status())));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| Error::Permanent(e.to_string()))?;

        if let Some(expected_aud) = &self.audience {
            let matches_aud = match &body["aud"] {
                serde_json::Value::String(s) => s == expected_aud,
                serde_json::Value::Array(values) => {
                    values.iter().any(|v| v.as_str() == Some(expected_aud.as_str()))
                }
                _ => false,
            };
            if !matches_aud {
                return Err(Error::Unauthorized);
            }
        }

        let subject = body["sub"]
            .as_str()
            .ok_or_else(|| Error::Permanent("idp response missing 'sub'".into()))?
            .to_string();
        let email = body["email"].as_str().unwrap_or("").to_string();

        Ok(IdpClaims { subject, email })
    }
}
