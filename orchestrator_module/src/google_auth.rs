//! Google OAuth 2.0 access-token management for one user.
//!
//! Wraps the token material held in the credential vault and refreshes the
//! access token through the refresh-token flow when it is close to expiry.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::credential_vault::TokenMaterial;

pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// OAuth client registration shared by every user.
#[derive(Debug, Clone, Default)]
pub struct GoogleOAuthClient {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: String,
}

impl GoogleOAuthClient {
    pub fn from_env() -> Self {
        Self {
            client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            token_url: std::env::var("GOOGLE_TOKEN_URL")
                .unwrap_or_else(|_| GOOGLE_TOKEN_URL.to_string()),
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GoogleAuthError {
    #[error("missing credentials: {0}")]
    MissingCredentials(String),
    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(String),
    #[error("http error: {0}")]
    HttpError(String),
    #[error("json error: {0}")]
    JsonError(String),
}

/// Access-token cache for a single user. Clones share the cache.
#[derive(Debug, Clone)]
pub struct GoogleAuth {
    client: GoogleOAuthClient,
    inner: Arc<RwLock<GoogleAuthInner>>,
}

#[derive(Debug)]
struct GoogleAuthInner {
    refresh_token: Option<String>,
    access_token: Option<String>,
    token_expires_at: Option<Instant>,
}

impl GoogleAuth {
    pub fn new(client: GoogleOAuthClient, token: &TokenMaterial) -> Result<Self, GoogleAuthError> {
        let can_refresh = token.refresh_token.is_some() && client.can_refresh();
        if token.access_token.is_none() && !can_refresh {
            return Err(GoogleAuthError::MissingCredentials(
                "token has neither an access token nor a refreshable refresh token".to_string(),
            ));
        }

        let token_expires_at = token.access_token.as_ref().map(|_| {
            // Tokens without a recorded expiry are assumed valid for one hour.
            let remaining = token
                .expires_at
                .map(remaining_until)
                .unwrap_or(Duration::from_secs(3600));
            Instant::now() + remaining
        });

        Ok(Self {
            client,
            inner: Arc::new(RwLock::new(GoogleAuthInner {
                refresh_token: token.refresh_token.clone(),
                access_token: token.access_token.clone(),
                token_expires_at,
            })),
        })
    }

    /// Get a valid access token, refreshing if necessary.
    pub fn get_access_token(&self) -> Result<String, GoogleAuthError> {
        {
            let inner = self.inner.read().unwrap_or_else(|poison| poison.into_inner());
            if let (Some(token), Some(expires_at)) = (&inner.access_token, &inner.token_expires_at)
            {
                // 60 second buffer before expiration
                if *expires_at > Instant::now() + Duration::from_secs(60) {
                    return Ok(token.clone());
                }
            }
        }
        self.refresh_access_token()
    }

    pub fn refresh_access_token(&self) -> Result<String, GoogleAuthError> {
        let refresh_token = {
            let inner = self.inner.read().unwrap_or_else(|poison| poison.into_inner());
            inner.refresh_token.clone()
        };
        let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            self.client.client_id.as_deref(),
            self.client.client_secret.as_deref(),
            refresh_token,
        ) else {
            return Err(GoogleAuthError::MissingCredentials(
                "access token expired and no refresh credentials are available".to_string(),
            ));
        };

        debug!("Refreshing Google OAuth token");
        let response = reqwest::blocking::Client::new()
            .post(&self.client.token_url)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .map_err(|e| GoogleAuthError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            error!("OAuth token refresh failed: {} - {}", status, body);
            return Err(GoogleAuthError::TokenRefreshFailed(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let token_response: OAuthTokenResponse = response
            .json()
            .map_err(|e| GoogleAuthError::JsonError(e.to_string()))?;

        let expires_at = Instant::now() + Duration::from_secs(token_response.expires_in.max(0) as u64);
        let access_token = token_response.access_token.clone();
        {
            let mut inner = self.inner.write().unwrap_or_else(|poison| poison.into_inner());
            inner.access_token = Some(token_response.access_token);
            inner.token_expires_at = Some(expires_at);
        }

        debug!("Google OAuth token refreshed successfully");
        Ok(access_token)
    }
}

fn remaining_until(expires_at: DateTime<Utc>) -> Duration {
    (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn oauth_client(token_url: String) -> GoogleOAuthClient {
        GoogleOAuthClient {
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            token_url,
        }
    }

    #[test]
    fn rejects_token_without_usable_credentials() {
        let token = TokenMaterial {
            access_token: None,
            refresh_token: Some("refresh".to_string()),
            expires_at: None,
        };
        let result = GoogleAuth::new(GoogleOAuthClient::default(), &token);
        assert!(matches!(result, Err(GoogleAuthError::MissingCredentials(_))));
    }

    #[test]
    fn fresh_access_token_is_served_from_cache() {
        let token = TokenMaterial {
            access_token: Some("cached".to_string()),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::minutes(30)),
        };
        let auth = GoogleAuth::new(GoogleOAuthClient::default(), &token).expect("auth");
        assert_eq!(auth.get_access_token().unwrap(), "cached");
    }

    #[test]
    fn expired_access_token_is_refreshed() {
        let mut server = Server::new();
        let mock = server
            .mock("POST", "/token")
            .match_body(Matcher::UrlEncoded(
                "grant_type".to_string(),
                "refresh_token".to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"fresh","expires_in":3599,"token_type":"Bearer"}"#)
            .expect(1)
            .create();

        let token = TokenMaterial {
            access_token: Some("stale".to_string()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
        };
        let auth = GoogleAuth::new(oauth_client(format!("{}/token", server.url())), &token)
            .expect("auth");

        assert_eq!(auth.get_access_token().unwrap(), "fresh");
        assert_eq!(auth.get_access_token().unwrap(), "fresh");
        mock.assert();
    }
}
