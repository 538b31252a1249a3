//! Builds authenticated per-user integration clients from vault credentials.

use std::sync::Arc;
use tracing::debug;

use crate::calendar_client::{ExternalCalendarClient, GoogleCalendarClient, GOOGLE_CALENDAR_API};
use crate::credential_vault::{CredentialVault, VaultError};
use crate::google_auth::{GoogleAuth, GoogleAuthError, GoogleOAuthClient};
use crate::mail_client::{GmailClient, MailClient, GMAIL_API};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("no stored credentials for user {0}")]
    MissingToken(String),
    #[error("auth error: {0}")]
    Auth(#[from] GoogleAuthError),
}

/// Source of authenticated clients for a user.
///
/// Implementations do not check scopes; callers gate on the vault first.
pub trait IntegrationClients: Send + Sync {
    fn mail_client(&self, user_id: &str) -> Result<Arc<dyn MailClient>, ClientError>;

    fn calendar_client(&self, user_id: &str)
        -> Result<Arc<dyn ExternalCalendarClient>, ClientError>;
}

/// Google-backed [`IntegrationClients`].
pub struct GoogleClientFactory {
    vault: Arc<dyn CredentialVault>,
    oauth: GoogleOAuthClient,
    calendar_base_url: String,
    gmail_base_url: String,
}

impl GoogleClientFactory {
    pub fn new(vault: Arc<dyn CredentialVault>, oauth: GoogleOAuthClient) -> Self {
        Self {
            vault,
            oauth,
            calendar_base_url: GOOGLE_CALENDAR_API.to_string(),
            gmail_base_url: GMAIL_API.to_string(),
        }
    }

    /// Point the clients at other API hosts.
    pub fn with_base_urls(
        mut self,
        calendar_base_url: impl Into<String>,
        gmail_base_url: impl Into<String>,
    ) -> Self {
        self.calendar_base_url = calendar_base_url.into();
        self.gmail_base_url = gmail_base_url.into();
        self
    }

    fn auth_for(&self, user_id: &str) -> Result<GoogleAuth, ClientError> {
        let token = self
            .vault
            .get_token(user_id)?
            .ok_or_else(|| ClientError::MissingToken(user_id.to_string()))?;
        debug!("building Google auth for user {}", user_id);
        Ok(GoogleAuth::new(self.oauth.clone(), &token)?)
    }
}

impl IntegrationClients for GoogleClientFactory {
    fn mail_client(&self, user_id: &str) -> Result<Arc<dyn MailClient>, ClientError> {
        let auth = self.auth_for(user_id)?;
        Ok(Arc::new(GmailClient::new(auth, self.gmail_base_url.clone())))
    }

    fn calendar_client(
        &self,
        user_id: &str,
    ) -> Result<Arc<dyn ExternalCalendarClient>, ClientError> {
        let auth = self.auth_for(user_id)?;
        Ok(Arc::new(GoogleCalendarClient::new(
            auth,
            self.calendar_base_url.clone(),
        )))
    }
}
