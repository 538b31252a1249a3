//! Per-user OAuth token storage and scope grants.
//!
//! The vault stores token material as an opaque JSON document next to the set
//! of scopes the user granted. Encryption at rest belongs to the deployment
//! (an encrypted volume or a SQLCipher build) and is not handled here.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::scopes::ScopeSet;

/// OAuth token material for one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenMaterial {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenMaterial {
    pub fn is_usable(&self) -> bool {
        self.access_token.is_some() || self.refresh_token.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read/write access to per-user credentials.
pub trait CredentialVault: Send + Sync {
    fn has_scope(&self, user_id: &str, scope: &str) -> Result<bool, VaultError>;

    fn get_token(&self, user_id: &str) -> Result<Option<TokenMaterial>, VaultError>;

    fn granted_scopes(&self, user_id: &str) -> Result<ScopeSet, VaultError>;

    /// Store `token` and union-merge `scopes` into the user's grant set.
    /// Returns the merged set.
    fn grant_scopes(
        &self,
        user_id: &str,
        token: &TokenMaterial,
        scopes: &ScopeSet,
    ) -> Result<ScopeSet, VaultError>;

    fn revoke_scope(&self, user_id: &str, scope: &str) -> Result<bool, VaultError>;

    /// Users holding a token together with at least one of `scopes`.
    fn users_with_any_scope(&self, scopes: &[&str]) -> Result<Vec<String>, VaultError>;
}

const VAULT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vault_tokens (
    user_id TEXT PRIMARY KEY,
    token_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_scopes (
    user_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    granted_at TEXT NOT NULL,
    PRIMARY KEY (user_id, scope)
);
"#;

/// SQLite-backed [`CredentialVault`].
#[derive(Debug, Clone)]
pub struct SqliteCredentialVault {
    path: PathBuf,
}

impl SqliteCredentialVault {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let vault = Self { path: path.into() };
        if let Some(parent) = vault.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = vault.open()?;
        conn.execute_batch(VAULT_SCHEMA)?;
        Ok(vault)
    }

    fn open(&self) -> Result<Connection, VaultError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl CredentialVault for SqliteCredentialVault {
    fn has_scope(&self, user_id: &str, scope: &str) -> Result<bool, VaultError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vault_scopes s
             JOIN vault_tokens t ON t.user_id = s.user_id
             WHERE s.user_id = ?1 AND s.scope = ?2",
            params![user_id, scope],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_token(&self, user_id: &str) -> Result<Option<TokenMaterial>, VaultError> {
        let conn = self.open()?;
        let raw = conn
            .query_row(
                "SELECT token_json FROM vault_tokens WHERE user_id = ?1",
                params![user_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn granted_scopes(&self, user_id: &str) -> Result<ScopeSet, VaultError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT scope FROM vault_scopes WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        let mut scopes = ScopeSet::new();
        for row in rows {
            scopes.insert(row?);
        }
        Ok(scopes)
    }

    fn grant_scopes(
        &self,
        user_id: &str,
        token: &TokenMaterial,
        scopes: &ScopeSet,
    ) -> Result<ScopeSet, VaultError> {
        let mut merged_token = token.clone();
        // Incremental grants often come back without a refresh token; keep the old one.
        if merged_token.refresh_token.is_none() {
            if let Some(existing) = self.get_token(user_id)? {
                merged_token.refresh_token = existing.refresh_token;
            }
        }

        let mut conn = self.open()?;
        let now = Utc::now().to_rfc3339();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO vault_tokens (user_id, token_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                token_json = excluded.token_json,
                updated_at = excluded.updated_at",
            params![user_id, serde_json::to_string(&merged_token)?, now],
        )?;
        for scope in scopes.iter() {
            tx.execute(
                "INSERT OR IGNORE INTO vault_scopes (user_id, scope, granted_at) VALUES (?1, ?2, ?3)",
                params![user_id, scope, now],
            )?;
        }
        tx.commit()?;
        self.granted_scopes(user_id)
    }

    fn revoke_scope(&self, user_id: &str, scope: &str) -> Result<bool, VaultError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM vault_scopes WHERE user_id = ?1 AND scope = ?2",
            params![user_id, scope],
        )?;
        Ok(removed > 0)
    }

    fn users_with_any_scope(&self, scopes: &[&str]) -> Result<Vec<String>, VaultError> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let placeholders = (1..=scopes.len())
            .map(|idx| format!("?{}", idx))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT s.user_id FROM vault_scopes s
             JOIN vault_tokens t ON t.user_id = s.user_id
             WHERE s.scope IN ({})
             ORDER BY s.user_id",
            placeholders
        ))?;
        let rows = stmt.query_map(rusqlite::params_from_iter(scopes.iter()), |row| {
            row.get::<_, String>(0)
        })?;
        let mut user_ids = Vec::new();
        for row in rows {
            user_ids.push(row?);
        }
        Ok(user_ids)
    }
}
