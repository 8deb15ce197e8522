//! Encrypted bearer-token cache using SQLite.

use super::{BearerToken, TokenCipher, UpstreamApi};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

/// Bearer tokens per (account, api), encrypted at rest.
///
/// # Schema
/// ```sql
/// CREATE TABLE bearer_tokens (
///     account_id TEXT NOT NULL,
///     api TEXT NOT NULL,
///     access_token TEXT NOT NULL,        -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     expires_at TEXT NOT NULL,          -- RFC 3339
///     updated_at TEXT NOT NULL,
///     PRIMARY KEY (account_id, api)
/// );
/// ```
pub struct TokenStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl TokenStore {
    /// Creates or opens a token store.
    ///
    /// `encryption_key` is a base64-encoded 32-byte master key.
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;
        let conn = Connection::open(db_path).context("Failed to open token database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS bearer_tokens (
                account_id TEXT NOT NULL,
                api TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, api)
            )
            "#,
            [],
        )
        .context("Failed to create bearer_tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("token store connection poisoned"))
    }

    /// Stores a token, replacing any previous one for the same key.
    pub fn store(&self, account_id: &str, api: UpstreamApi, token: &BearerToken) -> Result<()> {
        let (sealed, nonce) = self
            .cipher
            .seal(&token.access_token)
            .context("Failed to encrypt access token")?;

        self.conn()?
            .execute(
                r#"
                INSERT INTO bearer_tokens (
                    account_id, api, access_token, access_token_nonce, expires_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(account_id, api) DO UPDATE SET
                    access_token = excluded.access_token,
                    access_token_nonce = excluded.access_token_nonce,
                    expires_at = excluded.expires_at,
                    updated_at = excluded.updated_at
                "#,
                params![
                    account_id,
                    api.as_str(),
                    sealed,
                    nonce,
                    token.expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to store bearer token")?;

        Ok(())
    }

    /// Returns the cached token, expired or not. Callers check validity.
    pub fn get(&self, account_id: &str, api: UpstreamApi) -> Result<Option<BearerToken>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT access_token, access_token_nonce, expires_at
                FROM bearer_tokens
                WHERE account_id = ?1 AND api = ?2
                "#,
            )
            .context("Failed to prepare query")?;

        let mut rows = stmt
            .query(params![account_id, api.as_str()])
            .context("Failed to execute query")?;

        let Some(row) = rows.next().context("Failed to read row")? else {
            return Ok(None);
        };

        let sealed: String = row.get(0)?;
        let nonce: String = row.get(1)?;
        let expires_at: String = row.get(2)?;

        let access_token = self
            .cipher
            .open(&sealed, &nonce)
            .context("Failed to decrypt access token")?;
        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .context("Failed to parse expires_at timestamp")?
            .with_timezone(&Utc);

        Ok(Some(BearerToken {
            access_token,
            expires_at,
        }))
    }

    /// Returns true if a token was removed.
    pub fn delete(&self, account_id: &str, api: UpstreamApi) -> Result<bool> {
        let removed = self
            .conn()?
            .execute(
                "DELETE FROM bearer_tokens WHERE account_id = ?1 AND api = ?2",
                params![account_id, api.as_str()],
            )
            .context("Failed to delete bearer token")?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_store() -> TokenStore {
        let key = BASE64.encode([0u8; 32]);
        TokenStore::new(":memory:", &key).expect("Failed to create test store")
    }

    fn token(value: &str) -> BearerToken {
        BearerToken {
            access_token: value.to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_store_and_get() {
        let store = create_test_store();
        let original = token("adv-token-1");
        store
            .store("ADV-001", UpstreamApi::Advertising, &original)
            .unwrap();

        let cached = store
            .get("ADV-001", UpstreamApi::Advertising)
            .unwrap()
            .expect("token not found");
        assert_eq!(cached.access_token, "adv-token-1");
        assert_eq!(cached.expires_at.timestamp(), original.expires_at.timestamp());
    }

    #[test]
    fn test_apis_are_separate() {
        let store = create_test_store();
        store
            .store("ACCT", UpstreamApi::Advertising, &token("adv"))
            .unwrap();
        assert!(store.get("ACCT", UpstreamApi::Sales).unwrap().is_none());
    }

    #[test]
    fn test_store_replaces_existing() {
        let store = create_test_store();
        store.store("SELLER-1", UpstreamApi::Sales, &token("old")).unwrap();
        store.store("SELLER-1", UpstreamApi::Sales, &token("new")).unwrap();
        let cached = store.get("SELLER-1", UpstreamApi::Sales).unwrap().unwrap();
        assert_eq!(cached.access_token, "new");
    }

    #[test]
    fn test_delete() {
        let store = create_test_store();
        store.store("SELLER-1", UpstreamApi::Sales, &token("t")).unwrap();
        assert!(store.delete("SELLER-1", UpstreamApi::Sales).unwrap());
        assert!(!store.delete("SELLER-1", UpstreamApi::Sales).unwrap());
        assert!(store.get("SELLER-1", UpstreamApi::Sales).unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.db");
        let key = BASE64.encode([7u8; 32]);

        TokenStore::new(&path, &key)
            .unwrap()
            .store("ADV-001", UpstreamApi::Advertising, &token("kept"))
            .unwrap();

        let reopened = TokenStore::new(&path, &key).unwrap();
        let cached = reopened
            .get("ADV-001", UpstreamApi::Advertising)
            .unwrap()
            .unwrap();
        assert_eq!(cached.access_token, "kept");

        let wrong_key = TokenStore::new(&path, &BASE64.encode([8u8; 32])).unwrap();
        assert!(wrong_key.get("ADV-001", UpstreamApi::Advertising).is_err());
    }
}
