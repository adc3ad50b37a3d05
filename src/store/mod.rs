//! Credential and account storage
//!
//! SQLite-backed store for upstream credentials, external API accounts,
//! and client API keys. Secrets (refresh tokens, API keys) are encrypted
//! at rest with AES-256-GCM; the key is derived from the configured
//! secret. Counter updates are single UPDATE statements, so they are
//! atomic under SQLite's locking.
//!
//! Status transitions are one-way: a credential can leave `active` for
//! `invalid` or `expired`, but restoration is an admin operation outside
//! this store.

use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use sha2::{Digest, Sha256};

/// Credential lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Active,
    Invalid,
    Expired,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Invalid => "invalid",
            CredentialStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "invalid" => CredentialStatus::Invalid,
            "expired" => CredentialStatus::Expired,
            _ => CredentialStatus::Active,
        }
    }
}

/// One stored upstream credential (secrets excluded).
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: i64,
    /// Owning user - surfaced by the account UI collaborator
    #[allow(dead_code)]
    pub user_id: i64,
    pub auth_type: String,
    pub region: String,
    pub visibility: String,
    pub status: CredentialStatus,
    pub opus_enabled: bool,
    pub success_count: i64,
    pub fail_count: i64,
    pub last_used_ms: Option<i64>,
    /// Last health-check time - surfaced by the account UI collaborator
    #[allow(dead_code)]
    pub last_check_ms: Option<i64>,
    /// Cached account metadata - surfaced by the account UI collaborator
    #[allow(dead_code)]
    pub subscription_tier: Option<String>,
    #[allow(dead_code)]
    pub usage_percent: Option<f64>,
}

impl Credential {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.fail_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }
}

/// Decrypted secrets for one credential.
#[derive(Debug, Clone)]
pub struct CredentialSecrets {
    pub refresh_token: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// An outbound external API account (api_key decrypted on fetch).
#[derive(Debug, Clone)]
pub struct ExternalApiAccount {
    pub id: i64,
    /// Owning user - surfaced by the account UI collaborator
    #[allow(dead_code)]
    pub user_id: i64,
    pub name: String,
    pub api_base: String,
    pub api_key: String,
    pub format: String,
    pub provider: String,
    pub model_whitelist: String,
    /// Counters - surfaced by the account UI collaborator
    #[allow(dead_code)]
    pub success_count: i64,
    #[allow(dead_code)]
    pub fail_count: i64,
}

impl ExternalApiAccount {
    /// Whitelist entries, trimmed. Empty list = no models allowed.
    pub fn whitelisted_models(&self) -> Vec<&str> {
        self.model_whitelist
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.whitelisted_models().iter().any(|m| *m == model)
    }
}

#[derive(Clone)]
pub struct Store {
    pool: r2d2::Pool<SqliteConnectionManager>,
    cipher: Aes256Gcm,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, encryption_secret: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path);
        let pool = r2d2::Pool::builder()
            .max_size(8)
            .build(manager)
            .context("Failed to open database pool")?;
        let store = Self {
            pool,
            cipher: build_cipher(encryption_secret),
        };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        // A single connection: every in-memory connection is its own db
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        let store = Self {
            pool,
            cipher: build_cipher("test-secret"),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                refresh_token_enc TEXT NOT NULL,
                refresh_token_hash TEXT NOT NULL,
                auth_type TEXT NOT NULL DEFAULT 'social',
                client_id TEXT,
                client_secret_enc TEXT,
                region TEXT NOT NULL DEFAULT 'us-east-1',
                visibility TEXT NOT NULL DEFAULT 'private',
                status TEXT NOT NULL DEFAULT 'active',
                opus_enabled INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER,
                last_check INTEGER,
                last_check_error TEXT,
                subscription_tier TEXT,
                usage_percent REAL,
                created_at INTEGER NOT NULL,
                UNIQUE(user_id, refresh_token_hash, region)
            );
            CREATE TABLE IF NOT EXISTS external_api_accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                api_base TEXT NOT NULL,
                api_key_enc TEXT NOT NULL,
                format TEXT NOT NULL DEFAULT 'openai',
                provider TEXT NOT NULL DEFAULT '',
                model_whitelist TEXT NOT NULL DEFAULT '',
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS api_keys (
                key_hash TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_credentials_user ON credentials(user_id);
            CREATE INDEX IF NOT EXISTS idx_credentials_visibility ON credentials(visibility, status);
            "#,
        )?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Credentials
    // ────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_credential(
        &self,
        user_id: i64,
        refresh_token: &str,
        auth_type: &str,
        region: &str,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        visibility: &str,
        opus_enabled: bool,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        let token_enc = self.encrypt(refresh_token)?;
        let token_hash = hash_secret(refresh_token);
        let secret_enc = client_secret.map(|s| self.encrypt(s)).transpose()?;
        let now = chrono::Utc::now().timestamp_millis();

        conn.execute(
            "INSERT INTO credentials
               (user_id, refresh_token_enc, refresh_token_hash, auth_type, client_id,
                client_secret_enc, region, visibility, opus_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                user_id,
                token_enc,
                token_hash,
                auth_type,
                client_id,
                secret_enc,
                region,
                visibility,
                opus_enabled as i64,
                now
            ],
        )
        .context("Failed to insert credential")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user_credentials(&self, user_id: i64) -> Result<Vec<Credential>> {
        self.query_credentials("WHERE user_id = ?1", params![user_id])
    }

    pub fn get_public_credentials(&self) -> Result<Vec<Credential>> {
        self.query_credentials(
            "WHERE visibility = 'public' AND status = 'active'",
            params![],
        )
    }

    pub fn get_all_active_credentials(&self) -> Result<Vec<Credential>> {
        self.query_credentials("WHERE status = 'active'", params![])
    }

    fn query_credentials(
        &self,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Credential>> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT id, user_id, auth_type, region, visibility, status, opus_enabled,
                    success_count, fail_count, last_used, last_check,
                    subscription_tier, usage_percent
             FROM credentials {} ORDER BY id",
            where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok(Credential {
                id: row.get(0)?,
                user_id: row.get(1)?,
                auth_type: row.get(2)?,
                region: row.get(3)?,
                visibility: row.get(4)?,
                status: CredentialStatus::parse(&row.get::<_, String>(5)?),
                opus_enabled: row.get::<_, i64>(6)? != 0,
                success_count: row.get(7)?,
                fail_count: row.get(8)?,
                last_used_ms: row.get(9)?,
                last_check_ms: row.get(10)?,
                subscription_tier: row.get(11)?,
                usage_percent: row.get(12)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Full decrypted secrets for a credential.
    pub fn get_credential_secrets(&self, id: i64) -> Result<CredentialSecrets> {
        let conn = self.pool.get()?;
        let (token_enc, client_id, secret_enc): (String, Option<String>, Option<String>) = conn
            .query_row(
                "SELECT refresh_token_enc, client_id, client_secret_enc
                 FROM credentials WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .context("Credential not found")?;

        Ok(CredentialSecrets {
            refresh_token: self.decrypt(&token_enc)?,
            client_id,
            client_secret: secret_enc.map(|s| self.decrypt(&s)).transpose()?,
        })
    }

    /// One-way status transition out of `active`.
    pub fn set_credential_status(&self, id: i64, status: CredentialStatus) -> Result<bool> {
        if status == CredentialStatus::Active {
            bail!("Restoring a credential to active is an admin operation");
        }
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE credentials SET status = ?1 WHERE id = ?2 AND status = 'active'",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }

    /// Record one use. Counters only grow.
    pub fn record_credential_usage(&self, id: i64, success: bool) -> Result<()> {
        let conn = self.pool.get()?;
        let now = chrono::Utc::now().timestamp_millis();
        if success {
            conn.execute(
                "UPDATE credentials SET success_count = success_count + 1, last_used = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
        } else {
            conn.execute(
                "UPDATE credentials SET fail_count = fail_count + 1, last_used = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(())
    }

    pub fn record_health_check(&self, id: i64, ok: bool, error: Option<&str>) -> Result<()> {
        let conn = self.pool.get()?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE credentials SET last_check = ?1, last_check_error = ?2 WHERE id = ?3",
            params![now, if ok { None } else { error }, id],
        )?;
        Ok(())
    }

    pub fn update_account_metadata(
        &self,
        id: i64,
        tier: Option<&str>,
        usage_percent: Option<f64>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE credentials SET subscription_tier = ?1, usage_percent = ?2 WHERE id = ?3",
            params![tier, usage_percent, id],
        )?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // External API accounts
    // ────────────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn insert_external_account(
        &self,
        user_id: i64,
        name: &str,
        api_base: &str,
        api_key: &str,
        format: &str,
        provider: &str,
        model_whitelist: &str,
    ) -> Result<i64> {
        let conn = self.pool.get()?;
        let key_enc = self.encrypt(api_key)?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT INTO external_api_accounts
               (user_id, name, api_base, api_key_enc, format, provider, model_whitelist, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![user_id, name, api_base, key_enc, format, provider, model_whitelist, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_user_external_accounts(&self, user_id: i64) -> Result<Vec<ExternalApiAccount>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, name, api_base, api_key_enc, format, provider,
                    model_whitelist, success_count, fail_count
             FROM external_api_accounts WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, i64>(8)?,
                row.get::<_, i64>(9)?,
            ))
        })?;

        let mut accounts = Vec::new();
        for row in rows {
            let (id, user_id, name, api_base, key_enc, format, provider, whitelist, ok, fail) =
                row?;
            accounts.push(ExternalApiAccount {
                id,
                user_id,
                name,
                api_base,
                api_key: self.decrypt(&key_enc)?,
                format,
                provider,
                model_whitelist: whitelist,
                success_count: ok,
                fail_count: fail,
            });
        }
        Ok(accounts)
    }

    pub fn record_external_usage(&self, id: i64, success: bool) -> Result<()> {
        let conn = self.pool.get()?;
        let column = if success { "success_count" } else { "fail_count" };
        conn.execute(
            &format!(
                "UPDATE external_api_accounts SET {} = {} + 1 WHERE id = ?1",
                column, column
            ),
            params![id],
        )?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Client API keys
    // ────────────────────────────────────────────────────────────────────

    pub fn insert_api_key(&self, user_id: i64, key: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO api_keys (key_hash, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![hash_secret(key), user_id, now],
        )?;
        Ok(())
    }

    /// Resolve a presented client key to a user id.
    pub fn resolve_api_key(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.pool.get()?;
        let result = conn
            .query_row(
                "SELECT user_id FROM api_keys WHERE key_hash = ?1",
                params![hash_secret(key)],
                |row| row.get::<_, i64>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(result)
    }

    // ────────────────────────────────────────────────────────────────────
    // Encryption
    // ────────────────────────────────────────────────────────────────────

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;
        let mut combined = nonce.to_vec();
        combined.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(combined))
    }

    fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = BASE64.decode(encoded).context("Invalid ciphertext encoding")?;
        if combined.len() < 12 {
            bail!("Ciphertext too short");
        }
        let (nonce, ciphertext) = combined.split_at(12);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| anyhow!("Decryption failed: {}", e))?;
        String::from_utf8(plaintext).context("Decrypted secret is not UTF-8")
    }
}

/// Derive the AES-256 key from the configured secret.
fn build_cipher(secret: &str) -> Aes256Gcm {
    let mut hasher = Sha256::new();
    hasher.update(b"crossgate-store-v1");
    hasher.update(secret.as_bytes());
    let key = hasher.finalize();
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
}

/// Stable hash for uniqueness checks and key lookups.
fn hash_secret(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_credential() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_credential(1, "refresh-token-1", "social", "us-east-1", None, None, "private", false)
            .unwrap();
        (store, id)
    }

    #[test]
    fn test_secrets_roundtrip_encrypted() {
        let (store, id) = store_with_credential();
        let secrets = store.get_credential_secrets(id).unwrap();
        assert_eq!(secrets.refresh_token, "refresh-token-1");

        // The raw token never appears in the database
        let conn = store.pool.get().unwrap();
        let stored: String = conn
            .query_row(
                "SELECT refresh_token_enc FROM credentials WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!stored.contains("refresh-token-1"));
    }

    #[test]
    fn test_idc_credential_secrets() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_credential(
                1,
                "idc-token",
                "idc",
                "eu-west-1",
                Some("client-1"),
                Some("shhh"),
                "private",
                true,
            )
            .unwrap();
        let secrets = store.get_credential_secrets(id).unwrap();
        assert_eq!(secrets.client_id.as_deref(), Some("client-1"));
        assert_eq!(secrets.client_secret.as_deref(), Some("shhh"));

        let creds = store.get_user_credentials(1).unwrap();
        assert!(creds[0].opus_enabled);
        assert_eq!(creds[0].region, "eu-west-1");
    }

    #[test]
    fn test_duplicate_token_region_rejected() {
        let (store, _) = store_with_credential();
        let dup = store.insert_credential(
            1, "refresh-token-1", "social", "us-east-1", None, None, "private", false,
        );
        assert!(dup.is_err());

        // Same token in a different region is a distinct credential
        let other_region = store.insert_credential(
            1, "refresh-token-1", "social", "eu-west-1", None, None, "private", false,
        );
        assert!(other_region.is_ok());
    }

    #[test]
    fn test_status_transition_one_way() {
        let (store, id) = store_with_credential();
        assert!(store.set_credential_status(id, CredentialStatus::Expired).unwrap());

        // Already expired: no transition back through this path
        assert!(!store.set_credential_status(id, CredentialStatus::Invalid).unwrap());
        assert!(store.set_credential_status(id, CredentialStatus::Active).is_err());

        let creds = store.get_user_credentials(1).unwrap();
        assert_eq!(creds[0].status, CredentialStatus::Expired);
    }

    #[test]
    fn test_counters_monotonic() {
        let (store, id) = store_with_credential();
        store.record_credential_usage(id, true).unwrap();
        store.record_credential_usage(id, true).unwrap();
        store.record_credential_usage(id, false).unwrap();

        let cred = &store.get_user_credentials(1).unwrap()[0];
        assert_eq!(cred.success_count, 2);
        assert_eq!(cred.fail_count, 1);
        assert!(cred.last_used_ms.is_some());
        assert!((cred.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_public_pool_excludes_inactive() {
        let store = Store::open_in_memory().unwrap();
        let a = store
            .insert_credential(1, "tok-a", "social", "us-east-1", None, None, "public", false)
            .unwrap();
        store
            .insert_credential(1, "tok-b", "social", "us-east-1", None, None, "public", false)
            .unwrap();
        store
            .insert_credential(1, "tok-c", "social", "us-east-1", None, None, "private", false)
            .unwrap();
        store.set_credential_status(a, CredentialStatus::Invalid).unwrap();

        let public = store.get_public_credentials().unwrap();
        assert_eq!(public.len(), 1);
    }

    #[test]
    fn test_external_account_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_external_account(
                7,
                "backup",
                "https://api.example.com",
                "sk-secret",
                "anthropic",
                "azure",
                "claude-sonnet-4, claude-haiku-4-5",
            )
            .unwrap();

        let accounts = store.get_user_external_accounts(7).unwrap();
        assert_eq!(accounts.len(), 1);
        let account = &accounts[0];
        assert_eq!(account.api_key, "sk-secret");
        assert!(account.allows_model("claude-sonnet-4"));
        assert!(account.allows_model("claude-haiku-4-5"));
        assert!(!account.allows_model("claude-opus-4"));
    }

    #[test]
    fn test_api_key_resolution() {
        let store = Store::open_in_memory().unwrap();
        store.insert_api_key(42, "sk-user-key").unwrap();
        assert_eq!(store.resolve_api_key("sk-user-key").unwrap(), Some(42));
        assert_eq!(store.resolve_api_key("sk-unknown").unwrap(), None);
    }

    #[test]
    fn test_health_check_recording() {
        let (store, id) = store_with_credential();
        store.record_health_check(id, false, Some("refresh rejected")).unwrap();
        let cred = &store.get_user_credentials(1).unwrap()[0];
        assert!(cred.last_check_ms.is_some());
    }

    #[test]
    fn test_account_metadata() {
        let (store, id) = store_with_credential();
        store.update_account_metadata(id, Some("pro+"), Some(37.5)).unwrap();
        let cred = &store.get_user_credentials(1).unwrap()[0];
        assert_eq!(cred.subscription_tier.as_deref(), Some("pro+"));
        assert_eq!(cred.usage_percent, Some(37.5));
    }
}
