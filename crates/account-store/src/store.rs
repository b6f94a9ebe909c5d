//! Token store: on-disk account credential layout
//!
//! Lives under `<home>/.codex/`:
//! - `auth.json` — the "current" account's credentials, in the same schema
//!   as a per-account record; consumed by the external CLI.
//! - `accounts/<id>/auth.json` — per-account credentials (schema in
//!   [`crate::schema`]).
//! - `accounts_meta.json` — id -> `{label?, added_at}`.
//! - `config.toml` — opaque, read-only passthrough; never parsed here.
//!
//! This store reads and writes `auth.json` as plain credential state; the
//! interactive flows that add, label, or remove accounts by hand are
//! external account-CRUD territory and out of scope here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::claims::{Claims, decode_claims};
use crate::error::{Error, Result};
use crate::schema::{AccountRecord, Tokens};

/// Metadata sidecar for one account, read from and written to
/// `accounts_meta.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Milliseconds since epoch; assigned the first time an account is saved.
    pub added_at: u64,
}

/// An account with its claim-derived fields, as returned by `list`.
#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub id: String,
    pub email: String,
    pub plan: String,
    pub user_id: String,
    pub access_token_expires_at_ms: u64,
    pub label: Option<String>,
    pub added_at: u64,
}

pub struct TokenStore {
    root: PathBuf,
    meta: Mutex<HashMap<String, AccountMeta>>,
}

impl TokenStore {
    /// Open (and create if missing) the store rooted at `<home>/.codex`.
    pub async fn open(home: &Path) -> Result<Self> {
        let root = home.join(".codex");
        tokio::fs::create_dir_all(root.join("accounts"))
            .await
            .map_err(|e| Error::Io(format!("creating account store root: {e}")))?;

        let meta_path = root.join("accounts_meta.json");
        let meta = if meta_path.exists() {
            let contents = tokio::fs::read_to_string(&meta_path)
                .await
                .map_err(|e| Error::Io(format!("reading accounts_meta.json: {e}")))?;
            serde_json::from_str(&contents)
                .map_err(|e| Error::RecordParse(format!("parsing accounts_meta.json: {e}")))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            root,
            meta: Mutex::new(meta),
        })
    }

    fn account_file(&self, id: &str) -> PathBuf {
        self.root.join("accounts").join(id).join("auth.json")
    }

    fn meta_file(&self) -> PathBuf {
        self.root.join("accounts_meta.json")
    }

    /// List every account, deriving claim fields from its access token.
    /// A corrupt record is logged and skipped rather than aborting the scan.
    pub async fn list(&self) -> Result<Vec<AccountSummary>> {
        let accounts_dir = self.root.join("accounts");
        let mut entries = tokio::fs::read_dir(&accounts_dir)
            .await
            .map_err(|e| Error::Io(format!("reading accounts directory: {e}")))?;

        let meta = self.meta.lock().await;
        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io(format!("iterating accounts directory: {e}")))?
        {
            let id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&id).await {
                Ok(record) => {
                    let claims: Claims = decode_claims(&record.tokens.access_token);
                    let account_meta = meta.get(&id).cloned().unwrap_or_default();
                    summaries.push(AccountSummary {
                        id,
                        email: claims.email,
                        plan: claims.plan,
                        user_id: claims.user_id,
                        access_token_expires_at_ms: claims.expires_at_ms,
                        label: account_meta.label,
                        added_at: account_meta.added_at,
                    });
                }
                Err(e) => {
                    warn!(account_id = %id, error = %e, "skipping corrupt account record");
                }
            }
        }
        Ok(summaries)
    }

    /// Load a single account's full record (including tokens).
    pub async fn load(&self, id: &str) -> Result<AccountRecord> {
        let path = self.account_file(id);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(format!("account {id} not in store")))?;
        AccountRecord::from_json(&bytes)
            .map_err(|e| Error::RecordParse(format!("parsing account {id}: {e}")))
    }

    /// Save (create or replace) an account's record atomically.
    pub async fn save(&self, id: &str, record: &AccountRecord) -> Result<()> {
        let dir = self.root.join("accounts").join(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Io(format!("creating account directory: {e}")))?;

        let json = record
            .to_json_pretty()
            .map_err(|e| Error::RecordParse(format!("serializing account {id}: {e}")))?;
        write_atomic(&dir.join("auth.json"), json.as_bytes()).await?;

        let mut meta = self.meta.lock().await;
        meta.entry(id.to_string()).or_insert_with(|| AccountMeta {
            label: None,
            added_at: now_ms(),
        });
        self.persist_meta(&meta).await?;

        debug!(account_id = id, "saved account record");
        Ok(())
    }

    /// Update only the token fields after a refresh, preserving sidecar
    /// fields and metadata.
    pub async fn update_tokens(&self, id: &str, tokens: Tokens) -> Result<()> {
        let mut record = self.load(id).await?;
        record.tokens = tokens;
        record.last_refresh = Some(now_ms().to_string());
        self.save(id, &record).await
    }

    /// Remove an account's record. Idempotent: removing a nonexistent
    /// account is not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let dir = self.root.join("accounts").join(id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| Error::Io(format!("removing account {id}: {e}")))?;
        }
        let mut meta = self.meta.lock().await;
        if meta.remove(id).is_some() {
            self.persist_meta(&meta).await?;
        }
        Ok(())
    }

    async fn persist_meta(&self, meta: &HashMap<String, AccountMeta>) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)
            .map_err(|e| Error::RecordParse(format!("serializing accounts_meta.json: {e}")))?;
        write_atomic(&self.meta_file(), json.as_bytes()).await
    }

    /// Read `config.toml` verbatim. Never parsed here -- ownership of its
    /// contents belongs to the external CLI tool.
    pub async fn read_config_passthrough(&self) -> Result<Option<String>> {
        let path = self.root.join("config.toml");
        if !path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Io(format!("reading config.toml: {e}")))?;
        Ok(Some(contents))
    }

    fn current_account_file(&self) -> PathBuf {
        self.root.join("auth.json")
    }

    /// Read the top-level `auth.json` pointer file: the credentials of
    /// whichever account the external CLI currently has active. `None` if
    /// no account has ever been selected.
    pub async fn read_current_account(&self) -> Result<Option<AccountRecord>> {
        let path = self.current_account_file();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(format!("reading auth.json: {e}"))),
        };
        AccountRecord::from_json(&bytes)
            .map(Some)
            .map_err(|e| Error::RecordParse(format!("parsing auth.json: {e}")))
    }

    /// Overwrite the top-level `auth.json` pointer file with `record`,
    /// making it the external CLI's current account.
    pub async fn write_current_account(&self, record: &AccountRecord) -> Result<()> {
        let json = record
            .to_json_pretty()
            .map_err(|e| Error::RecordParse(format!("serializing auth.json: {e}")))?;
        write_atomic(&self.current_account_file(), json.as_bytes()).await?;
        debug!("wrote current-account pointer file");
        Ok(())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
        std::process::id()
    ));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Error::Io(format!("writing temp file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp file: {e}")))?;

    info!(path = %path.display(), "persisted account store file");
    Ok(())
}
