//! API-key validation as an injected capability, with the sqlite-backed
//! store used in production and a static in-memory store for fixed keys.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::{ProxyError, Result};

static KEY_SEQ: AtomicU64 = AtomicU64::new(0);

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn is_valid(&self, api_key: &str) -> Result<bool>;
}

/// Keys live in an `api_users` table: `api_key` plus an optional RFC 3339
/// `expiring_date`. A key past its expiry is invalid, not deleted.
#[derive(Clone, Debug)]
pub struct SqliteKeyStore {
    path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub api_key: String,
    pub expiring_date: Option<String>,
}

impl SqliteKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Inserts a freshly generated key, optionally expiring after
    /// `expiration_days`, and returns the key text.
    pub async fn add_key(&self, expiration_days: Option<u32>) -> Result<String> {
        let path = self.path.clone();
        let api_key = generate_api_key();
        let expiring_date = match expiration_days {
            Some(days) => Some(expiry_timestamp(days)?),
            None => None,
        };

        let inserted_key = api_key.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO api_users (api_key, expiring_date) VALUES (?1, ?2)",
                (&inserted_key, &expiring_date),
            )?;
            Ok(())
        })
        .await??;

        Ok(api_key)
    }

    pub async fn list_keys(&self) -> Result<Vec<ApiKeyRecord>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ApiKeyRecord>> {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            let mut stmt =
                conn.prepare("SELECT id, api_key, expiring_date FROM api_users ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(ApiKeyRecord {
                    id: row.get(0)?,
                    api_key: row.get(1)?,
                    expiring_date: row.get(2)?,
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
        .await?
    }
}

#[async_trait]
impl ApiKeyStore for SqliteKeyStore {
    async fn is_valid(&self, api_key: &str) -> Result<bool> {
        let path = self.path.clone();
        let api_key = api_key.to_string();
        let expiring_date: Option<Option<String>> =
            tokio::task::spawn_blocking(move || -> Result<Option<Option<String>>> {
                let conn = open_connection(&path)?;
                init_schema(&conn)?;
                let row = conn
                    .query_row(
                        "SELECT expiring_date FROM api_users WHERE api_key = ?1",
                        [&api_key],
                        |row| row.get::<_, Option<String>>(0),
                    )
                    .optional()?;
                Ok(row)
            })
            .await??;

        let Some(expiring_date) = expiring_date else {
            return Ok(false);
        };

        match expiring_date {
            None => Ok(true),
            Some(raw) => {
                // Unparseable expiry text means the key cannot be trusted.
                let Ok(expiry) = OffsetDateTime::parse(&raw, &Rfc3339) else {
                    return Ok(false);
                };
                Ok(OffsetDateTime::now_utc() <= expiry)
            }
        }
    }
}

/// Fixed key set, typically loaded from configuration. Also the test double.
#[derive(Clone, Debug, Default)]
pub struct StaticKeyStore {
    keys: HashSet<String>,
}

impl StaticKeyStore {
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ApiKeyStore for StaticKeyStore {
    async fn is_valid(&self, api_key: &str) -> Result<bool> {
        Ok(self.keys.contains(api_key))
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS api_users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            api_key TEXT NOT NULL,
            expiring_date TEXT
        );",
    )?;
    Ok(())
}

fn expiry_timestamp(days: u32) -> Result<String> {
    let expiry = OffsetDateTime::now_utc() + time::Duration::days(i64::from(days));
    expiry
        .format(&Rfc3339)
        .map_err(|err| ProxyError::Config(format!("failed to format expiry: {err}")))
}

pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let seq = KEY_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("gk_fallback_{ts_ms}_{seq}");
    }
    format!("gk-{}", hex_encode(&bytes))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
