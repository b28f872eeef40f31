use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{Connection, OpenFlags, OptionalExtension as _, params};
use serde_json::Value;

use crate::config::{self, Config};

pub const STORE_DB_FILENAME: &str = "replay.db";
const SCHEMA_VERSION: i32 = 1;

/// Durable key-value store. Values are JSON documents; a write replaces the previous value
/// of its key (last write wins), and no transaction spans more than one call.
#[derive(Debug, Clone)]
pub struct KeyValueStore {
    db_path: PathBuf,
}

impl KeyValueStore {
    pub fn from_config(config: &Config) -> anyhow::Result<Option<Self>> {
        let Some(storage) = config.storage.as_ref() else {
            return Ok(None);
        };
        let base_path = config::expand_tilde_path(&storage.path)?;
        Ok(Some(Self::open(base_path.join(STORE_DB_FILENAME))?))
    }

    pub fn open(db_path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let store = Self { db_path };
        store.init()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Returns the stored values for `keys`; keys without a value are absent from the map.
    pub async fn get(&self, keys: Vec<String>) -> anyhow::Result<BTreeMap<String, Value>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || get_blocking(&db_path, &keys))
            .await
            .context("join kv get task")?
    }

    pub async fn set(&self, entries: BTreeMap<String, Value>) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || set_blocking(&db_path, &entries))
            .await
            .context("join kv set task")?
    }

    pub async fn remove(&self, keys: Vec<String>) -> anyhow::Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || remove_blocking(&db_path, &keys))
            .await
            .context("join kv remove task")?
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)?;
        Ok(())
    }
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS kv (
                  key TEXT PRIMARY KEY NOT NULL,
                  value_json TEXT NOT NULL,
                  updated_at_unix_ms INTEGER NOT NULL
                );
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported {STORE_DB_FILENAME} schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn get_blocking(path: &Path, keys: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT value_json FROM kv WHERE key = ?1")
        .context("prepare kv get")?;

    let mut values = BTreeMap::new();
    for key in keys {
        let raw: Option<String> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()
            .with_context(|| format!("read kv key `{key}`"))?;
        let Some(raw) = raw else { continue };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("deserialize kv key `{key}`"))?;
        values.insert(key.clone(), value);
    }
    Ok(values)
}

fn set_blocking(path: &Path, entries: &BTreeMap<String, Value>) -> anyhow::Result<()> {
    let mut conn = open_connection(path)?;
    let now = now_unix_ms();
    let tx = conn.transaction().context("begin kv set transaction")?;
    for (key, value) in entries {
        let value_json = serde_json::to_string(value)
            .with_context(|| format!("serialize kv key `{key}`"))?;
        tx.execute(
            r#"
            INSERT INTO kv (key, value_json, updated_at_unix_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
              value_json = excluded.value_json,
              updated_at_unix_ms = excluded.updated_at_unix_ms
            "#,
            params![key, value_json, now],
        )
        .with_context(|| format!("write kv key `{key}`"))?;
    }
    tx.commit().context("commit kv set transaction")?;
    Ok(())
}

fn remove_blocking(path: &Path, keys: &[String]) -> anyhow::Result<usize> {
    let conn = open_connection(path)?;
    let mut removed = 0;
    for key in keys {
        removed += conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .with_context(|| format!("delete kv key `{key}`"))?;
    }
    Ok(removed)
}

fn now_unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
