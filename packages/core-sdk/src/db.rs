use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use tracing::warn;

use crate::config::{RemoteConfig, RemoteConfigSource};
use crate::models::{ModelDescriptor, ProviderConfig, ProviderType};
use crate::registry::{InMemoryRegistry, ProviderRegistry};

const REMOTE_CONFIG_KEY: &str = "remote_config";
const TELEMETRY_KEY: &str = "telemetry_enabled";

/**
 * \brief 打开默认数据库文件（本地目录下的 modelrace.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    open_db("modelrace.db")
}

pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS providers (
            provider_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            provider_type TEXT NOT NULL DEFAULT 'openai-compatible',
            api_key  TEXT,
            base_url TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS models (
            provider_id TEXT NOT NULL REFERENCES providers(provider_id),
            model_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            position INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (provider_id, model_id)
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_column(conn, "providers", "default_base_url", "TEXT NOT NULL DEFAULT ''")?;
    ensure_column(conn, "providers", "temperature", "REAL")?;
    ensure_column(conn, "providers", "max_tokens", "INTEGER")?;
    Ok(())
}

/** \brief 旧库缺列时补上。 */
fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                &format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"),
                [],
            )
        })?;
    }
    Ok(())
}

fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_config(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_config(conn, key)?.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 新增或覆盖 Provider，模型列表整体替换。
 */
pub fn upsert_provider(conn: &Connection, provider: &ProviderConfig) -> Result<()> {
    if provider.provider_id.trim().is_empty() {
        return Err(anyhow!("provider id is required"));
    }
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO providers (provider_id, name, provider_type, api_key, base_url, default_base_url, temperature, max_tokens)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(provider_id) DO UPDATE SET
                name=excluded.name, provider_type=excluded.provider_type, api_key=excluded.api_key,
                base_url=excluded.base_url, default_base_url=excluded.default_base_url,
                temperature=excluded.temperature, max_tokens=excluded.max_tokens",
            params![
                provider.provider_id,
                provider.name,
                provider.provider_type.as_str(),
                provider.api_key,
                provider.base_url,
                provider.default_base_url,
                provider.temperature,
                provider.max_tokens,
            ],
        )
    })?;
    retry_on_locked(|| {
        conn.execute(
            "DELETE FROM models WHERE provider_id=?1",
            params![provider.provider_id],
        )
    })?;
    for (position, model) in provider.models.iter().enumerate() {
        retry_on_locked(|| {
            conn.execute(
                "INSERT INTO models (provider_id, model_id, display_name, position) VALUES (?1, ?2, ?3, ?4)",
                params![provider.provider_id, model.id, model.display_name, position as i64],
            )
        })?;
    }
    Ok(())
}

/**
 * \brief 删除 Provider 及其模型，返回是否存在。
 */
pub fn delete_provider(conn: &Connection, provider_id: &str) -> Result<bool> {
    retry_on_locked(|| conn.execute("DELETE FROM models WHERE provider_id=?1", params![provider_id]))?;
    let rows = retry_on_locked(|| {
        conn.execute("DELETE FROM providers WHERE provider_id=?1", params![provider_id])
    })?;
    Ok(rows > 0)
}

/**
 * \brief 列出所有 Provider（按 ID 排序）。
 */
pub fn list_providers(conn: &Connection) -> Result<Vec<ProviderConfig>> {
    let mut stmt = conn.prepare(
        "SELECT provider_id, name, provider_type, api_key, base_url, default_base_url, temperature, max_tokens
         FROM providers ORDER BY provider_id ASC",
    )?;
    let mut providers = stmt
        .query_map([], provider_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for provider in &mut providers {
        provider.models = load_models(conn, &provider.provider_id)?;
    }
    Ok(providers)
}

pub fn get_provider(conn: &Connection, provider_id: &str) -> Result<Option<ProviderConfig>> {
    let provider = conn
        .query_row(
            "SELECT provider_id, name, provider_type, api_key, base_url, default_base_url, temperature, max_tokens
             FROM providers WHERE provider_id=?1",
            params![provider_id],
            provider_from_row,
        )
        .optional()?;
    match provider {
        Some(mut provider) => {
            provider.models = load_models(conn, provider_id)?;
            Ok(Some(provider))
        }
        None => Ok(None),
    }
}

fn provider_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProviderConfig> {
    let provider_type: String = row.get(2)?;
    Ok(ProviderConfig {
        provider_id: row.get(0)?,
        name: row.get(1)?,
        provider_type: ProviderType::parse(&provider_type),
        api_key: row.get(3)?,
        base_url: row.get(4)?,
        default_base_url: row.get(5)?,
        temperature: row.get(6)?,
        max_tokens: row.get(7)?,
        models: Vec::new(),
    })
}

fn load_models(conn: &Connection, provider_id: &str) -> Result<Vec<ModelDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT model_id, display_name FROM models WHERE provider_id=?1 ORDER BY position ASC",
    )?;
    let rows = stmt
        .query_map(params![provider_id], |row| {
            Ok(ModelDescriptor {
                id: row.get(0)?,
                display_name: row.get(1)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 读取远程执行配置，未保存时为默认值。
 */
pub fn get_remote_config(conn: &Connection) -> Result<RemoteConfig> {
    match get_config(conn, REMOTE_CONFIG_KEY)? {
        Some(raw) => serde_json::from_str(&raw).context("decode stored remote config"),
        None => Ok(RemoteConfig::default()),
    }
}

pub fn set_remote_config(conn: &Connection, config: &RemoteConfig) -> Result<()> {
    set_config(conn, REMOTE_CONFIG_KEY, &serde_json::to_string(config)?)
}

/**
 * \brief 读取遥测开关（默认关闭）。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, TELEMETRY_KEY, false)
}

/**
 * \brief 设置遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, TELEMETRY_KEY, enabled)
}

fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                warn!(attempt, ?backoff, "database locked, retrying");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/**
 * \brief SQLite 存储：同时充当 Provider 注册表与远程配置来源。
 *
 * 异步路径上的读取走 spawn_blocking，锁等待与 retry_on_locked 的退避不占用运行时线程。
 */
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /** \brief 打开并迁移指定数据库。 */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(open_db(path)?)
    }

    pub fn open_default() -> Result<Self> {
        Self::from_connection(open_default_db()?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /** \brief 在持锁状态下访问连接。 */
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection poisoned"))?;
        f(&conn)
    }

    /** \brief 在阻塞线程池中持锁访问连接。 */
    pub async fn with_conn_blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| anyhow!("database connection poisoned"))?;
            f(&conn)
        })
        .await
        .context("database task failed")?
    }
}

#[async_trait]
impl ProviderRegistry for SqliteStore {
    fn get_provider(&self, provider_id: &str) -> Option<ProviderConfig> {
        self.with_conn(|conn| get_provider(conn, provider_id))
            .unwrap_or_else(|err| {
                warn!(provider = provider_id, error = %err, "provider lookup failed");
                None
            })
    }

    fn all_providers(&self) -> Vec<ProviderConfig> {
        self.with_conn(list_providers).unwrap_or_else(|err| {
            warn!(error = %err, "listing providers failed");
            Vec::new()
        })
    }

    async fn snapshot(&self) -> Option<InMemoryRegistry> {
        let providers = self
            .with_conn_blocking(list_providers)
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "loading provider snapshot failed");
                Vec::new()
            });
        Some(InMemoryRegistry::new(providers))
    }
}

#[async_trait]
impl RemoteConfigSource for SqliteStore {
    async fn load_remote_config(&self) -> Result<RemoteConfig> {
        self.with_conn_blocking(get_remote_config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn provider(id: &str, models: &[&str]) -> ProviderConfig {
        ProviderConfig {
            provider_id: id.to_string(),
            name: id.to_uppercase(),
            provider_type: ProviderType::Anthropic,
            api_key: Some("sk-1".to_string()),
            base_url: String::new(),
            default_base_url: "https://api.anthropic.com/v1".to_string(),
            temperature: Some(0.2),
            max_tokens: None,
            models: models
                .iter()
                .map(|m| ModelDescriptor {
                    id: m.to_string(),
                    display_name: format!("{m} display"),
                })
                .collect(),
        }
    }

    #[test]
    fn test_provider_upsert_and_models() {
        let conn = mem_conn();
        upsert_provider(&conn, &provider("claude", &["b", "a"])).expect("insert");
        upsert_provider(&conn, &provider("abc", &[])).expect("insert 2");

        let list = list_providers(&conn).expect("list");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].provider_id, "abc");

        let one = get_provider(&conn, "claude").expect("get").expect("exists");
        assert_eq!(one.provider_type, ProviderType::Anthropic);
        assert_eq!(one.effective_base_url(), "https://api.anthropic.com/v1");
        assert_eq!(one.temperature, Some(0.2));
        let ids: Vec<_> = one.models.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["b", "a"]);

        let mut updated = provider("claude", &["c"]);
        updated.api_key = None;
        upsert_provider(&conn, &updated).expect("update");
        let one = get_provider(&conn, "claude").expect("get").expect("exists");
        assert_eq!(one.api_key(), None);
        assert_eq!(one.models.len(), 1);
    }

    #[test]
    fn test_delete_provider() {
        let conn = mem_conn();
        upsert_provider(&conn, &provider("claude", &["a"])).expect("insert");
        assert!(delete_provider(&conn, "claude").expect("delete"));
        assert!(!delete_provider(&conn, "claude").expect("delete again"));
        assert!(get_provider(&conn, "claude").expect("get").is_none());
    }

    #[test]
    fn test_remote_config_roundtrip_and_defaults() {
        let conn = mem_conn();
        assert_eq!(get_remote_config(&conn).expect("default"), RemoteConfig::default());
        let cfg = RemoteConfig {
            enabled: true,
            server_url: "https://ai.example.com".into(),
            retry_attempts: 5,
            ..Default::default()
        };
        set_remote_config(&conn, &cfg).expect("save");
        assert_eq!(get_remote_config(&conn).expect("load"), cfg);
    }

    #[test]
    fn test_telemetry_flag() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).expect("default"));
        set_telemetry_enabled(&conn, true).expect("enable");
        assert!(get_telemetry_enabled(&conn).expect("read"));
    }

    #[test]
    fn test_migrate_adds_missing_columns() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE providers (provider_id TEXT PRIMARY KEY, name TEXT NOT NULL,
             provider_type TEXT NOT NULL DEFAULT 'openai-compatible', api_key TEXT,
             base_url TEXT NOT NULL DEFAULT '');",
        )
        .expect("legacy schema");
        migrate(&conn).expect("migrate");
        upsert_provider(&conn, &provider("claude", &[])).expect("insert after migrate");
    }

    #[tokio::test]
    async fn test_store_serves_registry_and_remote_config() {
        let store = SqliteStore::in_memory().expect("store");
        store
            .with_conn(|conn| upsert_provider(conn, &provider("claude", &["haiku"])))
            .expect("insert");
        assert!(store.get_provider("claude").is_some());
        assert!(store.get_provider("missing").is_none());
        assert_eq!(store.all_providers().len(), 1);
        assert!(!store.load_remote_config().await.expect("load").enabled);
    }

    #[tokio::test]
    async fn test_snapshot_waits_for_lock_off_the_runtime() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let store = Arc::new(SqliteStore::in_memory().expect("store"));
        store
            .with_conn(|conn| upsert_provider(conn, &provider("claude", &["haiku"])))
            .expect("insert");

        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .with_conn(|_| {
                        locked_tx.send(()).ok();
                        thread::sleep(Duration::from_millis(300));
                        Ok(())
                    })
                    .expect("hold lock");
            })
        };
        locked_rx.recv().expect("lock taken");

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let snapshot = store.snapshot().await.expect("snapshot");
        let seen = ticks.load(Ordering::SeqCst);
        ticker.abort();
        holder.join().expect("holder thread");

        assert!(snapshot.get_provider("claude").is_some());
        assert!(seen >= 5, "runtime stalled while waiting for the lock: {seen} ticks");
    }
}
