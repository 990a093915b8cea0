use anyhow::Result;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::{thread, time::Duration};

/** \brief 默认数据库文件名。 */
pub const DEFAULT_DB_PATH: &str = "diagramhub.db";

/**
 * \brief 持久化的用户设置文档及其版本号（乐观并发控制）。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsDocument {
    /** \brief UserAiSettings 的 JSON 序列化文本。 */
    pub document: String,
    /** \brief 每次成功替换后递增。 */
    pub version: i64,
}

/**
 * \brief 打开指定路径的数据库文件。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
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
        CREATE TABLE IF NOT EXISTS user_ai_settings (
            user_id    TEXT PRIMARY KEY,
            document   TEXT NOT NULL,
            version    INTEGER NOT NULL DEFAULT 1,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_settings_version_column(conn)?;
    Ok(())
}

fn ensure_settings_version_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(user_ai_settings)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "version" {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                "ALTER TABLE user_ai_settings ADD COLUMN version INTEGER NOT NULL DEFAULT 1",
                [],
            )
        })?;
    }
    Ok(())
}

/**
 * \brief 读取用户设置文档，不存在返回 None。
 */
pub fn load_settings_document(conn: &Connection, user_id: &str) -> Result<Option<SettingsDocument>> {
    let doc = conn
        .query_row(
            "SELECT document, version FROM user_ai_settings WHERE user_id=?1",
            params![user_id],
            |row| {
                Ok(SettingsDocument {
                    document: row.get(0)?,
                    version: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(doc)
}

/**
 * \brief 首次写入用户设置文档（版本 1）。
 * \return 已有记录时返回 false，不覆盖
 */
pub fn insert_settings_document(
    conn: &Connection,
    user_id: &str,
    document: &str,
    updated_at: i64,
) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "INSERT INTO user_ai_settings (user_id, document, version, updated_at)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(user_id) DO NOTHING",
            params![user_id, document, updated_at],
        )
    })?;
    Ok(rows == 1)
}

/**
 * \brief 以比较并交换的方式替换文档。
 * \param expected_version 读取时的版本号
 * \return 版本已被其他写入者推进时返回 false
 */
pub fn replace_settings_document(
    conn: &Connection,
    user_id: &str,
    document: &str,
    expected_version: i64,
    updated_at: i64,
) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE user_ai_settings
         SET document=?1, version=version + 1, updated_at=?2
         WHERE user_id=?3 AND version=?4",
            params![document, updated_at, user_id, expected_version],
        )
    })?;
    Ok(rows == 1)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并线性退避，最大尝试 6 次。
 */
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
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
