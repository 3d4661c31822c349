//! SQLite 持久化适配器
//!
//! 三张表：sessions / messages / parts，按 session_id 与 message_id 建索引。
//! 单连接 + 锁，所有查询经 spawn_blocking 执行，不阻塞 async 运行时。

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::adapter::{PersistenceAdapter, PersistenceError};
use super::types::{MessageInfo, MessageWithParts, Part, PartPayload, Role, Session, SessionSummary};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    parent_id TEXT,
    title TEXT NOT NULL,
    directory TEXT NOT NULL,
    summary_additions INTEGER NOT NULL DEFAULT 0,
    summary_deletions INTEGER NOT NULL DEFAULT 0,
    summary_files INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    message_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    parent_id TEXT,
    role TEXT NOT NULL,
    agent TEXT,
    model TEXT,
    created_at INTEGER NOT NULL,
    metadata TEXT
);
CREATE TABLE IF NOT EXISTS parts (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    session_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    type TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_parts_message ON parts(message_id);
CREATE INDEX IF NOT EXISTS idx_parts_session ON parts(session_id);
";

const SESSION_COLUMNS: &str = "id, parent_id, title, directory, summary_additions, summary_deletions, \
     summary_files, created_at, updated_at, message_count, metadata";

const MESSAGE_COLUMNS: &str = "id, session_id, parent_id, role, agent, model, created_at, metadata";

#[derive(Clone)]
pub struct SqliteAdapter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAdapter {
    /// 打开（必要时创建）数据库文件并建表
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, PersistenceError> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
                }
            }
            let conn = Connection::open(&path)?;
            init_schema(&conn)?;
            Ok(conn)
        })
        .await
        .map_err(|e| PersistenceError::Join(e.to_string()))??;

        tracing::info!("SQLite session store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存数据库（测试或临时会话）
    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, PersistenceError>
    where
        F: FnOnce(&mut Connection) -> Result<R, PersistenceError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| PersistenceError::Join(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute("PRAGMA foreign_keys = ON;", [])?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn json_column(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<serde_json::Value>> {
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        title: row.get(2)?,
        directory: row.get(3)?,
        summary: SessionSummary {
            additions: row.get::<_, i64>(4)? as u64,
            deletions: row.get::<_, i64>(5)? as u64,
            files: row.get::<_, i64>(6)? as u64,
        },
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        message_count: row.get::<_, i64>(9)? as u64,
        metadata: json_column(10, row.get(10)?)?,
    })
}

fn message_info_from_row(row: &Row<'_>) -> rusqlite::Result<MessageInfo> {
    let role: String = row.get(3)?;
    let role = Role::parse(&role).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown role: {role}").into(),
        )
    })?;
    Ok(MessageInfo {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_id: row.get(2)?,
        role,
        agent: row.get(4)?,
        model: row.get(5)?,
        created_at: row.get(6)?,
        metadata: json_column(7, row.get(7)?)?,
    })
}

fn part_from_row(row: &Row<'_>) -> rusqlite::Result<Part> {
    let data: String = row.get(3)?;
    let payload: PartPayload = serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Part {
        id: row.get(0)?,
        message_id: row.get(1)?,
        session_id: row.get(2)?,
        payload,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn load_parts(conn: &Connection, message_id: &str) -> Result<Vec<Part>, PersistenceError> {
    let mut stmt = conn.prepare(
        "SELECT id, message_id, session_id, data, created_at, updated_at
         FROM parts WHERE message_id = ? ORDER BY position ASC",
    )?;
    let parts = stmt
        .query_map(params![message_id], part_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts)
}

#[async_trait]
impl PersistenceAdapter for SqliteAdapter {
    async fn save_session(&self, session: &Session) -> Result<(), PersistenceError> {
        let session = session.clone();
        let metadata = session.metadata.as_ref().map(|v| v.to_string());
        self.run_blocking(move |conn| {
            // ON CONFLICT DO UPDATE 而非 INSERT OR REPLACE：REPLACE 会先删行并级联删除消息
            conn.execute(
                "INSERT INTO sessions (id, parent_id, title, directory, summary_additions, summary_deletions,
                                       summary_files, created_at, updated_at, message_count, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    title = excluded.title,
                    directory = excluded.directory,
                    summary_additions = excluded.summary_additions,
                    summary_deletions = excluded.summary_deletions,
                    summary_files = excluded.summary_files,
                    updated_at = excluded.updated_at,
                    message_count = excluded.message_count,
                    metadata = excluded.metadata",
                params![
                    session.id,
                    session.parent_id,
                    session.title,
                    session.directory,
                    session.summary.additions as i64,
                    session.summary.deletions as i64,
                    session.summary.files as i64,
                    session.created_at,
                    session.updated_at,
                    session.message_count as i64,
                    metadata,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>, PersistenceError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
            Ok(conn
                .query_row(&sql, params![session_id], session_from_row)
                .optional()?)
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), PersistenceError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM parts WHERE session_id = ?", params![session_id])?;
            tx.execute("DELETE FROM messages WHERE session_id = ?", params![session_id])?;
            tx.execute("DELETE FROM sessions WHERE id = ?", params![session_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, PersistenceError> {
        self.run_blocking(|conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at ASC");
            let mut stmt = conn.prepare(&sql)?;
            let sessions = stmt
                .query_map([], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
        .await
    }

    async fn save_message(&self, message: &MessageWithParts) -> Result<(), PersistenceError> {
        let info = message.info.clone();
        let metadata = info.metadata.as_ref().map(|v| v.to_string());
        let parts = message
            .parts
            .iter()
            .map(|p| -> Result<_, PersistenceError> {
                Ok((p.clone(), serde_json::to_string(&p.payload)?))
            })
            .collect::<Result<Vec<_>, PersistenceError>>()?;

        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO messages (id, session_id, parent_id, role, agent, model, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    agent = excluded.agent,
                    model = excluded.model,
                    metadata = excluded.metadata",
                params![
                    info.id,
                    info.session_id,
                    info.parent_id,
                    info.role.as_str(),
                    info.agent,
                    info.model,
                    info.created_at,
                    metadata,
                ],
            )?;
            tx.execute("DELETE FROM parts WHERE message_id = ?", params![info.id])?;
            for (position, (part, data)) in parts.iter().enumerate() {
                tx.execute(
                    "INSERT INTO parts (id, message_id, session_id, position, type, data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        part.id,
                        part.message_id,
                        part.session_id,
                        position as i64,
                        part.payload.kind(),
                        data,
                        part.created_at,
                        part.updated_at,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageWithParts>, PersistenceError> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? AND id = ?");
            let info = conn
                .query_row(&sql, params![session_id, message_id], message_info_from_row)
                .optional()?;
            match info {
                Some(info) => {
                    let parts = load_parts(conn, &info.id)?;
                    Ok(Some(MessageWithParts { info, parts }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn get_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<MessageWithParts>, PersistenceError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE session_id = ? ORDER BY created_at ASC, rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let infos = stmt
                .query_map(params![session_id], message_info_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            infos
                .into_iter()
                .map(|info| -> Result<MessageWithParts, PersistenceError> {
                    let parts = load_parts(conn, &info.id)?;
                    Ok(MessageWithParts { info, parts })
                })
                .collect()
        })
        .await
    }

    async fn delete_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<(), PersistenceError> {
        let session_id = session_id.to_string();
        let message_id = message_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM parts WHERE message_id = ?", params![message_id])?;
            tx.execute(
                "DELETE FROM messages WHERE session_id = ? AND id = ?",
                params![session_id, message_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_messages(&self, session_id: &str) -> Result<(), PersistenceError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM parts WHERE session_id = ?", params![session_id])?;
            tx.execute("DELETE FROM messages WHERE session_id = ?", params![session_id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn clear(&self) -> Result<(), PersistenceError> {
        self.run_blocking(|conn| {
            conn.execute_batch("DELETE FROM parts; DELETE FROM messages; DELETE FROM sessions;")?;
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        // 写入是同步提交的；WAL 模式下把日志合并回主库
        self.run_blocking(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{new_id, now_ms};

    fn session(id: &str, parent: Option<&str>) -> Session {
        Session {
            id: id.to_string(),
            title: format!("title {id}"),
            parent_id: parent.map(str::to_string),
            directory: "/tmp/work".to_string(),
            summary: SessionSummary::default(),
            created_at: now_ms(),
            updated_at: now_ms(),
            message_count: 0,
            metadata: Some(serde_json::json!({"subagent_type": "general"})),
        }
    }

    fn message(session_id: &str, created_at: i64, text: &str) -> MessageWithParts {
        let id = new_id("msg");
        MessageWithParts {
            info: MessageInfo {
                id: id.clone(),
                session_id: session_id.to_string(),
                parent_id: None,
                role: Role::Assistant,
                agent: Some("build".into()),
                model: None,
                created_at,
                metadata: None,
            },
            parts: vec![
                Part {
                    id: new_id("prt"),
                    message_id: id.clone(),
                    session_id: session_id.to_string(),
                    payload: PartPayload::reasoning("thinking"),
                    created_at,
                    updated_at: created_at,
                },
                Part {
                    id: new_id("prt"),
                    message_id: id,
                    session_id: session_id.to_string(),
                    payload: PartPayload::text(text),
                    created_at,
                    updated_at: created_at,
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let adapter = SqliteAdapter::open(&path).await.unwrap();
        let s = session("ses_a", None);
        adapter.save_session(&s).await.unwrap();
        let first = message("ses_a", 20, "second");
        let earlier = message("ses_a", 10, "first");
        adapter.save_message(&first).await.unwrap();
        adapter.save_message(&earlier).await.unwrap();
        adapter.flush().await.unwrap();
        drop(adapter);

        let adapter = SqliteAdapter::open(&path).await.unwrap();
        assert_eq!(adapter.get_session("ses_a").await.unwrap(), Some(s));
        let messages = adapter.get_messages("ses_a").await.unwrap();
        let texts: Vec<String> = messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(messages[0].reasoning(), Some("thinking"));
        assert_eq!(messages[0].parts.len(), 2);
    }

    #[tokio::test]
    async fn test_save_session_upsert_keeps_messages() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let mut s = session("ses_a", None);
        adapter.save_session(&s).await.unwrap();
        adapter.save_message(&message("ses_a", 1, "hi")).await.unwrap();

        s.message_count = 1;
        s.title = "renamed".into();
        adapter.save_session(&s).await.unwrap();

        assert_eq!(adapter.get_messages("ses_a").await.unwrap().len(), 1);
        assert_eq!(adapter.get_session("ses_a").await.unwrap().unwrap().title, "renamed");
    }

    #[tokio::test]
    async fn test_message_upsert_replaces_parts() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter.save_session(&session("ses_a", None)).await.unwrap();
        let mut m = message("ses_a", 1, "partial");
        adapter.save_message(&m).await.unwrap();

        m.parts.pop();
        adapter.save_message(&m).await.unwrap();
        let stored = adapter.get_message("ses_a", &m.info.id).await.unwrap().unwrap();
        assert_eq!(stored.parts.len(), 1);
        assert!(adapter.get_message("ses_b", &m.info.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletes_and_clear() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        adapter.save_session(&session("ses_a", None)).await.unwrap();
        adapter.save_session(&session("ses_b", Some("ses_a"))).await.unwrap();
        let m = message("ses_a", 1, "x");
        adapter.save_message(&m).await.unwrap();
        adapter.save_message(&message("ses_a", 2, "y")).await.unwrap();

        adapter.delete_message("ses_a", &m.info.id).await.unwrap();
        assert_eq!(adapter.get_messages("ses_a").await.unwrap().len(), 1);

        adapter.delete_session("ses_a").await.unwrap();
        assert!(adapter.get_session("ses_a").await.unwrap().is_none());
        assert!(adapter.get_messages("ses_a").await.unwrap().is_empty());
        assert_eq!(adapter.list_sessions().await.unwrap().len(), 1);

        adapter.clear().await.unwrap();
        assert!(adapter.list_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_message_is_rejected() {
        let adapter = SqliteAdapter::open_in_memory().unwrap();
        let err = adapter.save_message(&message("ses_missing", 1, "x")).await;
        assert!(matches!(err, Err(PersistenceError::Sqlite(_))));
    }
}
