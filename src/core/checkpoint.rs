//! 任务检查点：记录格式与存储
//!
//! - InMemoryCheckpointStore：进程内（默认）
//! - SqliteCheckpointStore：rusqlite，快照以 JSON 存一列；阻塞 I/O 交给 spawn_blocking

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::error::CheckpointError;
use super::task::{TaskId, TaskState};

/// 检查点记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub task_id: TaskId,
    pub snapshot: TaskState,
    pub created_at: DateTime<Utc>,
    /// 创建时在等待队列中的位置（仅 queued 任务）
    #[serde(default)]
    pub queue_position: Option<usize>,
    /// 创建时尚未决定的审批请求 id
    #[serde(default)]
    pub pending_approvals: Vec<String>,
}

impl CheckpointRecord {
    pub fn new(snapshot: TaskState) -> Self {
        Self {
            checkpoint_id: format!("ckpt_{}", uuid::Uuid::new_v4()),
            task_id: snapshot.id.clone(),
            snapshot,
            created_at: Utc::now(),
            queue_position: None,
            pending_approvals: Vec::new(),
        }
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError>;

    async fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// 某任务的所有检查点，按创建时间升序
    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError>;

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, CheckpointError>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    records: RwLock<HashMap<String, CheckpointRecord>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        self.records
            .write()
            .await
            .insert(record.checkpoint_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        Ok(self.records.read().await.get(checkpoint_id).cloned())
    }

    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let mut records: Vec<CheckpointRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.records.write().await.remove(checkpoint_id).is_some())
    }
}

/// SQLite 检查点存储
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id, created_at);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CheckpointError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&conn)
        })
        .await?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let json = serde_json::to_string(record)?;
        let id = record.checkpoint_id.clone();
        let task_id = record.task_id.clone();
        let created_at = record.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.with_conn(move |conn| {
            conn.execute(
                r#"
                INSERT INTO checkpoints(id, task_id, created_at, record)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET record=excluded.record
                "#,
                params![id, task_id, created_at, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let id = checkpoint_id.to_string();
        let json = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row("SELECT record FROM checkpoints WHERE id = ?1", params![id], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?)
            })
            .await?;
        json.map(|j| serde_json::from_str(&j).map_err(CheckpointError::from))
            .transpose()
    }

    async fn list(&self, task_id: &str) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        let task_id = task_id.to_string();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT record FROM checkpoints WHERE task_id = ?1 ORDER BY created_at ASC")?;
                let rows = stmt
                    .query_map(params![task_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(CheckpointError::from))
            .collect()
    }

    async fn delete(&self, checkpoint_id: &str) -> Result<bool, CheckpointError> {
        let id = checkpoint_id.to_string();
        self.with_conn(move |conn| Ok(conn.execute("DELETE FROM checkpoints WHERE id = ?1", params![id])? > 0))
            .await
    }
}
