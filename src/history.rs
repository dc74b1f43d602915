//! 模块结果历史记录
//!
//! 每次回调结束后把模块输出写入历史（尽力而为，失败只记日志）。
//! 提供内存、JSON Lines 文件与 SQLite（feature = "async-sqlite"）三种存储。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::operation::{Operation, OutputLine};

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for HistoryError {
    fn from(e: sqlx::Error) -> Self {
        HistoryError::Database(e.to_string())
    }
}

/// 一条历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub module_name: String,
    pub display_name: String,
    pub target: String,
    /// 回调上报的状态；本地执行时为执行结果
    pub status: Option<bool>,
    pub lines: Vec<OutputLine>,
    pub result: Option<serde_json::Value>,
    /// 毫秒时间戳
    pub completed_at: i64,
}

impl HistoryEntry {
    pub fn from_operation(op: &dyn Operation, status: Option<bool>) -> Self {
        let spec = op.spec();
        Self {
            module_name: spec.module_name.clone(),
            display_name: spec.display_name.clone(),
            target: spec.target_str(),
            status,
            lines: op.output().lines().to_vec(),
            result: op.output().result().cloned(),
            completed_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 历史存储接口
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError>;

    /// 最近 limit 条，按写入顺序
    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError>;
}

/// 内存历史存储，保留最近 max_entries 条
pub struct MemoryHistoryStore {
    entries: RwLock<Vec<HistoryEntry>>,
    max_entries: usize,
}

impl MemoryHistoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        let n = entries.len();
        if n > self.max_entries {
            entries.drain(0..n - self.max_entries);
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let entries = self.entries.read().await;
        Ok(entries[entries.len().saturating_sub(limit)..].to_vec())
    }
}

/// JSON Lines 文件存储：每条记录一行；父目录不存在时自动创建
#[derive(Debug)]
pub struct JsonlHistoryStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlHistoryStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<HistoryEntry> = data
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match serde_json::from_str(l) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!("Skipping malformed history line: {}", e);
                    None
                }
            })
            .collect();
        Ok(entries[entries.len().saturating_sub(limit)..].to_vec())
    }
}

/// SQLite 历史存储
#[cfg(feature = "async-sqlite")]
pub struct SqliteHistoryStore {
    pool: sqlx::sqlite::SqlitePool,
}

#[cfg(feature = "async-sqlite")]
impl SqliteHistoryStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS module_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                module_name TEXT NOT NULL,
                display_name TEXT NOT NULL,
                target TEXT NOT NULL,
                status INTEGER,
                lines TEXT NOT NULL,
                result TEXT,
                completed_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[cfg(feature = "async-sqlite")]
#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        let lines = serde_json::to_string(&entry.lines)?;
        let result = entry.result.as_ref().map(|v| v.to_string());
        sqlx::query(
            "INSERT INTO module_history
             (module_name, display_name, target, status, lines, result, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.module_name)
        .bind(&entry.display_name)
        .bind(&entry.target)
        .bind(entry.status)
        .bind(&lines)
        .bind(&result)
        .bind(entry.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>, HistoryError> {
        use sqlx::Row;

        let rows = sqlx::query(
            "SELECT module_name, display_name, target, status, lines, result, completed_at
             FROM module_history ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows.into_iter().rev() {
            entries.push(HistoryEntry {
                module_name: row.get("module_name"),
                display_name: row.get("display_name"),
                target: row.get("target"),
                status: row.get("status"),
                lines: serde_json::from_str(row.get::<String, _>("lines").as_str())?,
                result: row
                    .get::<Option<String>, _>("result")
                    .and_then(|s| serde_json::from_str(&s).ok()),
                completed_at: row.get("completed_at"),
            });
        }
        Ok(entries)
    }
}

/// 按配置创建历史存储
///
/// backend = "sqlite" 且启用 async-sqlite 时使用 SQLite；"jsonl" 使用文件；其余使用内存
pub async fn create_history_store(backend: &str, path: Option<&Path>) -> Arc<dyn HistoryStore> {
    match (backend, path) {
        #[cfg(feature = "async-sqlite")]
        ("sqlite", Some(path)) => match SqliteHistoryStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite history store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite history store, falling back to memory: {}", e);
            }
        },
        ("jsonl", Some(path)) => {
            tracing::info!("Using JSONL history store: {:?}", path);
            return Arc::new(JsonlHistoryStore::new(path));
        }
        (other, _) if other != "memory" => {
            tracing::warn!("History backend '{}' unavailable, using memory store", other);
        }
        _ => {}
    }
    Arc::new(MemoryHistoryStore::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationSpec, OperationTarget, RawModuleOperation};

    fn entry(name: &str) -> HistoryEntry {
        let mut op = RawModuleOperation::new(OperationSpec::new(
            "post",
            name,
            "post_msf_job",
            name,
            OperationTarget::None,
        ));
        op.output_mut().log_good("ok");
        HistoryEntry::from_operation(&op, Some(true))
    }

    #[tokio::test]
    async fn test_memory_store_caps_entries() {
        let store = MemoryHistoryStore::new(2);
        store.append(entry("a")).await.unwrap();
        store.append(entry("b")).await.unwrap();
        store.append(entry("c")).await.unwrap();
        let recent = store.recent(10).await.unwrap();
        let names: Vec<_> = recent.iter().map(|e| e.module_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_jsonl_store_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::new(dir.path().join("nested/history.jsonl"));
        assert!(store.recent(5).await.unwrap().is_empty());

        store.append(entry("a")).await.unwrap();
        store.append(entry("b")).await.unwrap();

        let recent = store.recent(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].module_name, "b");
        assert_eq!(recent[0].status, Some(true));
        assert_eq!(recent[0].lines[0].text, "ok");
    }

    #[tokio::test]
    async fn test_create_store_unknown_backend_falls_back() {
        let store = create_history_store("nope", None).await;
        store.append(entry("a")).await.unwrap();
        assert_eq!(store.recent(5).await.unwrap().len(), 1);
    }
}
