//! 持久层：任务、思考与轮次标记（SQLite）
//!
//! 多个运行实例可以共享同一个数据库文件；每次读写都显式带 occurrence 过滤（或共享哨兵），
//! 任务 ID 的主键唯一约束是跨实例互斥的唯一原语（见 processor::claims）。

mod rounds;
mod tasks;
mod thoughts;

pub mod models;

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::core::{raise_consistency_alarm, StoreError};

pub use models::{
    now_millis, OccurrenceId, Task, TaskContext, TaskStatus, Thought, ThoughtContext,
    ThoughtStatus, MAX_THOUGHT_DEPTH, SHARED_OCCURRENCE,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL,
    agent_occurrence_id TEXT NOT NULL,
    description TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    parent_task_id TEXT,
    context_json TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_occurrence_status
    ON tasks(agent_occurrence_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_occurrence_channel_status
    ON tasks(agent_occurrence_id, channel_id, status);

CREATE TABLE IF NOT EXISTS thoughts (
    thought_id TEXT PRIMARY KEY,
    source_task_id TEXT NOT NULL,
    agent_occurrence_id TEXT NOT NULL,
    status TEXT NOT NULL,
    round_number INTEGER NOT NULL,
    depth INTEGER NOT NULL CHECK (depth >= 0 AND depth <= 1),
    parent_thought_id TEXT,
    content TEXT NOT NULL,
    context_json TEXT NOT NULL,
    final_action_json TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thoughts_occurrence_status
    ON thoughts(agent_occurrence_id, status);
CREATE INDEX IF NOT EXISTS idx_thoughts_source_task
    ON thoughts(source_task_id);

CREATE TABLE IF NOT EXISTS processing_rounds (
    agent_occurrence_id TEXT PRIMARY KEY,
    round_number INTEGER NOT NULL,
    completed_at INTEGER NOT NULL
);
";

/// SQLite 存储；连接由 tokio Mutex 保护，单条语句即一次原子写
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::InvalidValue(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // WAL：多个实例进程并发读写同一文件
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    /// 内存数据库（测试 / 单实例试运行）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// WAL checkpoint（关闭前调用）
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    /// 测试用：直接执行 SQL（如安装触发器模拟写入失败）
    #[cfg(test)]
    pub(crate) async fn execute_batch_for_test(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.lock().await.execute_batch(sql)?;
        Ok(())
    }
}

/// 作用域写入未命中时区分「不存在」与「属于其它实例」；后者触发一致性告警
fn classify_miss(
    conn: &Connection,
    entity: &'static str,
    id: &str,
    occurrence: &OccurrenceId,
) -> StoreError {
    let sql = match entity {
        "thought" => "SELECT agent_occurrence_id FROM thoughts WHERE thought_id = ?1",
        _ => "SELECT agent_occurrence_id FROM tasks WHERE task_id = ?1",
    };
    let owner: Option<String> = match conn.query_row(sql, params![id], |row| row.get(0)).optional() {
        Ok(owner) => owner,
        Err(e) => return StoreError::Sqlite(e),
    };
    match owner {
        Some(_) => {
            raise_consistency_alarm(entity, id, occurrence.as_str());
            StoreError::OwnershipViolation {
                entity,
                id: id.to_string(),
                occurrence: occurrence.to_string(),
            }
        }
        None => StoreError::NotFound {
            entity,
            id: id.to_string(),
        },
    }
}

/// 读取 JSON 列并反序列化
fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// LIMIT 参数：None 表示不限（SQLite 中 -1）
fn limit_param(limit: Option<usize>) -> i64 {
    limit.map(|l| l as i64).unwrap_or(-1)
}
