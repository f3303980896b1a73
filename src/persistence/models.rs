//! 数据模型：Occurrence、Task、Thought 及其状态
//!
//! 所有记录都携带 agent_occurrence_id；思考的 occurrence 永远继承自所属任务，不能单独指定。

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// 共享作用域哨兵：表示智能体级（非某个实例私有）的记录
pub const SHARED_OCCURRENCE: &str = "__shared__";

/// 递归细化深度上限（0 = 初始思考，1 = 一次细化）
pub const MAX_THOUGHT_DEPTH: u8 = 1;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 运行实例 ID（或共享哨兵）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OccurrenceId(String);

impl OccurrenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn shared() -> Self {
        Self(SHARED_OCCURRENCE.to_string())
    }

    pub fn is_shared(&self) -> bool {
        self.0 == SHARED_OCCURRENCE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToSql for OccurrenceId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for OccurrenceId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().map(OccurrenceId::new)
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "active" => Some(TaskStatus::Active),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        TaskStatus::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown task status '{s}'").into()))
    }
}

/// 思考状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ThoughtStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ThoughtStatus::Pending => "pending",
            ThoughtStatus::Processing => "processing",
            ThoughtStatus::Completed => "completed",
            ThoughtStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ThoughtStatus::Pending),
            "processing" => Some(ThoughtStatus::Processing),
            "completed" => Some(ThoughtStatus::Completed),
            "failed" => Some(ThoughtStatus::Failed),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, ThoughtStatus::Pending | ThoughtStatus::Processing)
    }
}

impl ToSql for ThoughtStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ThoughtStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        ThoughtStatus::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown thought status '{s}'").into()))
    }
}

/// 任务上下文：频道、发起用户、关联 ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    pub channel_id: String,
    pub user_id: Option<String>,
    pub correlation_id: String,
}

/// 任务：外部或内部触发的一个工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub channel_id: String,
    pub description: String,
    pub agent_occurrence_id: OccurrenceId,
    pub status: TaskStatus,
    /// 数值越大越优先
    pub priority: i32,
    pub created_at: i64,
    pub updated_at: i64,
    pub parent_task_id: Option<String>,
    pub context: TaskContext,
    /// 已消耗的评估失败重试次数
    pub retry_count: u32,
    /// 终止于 FAILED 时的人类可读原因
    pub failure_reason: Option<String>,
}

impl Task {
    pub fn new(
        occurrence: OccurrenceId,
        channel_id: impl Into<String>,
        description: impl Into<String>,
        priority: i32,
    ) -> Self {
        let channel_id = channel_id.into();
        let now = now_millis();
        Self {
            task_id: format!("task_{}", uuid::Uuid::new_v4()),
            channel_id: channel_id.clone(),
            description: description.into(),
            agent_occurrence_id: occurrence,
            status: TaskStatus::Pending,
            priority,
            created_at: now,
            updated_at: now,
            parent_task_id: None,
            context: TaskContext {
                channel_id,
                user_id: None,
                correlation_id: uuid::Uuid::new_v4().to_string(),
            },
            retry_count: 0,
            failure_reason: None,
        }
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.context.user_id = Some(user_id.into());
        self
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// 思考上下文
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThoughtContext {
    pub channel_id: String,
    pub correlation_id: String,
    pub round_number: u64,
}

/// 思考：属于某个任务的一步推理
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub thought_id: String,
    pub source_task_id: String,
    pub agent_occurrence_id: OccurrenceId,
    pub status: ThoughtStatus,
    pub round_number: u64,
    pub depth: u8,
    pub parent_thought_id: Option<String>,
    pub content: String,
    pub context: ThoughtContext,
    /// 最终动作（ACTION_COMPLETE 后写入）
    pub final_action: Option<serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Thought {
    /// 为任务创建 depth 0 的种子思考；occurrence 与频道继承自任务
    pub fn seed(task: &Task, round_number: u64) -> Self {
        let now = now_millis();
        Self {
            thought_id: format!("th_{}", uuid::Uuid::new_v4()),
            source_task_id: task.task_id.clone(),
            agent_occurrence_id: task.agent_occurrence_id.clone(),
            status: ThoughtStatus::Pending,
            round_number,
            depth: 0,
            parent_thought_id: None,
            content: task.description.clone(),
            context: ThoughtContext {
                channel_id: task.channel_id.clone(),
                correlation_id: task.context.correlation_id.clone(),
                round_number,
            },
            final_action: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 基于父思考创建下一层细化思考（不检查深度上限，由调用方负责）
    pub fn child_of(parent: &Thought, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            thought_id: format!("th_{}", uuid::Uuid::new_v4()),
            source_task_id: parent.source_task_id.clone(),
            agent_occurrence_id: parent.agent_occurrence_id.clone(),
            status: ThoughtStatus::Pending,
            round_number: parent.round_number,
            depth: parent.depth.saturating_add(1),
            parent_thought_id: Some(parent.thought_id.clone()),
            content: content.into(),
            context: parent.context.clone(),
            final_action: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_inherits_task_scope() {
        let task = Task::new(OccurrenceId::new("a"), "general", "hello", 0);
        let thought = Thought::seed(&task, 4);
        assert_eq!(thought.agent_occurrence_id, task.agent_occurrence_id);
        assert_eq!(thought.context.channel_id, "general");
        assert_eq!(thought.context.round_number, 4);
        assert_eq!(thought.depth, 0);

        let child = Thought::child_of(&thought, "refine");
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_thought_id.as_deref(), Some(thought.thought_id.as_str()));
    }

    #[test]
    fn test_status_round_trip_strings() {
        assert_eq!(TaskStatus::parse("active"), Some(TaskStatus::Active));
        assert_eq!(TaskStatus::parse("bogus"), None);
        assert!(TaskStatus::Failed.is_terminal());
        assert!(ThoughtStatus::Processing.is_open());
        assert!(!ThoughtStatus::Completed.is_open());
        assert!(OccurrenceId::shared().is_shared());
    }
}
