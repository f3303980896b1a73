//! 跨实例的共享决策认领
//!
//! 共享决策记录是一个 ID 确定（决策类型 + 日期）的任务；认领就是一次「不存在则插入」，
//! 主键唯一约束是唯一的同步原语：插入成功者负责处理，失败者只读取结果。
//! ClaimCoordinator 把这层策略隔离在 trait 之后，另一种语义（每个实例各自决策）可以替换进来而不影响管线。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::core::{RuntimeError, StoreError};
use crate::persistence::{now_millis, OccurrenceId, Store, Task, TaskStatus};

/// 决策键：类型 + 日期，文本形式如 `WAKEUP_2025-10-27`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    kind: String,
    date: NaiveDate,
}

impl DecisionKey {
    pub fn new(kind: &str, date: NaiveDate) -> Self {
        Self {
            kind: kind.trim().to_uppercase(),
            date,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// 全体实例共用的记录 ID，如 `WAKEUP_SHARED_20251027`
    pub fn shared_task_id(&self) -> String {
        format!("{}_SHARED_{}", self.kind, self.date.format("%Y%m%d"))
    }

    /// 单个实例私有的记录 ID，如 `WAKEUP_a_20251027`
    pub fn occurrence_task_id(&self, occurrence: &OccurrenceId) -> String {
        format!("{}_{}_{}", self.kind, occurrence, self.date.format("%Y%m%d"))
    }
}

impl fmt::Display for DecisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.date.format("%Y-%m-%d"))
    }
}

impl FromStr for DecisionKey {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RuntimeError::Lifecycle(format!("invalid decision key '{s}', expected KIND_YYYY-MM-DD"));
        let (kind, date) = s.rsplit_once('_').ok_or_else(invalid)?;
        if kind.trim().is_empty() {
            return Err(invalid());
        }
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
        Ok(Self::new(kind, date))
    }
}

/// 共享决策的认领与查询
#[async_trait]
pub trait ClaimCoordinator: Send + Sync {
    /// 决策记录的任务 ID（生命周期任务以它为父任务）
    fn record_id(&self, key: &DecisionKey) -> String;

    /// 尝试认领；true 表示本实例负责处理，false 表示已被认领
    async fn try_claim_shared_task(&self, key: &DecisionKey) -> Result<bool, StoreError>;

    /// 接管一条停滞的认领：原认领者是本实例（崩溃后重启），或认领已超过 stale_after 没有结果
    async fn take_over_stale_claim(&self, key: &DecisionKey, stale_after: Duration) -> Result<bool, StoreError>;

    async fn is_shared_task_completed(&self, key: &DecisionKey) -> Result<bool, StoreError>;

    async fn get_latest_shared_task(&self, key: &DecisionKey) -> Result<Option<Task>, StoreError>;

    /// 认领者在处理完成后写入结果
    async fn complete_shared_task(&self, key: &DecisionKey) -> Result<(), StoreError>;

    async fn fail_shared_task(&self, key: &DecisionKey, reason: &str) -> Result<(), StoreError>;
}

/// 记录都放在共享作用域下，区别只在于 ID 怎么生成
struct RecordScope {
    store: Arc<Store>,
    claimer: OccurrenceId,
    channel_id: String,
}

impl RecordScope {
    /// 认领者记录在 context.user_id
    fn record(&self, record_id: String, key: &DecisionKey) -> Task {
        Task::new(
            OccurrenceId::shared(),
            self.channel_id.as_str(),
            format!("{key} decision (claimed by {})", self.claimer),
            0,
        )
        .with_id(record_id)
        .with_status(TaskStatus::Active)
        .with_user(self.claimer.as_str())
    }

    async fn claim(&self, record_id: String, key: &DecisionKey) -> Result<bool, StoreError> {
        let record = self.record(record_id, key);
        let claimed = self.store.insert_task_if_absent(&record).await?;
        if claimed {
            tracing::info!(decision = %key, record_id = %record.task_id, occurrence = %self.claimer, "Shared decision claimed");
        } else {
            tracing::debug!(decision = %key, record_id = %record.task_id, occurrence = %self.claimer, "Shared decision already claimed");
        }
        Ok(claimed)
    }

    async fn take_over(&self, record_id: String, key: &DecisionKey, stale_after: Duration) -> Result<bool, StoreError> {
        let record = self.record(record_id, key);
        let stale_before = now_millis().saturating_sub(i64::try_from(stale_after.as_millis()).unwrap_or(i64::MAX));
        let taken = self.store.take_over_stale_task(&record, stale_before).await?;
        if taken {
            tracing::warn!(decision = %key, record_id = %record.task_id, occurrence = %self.claimer, "Took over stale shared decision");
        }
        Ok(taken)
    }

    async fn get(&self, record_id: &str) -> Result<Option<Task>, StoreError> {
        self.store.get_task(record_id, &OccurrenceId::shared()).await
    }

    async fn finish(&self, record_id: &str, status: TaskStatus, reason: Option<&str>) -> Result<(), StoreError> {
        self.store
            .update_task_status(record_id, status, &OccurrenceId::shared(), reason)
            .await
    }
}

/// 默认语义：一次决策对全体实例生效
pub struct SharedClaimCoordinator {
    scope: RecordScope,
}

impl SharedClaimCoordinator {
    pub fn new(store: Arc<Store>, claimer: OccurrenceId, channel_id: impl Into<String>) -> Self {
        Self {
            scope: RecordScope {
                store,
                claimer,
                channel_id: channel_id.into(),
            },
        }
    }
}

#[async_trait]
impl ClaimCoordinator for SharedClaimCoordinator {
    fn record_id(&self, key: &DecisionKey) -> String {
        key.shared_task_id()
    }

    async fn try_claim_shared_task(&self, key: &DecisionKey) -> Result<bool, StoreError> {
        self.scope.claim(self.record_id(key), key).await
    }

    async fn take_over_stale_claim(&self, key: &DecisionKey, stale_after: Duration) -> Result<bool, StoreError> {
        self.scope.take_over(self.record_id(key), key, stale_after).await
    }

    async fn is_shared_task_completed(&self, key: &DecisionKey) -> Result<bool, StoreError> {
        Ok(matches!(
            self.scope.get(&self.record_id(key)).await?,
            Some(task) if task.status == TaskStatus::Completed
        ))
    }

    async fn get_latest_shared_task(&self, key: &DecisionKey) -> Result<Option<Task>, StoreError> {
        self.scope.get(&self.record_id(key)).await
    }

    async fn complete_shared_task(&self, key: &DecisionKey) -> Result<(), StoreError> {
        self.scope.finish(&self.record_id(key), TaskStatus::Completed, None).await
    }

    async fn fail_shared_task(&self, key: &DecisionKey, reason: &str) -> Result<(), StoreError> {
        self.scope.finish(&self.record_id(key), TaskStatus::Failed, Some(reason)).await
    }
}

/// 替代语义：每个实例各自决策（记录 ID 带上 occurrence）
pub struct PerOccurrenceClaimCoordinator {
    scope: RecordScope,
}

impl PerOccurrenceClaimCoordinator {
    pub fn new(store: Arc<Store>, occurrence: OccurrenceId, channel_id: impl Into<String>) -> Self {
        Self {
            scope: RecordScope {
                store,
                claimer: occurrence,
                channel_id: channel_id.into(),
            },
        }
    }
}

#[async_trait]
impl ClaimCoordinator for PerOccurrenceClaimCoordinator {
    fn record_id(&self, key: &DecisionKey) -> String {
        key.occurrence_task_id(&self.scope.claimer)
    }

    async fn try_claim_shared_task(&self, key: &DecisionKey) -> Result<bool, StoreError> {
        self.scope.claim(self.record_id(key), key).await
    }

    async fn take_over_stale_claim(&self, key: &DecisionKey, stale_after: Duration) -> Result<bool, StoreError> {
        self.scope.take_over(self.record_id(key), key, stale_after).await
    }

    async fn is_shared_task_completed(&self, key: &DecisionKey) -> Result<bool, StoreError> {
        Ok(matches!(
            self.scope.get(&self.record_id(key)).await?,
            Some(task) if task.status == TaskStatus::Completed
        ))
    }

    async fn get_latest_shared_task(&self, key: &DecisionKey) -> Result<Option<Task>, StoreError> {
        self.scope.get(&self.record_id(key)).await
    }

    async fn complete_shared_task(&self, key: &DecisionKey) -> Result<(), StoreError> {
        self.scope.finish(&self.record_id(key), TaskStatus::Completed, None).await
    }

    async fn fail_shared_task(&self, key: &DecisionKey, reason: &str) -> Result<(), StoreError> {
        self.scope.finish(&self.record_id(key), TaskStatus::Failed, Some(reason)).await
    }
}
