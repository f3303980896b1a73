//! 任务管理：创建、激活（并发上限 + 频道唯一）、取消与失败计数
//!
//! 每个 TaskManager 绑定一个 occurrence；所有读写都带这个 occurrence 过滤，从不触碰其它实例的任务。

use std::sync::Arc;

use crate::core::StoreError;
use crate::evaluators::DeferralSink;
use crate::persistence::{OccurrenceId, Store, Task, TaskStatus};

/// 记录一次评估失败后的去向
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// 任务保持 ACTIVE，下一轮重新播种
    Retry { attempt: u32 },
    /// 预算耗尽：任务已 FAILED 并已提交延期
    Exhausted,
}

pub struct TaskManager {
    store: Arc<Store>,
    occurrence: OccurrenceId,
    max_active_tasks: usize,
    retry_budget: u32,
}

impl TaskManager {
    pub fn new(store: Arc<Store>, occurrence: OccurrenceId, max_active_tasks: usize, retry_budget: u32) -> Self {
        Self {
            store,
            occurrence,
            max_active_tasks,
            retry_budget,
        }
    }

    pub fn occurrence(&self) -> &OccurrenceId {
        &self.occurrence
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// 创建 PENDING 任务，occurrence 取自本管理器
    pub async fn create_task(
        &self,
        description: &str,
        channel_id: &str,
        priority: i32,
        parent_task_id: Option<&str>,
    ) -> Result<Task, StoreError> {
        let mut task = Task::new(self.occurrence.clone(), channel_id, description, priority);
        if let Some(parent) = parent_task_id {
            task = task.with_parent(parent);
        }
        self.store.add_task(&task).await?;
        tracing::debug!(task_id = %task.task_id, channel = channel_id, occurrence = %self.occurrence, "Task created");
        Ok(task)
    }

    /// 按创建顺序激活 PENDING 任务，直到达到上限；频道已有 ACTIVE 任务的跳过
    pub async fn activate_pending_tasks(&self) -> Result<usize, StoreError> {
        let active = self.store.count_tasks(TaskStatus::Active, &self.occurrence).await?;
        if active >= self.max_active_tasks {
            return Ok(0);
        }
        let slots = self.max_active_tasks - active;
        let pending = self
            .store
            .get_tasks_by_status(TaskStatus::Pending, &self.occurrence, None)
            .await?;

        let mut activated = 0;
        for task in pending {
            if activated >= slots {
                break;
            }
            if self
                .store
                .activate_task_if_channel_free(&task.task_id, &self.occurrence)
                .await?
            {
                tracing::info!(task_id = %task.task_id, channel = %task.channel_id, occurrence = %self.occurrence, "Task activated");
                activated += 1;
            }
        }
        Ok(activated)
    }

    pub async fn get_active_task_for_channel(&self, channel_id: &str) -> Result<Option<Task>, StoreError> {
        self.store.get_active_task_for_channel(channel_id, &self.occurrence).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.store.get_task(task_id, &self.occurrence).await
    }

    /// 取消任务：置为 FAILED 并写入原因；已终止的任务返回 false
    ///
    /// 它的未完成思考在下一次调度 tick 时被置为 FAILED。
    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool, StoreError> {
        let task = match self.store.get_task(task_id, &self.occurrence).await? {
            Some(task) => task,
            // 未命中时走一次带作用域的写入，区分「不存在」与「属于其它实例」
            None => {
                self.store
                    .update_task_status(task_id, TaskStatus::Failed, &self.occurrence, None)
                    .await?;
                return Ok(false);
            }
        };
        if task.status.is_terminal() {
            return Ok(false);
        }
        self.store
            .update_task_status(task_id, TaskStatus::Failed, &self.occurrence, Some(&format!("cancelled: {reason}")))
            .await?;
        tracing::info!(task_id, occurrence = %self.occurrence, reason, "Task cancelled");
        Ok(true)
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<(), StoreError> {
        self.store
            .update_task_status(task_id, TaskStatus::Completed, &self.occurrence, None)
            .await
    }

    pub async fn fail_task(&self, task_id: &str, reason: &str) -> Result<(), StoreError> {
        self.store
            .update_task_status(task_id, TaskStatus::Failed, &self.occurrence, Some(reason))
            .await
    }

    /// 评估失败计数：预算内保持 ACTIVE 等待重试种子，超出则 FAILED 并延期
    pub async fn record_failure(
        &self,
        task: &Task,
        reason: &str,
        deferral: &dyn DeferralSink,
    ) -> Result<FailureDisposition, StoreError> {
        let attempt = self.store.increment_task_retry(&task.task_id, &self.occurrence).await?;
        if attempt <= self.retry_budget {
            tracing::warn!(task_id = %task.task_id, attempt, budget = self.retry_budget, reason, "Task will be retried with a new seed");
            return Ok(FailureDisposition::Retry { attempt });
        }
        let final_reason = format!("retry budget exhausted after {attempt} failures: {reason}");
        self.fail_task(&task.task_id, &final_reason).await?;
        tracing::error!(task_id = %task.task_id, reason = %final_reason, "Task failed");
        deferral.defer(task, &final_reason).await;
        Ok(FailureDisposition::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::mock::RecordingDeferral;

    fn manager(store: &Arc<Store>, occ: &str, cap: usize) -> TaskManager {
        TaskManager::new(store.clone(), OccurrenceId::new(occ), cap, 1)
    }

    #[tokio::test]
    async fn test_activation_is_scoped_and_capped() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let a = manager(&store, "a", 2);
        let b = manager(&store, "b", 2);

        let t1 = a.create_task("one", "general", 0, None).await.unwrap();
        a.create_task("two", "general", 0, None).await.unwrap();
        a.create_task("three", "random", 0, None).await.unwrap();
        a.create_task("four", "news", 0, None).await.unwrap();

        assert_eq!(b.activate_pending_tasks().await.unwrap(), 0);
        assert_eq!(a.activate_pending_tasks().await.unwrap(), 2);
        assert_eq!(a.activate_pending_tasks().await.unwrap(), 0);

        let active = a.get_active_task_for_channel("general").await.unwrap().unwrap();
        assert_eq!(active.task_id, t1.task_id);
        assert!(b.get_active_task_for_channel("general").await.unwrap().is_none());
        assert_eq!(store.count_tasks(TaskStatus::Active, &OccurrenceId::new("a")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_only_own_non_terminal_tasks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let a = manager(&store, "a", 5);
        let b = manager(&store, "b", 5);
        let task = a.create_task("cancel me", "general", 0, None).await.unwrap();

        assert!(matches!(
            b.cancel_task(&task.task_id, "nope").await,
            Err(StoreError::OwnershipViolation { .. })
        ));
        assert!(a.cancel_task(&task.task_id, "operator").await.unwrap());
        assert!(!a.cancel_task(&task.task_id, "again").await.unwrap());

        let stored = a.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("cancelled: operator"));
    }

    #[tokio::test]
    async fn test_record_failure_respects_budget() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let a = manager(&store, "a", 5);
        let deferral = RecordingDeferral::default();
        let task = a.create_task("flaky", "general", 0, None).await.unwrap();

        assert_eq!(
            a.record_failure(&task, "dma offline", &deferral).await.unwrap(),
            FailureDisposition::Retry { attempt: 1 }
        );
        assert_eq!(
            a.record_failure(&task, "dma offline", &deferral).await.unwrap(),
            FailureDisposition::Exhausted
        );
        let stored = a.get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("retry budget exhausted"));
        assert_eq!(deferral.deferred().len(), 1);
    }
}
