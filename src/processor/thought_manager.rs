//! 思考管理与入队：种子思考、递归细化思考、每轮的处理队列

use std::sync::Arc;

use crate::core::StoreError;
use crate::evaluators::DeferralSink;
use crate::persistence::{now_millis, OccurrenceId, Store, Task, Thought, ThoughtStatus, MAX_THOUGHT_DEPTH};
use crate::processor::TaskManager;

/// 本轮队列中的一项（只存在于内存，轮次结束即丢弃）
#[derive(Debug, Clone)]
pub struct ProcessingQueueItem {
    pub thought: Thought,
    pub round_number: u64,
    pub enqueued_at: i64,
}

impl ProcessingQueueItem {
    pub fn thought_id(&self) -> &str {
        &self.thought.thought_id
    }

    pub fn task_id(&self) -> &str {
        &self.thought.source_task_id
    }
}

/// seed_active_tasks 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub seeded: usize,
    /// 因思考预算耗尽而失败的任务数
    pub exhausted: usize,
}

pub struct ThoughtManager {
    store: Arc<Store>,
    tasks: Arc<TaskManager>,
    max_active_thoughts: usize,
    max_thoughts_per_task: usize,
}

impl ThoughtManager {
    pub fn new(tasks: Arc<TaskManager>, max_active_thoughts: usize, max_thoughts_per_task: usize) -> Self {
        Self {
            store: tasks.store().clone(),
            tasks,
            max_active_thoughts,
            max_thoughts_per_task,
        }
    }

    pub fn occurrence(&self) -> &OccurrenceId {
        self.tasks.occurrence()
    }

    /// 为任务生成 depth 0 的种子思考
    pub async fn generate_seed_thought(&self, task: &Task, round_number: u64) -> Result<Thought, StoreError> {
        let thought = Thought::seed(task, round_number);
        self.store.add_thought(&thought).await?;
        tracing::debug!(thought_id = %thought.thought_id, task_id = %task.task_id, round = round_number, "Seed thought created");
        Ok(thought)
    }

    /// 每个没有未完成思考的 ACTIVE 任务得到一个新种子；超出思考预算的任务失败并延期
    pub async fn seed_active_tasks(
        &self,
        round_number: u64,
        deferral: &dyn DeferralSink,
    ) -> Result<SeedReport, StoreError> {
        let mut report = SeedReport::default();
        let tasks = self.store.active_tasks_without_open_thoughts(self.occurrence()).await?;
        for task in tasks {
            let used = self.store.count_thoughts_for_task(&task.task_id, self.occurrence()).await?;
            if used >= self.max_thoughts_per_task {
                let reason = format!("thought budget exhausted ({used} thoughts)");
                self.tasks.fail_task(&task.task_id, &reason).await?;
                tracing::warn!(task_id = %task.task_id, reason = %reason, "Task failed");
                deferral.defer(&task, &reason).await;
                report.exhausted += 1;
                continue;
            }
            self.generate_seed_thought(&task, round_number).await?;
            report.seeded += 1;
        }
        Ok(report)
    }

    /// 构建本轮队列：只包含本实例 ACTIVE 任务的 PENDING/PROCESSING 思考，最多 max_active_thoughts 条
    pub async fn populate_queue(&self, round_number: u64) -> Result<Vec<ProcessingQueueItem>, StoreError> {
        let thoughts = self
            .store
            .get_queueable_thoughts(self.occurrence(), Some(self.max_active_thoughts))
            .await?;
        let enqueued_at = now_millis();
        Ok(thoughts
            .into_iter()
            .map(|thought| ProcessingQueueItem {
                thought,
                round_number,
                enqueued_at,
            })
            .collect())
    }

    /// 为 depth 0 思考创建 depth 1 的细化思考（直接处于 PROCESSING）；拒绝更深的递归
    pub async fn create_refinement(&self, parent: &Thought, content: &str) -> Result<Thought, StoreError> {
        if parent.depth >= MAX_THOUGHT_DEPTH {
            return Err(StoreError::InvalidThought(format!(
                "thought {} is already at depth {}; no further refinement allowed",
                parent.thought_id, parent.depth
            )));
        }
        let mut child = Thought::child_of(parent, content);
        child.status = ThoughtStatus::Processing;
        self.store.add_thought(&child).await?;
        Ok(child)
    }
}
