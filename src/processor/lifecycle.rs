//! 智能体生命周期：唤醒与关闭决策
//!
//! 两者都是「每天一次」的共享决策：认领者把决策拆成本地任务交给调度器执行，
//! 结束后把结果写回共享记录；其它实例只轮询这条记录。
//! 唤醒前先做一次启动维护，清理上一次运行（可能是崩溃）留下的任务与认领。

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::RuntimeError;
use crate::persistence::{now_millis, Task, TaskStatus};
use crate::processor::{ClaimCoordinator, DecisionKey, RoundScheduler, TaskManager};

pub const WAKEUP_KIND: &str = "WAKEUP";
pub const SHUTDOWN_KIND: &str = "SHUTDOWN";

/// 唤醒仪式的五个步骤，按顺序在同一频道上执行
pub const WAKEUP_STEPS: [(&str, &str); 5] = [
    ("VERIFY_IDENTITY", "Confirm who you are and the purpose you serve."),
    ("VALIDATE_INTEGRITY", "Check that your internal state and memory are consistent."),
    ("EVALUATE_RESILIENCE", "Assess whether you can recover from the failures you may meet today."),
    ("ACCEPT_INCOMPLETENESS", "Acknowledge the limits of your knowledge and abilities."),
    ("EXPRESS_GRATITUDE", "Express gratitude to the people and systems you work with."),
];

/// 一次生命周期决策的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// 本实例认领并成功完成
    Completed,
    /// 决策已由其它实例（或更早的运行）完成
    Joined,
    /// 决策失败（本实例执行失败，或读取到的共享结果为 FAILED）
    Failed { reason: String },
    /// 等待共享结果超时
    TimedOut,
    /// 关闭信号打断了决策
    Interrupted,
    /// 配置中关闭了该决策
    Skipped,
}

impl LifecycleOutcome {
    /// 是否可以进入工作状态
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Completed | Self::Joined | Self::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub channel_id: String,
    pub wakeup_enabled: bool,
    pub poll_interval: Duration,
    pub wakeup_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// 早于该时长创建的 PENDING/ACTIVE 任务在启动时被视为遗留
    pub stale_task_age: Duration,
    /// 认领者执行决策任务时最多跑的轮数
    pub round_limit: u64,
}

impl LifecycleSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let per_task = cfg.workflow.max_thoughts_per_task as u64 + 1;
        Self {
            channel_id: cfg.app.default_channel.clone(),
            wakeup_enabled: cfg.lifecycle.wakeup_enabled,
            poll_interval: Duration::from_millis(cfg.workflow.round_delay_ms.max(10)),
            wakeup_timeout: Duration::from_secs(cfg.lifecycle.wakeup_timeout_secs),
            shutdown_timeout: Duration::from_secs(cfg.lifecycle.shutdown_timeout_secs),
            stale_task_age: Duration::from_secs(cfg.lifecycle.stale_task_secs),
            round_limit: per_task * (WAKEUP_STEPS.len() as u64 + 1),
        }
    }
}

/// 启动维护的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// 自动完成的遗留任务
    pub completed: usize,
    /// 置为 FAILED 的遗留决策子任务
    pub failed: usize,
    /// 随之置为 FAILED 的未完成思考
    pub swept_thoughts: usize,
}

pub struct AgentLifecycle {
    tasks: Arc<TaskManager>,
    claims: Arc<dyn ClaimCoordinator>,
    scheduler: Arc<RoundScheduler>,
    settings: LifecycleSettings,
}

impl AgentLifecycle {
    pub fn new(
        tasks: Arc<TaskManager>,
        claims: Arc<dyn ClaimCoordinator>,
        scheduler: Arc<RoundScheduler>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            tasks,
            claims,
            scheduler,
            settings,
        }
    }

    pub fn claims(&self) -> &Arc<dyn ClaimCoordinator> {
        &self.claims
    }

    /// 启动维护：关闭本实例上一次运行遗留的 PENDING/ACTIVE 任务，并让它们的未完成思考失败
    ///
    /// 遗留任务若不关闭会一直占着频道，新任务无法激活。
    pub async fn startup_maintenance(&self) -> Result<MaintenanceReport, RuntimeError> {
        let age = i64::try_from(self.settings.stale_task_age.as_millis()).unwrap_or(i64::MAX);
        let store = self.tasks.store();
        let occurrence = self.tasks.occurrence();
        let (completed, failed) = store
            .close_stale_tasks(occurrence, now_millis().saturating_sub(age))
            .await?;
        for task_id in &completed {
            tracing::warn!(task_id = %task_id, occurrence = %occurrence, "Auto-completed task left over from a previous run");
        }
        let swept_thoughts = store.fail_thoughts_of_inactive_tasks(occurrence).await?;
        let report = MaintenanceReport {
            completed: completed.len(),
            failed: failed.len(),
            swept_thoughts,
        };
        if report != MaintenanceReport::default() {
            tracing::info!(?report, occurrence = %occurrence, "Startup maintenance finished");
        }
        Ok(report)
    }

    /// 认领决策；已被认领时尝试接管停滞的认领，接管后让旧认领留下的决策任务失败
    async fn claim(&self, key: &DecisionKey, stale_after: Duration) -> Result<bool, RuntimeError> {
        if self.claims.try_claim_shared_task(key).await? {
            return Ok(true);
        }
        if !self.claims.take_over_stale_claim(key, stale_after).await? {
            return Ok(false);
        }
        let superseded = self
            .tasks
            .store()
            .fail_open_children(&self.claims.record_id(key), self.tasks.occurrence(), "superseded by a new claim")
            .await?;
        tracing::info!(decision = %key, superseded, "Resuming shared decision from a stale claim");
        Ok(true)
    }

    /// 今天的唤醒决策
    pub async fn wakeup(&self, cancel: &CancellationToken) -> Result<LifecycleOutcome, RuntimeError> {
        self.wakeup_on(chrono::Utc::now().date_naive(), cancel).await
    }

    pub async fn wakeup_on(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<LifecycleOutcome, RuntimeError> {
        self.startup_maintenance().await?;
        if !self.settings.wakeup_enabled {
            return Ok(LifecycleOutcome::Skipped);
        }
        let key = DecisionKey::new(WAKEUP_KIND, date);
        if self.claims.is_shared_task_completed(&key).await? {
            tracing::info!(decision = %key, occurrence = %self.tasks.occurrence(), "Wakeup already completed; joining active pool");
            return Ok(LifecycleOutcome::Joined);
        }
        if !self.claim(&key, self.settings.wakeup_timeout).await? {
            return self.await_shared_outcome(&key, self.settings.wakeup_timeout, cancel).await;
        }

        let record_id = self.claims.record_id(&key);
        let total = WAKEUP_STEPS.len();
        let mut steps = Vec::with_capacity(total);
        for (index, (name, prompt)) in WAKEUP_STEPS.iter().enumerate() {
            let description = format!("{key} step {}/{total} {name}: {prompt}", index + 1);
            let task = self
                .tasks
                .create_task(&description, &self.settings.channel_id, 0, Some(&record_id))
                .await?;
            steps.push(task);
        }
        tracing::info!(decision = %key, steps = steps.len(), "Wakeup sequence started");
        self.run_claimed(&key, &steps, cancel).await
    }

    /// 今天的关闭决策；调用方的 token 通常已被取消，这里使用独立的 token 并以 shutdown_timeout 为上限
    pub async fn shutdown(&self, reason: &str) -> Result<LifecycleOutcome, RuntimeError> {
        self.shutdown_on(chrono::Utc::now().date_naive(), reason).await
    }

    pub async fn shutdown_on(&self, date: NaiveDate, reason: &str) -> Result<LifecycleOutcome, RuntimeError> {
        let key = DecisionKey::new(SHUTDOWN_KIND, date);
        let cancel = CancellationToken::new();
        if self.claims.is_shared_task_completed(&key).await? {
            return Ok(LifecycleOutcome::Joined);
        }
        if !self.claim(&key, self.settings.shutdown_timeout).await? {
            return self.await_shared_outcome(&key, self.settings.shutdown_timeout, &cancel).await;
        }

        let record_id = self.claims.record_id(&key);
        let task = self
            .tasks
            .create_task(
                &format!("{key}: the system is shutting down ({reason}). Acknowledge and close out your work."),
                &self.settings.channel_id,
                i32::MAX,
                Some(&record_id),
            )
            .await?;
        let steps = [task];
        match tokio::time::timeout(self.settings.shutdown_timeout, self.run_claimed(&key, &steps, &cancel)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                let reason = format!("shutdown not acknowledged within {}s", self.settings.shutdown_timeout.as_secs());
                self.tasks.fail_task(&steps[0].task_id, &reason).await?;
                self.claims.fail_shared_task(&key, &reason).await?;
                tracing::warn!(decision = %key, reason = %reason, "Shutdown decision timed out");
                Ok(LifecycleOutcome::Failed { reason })
            }
        }
    }

    /// 认领者：驱动调度器直到所有决策任务终止，再把结果写回共享记录
    async fn run_claimed(
        &self,
        key: &DecisionKey,
        steps: &[Task],
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome, RuntimeError> {
        let mut rounds = 0u64;
        loop {
            let statuses = self.step_statuses(steps).await?;
            if let Some((task, status, reason)) = statuses.iter().find(|(_, status, _)| *status == TaskStatus::Failed) {
                let reason = format!(
                    "{} {}: {}",
                    task.description.split(':').next().unwrap_or(key.kind()),
                    status.as_str(),
                    reason.as_deref().unwrap_or("no reason recorded")
                );
                self.abandon(key, steps, &reason).await?;
                return Ok(LifecycleOutcome::Failed { reason });
            }
            if statuses.iter().all(|(_, status, _)| *status == TaskStatus::Completed) {
                self.claims.complete_shared_task(key).await?;
                tracing::info!(decision = %key, rounds, "Shared decision completed");
                return Ok(LifecycleOutcome::Completed);
            }
            if cancel.is_cancelled() {
                self.abandon(key, steps, "interrupted by shutdown").await?;
                return Ok(LifecycleOutcome::Interrupted);
            }
            if rounds >= self.settings.round_limit {
                let reason = format!("not finished within {rounds} rounds");
                self.abandon(key, steps, &reason).await?;
                return Ok(LifecycleOutcome::Failed { reason });
            }

            let report = self.scheduler.run_round(cancel).await?;
            rounds += 1;
            if report.processed() == 0 {
                // 频道被其它 ACTIVE 任务占用时等一会儿再试
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
    }

    async fn step_statuses(&self, steps: &[Task]) -> Result<Vec<(Task, TaskStatus, Option<String>)>, RuntimeError> {
        let mut statuses = Vec::with_capacity(steps.len());
        for step in steps {
            let current = self
                .tasks
                .get_task(&step.task_id)
                .await?
                .ok_or_else(|| RuntimeError::Lifecycle(format!("decision task {} disappeared", step.task_id)))?;
            statuses.push((step.clone(), current.status, current.failure_reason));
        }
        Ok(statuses)
    }

    /// 取消剩余的决策任务并让共享记录失败，等待方不会无限期挂起
    async fn abandon(&self, key: &DecisionKey, steps: &[Task], reason: &str) -> Result<(), RuntimeError> {
        for step in steps {
            self.tasks.cancel_task(&step.task_id, reason).await?;
        }
        self.claims.fail_shared_task(key, reason).await?;
        tracing::warn!(decision = %key, reason, "Shared decision failed");
        Ok(())
    }

    /// 非认领者：轮询共享记录直到终止、超时或被取消
    async fn await_shared_outcome(
        &self,
        key: &DecisionKey,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome, RuntimeError> {
        tracing::info!(decision = %key, occurrence = %self.tasks.occurrence(), "Waiting for shared decision");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.claims.get_latest_shared_task(key).await? {
                Some(record) if record.status == TaskStatus::Completed => return Ok(LifecycleOutcome::Joined),
                Some(record) if record.status == TaskStatus::Failed => {
                    return Ok(LifecycleOutcome::Failed {
                        reason: record.failure_reason.unwrap_or_else(|| format!("{key} failed")),
                    })
                }
                _ => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(LifecycleOutcome::Interrupted),
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(decision = %key, secs = timeout.as_secs(), "Timed out waiting for shared decision");
                    return Ok(LifecycleOutcome::TimedOut);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}
