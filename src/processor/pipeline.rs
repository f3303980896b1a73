//! H3ERE 管线：把一个思考按固定步骤推进到一次（且仅一次）动作分发
//!
//! START_ROUND → GATHER_CONTEXT → PERFORM_DMAS → PERFORM_ASPDMA → CONSCIENCE_EXECUTION
//! → [RECURSIVE_ASPDMA → RECURSIVE_CONSCIENCE] → FINALIZE_ACTION → PERFORM_ACTION → ACTION_COMPLETE
//!
//! - 递归细化只发生在 depth 0 的思考上，且只发生一次；细化后仍被拒绝时兜底为 ponder，绝不分发被拒绝的动作
//! - 每个外部调用都有超时；超时视为该步失败
//! - 关闭只在步骤之间生效；PERFORM_ACTION 之后不再中断，避免重复分发

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::PipelineSection;
use crate::core::{
    raise_dispatch_alarm, DispatchError, EvaluatorError, PipelineController, PipelineError, PipelineState,
    RecoveryAction, RecoveryEngine, SchedulerSnapshot, StepPoint, StoreError,
};
use crate::evaluators::{
    ActionType, ContextBundle, DispatchOutcome, DmaResult, EvaluatorSet, ProposedAction,
};
use crate::persistence::{OccurrenceId, Store, Task, TaskStatus, Thought, ThoughtStatus};
use crate::processor::{
    FailureDisposition, ProcessingQueueItem, StepEvent, StepObservers, TaskManager, ThoughtManager,
};

/// 超时与重试参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub context_timeout: Duration,
    pub evaluator_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub dma_retry_limit: u32,
    pub dispatch_retry_limit: u32,
    pub retry_delay: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &PipelineSection) -> Self {
        Self {
            context_timeout: Duration::from_secs(cfg.context_timeout_secs),
            evaluator_timeout: Duration::from_secs(cfg.evaluator_timeout_secs),
            dispatch_timeout: Duration::from_secs(cfg.dispatch_timeout_secs),
            dma_retry_limit: cfg.dma_retry_limit,
            dispatch_retry_limit: cfg.dispatch_retry_limit,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&PipelineSection::default())
    }
}

/// 单个思考的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ThoughtOutcome {
    /// 动作已分发，思考 COMPLETED；task_status 为分发后任务的状态（非终止动作时仍为 ACTIVE）
    Completed { action: ActionType, task_status: TaskStatus },
    /// 两次均被 conscience 拒绝，已分发 ponder 兜底；任务保持 ACTIVE
    Fallback { rejected: Vec<String> },
    /// 评估失败；retry 表示任务仍在预算内，下一轮重新播种
    EvaluationFailed { reason: String, retry: bool },
    /// 分发层重试耗尽，任务 FAILED 并已延期
    DispatchFailed { reason: String },
    /// 所属任务已不再 ACTIVE（被取消或已结束），未分发
    Cancelled,
    /// 关闭信号在步骤之间生效，思考保持 PROCESSING 等待下一次入队
    Interrupted,
    /// 所有权违规（调用被拒绝且不做任何写入），或动作已分发但结果未能落盘
    Aborted { reason: String },
}

/// 单轮的共享簿记：轮次号、取消 token 与 PipelineState
pub struct RoundContext {
    pub round_number: u64,
    pub cancel: CancellationToken,
    state: Mutex<PipelineState>,
}

impl RoundContext {
    pub fn new(round_number: u64, cancel: CancellationToken) -> Self {
        Self {
            round_number,
            cancel,
            state: Mutex::new(PipelineState::new(round_number)),
        }
    }

    pub async fn snapshot(&self, occurrence: &OccurrenceId) -> SchedulerSnapshot {
        self.state.lock().await.project(occurrence.as_str())
    }

    /// ROUND_COMPLETE：标记本轮所有思考并发布最终快照
    pub async fn complete(&self, observers: &StepObservers) {
        let mut state = self.state.lock().await;
        state.complete_round();
        observers.publish(&state);
    }
}

/// 管线编排器；在同一轮内被多个任务并发共享
pub struct PipelineOrchestrator {
    store: Arc<Store>,
    occurrence: OccurrenceId,
    tasks: Arc<TaskManager>,
    thoughts: Arc<ThoughtManager>,
    evaluators: EvaluatorSet,
    controller: Arc<PipelineController>,
    observers: Arc<StepObservers>,
    recovery: RecoveryEngine,
    settings: PipelineSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        tasks: Arc<TaskManager>,
        thoughts: Arc<ThoughtManager>,
        evaluators: EvaluatorSet,
        controller: Arc<PipelineController>,
        observers: Arc<StepObservers>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store: tasks.store().clone(),
            occurrence: tasks.occurrence().clone(),
            tasks,
            thoughts,
            evaluators,
            controller,
            observers,
            recovery: RecoveryEngine::new(),
            settings,
        }
    }

    pub fn evaluators(&self) -> &EvaluatorSet {
        &self.evaluators
    }

    /// 处理一个思考直到完成、失败或被中断；错误在这里按恢复策略消化，不向上抛出
    pub async fn process_thought(&self, item: &ProcessingQueueItem, round: &RoundContext) -> ThoughtOutcome {
        let span = tracing::info_span!(
            "thought",
            thought_id = %item.thought_id(),
            task_id = %item.task_id(),
            occurrence = %self.occurrence,
            round = round.round_number,
        );
        async {
            let mut refinement = None;
            match self.drive(item, round, &mut refinement).await {
                Ok(outcome) => {
                    tracing::info!(?outcome, "Thought processed");
                    outcome
                }
                Err(err) => self.recover(item, refinement, err).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        item: &ProcessingQueueItem,
        round: &RoundContext,
        refinement: &mut Option<Thought>,
    ) -> Result<ThoughtOutcome, PipelineError> {
        let thought = &item.thought;

        let started = self.enter(round, thought, StepPoint::StartRound, true).await?;
        self.store
            .update_thought_status(&thought.thought_id, ThoughtStatus::Processing, &self.occurrence, None)
            .await?;
        self.finish(round, thought, StepPoint::StartRound, started).await;

        let started = self.enter(round, thought, StepPoint::GatherContext, true).await?;
        let task = self.active_task(&thought.source_task_id).await?;
        let context = match tokio::time::timeout(
            self.settings.context_timeout,
            self.evaluators.context.fetch_context(&task, thought),
        )
        .await
        {
            Ok(Ok(context)) => context,
            Ok(Err(source)) => {
                return Err(PipelineError::Evaluation {
                    step: StepPoint::GatherContext,
                    source,
                })
            }
            Err(_) => {
                return Err(PipelineError::Evaluation {
                    step: StepPoint::GatherContext,
                    source: EvaluatorError::Timeout {
                        component: "context".to_string(),
                        secs: self.settings.context_timeout.as_secs(),
                    },
                })
            }
        };
        self.finish(round, thought, StepPoint::GatherContext, started).await;

        let started = self.enter(round, thought, StepPoint::PerformDmas, true).await?;
        let dma_results = self.perform_dmas(&context).await?;
        self.finish(round, thought, StepPoint::PerformDmas, started).await;

        let started = self.enter(round, thought, StepPoint::PerformAspdma, true).await?;
        let proposed = self
            .call_evaluator(StepPoint::PerformAspdma, "aspdma", || {
                self.evaluators.selector.select(&context, &dma_results)
            })
            .await?;
        tracing::debug!(action = %proposed.action, "Action proposed");
        self.finish(round, thought, StepPoint::PerformAspdma, started).await;

        let started = self.enter(round, thought, StepPoint::ConscienceExecution, true).await?;
        let reasons = self.run_consciences(&proposed, &context).await;
        self.finish(round, thought, StepPoint::ConscienceExecution, started).await;

        let mut rejected: Vec<String> = Vec::new();
        let accepted = if reasons.is_empty() {
            Some(proposed)
        } else {
            self.report_rejection(thought, thought.depth, &reasons);
            rejected.extend(reasons.iter().cloned());
            if thought.depth == 0 {
                let started = self.enter(round, thought, StepPoint::RecursiveAspdma, true).await?;
                let child = self
                    .thoughts
                    .create_refinement(thought, &format!("Reconsider after conscience feedback: {}", thought.content))
                    .await?;
                *refinement = Some(child);
                let refined_context = context.with_feedback(&reasons, &proposed);
                let refined = self
                    .call_evaluator(StepPoint::RecursiveAspdma, "aspdma", || {
                        self.evaluators.selector.select(&refined_context, &dma_results)
                    })
                    .await?;
                self.finish(round, thought, StepPoint::RecursiveAspdma, started).await;

                let started = self.enter(round, thought, StepPoint::RecursiveConscience, true).await?;
                let refined_reasons = self.run_consciences(&refined, &refined_context).await;
                self.finish(round, thought, StepPoint::RecursiveConscience, started).await;

                if refined_reasons.is_empty() {
                    Some(refined)
                } else {
                    self.report_rejection(thought, 1, &refined_reasons);
                    rejected.extend(refined_reasons);
                    None
                }
            } else {
                None
            }
        };

        let started = self.enter(round, thought, StepPoint::FinalizeAction, true).await?;
        let fallback = accepted.is_none();
        let final_action = accepted.unwrap_or_else(|| ProposedAction::ponder_fallback(&rejected));
        tracing::info!(action = %final_action.action, fallback, "Action finalized");
        self.finish(round, thought, StepPoint::FinalizeAction, started).await;

        let started = self.enter(round, thought, StepPoint::PerformAction, true).await?;
        // 分发前复核任务仍属于本实例且为 ACTIVE（可能在两步之间被取消）
        let task = self.active_task(&thought.source_task_id).await?;
        let outcome = self.dispatch_with_retry(&final_action, &context).await?;
        self.observers.emit(StepEvent::ActionDispatched {
            thought_id: thought.thought_id.clone(),
            task_id: task.task_id.clone(),
            action: outcome.action.to_string(),
            task_complete: outcome.task_complete,
        });
        self.finish(round, thought, StepPoint::PerformAction, started).await;

        let started = self.enter(round, thought, StepPoint::ActionComplete, false).await?;
        let task_status = self
            .record_dispatched(thought, &task, refinement, &final_action, &outcome)
            .await
            .map_err(|source| PipelineError::PostDispatch {
                action: final_action.action.to_string(),
                task_complete: outcome.task_complete,
                source,
            })?;
        self.finish(round, thought, StepPoint::ActionComplete, started).await;

        Ok(if fallback {
            ThoughtOutcome::Fallback { rejected }
        } else {
            ThoughtOutcome::Completed {
                action: final_action.action,
                task_status,
            }
        })
    }

    /// ACTION_COMPLETE：思考（及细化思考）写入最终动作，再按动作结束任务
    async fn record_dispatched(
        &self,
        thought: &Thought,
        task: &Task,
        refinement: &mut Option<Thought>,
        action: &ProposedAction,
        outcome: &DispatchOutcome,
    ) -> Result<TaskStatus, StoreError> {
        let record = action.to_json();
        if let Some(child) = refinement.as_ref() {
            self.store
                .update_thought_status(&child.thought_id, ThoughtStatus::Completed, &self.occurrence, Some(&record))
                .await?;
        }
        *refinement = None;
        self.store
            .update_thought_status(&thought.thought_id, ThoughtStatus::Completed, &self.occurrence, Some(&record))
            .await?;
        self.apply_terminal_action(task, action, outcome).await
    }

    /// 分发成功后按动作类型结束任务：speak / task_complete 完成，reject / defer 失败（defer 同时提交延期）
    async fn apply_terminal_action(
        &self,
        task: &Task,
        action: &ProposedAction,
        outcome: &DispatchOutcome,
    ) -> Result<TaskStatus, StoreError> {
        if !outcome.task_complete {
            return Ok(TaskStatus::Active);
        }
        match action.action {
            ActionType::Reject => {
                let reason = format!("rejected by agent: {}", action.rationale);
                self.tasks.fail_task(&task.task_id, &reason).await?;
                Ok(TaskStatus::Failed)
            }
            ActionType::Defer => {
                let reason = format!("deferred by agent: {}", action.rationale);
                self.tasks.fail_task(&task.task_id, &reason).await?;
                self.evaluators.deferral.defer(task, &reason).await;
                Ok(TaskStatus::Failed)
            }
            _ => {
                self.tasks.complete_task(&task.task_id).await?;
                Ok(TaskStatus::Completed)
            }
        }
    }

    async fn active_task(&self, task_id: &str) -> Result<Task, PipelineError> {
        match self.store.get_task(task_id, &self.occurrence).await? {
            Some(task) if task.status == TaskStatus::Active => Ok(task),
            _ => Err(PipelineError::TaskInactive(task_id.to_string())),
        }
    }

    /// DMA 并发执行；任一 DMA 在重试后仍失败则整步失败
    async fn perform_dmas(&self, context: &ContextBundle) -> Result<Vec<DmaResult>, PipelineError> {
        let calls = self.evaluators.dmas.iter().map(|dma| async move {
            self.call_evaluator(StepPoint::PerformDmas, dma.kind().as_str(), || dma.evaluate(context))
                .await
        });
        join_all(calls).await.into_iter().collect()
    }

    /// 带超时与重试的评估器调用
    async fn call_evaluator<T, F, Fut>(&self, step: StepPoint, component: &str, mut call: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EvaluatorError>>,
    {
        let limit = self.settings.dma_retry_limit.max(1);
        let mut last_error = None;
        for attempt in 1..=limit {
            let error = match tokio::time::timeout(self.settings.evaluator_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => EvaluatorError::Timeout {
                    component: component.to_string(),
                    secs: self.settings.evaluator_timeout.as_secs(),
                },
            };
            tracing::warn!(%step, component, attempt, limit, error = %error, "Evaluator call failed");
            last_error = Some(error);
            if attempt < limit {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        Err(PipelineError::Evaluation {
            step,
            source: last_error.unwrap_or_else(|| EvaluatorError::Unavailable(component.to_string())),
        })
    }

    /// 并发执行全部 conscience 检查，返回拒绝理由（空表示通过）；检查出错或超时算作拒绝
    async fn run_consciences(&self, action: &ProposedAction, context: &ContextBundle) -> Vec<String> {
        let checks = self.evaluators.consciences.iter().map(|check| async move {
            match tokio::time::timeout(self.settings.evaluator_timeout, check.check(action, context)).await {
                Ok(Ok(verdict)) if verdict.passed => None,
                Ok(Ok(verdict)) => Some(format!(
                    "{}: {}",
                    verdict.check,
                    verdict.reason.unwrap_or_else(|| "rejected".to_string())
                )),
                Ok(Err(e)) => Some(format!("{}: check unavailable ({e})", check.name())),
                Err(_) => Some(format!("{}: check timed out", check.name())),
            }
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    /// 分发层重试：同一个动作最多尝试 dispatch_retry_limit 次，不重新经过 conscience
    async fn dispatch_with_retry(
        &self,
        action: &ProposedAction,
        context: &ContextBundle,
    ) -> Result<DispatchOutcome, PipelineError> {
        let limit = self.settings.dispatch_retry_limit.max(1);
        let mut last_error = DispatchError::Failed("not attempted".to_string());
        for attempt in 1..=limit {
            last_error = match tokio::time::timeout(
                self.settings.dispatch_timeout,
                self.evaluators.dispatcher.dispatch(action, context),
            )
            .await
            {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(e)) => e,
                Err(_) => DispatchError::Timeout(self.settings.dispatch_timeout.as_secs()),
            };
            tracing::warn!(attempt, limit, action = %action.action, error = %last_error, "Dispatch attempt failed");
            if attempt < limit {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        Err(PipelineError::Dispatch {
            attempts: limit,
            source: last_error,
        })
    }

    fn report_rejection(&self, thought: &Thought, depth: u8, reasons: &[String]) {
        tracing::info!(depth, reasons = ?reasons, "Conscience rejected proposed action");
        self.observers.emit(StepEvent::ConscienceRejected {
            thought_id: thought.thought_id.clone(),
            depth,
            reasons: reasons.to_vec(),
        });
    }

    /// 步骤入口：检查关闭信号与暂停，记录进入的步骤
    ///
    /// interruptible = false 时关闭信号不会阻止进入（动作已分发，必须落盘）。
    async fn enter(
        &self,
        round: &RoundContext,
        thought: &Thought,
        step: StepPoint,
        interruptible: bool,
    ) -> Result<Instant, PipelineError> {
        let proceed = !round.cancel.is_cancelled() && self.controller.checkpoint(&round.cancel).await;
        if !proceed && interruptible {
            return Err(PipelineError::Cancelled);
        }
        {
            let mut state = round.state.lock().await;
            state.paused = self.controller.is_paused();
            state.enter(&thought.thought_id, &thought.source_task_id, step);
            self.observers.publish(&state);
        }
        self.observers.emit(StepEvent::StepEntered {
            round: round.round_number,
            thought_id: thought.thought_id.clone(),
            task_id: thought.source_task_id.clone(),
            step,
        });
        tracing::debug!(%step, "Entering step");
        Ok(Instant::now())
    }

    async fn finish(&self, round: &RoundContext, thought: &Thought, step: StepPoint, started: Instant) {
        let elapsed = started.elapsed();
        {
            let mut state = round.state.lock().await;
            state.finish(&thought.thought_id, step, elapsed);
            self.observers.publish(&state);
        }
        self.observers.emit(StepEvent::StepFinished {
            round: round.round_number,
            thought_id: thought.thought_id.clone(),
            step,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    async fn mark_failed(&self, thought: &Thought) {
        if let Err(e) = self
            .store
            .update_thought_status(&thought.thought_id, ThoughtStatus::Failed, &self.occurrence, None)
            .await
        {
            tracing::error!(thought_id = %thought.thought_id, error = %e, "Failed to mark thought FAILED");
        }
    }

    /// 按 RecoveryEngine 的建议消化管线错误
    async fn recover(
        &self,
        item: &ProcessingQueueItem,
        refinement: Option<Thought>,
        err: PipelineError,
    ) -> ThoughtOutcome {
        let thought = &item.thought;
        let action = self.recovery.handle(&err);
        self.observers.emit(StepEvent::Recovery {
            thought_id: thought.thought_id.clone(),
            action: format!("{action:?}"),
            detail: err.to_string(),
        });

        if let PipelineError::PostDispatch { task_complete, .. } = &err {
            return self.recover_after_dispatch(thought, refinement, *task_complete, &err).await;
        }
        if let RecoveryAction::ConsistencyAlarm(reason) = action {
            tracing::error!(alarm = "ownership_violation", reason = %reason, "Thought processing rejected");
            return ThoughtOutcome::Aborted { reason };
        }
        if let Some(child) = &refinement {
            self.mark_failed(child).await;
        }
        if matches!(err, PipelineError::Cancelled) {
            tracing::info!("Thought interrupted by shutdown; left for re-queue");
            return ThoughtOutcome::Interrupted;
        }
        self.mark_failed(thought).await;

        match action {
            RecoveryAction::RetryWithNewSeed(reason) => {
                let retry = match self.store.get_task(&thought.source_task_id, &self.occurrence).await {
                    Ok(Some(task)) if task.status == TaskStatus::Active => {
                        match self
                            .tasks
                            .record_failure(&task, &reason, self.evaluators.deferral.as_ref())
                            .await
                        {
                            Ok(FailureDisposition::Retry { .. }) => true,
                            Ok(FailureDisposition::Exhausted) => false,
                            Err(e) => {
                                tracing::error!(error = %e, "Failed to record task failure");
                                false
                            }
                        }
                    }
                    Ok(_) => false,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read task for retry accounting");
                        false
                    }
                };
                ThoughtOutcome::EvaluationFailed { reason, retry }
            }
            RecoveryAction::Defer(reason) => {
                match self.store.get_task(&thought.source_task_id, &self.occurrence).await {
                    Ok(Some(task)) => {
                        let final_reason = format!("dispatch failed: {reason}");
                        if let Err(e) = self.tasks.fail_task(&task.task_id, &final_reason).await {
                            tracing::error!(error = %e, "Failed to mark task FAILED");
                        }
                        self.evaluators.deferral.defer(&task, &final_reason).await;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(error = %e, "Failed to read task for deferral"),
                }
                ThoughtOutcome::DispatchFailed { reason }
            }
            RecoveryAction::Abort => {
                tracing::info!(reason = %err, "Thought dropped");
                ThoughtOutcome::Cancelled
            }
            RecoveryAction::ConsistencyAlarm(reason) => ThoughtOutcome::Aborted { reason },
        }
    }

    /// 动作已分发但未落盘：不重试；尽力让思考失败（不再入队），终止性动作同时让任务失败（不再播种）
    async fn recover_after_dispatch(
        &self,
        thought: &Thought,
        refinement: Option<Thought>,
        task_complete: bool,
        err: &PipelineError,
    ) -> ThoughtOutcome {
        let reason = err.to_string();
        raise_dispatch_alarm(&thought.thought_id, self.occurrence.as_str(), &reason);
        if let Some(child) = &refinement {
            self.mark_failed(child).await;
        }
        self.mark_failed(thought).await;
        if task_complete {
            if let Err(e) = self.tasks.fail_task(&thought.source_task_id, &reason).await {
                tracing::error!(error = %e, "Failed to close task after unrecorded dispatch");
            }
        }
        ThoughtOutcome::Aborted { reason }
    }
}
