//! 智能体运行时：把配置、存储与评估器组装成一个 occurrence 的完整处理栈
//!
//! 对外暴露 create_task / get_active_task_for_channel 供适配器路由入站事件，
//! 以及只读的步骤事件与快照订阅。

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, DecisionScope};
use crate::core::{PipelineController, RuntimeError, SchedulerSnapshot, StoreError};
use crate::evaluators::{
    BasicContextProvider, DmaKind, EvaluatorSet, LlmActionSelector, LlmConscience, LlmDma, LogDeferral,
    LogDispatcher,
};
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::persistence::{OccurrenceId, Store, Task};
use crate::processor::{
    AgentLifecycle, ClaimCoordinator, LifecycleOutcome, LifecycleSettings, PerOccurrenceClaimCoordinator,
    PipelineOrchestrator, PipelineSettings, RoundScheduler, RunStop, SharedClaimCoordinator, StepEvent,
    StepObservers, TaskManager, ThoughtManager,
};

const EVENT_CAPACITY: usize = 1024;

const SELECTOR_PROMPT: &str = "You are {agent}, an ethical autonomous agent. \
Choose exactly one next action for the thought you are given.";

/// 根据配置创建 LLM 客户端；没有可用的 API Key 时退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match OpenAiClient::from_config(&cfg.llm) {
        Some(client) => Arc::new(client),
        None => {
            tracing::warn!(provider = %cfg.llm.provider, "No LLM API key configured; using mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 基于 LLM 的默认评估器组合
pub fn default_evaluators(cfg: &AppConfig, store: Arc<Store>, llm: Arc<dyn LlmClient>) -> Result<EvaluatorSet, RuntimeError> {
    let identity = format!("{} (occurrence {})", cfg.app.agent_name, cfg.app.occurrence_id);
    let mut builder = EvaluatorSet::builder()
        .context(Arc::new(BasicContextProvider::new(store, identity)))
        .dma(Arc::new(LlmDma::new(llm.clone(), DmaKind::Ethical)))
        .dma(Arc::new(LlmDma::new(llm.clone(), DmaKind::CommonSense)))
        .dma(Arc::new(LlmDma::new(llm.clone(), DmaKind::Domain)))
        .selector(Arc::new(LlmActionSelector::new(
            llm.clone(),
            SELECTOR_PROMPT.replace("{agent}", &cfg.app.agent_name),
        )))
        .dispatcher(Arc::new(LogDispatcher))
        .deferral(Arc::new(LogDeferral));
    for check in LlmConscience::default_checks(llm) {
        builder = builder.conscience(Arc::new(check));
    }
    builder.build()
}

pub struct AgentRuntime {
    occurrence: OccurrenceId,
    default_channel: String,
    tasks: Arc<TaskManager>,
    controller: Arc<PipelineController>,
    observers: Arc<StepObservers>,
    scheduler: Arc<RoundScheduler>,
    lifecycle: AgentLifecycle,
}

impl AgentRuntime {
    /// 组装运行时；配置先经过校验
    pub fn build(cfg: &AppConfig, store: Arc<Store>, evaluators: EvaluatorSet) -> Result<Self, RuntimeError> {
        cfg.validate()?;
        let occurrence = OccurrenceId::new(cfg.app.occurrence_id.as_str());
        let tasks = Arc::new(TaskManager::new(
            store.clone(),
            occurrence.clone(),
            cfg.workflow.max_active_tasks,
            cfg.workflow.task_retry_budget,
        ));
        let thoughts = Arc::new(ThoughtManager::new(
            tasks.clone(),
            cfg.workflow.max_active_thoughts,
            cfg.workflow.max_thoughts_per_task,
        ));
        let controller = Arc::new(PipelineController::new());
        let observers = Arc::new(StepObservers::new(occurrence.clone(), EVENT_CAPACITY));
        let pipeline = Arc::new(PipelineOrchestrator::new(
            tasks.clone(),
            thoughts.clone(),
            evaluators,
            controller.clone(),
            observers.clone(),
            PipelineSettings::from_config(&cfg.pipeline),
        ));
        let scheduler = Arc::new(RoundScheduler::new(
            tasks.clone(),
            thoughts,
            pipeline,
            observers.clone(),
            &cfg.workflow,
        ));
        let claims: Arc<dyn ClaimCoordinator> = match cfg.lifecycle.decision_scope {
            DecisionScope::Shared => Arc::new(SharedClaimCoordinator::new(
                store,
                occurrence.clone(),
                cfg.app.default_channel.as_str(),
            )),
            DecisionScope::PerOccurrence => Arc::new(PerOccurrenceClaimCoordinator::new(
                store,
                occurrence.clone(),
                cfg.app.default_channel.as_str(),
            )),
        };
        let lifecycle = AgentLifecycle::new(
            tasks.clone(),
            claims,
            scheduler.clone(),
            LifecycleSettings::from_config(cfg),
        );
        tracing::info!(occurrence = %occurrence, scope = ?cfg.lifecycle.decision_scope, "Agent runtime ready");

        Ok(Self {
            occurrence,
            default_channel: cfg.app.default_channel.clone(),
            tasks,
            controller,
            observers,
            scheduler,
            lifecycle,
        })
    }

    /// 使用配置中的 LLM 与默认评估器组装
    pub fn from_config(cfg: &AppConfig, store: Arc<Store>) -> Result<Self, RuntimeError> {
        let llm = create_llm_from_config(cfg);
        let evaluators = default_evaluators(cfg, store.clone(), llm)?;
        Self::build(cfg, store, evaluators)
    }

    pub fn occurrence(&self) -> &OccurrenceId {
        &self.occurrence
    }

    /// 入站事件入口；channel 为 None 时使用默认频道
    pub async fn create_task(&self, description: &str, channel_id: Option<&str>, priority: i32) -> Result<Task, StoreError> {
        let channel = channel_id.unwrap_or(&self.default_channel);
        self.tasks.create_task(description, channel, priority, None).await
    }

    pub async fn get_active_task_for_channel(&self, channel_id: &str) -> Result<Option<Task>, StoreError> {
        self.tasks.get_active_task_for_channel(channel_id).await
    }

    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool, StoreError> {
        self.tasks.cancel_task(task_id, reason).await
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    /// 暂停 / 单步控制
    pub fn controller(&self) -> &Arc<PipelineController> {
        &self.controller
    }

    pub fn scheduler(&self) -> &Arc<RoundScheduler> {
        &self.scheduler
    }

    pub fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StepEvent> {
        self.observers.subscribe_events()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.observers.watch_snapshot()
    }

    pub async fn wakeup(&self, cancel: &CancellationToken) -> Result<LifecycleOutcome, RuntimeError> {
        self.lifecycle.wakeup(cancel).await
    }

    /// 跑轮次直到取消或达到 max_rounds
    pub async fn run(&self, cancel: &CancellationToken) -> RunStop {
        self.scheduler.run(cancel).await
    }

    pub async fn shutdown(&self, reason: &str) -> Result<LifecycleOutcome, RuntimeError> {
        self.lifecycle.shutdown(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::TaskStatus;

    fn config(occ: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.occurrence_id = occ.to_string();
        cfg.llm.provider = "mock".to_string();
        cfg.workflow.round_delay_ms = 1;
        cfg.workflow.max_rounds = Some(2);
        cfg
    }

    #[tokio::test]
    async fn test_runtime_with_mock_llm_completes_task() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let runtime = AgentRuntime::from_config(&config("a"), store).unwrap();
        let task = runtime.create_task("say hello", Some("general"), 0).await.unwrap();

        assert_eq!(runtime.run(&CancellationToken::new()).await, RunStop::RoundLimit);
        let stored = runtime.tasks().get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(runtime.get_active_task_for_channel("general").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runtime_rejects_invalid_config() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut cfg = config("a");
        cfg.workflow.max_in_flight = 0;
        assert!(matches!(
            AgentRuntime::from_config(&cfg, store),
            Err(RuntimeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_per_occurrence_scope_wakes_each_occurrence() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut a_cfg = config("a");
        a_cfg.lifecycle.decision_scope = DecisionScope::PerOccurrence;
        let mut b_cfg = config("b");
        b_cfg.lifecycle.decision_scope = DecisionScope::PerOccurrence;
        let a = AgentRuntime::from_config(&a_cfg, store.clone()).unwrap();
        let b = AgentRuntime::from_config(&b_cfg, store).unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(a.wakeup(&cancel).await.unwrap(), LifecycleOutcome::Completed);
        assert_eq!(b.wakeup(&cancel).await.unwrap(), LifecycleOutcome::Completed);
    }
}
