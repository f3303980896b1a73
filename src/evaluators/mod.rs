//! 外部协作方契约：DMA、ASPDMA、Conscience、上下文收集、动作分发、延期通道
//!
//! 每个能力一个 trait，在构建运行时时显式注册到 EvaluatorSet；管线只依赖这些 trait，
//! 超时与重试由调用方（管线）负责，实现本身无需关心。

pub mod context;
pub mod dispatch;
pub mod llm;
pub mod mock;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{DispatchError, EvaluatorError, RuntimeError};
use crate::persistence::{Task, Thought};

pub use context::BasicContextProvider;
pub use dispatch::{LogDeferral, LogDispatcher};
pub use llm::{LlmActionSelector, LlmConscience, LlmDma};
pub use types::{
    ActionType, ConscienceVerdict, ContextBundle, DispatchOutcome, DmaKind, DmaResult,
    ProposedAction,
};

/// 单一视角的评估（伦理 / 常识 / 领域）；无状态、无副作用
#[async_trait]
pub trait DmaEvaluator: Send + Sync {
    fn kind(&self) -> DmaKind;

    async fn evaluate(&self, context: &ContextBundle) -> Result<DmaResult, EvaluatorError>;
}

/// 根据 DMA 结果提出一个候选动作
#[async_trait]
pub trait ActionSelector: Send + Sync {
    async fn select(
        &self,
        context: &ContextBundle,
        dma_results: &[DmaResult],
    ) -> Result<ProposedAction, EvaluatorError>;
}

/// 对候选动作的一项安全检查
#[async_trait]
pub trait ConscienceCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(
        &self,
        action: &ProposedAction,
        context: &ContextBundle,
    ) -> Result<ConscienceVerdict, EvaluatorError>;
}

/// 组装上下文包（身份、记忆摘录、对话历史、约束）
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn fetch_context(&self, task: &Task, thought: &Thought) -> Result<ContextBundle, EvaluatorError>;
}

/// 执行最终动作
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        action: &ProposedAction,
        context: &ContextBundle,
    ) -> Result<DispatchOutcome, DispatchError>;
}

/// 人工 / 上级延期通道；管线视角下 fire-and-forget
#[async_trait]
pub trait DeferralSink: Send + Sync {
    async fn defer(&self, task: &Task, reason: &str);
}

/// 管线使用的全部协作方
#[derive(Clone)]
pub struct EvaluatorSet {
    pub context: Arc<dyn ContextProvider>,
    pub dmas: Vec<Arc<dyn DmaEvaluator>>,
    pub selector: Arc<dyn ActionSelector>,
    pub consciences: Vec<Arc<dyn ConscienceCheck>>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
    pub deferral: Arc<dyn DeferralSink>,
}

impl EvaluatorSet {
    pub fn builder() -> EvaluatorSetBuilder {
        EvaluatorSetBuilder::default()
    }
}

/// EvaluatorSet 构建器：每个协作方显式注册，缺项在 build 时报错
#[derive(Default)]
pub struct EvaluatorSetBuilder {
    context: Option<Arc<dyn ContextProvider>>,
    dmas: Vec<Arc<dyn DmaEvaluator>>,
    selector: Option<Arc<dyn ActionSelector>>,
    consciences: Vec<Arc<dyn ConscienceCheck>>,
    dispatcher: Option<Arc<dyn ActionDispatcher>>,
    deferral: Option<Arc<dyn DeferralSink>>,
}

impl EvaluatorSetBuilder {
    pub fn context(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn dma(mut self, dma: Arc<dyn DmaEvaluator>) -> Self {
        self.dmas.push(dma);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn ActionSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn conscience(mut self, check: Arc<dyn ConscienceCheck>) -> Self {
        self.consciences.push(check);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn deferral(mut self, deferral: Arc<dyn DeferralSink>) -> Self {
        self.deferral = Some(deferral);
        self
    }

    pub fn build(self) -> Result<EvaluatorSet, RuntimeError> {
        let missing = |what: &str| RuntimeError::Config(format!("evaluator set is missing {what}"));
        if self.dmas.is_empty() {
            return Err(missing("at least one DMA"));
        }
        if self.consciences.is_empty() {
            return Err(missing("at least one conscience check"));
        }
        let mut kinds: Vec<DmaKind> = self.dmas.iter().map(|d| d.kind()).collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds.dedup();
        if kinds.len() != self.dmas.len() {
            return Err(RuntimeError::Config("duplicate DMA kind registered".to_string()));
        }
        Ok(EvaluatorSet {
            context: self.context.ok_or_else(|| missing("a context provider"))?,
            dmas: self.dmas,
            selector: self.selector.ok_or_else(|| missing("an action selector"))?,
            consciences: self.consciences,
            dispatcher: self.dispatcher.ok_or_else(|| missing("a dispatcher"))?,
            deferral: self.deferral.ok_or_else(|| missing("a deferral sink"))?,
        })
    }
}
