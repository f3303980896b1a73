//! 确定性的测试替身（无需 LLM）：静态上下文 / DMA、脚本化选择器、可配置的 conscience、
//! 记录型分发器与延期通道。集成测试与本地试运行共用。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ActionDispatcher, ActionSelector, ActionType, ConscienceCheck, ConscienceVerdict, ContextBundle,
    ContextProvider, DeferralSink, DispatchOutcome, DmaEvaluator, DmaKind, DmaResult, ProposedAction,
};
use crate::core::{DispatchError, EvaluatorError};
use crate::persistence::{Task, Thought};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// 直接由任务与思考拼出上下文
pub struct StaticContext;

#[async_trait]
impl ContextProvider for StaticContext {
    async fn fetch_context(&self, task: &Task, thought: &Thought) -> Result<ContextBundle, EvaluatorError> {
        Ok(ContextBundle {
            identity: "test agent".to_string(),
            task_id: task.task_id.clone(),
            task_description: task.description.clone(),
            thought_id: thought.thought_id.clone(),
            thought_content: thought.content.clone(),
            channel_id: task.channel_id.clone(),
            depth: thought.depth,
            ..Default::default()
        })
    }
}

/// 固定打分的 DMA；可配置前 N 次失败或每次延迟
pub struct StaticDma {
    kind: DmaKind,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticDma {
    pub fn new(kind: DmaKind) -> Self {
        Self {
            kind,
            failures_left: AtomicUsize::new(0),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 前 n 次调用返回 Unavailable
    pub fn failing_first(kind: DmaKind, n: usize) -> Self {
        let dma = Self::new(kind);
        dma.failures_left.store(n, Ordering::SeqCst);
        dma
    }

    /// 每次调用前睡眠（用于超时测试）
    pub fn slow(kind: DmaKind, delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new(kind)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DmaEvaluator for StaticDma {
    fn kind(&self) -> DmaKind {
        self.kind
    }

    async fn evaluate(&self, _context: &ContextBundle) -> Result<DmaResult, EvaluatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EvaluatorError::Unavailable(format!("{} dma offline", self.kind.as_str())));
        }
        Ok(DmaResult {
            kind: self.kind,
            score: 0.8,
            rationale: "static".to_string(),
        })
    }
}

/// 按脚本依次返回动作；脚本耗尽后重复最后一个
pub struct ScriptedSelector {
    script: Mutex<VecDeque<ActionType>>,
    last: Mutex<Option<ActionType>>,
    fail: bool,
    seen_feedback: Mutex<Vec<Vec<String>>>,
}

impl ScriptedSelector {
    pub fn script(actions: Vec<ActionType>) -> Self {
        Self {
            script: Mutex::new(actions.into()),
            last: Mutex::new(None),
            fail: false,
            seen_feedback: Mutex::new(Vec::new()),
        }
    }

    pub fn always(action: ActionType) -> Self {
        Self::script(vec![action])
    }

    /// 每次调用都返回 Unavailable
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::script(Vec::new())
        }
    }

    /// 每次调用时上下文中的 conscience 反馈
    pub fn seen_feedback(&self) -> Vec<Vec<String>> {
        guard(&self.seen_feedback).clone()
    }
}

#[async_trait]
impl ActionSelector for ScriptedSelector {
    async fn select(
        &self,
        context: &ContextBundle,
        _dma_results: &[DmaResult],
    ) -> Result<ProposedAction, EvaluatorError> {
        guard(&self.seen_feedback).push(context.feedback.clone());
        if self.fail {
            return Err(EvaluatorError::Unavailable("selector offline".to_string()));
        }
        let next = guard(&self.script).pop_front();
        let action = {
            let mut last = guard(&self.last);
            if let Some(action) = next {
                *last = Some(action);
            }
            (*last).ok_or_else(|| EvaluatorError::InvalidOutput("empty script".to_string()))?
        };
        Ok(ProposedAction::new(
            action,
            serde_json::json!({ "content": format!("scripted {action}") }),
            format!("depth {}", context.depth),
        ))
    }
}

/// 总是通过
pub struct PassingConscience;

#[async_trait]
impl ConscienceCheck for PassingConscience {
    fn name(&self) -> &str {
        "passing"
    }

    async fn check(
        &self,
        _action: &ProposedAction,
        _context: &ContextBundle,
    ) -> Result<ConscienceVerdict, EvaluatorError> {
        Ok(ConscienceVerdict::pass(self.name()))
    }
}

/// 拒绝列表中的动作类型，其余通过
pub struct RejectingConscience {
    rejected: Vec<ActionType>,
    reason: String,
}

impl RejectingConscience {
    pub fn new(rejected: Vec<ActionType>, reason: impl Into<String>) -> Self {
        Self {
            rejected,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ConscienceCheck for RejectingConscience {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn check(
        &self,
        action: &ProposedAction,
        _context: &ContextBundle,
    ) -> Result<ConscienceVerdict, EvaluatorError> {
        if self.rejected.contains(&action.action) {
            Ok(ConscienceVerdict::reject(
                self.name(),
                format!("{}: {}", action.action, self.reason),
            ))
        } else {
            Ok(ConscienceVerdict::pass(self.name()))
        }
    }
}

/// 检查本身出错
pub struct BrokenConscience;

#[async_trait]
impl ConscienceCheck for BrokenConscience {
    fn name(&self) -> &str {
        "broken"
    }

    async fn check(
        &self,
        _action: &ProposedAction,
        _context: &ContextBundle,
    ) -> Result<ConscienceVerdict, EvaluatorError> {
        Err(EvaluatorError::Unavailable("conscience offline".to_string()))
    }
}

/// 记录每次分发；可配置为始终失败
#[derive(Default)]
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<ProposedAction>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingDispatcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn dispatched(&self) -> Vec<ProposedAction> {
        guard(&self.dispatched).clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        action: &ProposedAction,
        _context: &ContextBundle,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DispatchError::Failed("adapter unreachable".to_string()));
        }
        guard(&self.dispatched).push(action.clone());
        Ok(DispatchOutcome {
            action: action.action,
            task_complete: action.action.terminates_task(),
            detail: "recorded".to_string(),
        })
    }
}

/// 记录延期的 (task_id, reason)
#[derive(Default)]
pub struct RecordingDeferral {
    deferred: Mutex<Vec<(String, String)>>,
}

impl RecordingDeferral {
    pub fn deferred(&self) -> Vec<(String, String)> {
        guard(&self.deferred).clone()
    }
}

#[async_trait]
impl DeferralSink for RecordingDeferral {
    async fn defer(&self, task: &Task, reason: &str) {
        guard(&self.deferred).push((task.task_id.clone(), reason.to_string()));
    }
}
