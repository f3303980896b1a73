//! 默认分发器与延期通道：只写日志（真实的适配器在外部接入）

use async_trait::async_trait;

use super::{ActionDispatcher, ContextBundle, DeferralSink, DispatchOutcome, ProposedAction};
use crate::core::DispatchError;
use crate::persistence::Task;

/// 把动作写入日志；speak / task_complete / reject / defer 视为结束任务
#[derive(Debug, Default)]
pub struct LogDispatcher;

#[async_trait]
impl ActionDispatcher for LogDispatcher {
    async fn dispatch(
        &self,
        action: &ProposedAction,
        context: &ContextBundle,
    ) -> Result<DispatchOutcome, DispatchError> {
        tracing::info!(
            task_id = %context.task_id,
            thought_id = %context.thought_id,
            channel = %context.channel_id,
            action = %action.action,
            parameters = %action.parameters,
            "Dispatching action"
        );
        Ok(DispatchOutcome {
            action: action.action,
            task_complete: action.action.terminates_task(),
            detail: format!("logged {} on {}", action.action, context.channel_id),
        })
    }
}

/// 延期请求只记录告警日志
#[derive(Debug, Default)]
pub struct LogDeferral;

#[async_trait]
impl DeferralSink for LogDeferral {
    async fn defer(&self, task: &Task, reason: &str) {
        tracing::warn!(
            task_id = %task.task_id,
            occurrence = %task.agent_occurrence_id,
            reason,
            "Task deferred to human authority"
        );
    }
}
