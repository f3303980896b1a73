//! 错误恢复引擎
//!
//! 根据 PipelineError 类型返回 RecoveryAction，供调度器决定是重试种子、延期、告警还是终止。

use crate::core::{PipelineError, RecoveryAction, StoreError};

/// 语义化错误恢复：将管线错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &PipelineError) -> RecoveryAction {
        match err {
            PipelineError::Evaluation { step, source } => {
                RecoveryAction::RetryWithNewSeed(format!("{step} failed: {source}"))
            }
            PipelineError::Dispatch { .. } => RecoveryAction::Defer(err.to_string()),
            PipelineError::PostDispatch { .. } => RecoveryAction::ConsistencyAlarm(err.to_string()),
            PipelineError::Store(StoreError::OwnershipViolation { .. }) => {
                RecoveryAction::ConsistencyAlarm(err.to_string())
            }
            // 其它持久层错误（如数据库繁忙）按评估失败处理，下一轮重试
            PipelineError::Store(e) => RecoveryAction::RetryWithNewSeed(format!("store error: {e}")),
            PipelineError::TaskInactive(_) | PipelineError::Cancelled => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DispatchError, EvaluatorError, StepPoint};

    #[test]
    fn test_recovery_evaluation_failure() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::Evaluation {
            step: StepPoint::PerformDmas,
            source: EvaluatorError::Unavailable("ethical".to_string()),
        };
        match engine.handle(&err) {
            RecoveryAction::RetryWithNewSeed(msg) => assert!(msg.contains("PERFORM_DMAS")),
            other => panic!("Expected RetryWithNewSeed, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_dispatch_failure() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::Dispatch {
            attempts: 2,
            source: DispatchError::Failed("adapter offline".to_string()),
        };
        assert!(matches!(engine.handle(&err), RecoveryAction::Defer(_)));
    }

    #[test]
    fn test_recovery_ownership_violation() {
        let engine = RecoveryEngine::new();
        let err = PipelineError::Store(StoreError::OwnershipViolation {
            entity: "task",
            id: "task_1".to_string(),
            occurrence: "b".to_string(),
        });
        assert!(matches!(engine.handle(&err), RecoveryAction::ConsistencyAlarm(_)));
    }

    #[test]
    fn test_recovery_store_error_after_dispatch_is_not_retried() {
        let engine = RecoveryEngine::new();
        let busy = || StoreError::InvalidValue("database is locked".to_string());
        assert!(matches!(
            engine.handle(&PipelineError::Store(busy())),
            RecoveryAction::RetryWithNewSeed(_)
        ));
        let err = PipelineError::PostDispatch {
            action: "speak".to_string(),
            task_complete: true,
            source: busy(),
        };
        match engine.handle(&err) {
            RecoveryAction::ConsistencyAlarm(msg) => assert!(msg.contains("dispatched but not recorded")),
            other => panic!("Expected ConsistencyAlarm, got {other:?}"),
        }
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        assert_eq!(engine.handle(&PipelineError::Cancelled), RecoveryAction::Abort);
        assert_eq!(
            engine.handle(&PipelineError::TaskInactive("t".into())),
            RecoveryAction::Abort
        );
    }
}
