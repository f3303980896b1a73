//! 核心层：错误与恢复、管线状态投影、暂停/单步控制、优雅关闭

pub mod controller;
pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use controller::PipelineController;
pub use error::{
    consistency_alarms, raise_consistency_alarm, raise_dispatch_alarm, DispatchError, EvaluatorError, PipelineError,
    RecoveryAction, RuntimeError, StoreError,
};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, StoreCleanup};
pub use state::{PipelineState, SchedulerSnapshot, StepPoint, ThoughtSnapshot};
