//! 处理层：任务 / 思考管理、H3ERE 管线、轮次调度、共享决策与生命周期

pub mod claims;
pub mod events;
pub mod lifecycle;
pub mod pipeline;
pub mod scheduler;
pub mod task_manager;
pub mod thought_manager;

pub use claims::{ClaimCoordinator, DecisionKey, PerOccurrenceClaimCoordinator, SharedClaimCoordinator};
pub use events::{StepEvent, StepObservers};
pub use lifecycle::{
    AgentLifecycle, LifecycleOutcome, LifecycleSettings, MaintenanceReport, SHUTDOWN_KIND, WAKEUP_KIND, WAKEUP_STEPS,
};
pub use pipeline::{PipelineOrchestrator, PipelineSettings, RoundContext, ThoughtOutcome};
pub use scheduler::{RoundReport, RoundScheduler, RunStop};
pub use task_manager::{FailureDisposition, TaskManager};
pub use thought_manager::{ProcessingQueueItem, SeedReport, ThoughtManager};
