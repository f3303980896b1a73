//! 运行时错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 PipelineError 决定 RetryWithNewSeed / Defer / ConsistencyAlarm / Abort。
//! 安全拒绝（conscience 拒绝）与认领竞争失败都不是错误，不在此处出现。

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::core::StepPoint;

/// 持久层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// 试图修改不属于调用方实例的任务/思考（正确运行时不应出现）
    #[error("Ownership violation: {entity} {id} is not owned by occurrence {occurrence}")]
    OwnershipViolation {
        entity: &'static str,
        id: String,
        occurrence: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// 思考不满足数据模型约束（如 depth > 1）
    #[error("Invalid thought: {0}")]
    InvalidThought(String),

    #[error("Invalid stored value: {0}")]
    InvalidValue(String),
}

/// 外部评估器（DMA / ASPDMA / Conscience / 上下文收集）调用失败
#[derive(Error, Debug, Clone)]
pub enum EvaluatorError {
    #[error("{component} timed out after {secs}s")]
    Timeout { component: String, secs: u64 },

    #[error("Evaluator unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid evaluator output: {0}")]
    InvalidOutput(String),
}

/// 动作分发失败（与 conscience 拒绝严格区分）
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Dispatch timed out after {0}s")]
    Timeout(u64),

    #[error("Dispatch failed: {0}")]
    Failed(String),
}

/// 单个思考在管线中的硬错误
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Step {step} failed: {source}")]
    Evaluation {
        step: StepPoint,
        #[source]
        source: EvaluatorError,
    },

    #[error("Dispatch failed after {attempts} attempt(s): {source}")]
    Dispatch {
        attempts: u32,
        #[source]
        source: DispatchError,
    },

    /// 动作已分发，但结果写入失败；不能重试，否则同一条思考链会再次分发
    #[error("Action {action} dispatched but not recorded: {source}")]
    PostDispatch {
        action: String,
        task_complete: bool,
        #[source]
        source: StoreError,
    },

    #[error("Task {0} is no longer active")]
    TaskInactive(String),

    #[error("Cancelled")]
    Cancelled,
}

/// 运行时（调度器 / 生命周期 / 配置）错误
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 思考置为 FAILED，下一轮为任务生成重试种子思考（受重试预算约束）
    RetryWithNewSeed(String),
    /// 已在分发层重试过，交给延期（人工 / Wise Authority）通道
    Defer(String),
    /// 所有权违规：拒绝调用并触发一致性告警
    ConsistencyAlarm(String),
    /// 终止当前思考，不计入重试
    Abort,
}

static CONSISTENCY_ALARMS: AtomicU64 = AtomicU64::new(0);

/// 记录一次一致性告警（所有权违规）
pub fn raise_consistency_alarm(entity: &str, id: &str, occurrence: &str) {
    CONSISTENCY_ALARMS.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        alarm = "ownership_violation",
        entity,
        id,
        occurrence,
        "Mutation rejected: record is not owned by this occurrence"
    );
}

/// 记录一次一致性告警（动作已分发但结果未落盘）
pub fn raise_dispatch_alarm(thought_id: &str, occurrence: &str, detail: &str) {
    CONSISTENCY_ALARMS.fetch_add(1, Ordering::Relaxed);
    tracing::error!(
        alarm = "post_dispatch_write",
        thought_id,
        occurrence,
        detail,
        "Action was dispatched but its result could not be recorded"
    );
}

/// 进程内累计的一致性告警次数
pub fn consistency_alarms() -> u64 {
    CONSISTENCY_ALARMS.load(Ordering::Relaxed)
}
