//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `H3ERE__*` 覆盖（双下划线表示嵌套，如 `H3ERE__APP__OCCURRENCE_ID=b`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::RuntimeError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub workflow: WorkflowSection,
    pub pipeline: PipelineSection,
    pub lifecycle: LifecycleSection,
    pub llm: LlmSection,
}

/// [app] 段：实例身份、数据库位置、默认频道
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// 本进程的 occurrence ID；同一数据库上的多个进程必须各不相同
    #[serde(default = "default_occurrence_id")]
    pub occurrence_id: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// 生命周期任务（唤醒 / 关闭）使用的频道
    #[serde(default = "default_channel")]
    pub default_channel: String,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
}

fn default_occurrence_id() -> String {
    "default".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/h3ere.db")
}

fn default_channel() -> String {
    "system".to_string()
}

fn default_agent_name() -> String {
    "h3ere".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            occurrence_id: default_occurrence_id(),
            db_path: default_db_path(),
            default_channel: default_channel(),
            agent_name: default_agent_name(),
        }
    }
}

/// [workflow] 段：任务激活上限、队列上限、轮次节奏与重试预算
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    /// 本实例同时 ACTIVE 的任务上限
    #[serde(default = "default_max_active_tasks")]
    pub max_active_tasks: usize,
    /// 每轮入队的思考上限
    #[serde(default = "default_max_active_thoughts")]
    pub max_active_thoughts: usize,
    /// 每轮并发处理的任务数
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_round_delay_ms")]
    pub round_delay_ms: u64,
    /// 评估失败后允许的重新播种次数
    #[serde(default = "default_task_retry_budget")]
    pub task_retry_budget: u32,
    #[serde(default = "default_max_thoughts_per_task")]
    pub max_thoughts_per_task: usize,
    /// 运行到指定轮数后自动关闭；None 表示一直运行
    #[serde(default)]
    pub max_rounds: Option<u64>,
}

fn default_max_active_tasks() -> usize {
    10
}

fn default_max_active_thoughts() -> usize {
    50
}

fn default_max_in_flight() -> usize {
    4
}

fn default_round_delay_ms() -> u64 {
    1000
}

fn default_task_retry_budget() -> u32 {
    2
}

fn default_max_thoughts_per_task() -> usize {
    8
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_active_tasks: default_max_active_tasks(),
            max_active_thoughts: default_max_active_thoughts(),
            max_in_flight: default_max_in_flight(),
            round_delay_ms: default_round_delay_ms(),
            task_retry_budget: default_task_retry_budget(),
            max_thoughts_per_task: default_max_thoughts_per_task(),
            max_rounds: None,
        }
    }
}

/// [pipeline] 段：外部调用超时与重试
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_context_timeout_secs")]
    pub context_timeout_secs: u64,
    #[serde(default = "default_evaluator_timeout_secs")]
    pub evaluator_timeout_secs: u64,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// 单次 DMA / ASPDMA 调用的尝试次数
    #[serde(default = "default_dma_retry_limit")]
    pub dma_retry_limit: u32,
    #[serde(default = "default_dispatch_retry_limit")]
    pub dispatch_retry_limit: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_context_timeout_secs() -> u64 {
    10
}

fn default_evaluator_timeout_secs() -> u64 {
    30
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_dma_retry_limit() -> u32 {
    3
}

fn default_dispatch_retry_limit() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            context_timeout_secs: default_context_timeout_secs(),
            evaluator_timeout_secs: default_evaluator_timeout_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            dma_retry_limit: default_dma_retry_limit(),
            dispatch_retry_limit: default_dispatch_retry_limit(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

/// 生命周期决策的作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecisionScope {
    /// 全体实例共享一次决策（默认）
    #[default]
    Shared,
    /// 每个实例各自决策
    PerOccurrence,
}

/// [lifecycle] 段：唤醒 / 关闭决策
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleSection {
    #[serde(default)]
    pub decision_scope: DecisionScope,
    #[serde(default = "default_wakeup_enabled")]
    pub wakeup_enabled: bool,
    /// 非认领实例等待唤醒结果的上限（秒）
    #[serde(default = "default_wakeup_timeout_secs")]
    pub wakeup_timeout_secs: u64,
    /// 关闭决策（认领者执行或其它实例等待）的上限（秒）
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// 启动维护：早于该时长（秒）创建、仍为 PENDING/ACTIVE 的任务视为上一次运行的遗留
    #[serde(default = "default_stale_task_secs")]
    pub stale_task_secs: u64,
}

fn default_wakeup_enabled() -> bool {
    true
}

fn default_wakeup_timeout_secs() -> u64 {
    300
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_stale_task_secs() -> u64 {
    300
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            decision_scope: DecisionScope::default(),
            wakeup_enabled: default_wakeup_enabled(),
            wakeup_timeout_secs: default_wakeup_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            stale_task_secs: default_stale_task_secs(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock；有 API Key 时才会启用真实后端
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

impl AppConfig {
    /// 拒绝会让调度器无法前进的取值
    pub fn validate(&self) -> Result<(), RuntimeError> {
        let invalid = |msg: &str| Err(RuntimeError::Config(msg.to_string()));
        if self.app.occurrence_id.trim().is_empty() {
            return invalid("app.occurrence_id must not be empty");
        }
        if self.app.occurrence_id == crate::persistence::SHARED_OCCURRENCE {
            return invalid("app.occurrence_id must not equal the shared sentinel");
        }
        if self.app.default_channel.trim().is_empty() {
            return invalid("app.default_channel must not be empty");
        }
        if self.workflow.max_active_tasks == 0 {
            return invalid("workflow.max_active_tasks must be at least 1");
        }
        if self.workflow.max_active_thoughts == 0 {
            return invalid("workflow.max_active_thoughts must be at least 1");
        }
        if self.workflow.max_in_flight == 0 {
            return invalid("workflow.max_in_flight must be at least 1");
        }
        if self.workflow.max_thoughts_per_task == 0 {
            return invalid("workflow.max_thoughts_per_task must be at least 1");
        }
        if self.pipeline.dma_retry_limit == 0 || self.pipeline.dispatch_retry_limit == 0 {
            return invalid("pipeline retry limits must be at least 1");
        }
        if self.pipeline.context_timeout_secs == 0
            || self.pipeline.evaluator_timeout_secs == 0
            || self.pipeline.dispatch_timeout_secs == 0
        {
            return invalid("pipeline timeouts must be at least 1 second");
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 H3ERE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 H3ERE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("H3ERE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
