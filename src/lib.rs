//! H3ERE - 多实例智能体的思考处理运行时
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、管线状态、暂停/单步控制、优雅关闭
//! - **evaluators**: 评估器接口（DMA / ASPDMA / conscience / 分发 / 延期）及 LLM 与测试实现
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **persistence**: 按 occurrence 隔离的任务 / 思考存储（SQLite）
//! - **processor**: 任务与思考管理、H3ERE 管线、轮次调度、共享决策与生命周期
//! - **runtime**: 把以上组件组装成单个 occurrence 的运行时

pub mod config;
pub mod core;
pub mod evaluators;
pub mod llm;
pub mod observability;
pub mod persistence;
pub mod processor;
pub mod runtime;

pub use runtime::AgentRuntime;
