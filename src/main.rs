//! h3ere - 单个 occurrence 的运行入口
//!
//! 用法：`h3ere [config.toml]`。初始化日志与配置，唤醒后按轮次处理任务，
//! 收到 Ctrl+C / SIGTERM 或达到 max_rounds 后走共享关闭决策并清理。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use h3ere::config::load_config;
use h3ere::core::shutdown::run_with_graceful_shutdown;
use h3ere::core::{ShutdownCoordinator, ShutdownManager, ShutdownReason, StoreCleanup};
use h3ere::observability;
use h3ere::persistence::Store;
use h3ere::processor::RunStop;
use h3ere::AgentRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    cfg.validate().context("Invalid config")?;

    let store = Arc::new(Store::open(&cfg.app.db_path).context("Failed to open store")?);
    let runtime = AgentRuntime::from_config(&cfg, store.clone()).context("Failed to build runtime")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(shutdown.clone()).with_timeout(cfg.lifecycle.shutdown_timeout_secs);
    coordinator.register(StoreCleanup::new(store));
    let token = shutdown.token();

    let app = async {
        let ready = match runtime.wakeup(&token).await {
            Ok(outcome) if outcome.is_ready() => {
                tracing::info!(occurrence = %runtime.occurrence(), ?outcome, "Agent awake");
                true
            }
            Ok(outcome) => {
                tracing::warn!(occurrence = %runtime.occurrence(), ?outcome, "Wakeup did not succeed; not processing tasks");
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Wakeup failed");
                false
            }
        };

        if !ready {
            shutdown.shutdown(ShutdownReason::FatalError("wakeup did not complete".to_string()));
        } else if runtime.run(&token).await == RunStop::RoundLimit {
            shutdown.shutdown(ShutdownReason::RoundLimit);
        }
        let reason = shutdown.reason().unwrap_or(ShutdownReason::UserInitiated);

        match runtime.shutdown(&reason.describe()).await {
            Ok(outcome) => tracing::info!(?outcome, reason = %reason.describe(), "Shutdown decision finished"),
            Err(e) => tracing::error!(error = %e, "Shutdown decision failed"),
        }
    };

    run_with_graceful_shutdown(&coordinator, app).await;

    Ok(())
}
