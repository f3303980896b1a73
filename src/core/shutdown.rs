//! 优雅关闭
//!
//! 关闭信号只取消 token；调度器在步骤边界观察到它后停下，不留下半分发的动作。
//! 之后由调用方走共享关闭决策，最后依次执行注册的清理任务（如 SQLite WAL 落盘）。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::core::RuntimeError;
use crate::persistence::Store;

/// 关闭原因；只记录第一次触发的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 达到 workflow.max_rounds
    RoundLimit,
    FatalError(String),
}

impl ShutdownReason {
    pub fn describe(&self) -> String {
        match self {
            Self::UserInitiated => "operator requested shutdown".to_string(),
            Self::Signal => "received SIGTERM".to_string(),
            Self::RoundLimit => "configured round limit reached".to_string(),
            Self::FatalError(e) => format!("fatal error: {e}"),
        }
    }
}

/// 关闭信号：一个取消 token 加上首个关闭原因
#[derive(Clone)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(reason),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发时保留最初的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            tracing::info!(reason = %reason.describe(), "Shutdown requested");
            *current = Some(reason);
            true
        });
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    /// 监听 Ctrl+C 与（unix 下）SIGTERM
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            let terminate = async {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "SIGTERM handler unavailable");
                        std::future::pending::<()>().await;
                    }
                }
            };
            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        manager.shutdown(ShutdownReason::UserInitiated);
                    }
                }
                _ = terminate => manager.shutdown(ShutdownReason::Signal),
                _ = manager.token.cancelled() => {}
            }
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 退出前执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> Result<(), RuntimeError>;
}

/// 按注册顺序执行清理，每项单独限时；单项失败不影响其它项
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanups: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanups: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, cleanup: T) {
        self.cleanups.push(Arc::new(cleanup));
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }

    /// 返回失败（或超时）的清理任务名
    pub async fn run_cleanup(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        for cleanup in &self.cleanups {
            let name = cleanup.name();
            match tokio::time::timeout(self.timeout, cleanup.cleanup()).await {
                Ok(Ok(())) => tracing::info!(cleanup = name, "Cleanup finished"),
                Ok(Err(e)) => {
                    tracing::warn!(cleanup = name, error = %e, "Cleanup failed");
                    failed.push(name);
                }
                Err(_) => {
                    tracing::warn!(cleanup = name, secs = self.timeout.as_secs(), "Cleanup timed out");
                    failed.push(name);
                }
            }
        }
        failed
    }
}

/// SQLite：WAL checkpoint
pub struct StoreCleanup {
    store: Arc<Store>,
}

impl StoreCleanup {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ShutdownCleanup for StoreCleanup {
    fn name(&self) -> &'static str {
        "sqlite_checkpoint"
    }

    async fn cleanup(&self) -> Result<(), RuntimeError> {
        self.store.checkpoint().await?;
        Ok(())
    }
}

/// 安装信号处理器，运行 app 直到它自行结束，再执行清理
///
/// app 自己负责观察 token；这里不强行中断它，保证关闭决策能走完。
pub async fn run_with_graceful_shutdown<F>(coordinator: &ShutdownCoordinator, app: F)
where
    F: Future<Output = ()>,
{
    coordinator.manager().install_signal_handlers();
    app.await;
    let failed = coordinator.run_cleanup().await;
    if failed.is_empty() {
        tracing::info!("Shutdown complete");
    } else {
        tracing::warn!(failed = ?failed, "Shutdown complete with failed cleanups");
    }
}
