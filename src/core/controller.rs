//! 管线控制：暂停 / 恢复 / 单步
//!
//! 管线在每个步骤点之前调用 checkpoint()；暂停时阻塞，直到 single_step() 放行一步、resume() 或取消。
//! 只影响本实例内存中的执行节奏，不修改任何持久状态。

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::RuntimeError;

/// 单实例的管线执行控制器
#[derive(Debug)]
pub struct PipelineController {
    paused_tx: watch::Sender<bool>,
    /// 暂停期间每个许可放行一次步骤切换
    step_permits: Semaphore,
}

impl PipelineController {
    pub fn new() -> Self {
        let (paused_tx, _) = watch::channel(false);
        Self {
            paused_tx,
            step_permits: Semaphore::new(0),
        }
    }

    /// 暂停；已暂停时同样返回 true
    pub fn pause(&self) -> bool {
        if !self.paused_tx.send_replace(true) {
            tracing::info!("Pipeline paused");
        }
        true
    }

    /// 恢复；未暂停时返回 false
    pub fn resume(&self) -> bool {
        let was_paused = self.paused_tx.send_replace(false);
        while let Ok(permit) = self.step_permits.try_acquire() {
            permit.forget();
        }
        if was_paused {
            tracing::info!("Pipeline resumed");
        }
        was_paused
    }

    /// 暂停状态下放行恰好一次步骤切换
    pub fn single_step(&self) -> Result<(), RuntimeError> {
        if !self.is_paused() {
            return Err(RuntimeError::Lifecycle(
                "Cannot single-step unless the pipeline is paused".to_string(),
            ));
        }
        self.step_permits.add_permits(1);
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    /// 步骤点检查：未暂停立即返回 true；被取消返回 false
    pub async fn checkpoint(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.paused_tx.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                permit = self.step_permits.acquire() => {
                    if let Ok(permit) = permit {
                        permit.forget();
                    }
                    return true;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let controller = PipelineController::new();
        let token = CancellationToken::new();
        assert!(controller.checkpoint(&token).await);
    }

    #[tokio::test]
    async fn test_single_step_releases_one_checkpoint() {
        let controller = Arc::new(PipelineController::new());
        controller.pause();
        let token = CancellationToken::new();

        let c = Arc::clone(&controller);
        let t = token.clone();
        let handle = tokio::spawn(async move {
            c.checkpoint(&t).await;
            c.checkpoint(&t).await
        });

        controller.single_step().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "second checkpoint must still be blocked");

        controller.single_step().unwrap();
        let passed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(passed);
    }

    #[tokio::test]
    async fn test_resume_and_cancel() {
        let controller = Arc::new(PipelineController::new());
        assert!(controller.single_step().is_err());
        controller.pause();

        let token = CancellationToken::new();
        let c = Arc::clone(&controller);
        let t = token.clone();
        let handle = tokio::spawn(async move { c.checkpoint(&t).await });
        assert!(controller.resume());
        assert!(handle.await.unwrap());
        assert!(!controller.resume());

        controller.pause();
        token.cancel();
        assert!(!controller.checkpoint(&token).await);
    }
}
