//! 管线过程事件：用于流式展示每个思考的步骤切换（只读，订阅者无法影响调度）

use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::core::{PipelineState, SchedulerSnapshot, StepPoint};
use crate::persistence::OccurrenceId;

/// 单步过程事件（可序列化为 JSON 供外部观察）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    /// 新一轮开始
    RoundStarted { round: u64, queued: usize },
    /// 思考进入某一步
    StepEntered {
        round: u64,
        thought_id: String,
        task_id: String,
        step: StepPoint,
    },
    /// 某一步完成
    StepFinished {
        round: u64,
        thought_id: String,
        step: StepPoint,
        elapsed_ms: u64,
    },
    /// conscience 拒绝（设计内结果，不是错误）
    ConscienceRejected {
        thought_id: String,
        depth: u8,
        reasons: Vec<String>,
    },
    /// 分发了最终动作
    ActionDispatched {
        thought_id: String,
        task_id: String,
        action: String,
        task_complete: bool,
    },
    /// 错误恢复动作（RetryWithNewSeed / Defer / ConsistencyAlarm / Abort）
    Recovery {
        thought_id: String,
        action: String,
        detail: String,
    },
    /// 本轮结束
    RoundCompleted { round: u64, processed: usize },
}

/// 观察通道：broadcast 推送 StepEvent，watch 保存最新 SchedulerSnapshot
pub struct StepObservers {
    occurrence: OccurrenceId,
    events_tx: broadcast::Sender<StepEvent>,
    snapshot_tx: watch::Sender<SchedulerSnapshot>,
}

impl StepObservers {
    pub fn new(occurrence: OccurrenceId, capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        let (snapshot_tx, _) = watch::channel(SchedulerSnapshot {
            occurrence_id: occurrence.to_string(),
            ..Default::default()
        });
        Self {
            occurrence,
            events_tx,
            snapshot_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StepEvent> {
        self.events_tx.subscribe()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// 没有订阅者时事件直接丢弃
    pub fn emit(&self, event: StepEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn publish(&self, state: &PipelineState) {
        self.snapshot_tx.send_replace(state.project(self.occurrence.as_str()));
    }
}
