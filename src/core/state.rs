//! 状态定义：H3ERE 步骤点、单轮 PipelineState 与对外投影的 SchedulerSnapshot
//!
//! PipelineState 只属于当前轮次的 RoundScheduler，轮次结束即丢弃；
//! 外部观察者只拿到投影后的 SchedulerSnapshot（只读）。

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// H3ERE 管线的固定步骤（顺序不可配置）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepPoint {
    StartRound,
    GatherContext,
    PerformDmas,
    PerformAspdma,
    ConscienceExecution,
    /// 仅当首次 conscience 拒绝且 depth == 0 时执行
    RecursiveAspdma,
    /// 仅当 RecursiveAspdma 执行过时执行
    RecursiveConscience,
    FinalizeAction,
    PerformAction,
    ActionComplete,
    RoundComplete,
}

impl StepPoint {
    pub fn as_str(self) -> &'static str {
        match self {
            StepPoint::StartRound => "START_ROUND",
            StepPoint::GatherContext => "GATHER_CONTEXT",
            StepPoint::PerformDmas => "PERFORM_DMAS",
            StepPoint::PerformAspdma => "PERFORM_ASPDMA",
            StepPoint::ConscienceExecution => "CONSCIENCE_EXECUTION",
            StepPoint::RecursiveAspdma => "RECURSIVE_ASPDMA",
            StepPoint::RecursiveConscience => "RECURSIVE_CONSCIENCE",
            StepPoint::FinalizeAction => "FINALIZE_ACTION",
            StepPoint::PerformAction => "PERFORM_ACTION",
            StepPoint::ActionComplete => "ACTION_COMPLETE",
            StepPoint::RoundComplete => "ROUND_COMPLETE",
        }
    }

    /// 是否为条件分支步骤（递归细化）
    pub fn is_conditional(self) -> bool {
        matches!(self, StepPoint::RecursiveAspdma | StepPoint::RecursiveConscience)
    }
}

impl fmt::Display for StepPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个思考在本轮中的进度
#[derive(Clone, Debug, Default)]
pub struct ThoughtProgress {
    pub task_id: String,
    pub current_step: Option<StepPoint>,
    /// 已完成步骤及耗时（按执行顺序）
    pub timings: Vec<(StepPoint, Duration)>,
}

/// 单轮管线簿记：每个在途思考处于哪一步、各步耗时、是否处于暂停（单步检查）模式
#[derive(Clone, Debug, Default)]
pub struct PipelineState {
    pub round_number: u64,
    pub paused: bool,
    thoughts: HashMap<String, ThoughtProgress>,
}

impl PipelineState {
    pub fn new(round_number: u64) -> Self {
        Self {
            round_number,
            paused: false,
            thoughts: HashMap::new(),
        }
    }

    /// 记录思考进入某一步
    pub fn enter(&mut self, thought_id: &str, task_id: &str, step: StepPoint) {
        let progress = self
            .thoughts
            .entry(thought_id.to_string())
            .or_insert_with(|| ThoughtProgress {
                task_id: task_id.to_string(),
                ..Default::default()
            });
        progress.current_step = Some(step);
    }

    /// 记录某一步完成及其耗时
    pub fn finish(&mut self, thought_id: &str, step: StepPoint, elapsed: Duration) {
        if let Some(progress) = self.thoughts.get_mut(thought_id) {
            progress.timings.push((step, elapsed));
        }
    }

    /// 轮次结束：所有思考标记为 ROUND_COMPLETE
    pub fn complete_round(&mut self) {
        for progress in self.thoughts.values_mut() {
            progress.current_step = Some(StepPoint::RoundComplete);
        }
    }

    pub fn progress(&self, thought_id: &str) -> Option<&ThoughtProgress> {
        self.thoughts.get(thought_id)
    }

    pub fn in_flight(&self) -> usize {
        self.thoughts
            .values()
            .filter(|p| {
                !matches!(
                    p.current_step,
                    Some(StepPoint::ActionComplete) | Some(StepPoint::RoundComplete)
                )
            })
            .count()
    }

    /// 投影为对外只读快照
    pub fn project(&self, occurrence_id: &str) -> SchedulerSnapshot {
        let mut thoughts: Vec<ThoughtSnapshot> = self
            .thoughts
            .iter()
            .map(|(id, p)| ThoughtSnapshot {
                thought_id: id.clone(),
                task_id: p.task_id.clone(),
                current_step: p.current_step,
                step_timings_ms: p
                    .timings
                    .iter()
                    .map(|(s, d)| (*s, d.as_millis() as u64))
                    .collect(),
            })
            .collect();
        thoughts.sort_by(|a, b| a.thought_id.cmp(&b.thought_id));
        SchedulerSnapshot {
            occurrence_id: occurrence_id.to_string(),
            round_number: self.round_number,
            paused: self.paused,
            thoughts,
        }
    }
}

/// 对外投影：观察者（UI / 流式接口）看到的调度器状态
#[derive(Clone, Debug, Default, Serialize)]
pub struct SchedulerSnapshot {
    pub occurrence_id: String,
    pub round_number: u64,
    pub paused: bool,
    pub thoughts: Vec<ThoughtSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ThoughtSnapshot {
    pub thought_id: String,
    pub task_id: String,
    pub current_step: Option<StepPoint>,
    pub step_timings_ms: Vec<(StepPoint, u64)>,
}
