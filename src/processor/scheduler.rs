//! 轮次调度：激活 → 播种 → 入队 → 并发跑管线 → 记录轮次完成 → 等待下一轮
//!
//! 一轮不可重入：上一轮队列完全处理完之前不会再次 populate_queue。
//! 同一任务的思考按队列顺序串行处理；不同任务之间最多 max_in_flight 个并发。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowSection;
use crate::core::RuntimeError;
use crate::persistence::{OccurrenceId, Store};
use crate::processor::{
    PipelineOrchestrator, ProcessingQueueItem, RoundContext, StepEvent, StepObservers, TaskManager,
    ThoughtManager, ThoughtOutcome,
};

/// 单轮统计
#[derive(Debug, Clone, Default)]
pub struct RoundReport {
    pub round_number: u64,
    pub activated: usize,
    pub seeded: usize,
    /// 因所属任务已终止而被置为 FAILED 的残留思考
    pub swept: usize,
    /// 中断处理留下的细化思考，置为 FAILED 后只由父思考重跑
    pub orphaned: usize,
    pub outcomes: Vec<ThoughtOutcome>,
}

impl RoundReport {
    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn interrupted(&self) -> bool {
        self.outcomes.iter().any(|o| matches!(o, ThoughtOutcome::Interrupted))
    }
}

/// run 的结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    Cancelled,
    RoundLimit,
}

pub struct RoundScheduler {
    store: Arc<Store>,
    occurrence: OccurrenceId,
    tasks: Arc<TaskManager>,
    thoughts: Arc<ThoughtManager>,
    pipeline: Arc<PipelineOrchestrator>,
    observers: Arc<StepObservers>,
    max_in_flight: usize,
    round_delay: Duration,
    max_rounds: Option<u64>,
}

impl RoundScheduler {
    pub fn new(
        tasks: Arc<TaskManager>,
        thoughts: Arc<ThoughtManager>,
        pipeline: Arc<PipelineOrchestrator>,
        observers: Arc<StepObservers>,
        workflow: &WorkflowSection,
    ) -> Self {
        Self {
            store: tasks.store().clone(),
            occurrence: tasks.occurrence().clone(),
            tasks,
            thoughts,
            pipeline,
            observers,
            max_in_flight: workflow.max_in_flight.max(1),
            round_delay: Duration::from_millis(workflow.round_delay_ms),
            max_rounds: workflow.max_rounds,
        }
    }

    /// 执行一轮
    pub async fn run_round(&self, cancel: &CancellationToken) -> Result<RoundReport, RuntimeError> {
        let round_number = self.store.current_round(&self.occurrence).await? + 1;
        let swept = self.store.fail_thoughts_of_inactive_tasks(&self.occurrence).await?;
        if swept > 0 {
            tracing::info!(round = round_number, swept, "Failed thoughts of terminated tasks");
        }
        let orphaned = self.store.fail_orphaned_refinements(&self.occurrence).await?;
        if orphaned > 0 {
            tracing::warn!(round = round_number, orphaned, "Failed refinements left by an interrupted round");
        }
        let activated = self.tasks.activate_pending_tasks().await?;
        let seed = self
            .thoughts
            .seed_active_tasks(round_number, self.pipeline.evaluators().deferral.as_ref())
            .await?;
        let queue = self.thoughts.populate_queue(round_number).await?;

        self.observers.emit(StepEvent::RoundStarted {
            round: round_number,
            queued: queue.len(),
        });
        tracing::debug!(round = round_number, activated, seeded = seed.seeded, queued = queue.len(), "Round started");

        let round = RoundContext::new(round_number, cancel.clone());
        let outcomes = self.process_queue(queue, &round).await;
        round.complete(&self.observers).await;

        self.store.record_round_complete(&self.occurrence, round_number).await?;
        self.observers.emit(StepEvent::RoundCompleted {
            round: round_number,
            processed: outcomes.len(),
        });
        if !outcomes.is_empty() {
            tracing::info!(round = round_number, processed = outcomes.len(), "Round complete");
        }

        Ok(RoundReport {
            round_number,
            activated,
            seeded: seed.seeded,
            swept,
            orphaned,
            outcomes,
        })
    }

    /// 按任务分组：组内串行，组间受 max_in_flight 约束并发
    async fn process_queue(&self, queue: Vec<ProcessingQueueItem>, round: &RoundContext) -> Vec<ThoughtOutcome> {
        let mut groups: Vec<(String, Vec<ProcessingQueueItem>)> = Vec::new();
        for item in queue {
            match groups.iter_mut().find(|(task_id, _)| task_id == item.task_id()) {
                Some((_, items)) => items.push(item),
                None => groups.push((item.task_id().to_string(), vec![item])),
            }
        }

        let permits = Semaphore::new(self.max_in_flight);
        let runs = groups.iter().map(|(_, items)| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await.ok();
                let mut outcomes = Vec::with_capacity(items.len());
                for item in items {
                    let outcome = self.pipeline.process_thought(item, round).await;
                    let stop = matches!(outcome, ThoughtOutcome::Interrupted);
                    outcomes.push(outcome);
                    if stop {
                        break;
                    }
                }
                outcomes
            }
        });
        join_all(runs).await.into_iter().flatten().collect()
    }

    /// 持续运行直到取消或达到 max_rounds；单轮出错只记录日志，下一轮继续
    pub async fn run(&self, cancel: &CancellationToken) -> RunStop {
        let mut rounds = 0u64;
        loop {
            if cancel.is_cancelled() {
                return RunStop::Cancelled;
            }
            match self.run_round(cancel).await {
                Ok(report) if report.interrupted() => return RunStop::Cancelled,
                Ok(_) => {}
                Err(e) => tracing::error!(occurrence = %self.occurrence, error = %e, "Round failed"),
            }
            rounds += 1;
            if self.max_rounds.is_some_and(|max| rounds >= max) {
                tracing::info!(rounds, "Round limit reached");
                return RunStop::RoundLimit;
            }
            tokio::select! {
                _ = cancel.cancelled() => return RunStop::Cancelled,
                _ = tokio::time::sleep(self.round_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineController, StepPoint};
    use crate::evaluators::mock::{
        PassingConscience, RecordingDeferral, RecordingDispatcher, ScriptedSelector, StaticContext, StaticDma,
    };
    use crate::evaluators::{ActionType, DmaKind, EvaluatorSet};
    use crate::persistence::{TaskStatus, ThoughtStatus};
    use crate::processor::PipelineSettings;

    struct Fixture {
        store: Arc<Store>,
        tasks: Arc<TaskManager>,
        dispatcher: Arc<RecordingDispatcher>,
        observers: Arc<StepObservers>,
        scheduler: RoundScheduler,
    }

    fn fixture(selector: ScriptedSelector, workflow: WorkflowSection) -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let occurrence = OccurrenceId::new("a");
        let tasks = Arc::new(TaskManager::new(store.clone(), occurrence.clone(), 10, 1));
        let thoughts = Arc::new(ThoughtManager::new(tasks.clone(), 50, 8));
        let observers = Arc::new(StepObservers::new(occurrence, 1024));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let evaluators = EvaluatorSet::builder()
            .context(Arc::new(StaticContext))
            .dma(Arc::new(StaticDma::new(DmaKind::Ethical)))
            .selector(Arc::new(selector))
            .conscience(Arc::new(PassingConscience))
            .dispatcher(dispatcher.clone())
            .deferral(Arc::new(RecordingDeferral::default()))
            .build()
            .unwrap();
        let pipeline = Arc::new(PipelineOrchestrator::new(
            tasks.clone(),
            thoughts.clone(),
            evaluators,
            Arc::new(PipelineController::new()),
            observers.clone(),
            PipelineSettings::default(),
        ));
        let scheduler = RoundScheduler::new(tasks.clone(), thoughts, pipeline, observers.clone(), &workflow);
        Fixture {
            store,
            tasks,
            dispatcher,
            observers,
            scheduler,
        }
    }

    fn workflow() -> WorkflowSection {
        WorkflowSection {
            round_delay_ms: 1,
            ..WorkflowSection::default()
        }
    }

    #[tokio::test]
    async fn test_round_processes_each_active_task() {
        let f = fixture(ScriptedSelector::always(ActionType::Speak), workflow());
        let t1 = f.tasks.create_task("hello", "general", 0, None).await.unwrap();
        let t2 = f.tasks.create_task("news", "random", 0, None).await.unwrap();
        let mut events = f.observers.subscribe_events();
        let cancel = CancellationToken::new();

        let report = f.scheduler.run_round(&cancel).await.unwrap();
        assert_eq!(report.round_number, 1);
        assert_eq!(report.activated, 2);
        assert_eq!(report.seeded, 2);
        assert_eq!(report.processed(), 2);
        assert_eq!(f.dispatcher.dispatched().len(), 2);
        for task in [&t1, &t2] {
            assert_eq!(f.tasks.get_task(&task.task_id).await.unwrap().unwrap().status, TaskStatus::Completed);
        }
        assert_eq!(f.store.current_round(f.tasks.occurrence()).await.unwrap(), 1);

        let mut saw_start = false;
        let mut saw_end = false;
        while let Ok(event) = events.try_recv() {
            match event {
                StepEvent::RoundStarted { round: 1, queued: 2 } => saw_start = true,
                StepEvent::RoundCompleted { round: 1, processed: 2 } => saw_end = true,
                _ => {}
            }
        }
        assert!(saw_start && saw_end);

        let snapshot = f.observers.watch_snapshot().borrow().clone();
        assert_eq!(snapshot.round_number, 1);
        assert!(snapshot
            .thoughts
            .iter()
            .all(|t| t.current_step == Some(StepPoint::RoundComplete)));

        let next = f.scheduler.run_round(&cancel).await.unwrap();
        assert_eq!(next.round_number, 2);
        assert_eq!(next.processed(), 0);
    }

    #[tokio::test]
    async fn test_same_channel_tasks_run_in_sequence() {
        let f = fixture(ScriptedSelector::always(ActionType::TaskComplete), workflow());
        let first = f.tasks.create_task("first", "general", 0, None).await.unwrap();
        let second = f.tasks.create_task("second", "general", 0, None).await.unwrap();
        let cancel = CancellationToken::new();

        let report = f.scheduler.run_round(&cancel).await.unwrap();
        assert_eq!(report.activated, 1);
        assert_eq!(f.tasks.get_task(&first.task_id).await.unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(f.tasks.get_task(&second.task_id).await.unwrap().unwrap().status, TaskStatus::Pending);

        f.scheduler.run_round(&cancel).await.unwrap();
        assert_eq!(f.tasks.get_task(&second.task_id).await.unwrap().unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_non_terminal_action_reseeds_next_round() {
        let f = fixture(
            ScriptedSelector::script(vec![ActionType::Ponder, ActionType::Speak]),
            workflow(),
        );
        let task = f.tasks.create_task("think first", "general", 0, None).await.unwrap();
        let cancel = CancellationToken::new();

        f.scheduler.run_round(&cancel).await.unwrap();
        assert_eq!(f.tasks.get_task(&task.task_id).await.unwrap().unwrap().status, TaskStatus::Active);

        let report = f.scheduler.run_round(&cancel).await.unwrap();
        assert_eq!(report.seeded, 1);
        assert_eq!(f.tasks.get_task(&task.task_id).await.unwrap().unwrap().status, TaskStatus::Completed);
        let thoughts = f.store.get_thoughts_by_task(&task.task_id, f.tasks.occurrence()).await.unwrap();
        assert_eq!(thoughts.len(), 2);
        assert!(thoughts.iter().all(|t| t.round_number <= 2));
    }

    #[tokio::test]
    async fn test_cancelled_task_thoughts_are_swept() {
        let f = fixture(ScriptedSelector::always(ActionType::Speak), workflow());
        let task = f.tasks.create_task("cancel me", "general", 0, None).await.unwrap();
        f.tasks.activate_pending_tasks().await.unwrap();
        let seed = ThoughtManager::new(f.tasks.clone(), 50, 8)
            .generate_seed_thought(&task, 1)
            .await
            .unwrap();
        f.tasks.cancel_task(&task.task_id, "operator").await.unwrap();

        let report = f.scheduler.run_round(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.swept, 1);
        assert_eq!(report.processed(), 0);
        let stored = f.store.get_thought(&seed.thought_id, f.tasks.occurrence()).await.unwrap().unwrap();
        assert_eq!(stored.status, ThoughtStatus::Failed);
        assert!(f.dispatcher.dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_at_round_limit_or_cancel() {
        let limited = fixture(
            ScriptedSelector::always(ActionType::Speak),
            WorkflowSection {
                max_rounds: Some(3),
                ..workflow()
            },
        );
        let stop = limited.scheduler.run(&CancellationToken::new()).await;
        assert_eq!(stop, RunStop::RoundLimit);
        assert_eq!(limited.store.current_round(limited.tasks.occurrence()).await.unwrap(), 3);

        let open = fixture(ScriptedSelector::always(ActionType::Speak), workflow());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(open.scheduler.run(&cancel).await, RunStop::Cancelled);
        assert_eq!(open.store.current_round(open.tasks.occurrence()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_orphaned_refinement_is_not_dispatched_again() {
        let f = fixture(ScriptedSelector::always(ActionType::Ponder), workflow());
        let task = f.tasks.create_task("interrupted", "general", 0, None).await.unwrap();
        f.tasks.activate_pending_tasks().await.unwrap();
        let thoughts = ThoughtManager::new(f.tasks.clone(), 50, 8);
        let seed = thoughts.generate_seed_thought(&task, 1).await.unwrap();
        f.store
            .update_thought_status(&seed.thought_id, ThoughtStatus::Processing, f.tasks.occurrence(), None)
            .await
            .unwrap();
        // 上一次运行在细化途中退出
        let child = thoughts.create_refinement(&seed, "reconsider").await.unwrap();

        let report = f.scheduler.run_round(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.processed(), 1);
        assert_eq!(f.dispatcher.dispatched().len(), 1);

        let stored = f.store.get_thought(&child.thought_id, f.tasks.occurrence()).await.unwrap().unwrap();
        assert_eq!(stored.status, ThoughtStatus::Failed);
        let stored = f.store.get_thought(&seed.thought_id, f.tasks.occurrence()).await.unwrap().unwrap();
        assert_eq!(stored.status, ThoughtStatus::Completed);
    }
}
