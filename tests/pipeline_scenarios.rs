//! 端到端场景：双重拒绝兜底、跨实例唤醒认领、基于 Mock LLM 的运行时

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use h3ere::config::AppConfig;
    use h3ere::core::PipelineController;
    use h3ere::evaluators::mock::{
        RecordingDeferral, RecordingDispatcher, RejectingConscience, ScriptedSelector, StaticContext, StaticDma,
    };
    use h3ere::evaluators::{ActionType, DmaKind, EvaluatorSet};
    use h3ere::llm::mock::CONSCIENCE_MARKER;
    use h3ere::llm::MockLlmClient;
    use h3ere::persistence::{OccurrenceId, Store, TaskStatus, ThoughtStatus};
    use h3ere::processor::{
        ClaimCoordinator, DecisionKey, PipelineOrchestrator, PipelineSettings, RoundScheduler,
        SharedClaimCoordinator, StepEvent, StepObservers, TaskManager, ThoughtManager, ThoughtOutcome,
    };
    use h3ere::runtime::{default_evaluators, AgentRuntime};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_rejected_twice_falls_back_to_ponder() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let a = Arc::new(TaskManager::new(store.clone(), OccurrenceId::new("A"), 10, 2));
        let b = TaskManager::new(store.clone(), OccurrenceId::new("B"), 10, 2);
        let thoughts = Arc::new(ThoughtManager::new(a.clone(), 50, 8));
        let observers = Arc::new(StepObservers::new(OccurrenceId::new("A"), 512));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let evaluators = EvaluatorSet::builder()
            .context(Arc::new(StaticContext))
            .dma(Arc::new(StaticDma::new(DmaKind::Ethical)))
            .dma(Arc::new(StaticDma::new(DmaKind::CommonSense)))
            .dma(Arc::new(StaticDma::new(DmaKind::Domain)))
            .selector(Arc::new(ScriptedSelector::script(vec![ActionType::Speak, ActionType::Tool])))
            .conscience(Arc::new(RejectingConscience::new(
                vec![ActionType::Speak, ActionType::Tool],
                "would mislead the user",
            )))
            .dispatcher(dispatcher.clone())
            .deferral(Arc::new(RecordingDeferral::default()))
            .build()
            .unwrap();
        let pipeline = Arc::new(PipelineOrchestrator::new(
            a.clone(),
            thoughts.clone(),
            evaluators,
            Arc::new(PipelineController::new()),
            observers.clone(),
            PipelineSettings::default(),
        ));
        let scheduler = RoundScheduler::new(a.clone(), thoughts, pipeline, observers.clone(), &Default::default());
        let mut events = observers.subscribe_events();

        let task = a.create_task("answer the question", "general", 0, None).await.unwrap();
        assert_eq!(b.activate_pending_tasks().await.unwrap(), 0);

        let report = scheduler.run_round(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.activated, 1);
        assert_eq!(report.outcomes.len(), 1);
        assert!(matches!(&report.outcomes[0], ThoughtOutcome::Fallback { rejected } if rejected.len() == 2));

        let dispatched = dispatcher.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].action, ActionType::Ponder);

        let thoughts = store.get_thoughts_by_task(&task.task_id, a.occurrence()).await.unwrap();
        let seed = thoughts.iter().find(|t| t.depth == 0).unwrap();
        assert_eq!(seed.status, ThoughtStatus::Completed);
        assert_eq!(seed.final_action.as_ref().unwrap()["action"], "ponder");
        assert!(thoughts.iter().all(|t| t.depth <= 1));
        assert_eq!(a.get_task(&task.task_id).await.unwrap().unwrap().status, TaskStatus::Active);

        let mut rejections = 0;
        while let Ok(event) = events.try_recv() {
            if let StepEvent::ConscienceRejected { .. } = event {
                rejections += 1;
            }
        }
        assert_eq!(rejections, 2);

        // 下一轮为仍然 ACTIVE 的任务生成新种子
        let next = scheduler.run_round(&CancellationToken::new()).await.unwrap();
        assert_eq!(next.seeded, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_occurrences_claim_wakeup_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("agent.db");
        let a = SharedClaimCoordinator::new(Arc::new(Store::open(&db).unwrap()), OccurrenceId::new("A"), "system");
        let b = SharedClaimCoordinator::new(Arc::new(Store::open(&db).unwrap()), OccurrenceId::new("B"), "system");
        let key: DecisionKey = "WAKEUP_2025-10-27".parse().unwrap();

        let (claimed_a, claimed_b) = tokio::join!(a.try_claim_shared_task(&key), b.try_claim_shared_task(&key));
        let (claimed_a, claimed_b) = (claimed_a.unwrap(), claimed_b.unwrap());
        assert!(claimed_a ^ claimed_b);

        let seen_a = a.get_latest_shared_task(&key).await.unwrap().unwrap();
        let seen_b = b.get_latest_shared_task(&key).await.unwrap().unwrap();
        assert_eq!(seen_a.task_id, "WAKEUP_SHARED_20251027");
        assert_eq!(seen_a.task_id, seen_b.task_id);
        assert_eq!(seen_a.description, seen_b.description);
        assert_eq!(seen_a.created_at, seen_b.created_at);
    }

    fn mock_config(occ: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.occurrence_id = occ.to_string();
        cfg.llm.provider = "mock".to_string();
        cfg.workflow.round_delay_ms = 1;
        cfg.workflow.max_rounds = Some(1);
        cfg
    }

    #[tokio::test]
    async fn test_runtime_with_rejecting_llm_conscience_never_speaks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cfg = mock_config("A");
        let llm = Arc::new(MockLlmClient::new().with_reply(CONSCIENCE_MARKER, "this reply could cause harm"));
        let evaluators = default_evaluators(&cfg, store.clone(), llm).unwrap();
        let runtime = AgentRuntime::build(&cfg, store.clone(), evaluators).unwrap();

        let task = runtime.create_task("tell me a secret", Some("general"), 0).await.unwrap();
        runtime.run(&CancellationToken::new()).await;

        let stored = runtime.tasks().get_task(&task.task_id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Active);
        let thoughts = store.get_thoughts_by_task(&task.task_id, runtime.occurrence()).await.unwrap();
        let seed = thoughts.iter().find(|t| t.depth == 0).unwrap();
        assert_eq!(seed.final_action.as_ref().unwrap()["action"], "ponder");
    }

    #[tokio::test]
    async fn test_shared_wakeup_then_work_then_shutdown() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let a = AgentRuntime::from_config(&mock_config("A"), store.clone()).unwrap();
        let b = AgentRuntime::from_config(&mock_config("B"), store.clone()).unwrap();
        let cancel = CancellationToken::new();

        assert!(a.wakeup(&cancel).await.unwrap().is_ready());
        assert!(b.wakeup(&cancel).await.unwrap().is_ready());
        // 唤醒任务只在认领者名下
        assert_eq!(store.count_tasks(TaskStatus::Completed, b.occurrence()).await.unwrap(), 0);

        let task = b.create_task("hello", None, 0).await.unwrap();
        b.run(&cancel).await;
        assert_eq!(b.tasks().get_task(&task.task_id).await.unwrap().unwrap().status, TaskStatus::Completed);

        assert!(a.shutdown("test finished").await.unwrap().is_ready());
        assert!(b.shutdown("test finished").await.unwrap().is_ready());
    }
}
