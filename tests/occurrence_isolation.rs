//! 多实例共享同一数据库文件时的隔离与互斥

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use futures_util::future::join_all;
    use h3ere::core::StoreError;
    use h3ere::evaluators::mock::RecordingDeferral;
    use h3ere::persistence::{OccurrenceId, Store, TaskStatus, ThoughtStatus};
    use h3ere::processor::{ClaimCoordinator, DecisionKey, SharedClaimCoordinator, TaskManager, ThoughtManager};

    /// 每个实例各自打开一个连接，模拟独立进程
    fn open(path: &Path) -> Arc<Store> {
        Arc::new(Store::open(path).unwrap())
    }

    #[tokio::test]
    async fn test_managers_never_cross_activate() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shared.db");
        let a = TaskManager::new(open(&db), OccurrenceId::new("A"), 10, 1);
        let b = TaskManager::new(open(&db), OccurrenceId::new("B"), 10, 1);

        let t1 = a.create_task("first", "general", 0, None).await.unwrap();
        let t2 = a.create_task("second", "random", 0, None).await.unwrap();

        assert_eq!(b.activate_pending_tasks().await.unwrap(), 0);
        for task in [&t1, &t2] {
            assert!(b.get_task(&task.task_id).await.unwrap().is_none());
            assert_eq!(a.get_task(&task.task_id).await.unwrap().unwrap().status, TaskStatus::Pending);
        }

        assert_eq!(a.activate_pending_tasks().await.unwrap(), 2);
        assert!(b.get_active_task_for_channel("general").await.unwrap().is_none());
        assert!(matches!(
            b.complete_task(&t1.task_id).await,
            Err(StoreError::OwnershipViolation { .. })
        ));
        assert_eq!(a.get_task(&t1.task_id).await.unwrap().unwrap().status, TaskStatus::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_channel_uniqueness_under_concurrent_activation() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shared.db");
        let seed = TaskManager::new(open(&db), OccurrenceId::new("A"), 10, 1);
        for i in 0..10 {
            seed.create_task(&format!("message {i}"), "general", 0, None).await.unwrap();
        }

        let managers: Vec<Arc<TaskManager>> = (0..6)
            .map(|_| Arc::new(TaskManager::new(open(&db), OccurrenceId::new("A"), 10, 1)))
            .collect();
        let handles = managers.iter().cloned().map(|manager| {
            tokio::spawn(async move { manager.activate_pending_tasks().await.unwrap() })
        });
        let activated: usize = join_all(handles).await.into_iter().map(|r| r.unwrap()).sum();

        assert_eq!(activated, 1);
        let store = open(&db);
        let occ = OccurrenceId::new("A");
        assert_eq!(store.count_tasks(TaskStatus::Active, &occ).await.unwrap(), 1);
        assert_eq!(store.count_tasks(TaskStatus::Pending, &occ).await.unwrap(), 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_succeed_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shared.db");
        let key: DecisionKey = "WAKEUP_2025-10-27".parse().unwrap();

        let coordinators: Vec<Arc<SharedClaimCoordinator>> = (0..8)
            .map(|i| Arc::new(SharedClaimCoordinator::new(open(&db), OccurrenceId::new(format!("occ{i}")), "system")))
            .collect();
        let handles = coordinators.iter().cloned().map(|c| {
            let key = key.clone();
            tokio::spawn(async move { c.try_claim_shared_task(&key).await.unwrap() })
        });
        let results: Vec<bool> = join_all(handles).await.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(results.iter().filter(|claimed| **claimed).count(), 1);

        let winner = results.iter().position(|claimed| *claimed).unwrap();
        coordinators[winner].complete_shared_task(&key).await.unwrap();
        for coordinator in &coordinators {
            assert!(coordinator.is_shared_task_completed(&key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_queue_only_contains_active_tasks_of_caller() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shared.db");
        let a = Arc::new(TaskManager::new(open(&db), OccurrenceId::new("A"), 1, 1));
        let b = Arc::new(TaskManager::new(open(&db), OccurrenceId::new("B"), 10, 1));
        let a_thoughts = ThoughtManager::new(a.clone(), 50, 8);
        let b_thoughts = ThoughtManager::new(b.clone(), 50, 8);

        let active = a.create_task("active", "general", 0, None).await.unwrap();
        let pending = a.create_task("pending", "random", 0, None).await.unwrap();
        let other = b.create_task("other occurrence", "general", 0, None).await.unwrap();
        assert_eq!(a.activate_pending_tasks().await.unwrap(), 1);
        assert_eq!(b.activate_pending_tasks().await.unwrap(), 1);

        a_thoughts.generate_seed_thought(&active, 1).await.unwrap();
        a_thoughts.generate_seed_thought(&pending, 1).await.unwrap();
        b_thoughts.generate_seed_thought(&other, 1).await.unwrap();

        let queue = a_thoughts.populate_queue(1).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].task_id(), active.task_id);
        assert_eq!(queue[0].thought.status, ThoughtStatus::Pending);

        let queue = b_thoughts.populate_queue(1).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].task_id(), other.task_id);

        // 取消后，下一次入队不再包含该任务的思考
        a.cancel_task(&active.task_id, "operator").await.unwrap();
        assert!(a_thoughts.populate_queue(2).await.unwrap().is_empty());
        let deferral = RecordingDeferral::default();
        assert_eq!(a_thoughts.seed_active_tasks(2, &deferral).await.unwrap().seeded, 0);
    }
}
