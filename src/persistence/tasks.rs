//! 任务表读写；所有查询都按 occurrence 过滤

use rusqlite::{params, OptionalExtension, Row};

use super::{classify_miss, json_column, limit_param, now_millis, OccurrenceId, Store, Task, TaskStatus};
use crate::core::StoreError;

const TASK_COLUMNS: &str = "task_id, channel_id, agent_occurrence_id, description, status, priority, \
     created_at, updated_at, parent_task_id, context_json, retry_count, failure_reason";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        task_id: row.get(0)?,
        channel_id: row.get(1)?,
        agent_occurrence_id: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        parent_task_id: row.get(8)?,
        context: json_column(row, 9)?,
        retry_count: row.get(10)?,
        failure_reason: row.get(11)?,
    })
}

impl Store {
    /// 插入任务；ID 重复时返回 Sqlite 约束错误
    pub async fn add_task(&self, task: &Task) -> Result<(), StoreError> {
        let context = serde_json::to_string(&task.context)?;
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                task.task_id,
                task.channel_id,
                task.agent_occurrence_id,
                task.description,
                task.status,
                task.priority,
                task.created_at,
                task.updated_at,
                task.parent_task_id,
                context,
                task.retry_count,
                task.failure_reason,
            ],
        )?;
        Ok(())
    }

    /// 原子「不存在则插入」：返回 true 表示本次插入成功，false 表示 ID 已存在
    pub async fn insert_task_if_absent(&self, task: &Task) -> Result<bool, StoreError> {
        let context = serde_json::to_string(&task.context)?;
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                task.task_id,
                task.channel_id,
                task.agent_occurrence_id,
                task.description,
                task.status,
                task.priority,
                task.created_at,
                task.updated_at,
                task.parent_task_id,
                context,
                task.retry_count,
                task.failure_reason,
            ],
        )?;
        Ok(inserted == 1)
    }

    pub async fn get_task(
        &self,
        task_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1 AND agent_occurrence_id = ?2"),
                params![task_id, occurrence],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// 更新任务状态；reason 仅在提供时覆盖 failure_reason
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        occurrence: &OccurrenceId,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, failure_reason = COALESCE(?2, failure_reason), updated_at = ?3
             WHERE task_id = ?4 AND agent_occurrence_id = ?5",
            params![status, reason, now_millis(), task_id, occurrence],
        )?;
        if changed == 0 {
            return Err(classify_miss(&conn, "task", task_id, occurrence));
        }
        Ok(())
    }

    /// 接管停滞的 ACTIVE 记录：原认领者就是 record.context.user_id，或记录在 stale_before 之前就没有更新过
    ///
    /// 单条条件 UPDATE，多个实例同时接管时只有一个成功；成功后 updated_at 即新的认领时间。
    pub async fn take_over_stale_task(&self, record: &Task, stale_before: i64) -> Result<bool, StoreError> {
        let context = serde_json::to_string(&record.context)?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tasks SET description = ?1, context_json = ?2, updated_at = ?3, failure_reason = NULL
             WHERE task_id = ?4 AND agent_occurrence_id = ?5 AND status = 'active'
               AND (json_extract(context_json, '$.user_id') = ?6 OR updated_at < ?7)",
            params![
                record.description,
                context,
                now_millis(),
                record.task_id,
                record.agent_occurrence_id,
                record.context.user_id,
                stale_before,
            ],
        )?;
        Ok(changed == 1)
    }

    /// 把本实例下某父任务的未终止子任务置为 FAILED，返回影响行数
    pub async fn fail_open_children(
        &self,
        parent_task_id: &str,
        occurrence: &OccurrenceId,
        reason: &str,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'failed', failure_reason = ?1, updated_at = ?2
             WHERE parent_task_id = ?3 AND agent_occurrence_id = ?4 AND status IN ('pending', 'active')",
            params![reason, now_millis(), parent_task_id, occurrence],
        )?;
        Ok(changed)
    }

    /// 关闭上一次运行遗留的 PENDING/ACTIVE 任务（创建于 created_before 之前）
    ///
    /// 生命周期决策的子任务（父任务在共享作用域下）置为 FAILED，其余自动完成。
    /// 返回 (自动完成的任务, 失败的决策子任务)。
    pub async fn close_stale_tasks(
        &self,
        occurrence: &OccurrenceId,
        created_before: i64,
    ) -> Result<(Vec<String>, Vec<String>), StoreError> {
        let conn = self.conn.lock().await;
        let now = now_millis();
        let failed = {
            let mut stmt = conn.prepare(
                "UPDATE tasks SET status = 'failed', failure_reason = 'interrupted by restart', updated_at = ?1
                 WHERE agent_occurrence_id = ?2 AND status IN ('pending', 'active') AND created_at < ?3
                   AND parent_task_id IN (SELECT task_id FROM tasks WHERE agent_occurrence_id = ?4)
                 RETURNING task_id",
            )?;
            let rows = stmt.query_map(params![now, occurrence, created_before, OccurrenceId::shared()], |row| {
                row.get::<_, String>(0)
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let completed = {
            let mut stmt = conn.prepare(
                "UPDATE tasks SET status = 'completed', updated_at = ?1
                 WHERE agent_occurrence_id = ?2 AND status IN ('pending', 'active') AND created_at < ?3
                 RETURNING task_id",
            )?;
            let rows = stmt.query_map(params![now, occurrence, created_before], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok((completed, failed))
    }

    /// 重试计数 +1，返回新值
    pub async fn increment_task_retry(
        &self,
        task_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let count: Option<u32> = conn
            .query_row(
                "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ?1
                 WHERE task_id = ?2 AND agent_occurrence_id = ?3
                 RETURNING retry_count",
                params![now_millis(), task_id, occurrence],
                |row| row.get(0),
            )
            .optional()?;
        count.ok_or_else(|| classify_miss(&conn, "task", task_id, occurrence))
    }

    pub async fn count_tasks(
        &self,
        status: TaskStatus,
        occurrence: &OccurrenceId,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE agent_occurrence_id = ?1 AND status = ?2",
            params![occurrence, status],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// 按创建顺序列出某状态的任务
    pub async fn get_tasks_by_status(
        &self,
        status: TaskStatus,
        occurrence: &OccurrenceId,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE agent_occurrence_id = ?1 AND status = ?2
             ORDER BY created_at ASC, rowid ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![occurrence, status, limit_param(limit)], task_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_active_task_for_channel(
        &self,
        channel_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE agent_occurrence_id = ?1 AND channel_id = ?2 AND status = 'active'
                     ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                params![occurrence, channel_id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// 单条条件 UPDATE：仅当任务仍为 PENDING 且同频道在本实例下没有 ACTIVE 任务时激活
    pub async fn activate_task_if_channel_free(
        &self,
        task_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE tasks SET status = 'active', updated_at = ?1
             WHERE task_id = ?2 AND agent_occurrence_id = ?3 AND status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM tasks other
                   WHERE other.agent_occurrence_id = ?3
                     AND other.channel_id = tasks.channel_id
                     AND other.status = 'active'
               )",
            params![now_millis(), task_id, occurrence],
        )?;
        Ok(changed == 1)
    }

    /// 本实例下没有 PENDING/PROCESSING 思考的 ACTIVE 任务（需要新种子）
    pub async fn active_tasks_without_open_thoughts(
        &self,
        occurrence: &OccurrenceId,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t
             WHERE t.agent_occurrence_id = ?1 AND t.status = 'active'
               AND NOT EXISTS (
                   SELECT 1 FROM thoughts th
                   WHERE th.source_task_id = t.task_id
                     AND th.agent_occurrence_id = ?1
                     AND th.status IN ('pending', 'processing')
               )
             ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC"
        ))?;
        let rows = stmt.query_map(params![occurrence], task_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::consistency_alarms;

    fn occ(id: &str) -> OccurrenceId {
        OccurrenceId::new(id)
    }

    #[tokio::test]
    async fn test_task_reads_are_scoped() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new(occ("a"), "general", "hello", 0);
        store.add_task(&task).await.unwrap();

        assert!(store.get_task(&task.task_id, &occ("a")).await.unwrap().is_some());
        assert!(store.get_task(&task.task_id, &occ("b")).await.unwrap().is_none());
        assert_eq!(store.count_tasks(TaskStatus::Pending, &occ("a")).await.unwrap(), 1);
        assert_eq!(store.count_tasks(TaskStatus::Pending, &occ("b")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cross_occurrence_update_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new(occ("a"), "general", "hello", 0);
        store.add_task(&task).await.unwrap();

        let before = consistency_alarms();
        let err = store
            .update_task_status(&task.task_id, TaskStatus::Failed, &occ("b"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OwnershipViolation { .. }));
        assert!(consistency_alarms() > before);

        let unchanged = store.get_task(&task.task_id, &occ("a")).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Pending);

        let missing = store
            .update_task_status("task_missing", TaskStatus::Failed, &occ("a"), None)
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_insert_if_absent_and_duplicate_ids() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new(OccurrenceId::shared(), "general", "wakeup", 10).with_id("WAKEUP_SHARED_20251027");
        assert!(store.insert_task_if_absent(&task).await.unwrap());
        assert!(!store.insert_task_if_absent(&task).await.unwrap());
        assert!(store.add_task(&task).await.is_err());
    }

    #[tokio::test]
    async fn test_activation_guard_respects_channel() {
        let store = Store::open_in_memory().unwrap();
        let first = Task::new(occ("a"), "general", "one", 0);
        let second = Task::new(occ("a"), "general", "two", 0);
        let other_channel = Task::new(occ("a"), "random", "three", 0);
        for t in [&first, &second, &other_channel] {
            store.add_task(t).await.unwrap();
        }

        assert!(store.activate_task_if_channel_free(&first.task_id, &occ("a")).await.unwrap());
        assert!(!store.activate_task_if_channel_free(&second.task_id, &occ("a")).await.unwrap());
        assert!(store.activate_task_if_channel_free(&other_channel.task_id, &occ("a")).await.unwrap());
        // 其它实例无法激活本实例的任务
        assert!(!store.activate_task_if_channel_free(&second.task_id, &occ("b")).await.unwrap());

        let active = store.get_active_task_for_channel("general", &occ("a")).await.unwrap().unwrap();
        assert_eq!(active.task_id, first.task_id);
        assert!(store.get_active_task_for_channel("general", &occ("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_record_take_over() {
        let store = Store::open_in_memory().unwrap();
        let record = Task::new(OccurrenceId::shared(), "system", "claimed by a", 0)
            .with_id("WAKEUP_SHARED_20251027")
            .with_status(TaskStatus::Active)
            .with_user("a");
        assert!(store.insert_task_if_absent(&record).await.unwrap());
        let fresh = now_millis() - 60_000;

        // 其它实例：记录还新，不能接管
        let by_b = record.clone().with_user("b");
        assert!(!store.take_over_stale_task(&by_b, fresh).await.unwrap());
        // 原认领者重启后可以接管
        assert!(store.take_over_stale_task(&record, fresh).await.unwrap());
        // 记录过期后其它实例可以接管
        assert!(store.take_over_stale_task(&by_b, now_millis() + 1).await.unwrap());
        let stored = store.get_task(&record.task_id, &OccurrenceId::shared()).await.unwrap().unwrap();
        assert_eq!(stored.context.user_id.as_deref(), Some("b"));

        store
            .update_task_status(&record.task_id, TaskStatus::Completed, &OccurrenceId::shared(), None)
            .await
            .unwrap();
        assert!(!store.take_over_stale_task(&by_b, now_millis() + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_stale_tasks_from_previous_run() {
        let store = Store::open_in_memory().unwrap();
        let record = Task::new(OccurrenceId::shared(), "system", "decision", 0).with_id("WAKEUP_SHARED_20251027");
        store.add_task(&record).await.unwrap();
        let mut step = Task::new(occ("a"), "system", "step", 0)
            .with_parent(record.task_id.as_str())
            .with_status(TaskStatus::Active);
        step.created_at -= 600_000;
        let mut old = Task::new(occ("a"), "general", "old", 0).with_status(TaskStatus::Active);
        old.created_at -= 600_000;
        let young = Task::new(occ("a"), "general", "young", 0);
        let mut foreign = Task::new(occ("b"), "general", "foreign", 0).with_status(TaskStatus::Active);
        foreign.created_at -= 600_000;
        for t in [&step, &old, &young, &foreign] {
            store.add_task(t).await.unwrap();
        }

        let (completed, failed) = store.close_stale_tasks(&occ("a"), now_millis() - 300_000).await.unwrap();
        assert_eq!(completed, vec![old.task_id.clone()]);
        assert_eq!(failed, vec![step.task_id.clone()]);
        let young_now = store.get_task(&young.task_id, &occ("a")).await.unwrap().unwrap();
        assert_eq!(young_now.status, TaskStatus::Pending);
        let foreign_now = store.get_task(&foreign.task_id, &occ("b")).await.unwrap().unwrap();
        assert_eq!(foreign_now.status, TaskStatus::Active);
        assert!(store.activate_task_if_channel_free(&young.task_id, &occ("a")).await.unwrap());

        let sibling = Task::new(occ("a"), "system", "sibling", 0).with_parent(record.task_id.as_str());
        store.add_task(&sibling).await.unwrap();
        assert_eq!(store.fail_open_children(&record.task_id, &occ("a"), "superseded").await.unwrap(), 1);
        assert_eq!(store.fail_open_children(&record.task_id, &occ("b"), "superseded").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_counter_and_failure_reason() {
        let store = Store::open_in_memory().unwrap();
        let task = Task::new(occ("a"), "general", "flaky", 0);
        store.add_task(&task).await.unwrap();

        assert_eq!(store.increment_task_retry(&task.task_id, &occ("a")).await.unwrap(), 1);
        assert_eq!(store.increment_task_retry(&task.task_id, &occ("a")).await.unwrap(), 2);
        assert!(store.increment_task_retry(&task.task_id, &occ("b")).await.is_err());

        store
            .update_task_status(&task.task_id, TaskStatus::Failed, &occ("a"), Some("retry budget exhausted"))
            .await
            .unwrap();
        let failed = store.get_task(&task.task_id, &occ("a")).await.unwrap().unwrap();
        assert_eq!(failed.retry_count, 2);
        assert_eq!(failed.failure_reason.as_deref(), Some("retry budget exhausted"));
    }
}
