//! 思考表读写；写入前总是确认所属任务仍属于同一 occurrence

use rusqlite::{params, OptionalExtension, Row};

use super::{
    classify_miss, json_column, limit_param, now_millis, OccurrenceId, Store, Thought,
    ThoughtStatus, MAX_THOUGHT_DEPTH,
};
use crate::core::StoreError;

const THOUGHT_COLUMNS: &str = "thought_id, source_task_id, agent_occurrence_id, status, round_number, depth, \
     parent_thought_id, content, context_json, final_action_json, created_at, updated_at";

fn thought_from_row(row: &Row<'_>) -> rusqlite::Result<Thought> {
    let final_action: Option<String> = row.get(9)?;
    let final_action = match final_action {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(Thought {
        thought_id: row.get(0)?,
        source_task_id: row.get(1)?,
        agent_occurrence_id: row.get(2)?,
        status: row.get(3)?,
        round_number: row.get(4)?,
        depth: row.get(5)?,
        parent_thought_id: row.get(6)?,
        content: row.get(7)?,
        context: json_column(row, 8)?,
        final_action,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<Thought>>) -> Result<Vec<Thought>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

impl Store {
    /// 插入思考：仅当所属任务存在且属于同一 occurrence 时写入（单条 INSERT ... SELECT）
    pub async fn add_thought(&self, thought: &Thought) -> Result<(), StoreError> {
        if thought.depth > MAX_THOUGHT_DEPTH {
            return Err(StoreError::InvalidThought(format!(
                "thought {} has depth {} (max {})",
                thought.thought_id, thought.depth, MAX_THOUGHT_DEPTH
            )));
        }
        let context = serde_json::to_string(&thought.context)?;
        let final_action = thought
            .final_action
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            &format!(
                "INSERT INTO thoughts ({THOUGHT_COLUMNS})
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
                 WHERE EXISTS (
                     SELECT 1 FROM tasks WHERE task_id = ?2 AND agent_occurrence_id = ?3
                 )"
            ),
            params![
                thought.thought_id,
                thought.source_task_id,
                thought.agent_occurrence_id,
                thought.status,
                thought.round_number,
                thought.depth,
                thought.parent_thought_id,
                thought.content,
                context,
                final_action,
                thought.created_at,
                thought.updated_at,
            ],
        )?;
        if inserted == 0 {
            return Err(classify_miss(
                &conn,
                "task",
                &thought.source_task_id,
                &thought.agent_occurrence_id,
            ));
        }
        Ok(())
    }

    pub async fn get_thought(
        &self,
        thought_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<Option<Thought>, StoreError> {
        let conn = self.conn.lock().await;
        let thought = conn
            .query_row(
                &format!(
                    "SELECT {THOUGHT_COLUMNS} FROM thoughts WHERE thought_id = ?1 AND agent_occurrence_id = ?2"
                ),
                params![thought_id, occurrence],
                thought_from_row,
            )
            .optional()?;
        Ok(thought)
    }

    /// 任务的全部思考，按轮次、深度、创建顺序
    pub async fn get_thoughts_by_task(
        &self,
        task_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<Vec<Thought>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {THOUGHT_COLUMNS} FROM thoughts
             WHERE source_task_id = ?1 AND agent_occurrence_id = ?2
             ORDER BY round_number ASC, depth ASC, created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![task_id, occurrence], thought_from_row)?;
        collect(rows)
    }

    /// 更新思考状态；同时复核思考与所属任务的 occurrence 一致
    pub async fn update_thought_status(
        &self,
        thought_id: &str,
        status: ThoughtStatus,
        occurrence: &OccurrenceId,
        final_action: Option<&serde_json::Value>,
    ) -> Result<(), StoreError> {
        let final_action = final_action.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE thoughts
             SET status = ?1, final_action_json = COALESCE(?2, final_action_json), updated_at = ?3
             WHERE thought_id = ?4 AND agent_occurrence_id = ?5
               AND EXISTS (
                   SELECT 1 FROM tasks
                   WHERE tasks.task_id = thoughts.source_task_id AND tasks.agent_occurrence_id = ?5
               )",
            params![status, final_action, now_millis(), thought_id, occurrence],
        )?;
        if changed == 0 {
            return Err(classify_miss(&conn, "thought", thought_id, occurrence));
        }
        Ok(())
    }

    /// 可入队的思考：PENDING/PROCESSING 且所属任务在本实例下为 ACTIVE
    ///
    /// 顺序：任务优先级降序、任务创建时间，再按轮次与深度
    pub async fn get_queueable_thoughts(
        &self,
        occurrence: &OccurrenceId,
        limit: Option<usize>,
    ) -> Result<Vec<Thought>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT th.thought_id, th.source_task_id, th.agent_occurrence_id, th.status, th.round_number,
                    th.depth, th.parent_thought_id, th.content, th.context_json, th.final_action_json,
                    th.created_at, th.updated_at
             FROM thoughts th
             JOIN tasks t
               ON t.task_id = th.source_task_id AND t.agent_occurrence_id = th.agent_occurrence_id
             WHERE th.agent_occurrence_id = ?1
               AND th.status IN ('pending', 'processing')
               AND t.status = 'active'
             ORDER BY t.priority DESC, t.created_at ASC, t.rowid ASC,
                      th.round_number ASC, th.depth ASC, th.created_at ASC, th.rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![occurrence, limit_param(limit)], thought_from_row)?;
        collect(rows)
    }

    /// 把本实例下所属任务已终止（取消/完成/失败）的未完成思考标记为 FAILED，返回影响行数
    pub async fn fail_thoughts_of_inactive_tasks(
        &self,
        occurrence: &OccurrenceId,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE thoughts SET status = 'failed', updated_at = ?1
             WHERE agent_occurrence_id = ?2
               AND status IN ('pending', 'processing')
               AND EXISTS (
                   SELECT 1 FROM tasks
                   WHERE tasks.task_id = thoughts.source_task_id
                     AND tasks.agent_occurrence_id = ?2
                     AND tasks.status IN ('completed', 'failed')
               )",
            params![now_millis(), occurrence],
        )?;
        Ok(changed)
    }

    /// 细化思考只在父思考的一次处理中存活；轮次开始时仍未完成的细化思考来自中断的处理，置为 FAILED
    ///
    /// 父思考保持原状态，下一次入队时重新走完整管线。
    pub async fn fail_orphaned_refinements(&self, occurrence: &OccurrenceId) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE thoughts SET status = 'failed', updated_at = ?1
             WHERE agent_occurrence_id = ?2 AND depth > 0 AND status IN ('pending', 'processing')",
            params![now_millis(), occurrence],
        )?;
        Ok(changed)
    }

    pub async fn count_thoughts(
        &self,
        status: ThoughtStatus,
        occurrence: &OccurrenceId,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM thoughts WHERE agent_occurrence_id = ?1 AND status = ?2",
            params![occurrence, status],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub async fn count_thoughts_for_task(
        &self,
        task_id: &str,
        occurrence: &OccurrenceId,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM thoughts WHERE source_task_id = ?1 AND agent_occurrence_id = ?2",
            params![task_id, occurrence],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
