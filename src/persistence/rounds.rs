//! 轮次标记：每个 occurrence 一行，记录最后完成的轮次

use rusqlite::{params, OptionalExtension};

use super::{now_millis, OccurrenceId, Store};
use crate::core::StoreError;

impl Store {
    /// 最后完成的轮次（从未运行过为 0）
    pub async fn current_round(&self, occurrence: &OccurrenceId) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let round: Option<u64> = conn
            .query_row(
                "SELECT round_number FROM processing_rounds WHERE agent_occurrence_id = ?1",
                params![occurrence],
                |row| row.get(0),
            )
            .optional()?;
        Ok(round.unwrap_or(0))
    }

    /// 记录轮次完成；轮次号只前进不后退
    pub async fn record_round_complete(
        &self,
        occurrence: &OccurrenceId,
        round_number: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO processing_rounds (agent_occurrence_id, round_number, completed_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(agent_occurrence_id) DO UPDATE SET
                 round_number = MAX(round_number, excluded.round_number),
                 completed_at = excluded.completed_at",
            params![occurrence, round_number, now_millis()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_marker_per_occurrence() {
        let store = Store::open_in_memory().unwrap();
        let a = OccurrenceId::new("a");
        let b = OccurrenceId::new("b");

        assert_eq!(store.current_round(&a).await.unwrap(), 0);
        store.record_round_complete(&a, 3).await.unwrap();
        store.record_round_complete(&a, 2).await.unwrap();
        assert_eq!(store.current_round(&a).await.unwrap(), 3);
        assert_eq!(store.current_round(&b).await.unwrap(), 0);
    }
}
