//! 默认上下文收集：身份来自配置，对话历史取自本任务已完成的思考

use std::sync::Arc;

use async_trait::async_trait;

use super::{ContextBundle, ContextProvider};
use crate::core::EvaluatorError;
use crate::persistence::{Store, Task, Thought, ThoughtStatus};

pub struct BasicContextProvider {
    store: Arc<Store>,
    identity: String,
    constraints: Vec<String>,
}

/// 对话历史最多保留的条数（取最近的）
const HISTORY_LIMIT: usize = 10;

impl BasicContextProvider {
    pub fn new(store: Arc<Store>, identity: impl Into<String>) -> Self {
        Self {
            store,
            identity: identity.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }
}

#[async_trait]
impl ContextProvider for BasicContextProvider {
    async fn fetch_context(&self, task: &Task, thought: &Thought) -> Result<ContextBundle, EvaluatorError> {
        let prior = self
            .store
            .get_thoughts_by_task(&task.task_id, &task.agent_occurrence_id)
            .await
            .map_err(|e| EvaluatorError::Unavailable(format!("history lookup failed: {e}")))?;

        let mut history: Vec<String> = prior
            .iter()
            .filter(|t| t.status == ThoughtStatus::Completed && t.thought_id != thought.thought_id)
            .map(|t| {
                let action = t
                    .final_action
                    .as_ref()
                    .and_then(|a| a.get("action"))
                    .and_then(|a| a.as_str())
                    .unwrap_or("none");
                format!("round {} depth {}: {} -> {}", t.round_number, t.depth, t.content, action)
            })
            .collect();
        if history.len() > HISTORY_LIMIT {
            history.drain(..history.len() - HISTORY_LIMIT);
        }

        Ok(ContextBundle {
            identity: self.identity.clone(),
            task_id: task.task_id.clone(),
            task_description: task.description.clone(),
            thought_id: thought.thought_id.clone(),
            thought_content: thought.content.clone(),
            channel_id: thought.context.channel_id.clone(),
            depth: thought.depth,
            memory_excerpt: Vec::new(),
            conversation_history: history,
            constraints: self.constraints.clone(),
            feedback: Vec::new(),
        })
    }
}
