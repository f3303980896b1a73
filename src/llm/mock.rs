//! Mock LLM 客户端（用于测试与无 API Key 的试运行）
//!
//! 按提示词中的标记返回固定应答：`[DMA]` 返回评分 JSON，`[ASPDMA]` 返回 speak 动作，
//! `[CONSCIENCE]` 返回 OK。可用 `with_reply` 为某个标记覆盖应答。

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

pub const DMA_MARKER: &str = "[DMA]";
pub const ASPDMA_MARKER: &str = "[ASPDMA]";
pub const CONSCIENCE_MARKER: &str = "[CONSCIENCE]";

/// Mock 客户端：按标记返回固定应答
#[derive(Debug, Default)]
pub struct MockLlmClient {
    overrides: Vec<(String, String)>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 提示词包含 marker 时返回 reply（先注册者优先）
    pub fn with_reply(mut self, marker: impl Into<String>, reply: impl Into<String>) -> Self {
        self.overrides.push((marker.into(), reply.into()));
        self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        if let Some((_, reply)) = self.overrides.iter().find(|(marker, _)| prompt.contains(marker.as_str())) {
            return Ok(reply.clone());
        }

        let reply = if prompt.contains(ASPDMA_MARKER) {
            r#"{"action": "speak", "parameters": {"content": "Acknowledged."}, "rationale": "mock selection"}"#
                .to_string()
        } else if prompt.contains(CONSCIENCE_MARKER) {
            "OK".to_string()
        } else if prompt.contains(DMA_MARKER) {
            r#"{"score": 0.9, "rationale": "mock evaluation"}"#.to_string()
        } else {
            format!("Echo from Mock: {prompt}")
        };
        Ok(reply)
    }
}
