//! 评估器契约中的数据类型：动作、DMA 结果、conscience 结论、上下文包、分发结果

use std::fmt;

use serde::{Deserialize, Serialize};

/// 智能体可执行的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Speak,
    Ponder,
    Defer,
    Observe,
    Tool,
    Memorize,
    TaskComplete,
    Reject,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Speak => "speak",
            ActionType::Ponder => "ponder",
            ActionType::Defer => "defer",
            ActionType::Observe => "observe",
            ActionType::Tool => "tool",
            ActionType::Memorize => "memorize",
            ActionType::TaskComplete => "task_complete",
            ActionType::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "speak" => Some(ActionType::Speak),
            "ponder" => Some(ActionType::Ponder),
            "defer" => Some(ActionType::Defer),
            "observe" => Some(ActionType::Observe),
            "tool" => Some(ActionType::Tool),
            "memorize" => Some(ActionType::Memorize),
            "task_complete" => Some(ActionType::TaskComplete),
            "reject" => Some(ActionType::Reject),
            _ => None,
        }
    }

    /// 执行成功后是否结束所属任务
    pub fn terminates_task(self) -> bool {
        matches!(
            self,
            ActionType::Speak | ActionType::TaskComplete | ActionType::Reject | ActionType::Defer
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ASPDMA 提出的候选动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub action: ActionType,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub rationale: String,
}

impl ProposedAction {
    pub fn new(action: ActionType, parameters: serde_json::Value, rationale: impl Into<String>) -> Self {
        Self {
            action,
            parameters,
            rationale: rationale.into(),
        }
    }

    /// 递归细化后仍被拒绝时的安全兜底：ponder，携带全部拒绝理由
    pub fn ponder_fallback(reasons: &[String]) -> Self {
        Self {
            action: ActionType::Ponder,
            parameters: serde_json::json!({ "questions": reasons }),
            rationale: "Proposed actions were rejected by conscience; pondering instead".to_string(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "action": self.action,
            "parameters": self.parameters,
            "rationale": self.rationale,
        })
    }
}

/// DMA 视角
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmaKind {
    Ethical,
    CommonSense,
    Domain,
}

impl DmaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DmaKind::Ethical => "ethical",
            DmaKind::CommonSense => "common_sense",
            DmaKind::Domain => "domain",
        }
    }
}

/// 单个 DMA 的评估结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmaResult {
    pub kind: DmaKind,
    /// 0.0 - 1.0
    pub score: f32,
    pub rationale: String,
}

/// 单项 conscience 检查的结论
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConscienceVerdict {
    pub check: String,
    pub passed: bool,
    /// 拒绝理由（passed=false 时）
    pub reason: Option<String>,
}

impl ConscienceVerdict {
    pub fn pass(check: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            passed: true,
            reason: None,
        }
    }

    pub fn reject(check: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            check: check.into(),
            passed: false,
            reason: Some(reason.into()),
        }
    }
}

/// GATHER_CONTEXT 的产物；递归细化时在 feedback 中追加拒绝理由
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextBundle {
    pub identity: String,
    pub task_id: String,
    pub task_description: String,
    pub thought_id: String,
    pub thought_content: String,
    pub channel_id: String,
    pub depth: u8,
    pub memory_excerpt: Vec<String>,
    pub conversation_history: Vec<String>,
    pub constraints: Vec<String>,
    pub feedback: Vec<String>,
}

impl ContextBundle {
    /// 带上 conscience 反馈的副本（用于 RECURSIVE_ASPDMA）
    pub fn with_feedback(&self, reasons: &[String], rejected: &ProposedAction) -> Self {
        let mut next = self.clone();
        next.depth = self.depth.saturating_add(1);
        next.feedback.push(format!("Rejected action: {}", rejected.action));
        next.feedback.extend(reasons.iter().cloned());
        next
    }

    /// 供 LLM 提示词使用的纯文本渲染
    pub fn render(&self) -> String {
        let mut out = format!(
            "Identity: {}\nTask: {}\nThought: {}\nChannel: {}\n",
            self.identity, self.task_description, self.thought_content, self.channel_id
        );
        let sections = [
            ("Memory", &self.memory_excerpt),
            ("History", &self.conversation_history),
            ("Constraints", &self.constraints),
            ("Conscience feedback", &self.feedback),
        ];
        for (title, lines) in sections {
            if !lines.is_empty() {
                out.push_str(&format!("{title}:\n"));
                for line in lines {
                    out.push_str(&format!("- {line}\n"));
                }
            }
        }
        out
    }
}

/// 分发结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchOutcome {
    pub action: ActionType,
    /// 分发后所属任务是否结束
    pub task_complete: bool,
    pub detail: String,
}
