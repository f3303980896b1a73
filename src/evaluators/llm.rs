//! LLM 驱动的评估器：提示词模板 + JSON 解析
//!
//! - LlmDma：返回 `{"score": 0.0-1.0, "rationale": "..."}`
//! - LlmActionSelector：返回 `{"action": "...", "parameters": {...}, "rationale": "..."}`
//! - LlmConscience：回复以 OK / PASS 开头视为通过，其余内容作为拒绝理由

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    ActionSelector, ActionType, ConscienceCheck, ConscienceVerdict, ContextBundle, DmaEvaluator,
    DmaKind, DmaResult, ProposedAction,
};
use crate::core::EvaluatorError;
use crate::llm::mock::{ASPDMA_MARKER, CONSCIENCE_MARKER, DMA_MARKER};
use crate::llm::{LlmClient, Message};

/// 从 LLM 输出中截取 JSON（```json 代码块或首个 `{` 到最后一个 `}`）
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 单遍替换 `{name}` 占位符：替换进来的值不会再被扫描，未知占位符原样保留
fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let hit = tail.find('}').and_then(|close| {
            let name = &tail[1..close];
            values.iter().find(|(key, _)| *key == name).map(|(_, value)| (close, *value))
        });
        match hit {
            Some((close, value)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

async fn ask(llm: &dyn LlmClient, system: &str, prompt: String) -> Result<String, EvaluatorError> {
    let messages = vec![Message::system(system.to_string()), Message::user(prompt)];
    llm.complete(&messages).await.map_err(EvaluatorError::Unavailable)
}

#[derive(Deserialize)]
struct DmaReply {
    score: f32,
    #[serde(default)]
    rationale: String,
}

/// 单一视角的 LLM 评估
pub struct LlmDma {
    llm: Arc<dyn LlmClient>,
    kind: DmaKind,
}

impl LlmDma {
    pub fn new(llm: Arc<dyn LlmClient>, kind: DmaKind) -> Self {
        Self { llm, kind }
    }

    fn perspective(&self) -> &'static str {
        match self.kind {
            DmaKind::Ethical => "Judge whether acting on this thought respects beneficence, non-maleficence, justice and autonomy.",
            DmaKind::CommonSense => "Judge whether this thought is plausible and consistent with everyday physical and social reality.",
            DmaKind::Domain => "Judge this thought against the norms of the agent's operating domain.",
        }
    }
}

#[async_trait]
impl DmaEvaluator for LlmDma {
    fn kind(&self) -> DmaKind {
        self.kind
    }

    async fn evaluate(&self, context: &ContextBundle) -> Result<DmaResult, EvaluatorError> {
        let prompt = format!(
            "{DMA_MARKER} {}\n{}\nReply with JSON: {{\"score\": <0.0-1.0>, \"rationale\": \"...\"}}",
            self.perspective(),
            context.render()
        );
        let reply = ask(self.llm.as_ref(), "You are an evaluation module.", prompt).await?;
        let json = extract_json(&reply)
            .ok_or_else(|| EvaluatorError::InvalidOutput(format!("no JSON in DMA reply: {reply}")))?;
        let parsed: DmaReply = serde_json::from_str(json)
            .map_err(|e| EvaluatorError::InvalidOutput(format!("{e}: {json}")))?;
        Ok(DmaResult {
            kind: self.kind,
            score: parsed.score.clamp(0.0, 1.0),
            rationale: parsed.rationale,
        })
    }
}

#[derive(Deserialize)]
struct ActionReply {
    action: String,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    rationale: String,
}

/// ASPDMA：综合 DMA 结果选出一个动作
pub struct LlmActionSelector {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmActionSelector {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }
}

#[async_trait]
impl ActionSelector for LlmActionSelector {
    async fn select(
        &self,
        context: &ContextBundle,
        dma_results: &[DmaResult],
    ) -> Result<ProposedAction, EvaluatorError> {
        let evaluations: Vec<String> = dma_results
            .iter()
            .map(|r| format!("- {} ({:.2}): {}", r.kind.as_str(), r.score, r.rationale))
            .collect();
        let prompt = format!(
            "{ASPDMA_MARKER} Choose exactly one action among speak, ponder, defer, observe, tool, memorize, task_complete, reject.\n\
             {}\nEvaluations:\n{}\n\
             Reply with JSON: {{\"action\": \"...\", \"parameters\": {{...}}, \"rationale\": \"...\"}}",
            context.render(),
            evaluations.join("\n")
        );
        let reply = ask(self.llm.as_ref(), &self.system_prompt, prompt).await?;
        let json = extract_json(&reply)
            .ok_or_else(|| EvaluatorError::InvalidOutput(format!("no JSON in ASPDMA reply: {reply}")))?;
        let parsed: ActionReply = serde_json::from_str(json)
            .map_err(|e| EvaluatorError::InvalidOutput(format!("{e}: {json}")))?;
        let action = ActionType::parse(&parsed.action)
            .ok_or_else(|| EvaluatorError::InvalidOutput(format!("unknown action '{}'", parsed.action)))?;
        Ok(ProposedAction::new(action, parsed.parameters, parsed.rationale))
    }
}

/// 一项由 LLM 执行的 conscience 检查（熵 / 一致性 / 乐观否决 / 认知谦逊 等）
pub struct LlmConscience {
    llm: Arc<dyn LlmClient>,
    name: String,
    prompt_template: String,
}

impl LlmConscience {
    /// prompt_template 可使用 {action} {parameters} {rationale} {context} 占位符
    pub fn new(llm: Arc<dyn LlmClient>, name: impl Into<String>, prompt_template: impl Into<String>) -> Self {
        Self {
            llm,
            name: name.into(),
            prompt_template: prompt_template.into(),
        }
    }

    /// 默认的四项检查
    pub fn default_checks(llm: Arc<dyn LlmClient>) -> Vec<Self> {
        [
            ("entropy", "Is the action {action} with parameters {parameters} coherent rather than chaotic?"),
            ("coherence", "Does the action {action} ({rationale}) fit the agent's identity and prior behaviour?\n{context}"),
            ("optimization_veto", "Does the action {action} sacrifice human values for narrow goal optimization?"),
            ("epistemic_humility", "Is the agent overconfident in choosing {action} given: {rationale}?"),
        ]
        .into_iter()
        .map(|(name, template)| Self::new(llm.clone(), name, template))
        .collect()
    }
}

#[async_trait]
impl ConscienceCheck for LlmConscience {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(
        &self,
        action: &ProposedAction,
        context: &ContextBundle,
    ) -> Result<ConscienceVerdict, EvaluatorError> {
        let parameters = action.parameters.to_string();
        let rendered_context = context.render();
        let body = fill_template(
            &self.prompt_template,
            &[
                ("action", action.action.as_str()),
                ("parameters", parameters.as_str()),
                ("rationale", action.rationale.as_str()),
                ("context", rendered_context.as_str()),
            ],
        );
        let prompt = format!("{CONSCIENCE_MARKER} {body}\nReply OK if acceptable, otherwise explain the problem.");
        let reply = ask(self.llm.as_ref(), "You are a safety conscience.", prompt).await?;
        let normalized = reply.trim().to_uppercase();
        if normalized.starts_with("OK") || normalized.starts_with("PASS") {
            Ok(ConscienceVerdict::pass(&self.name))
        } else if normalized.is_empty() {
            Ok(ConscienceVerdict::reject(&self.name, "empty conscience reply"))
        } else {
            Ok(ConscienceVerdict::reject(&self.name, reply.trim()))
        }
    }
}
