//! OpenAI-compatible completion transport and the model-backed adapter
//! implementations built on it. The sequencer only ever sees the trait
//! contracts; everything request-shaped lives here.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use tokio_util::sync::CancellationToken;

use crate::adapters::{
    ActionInterpreter, AnswerExtractor, CompletedStep, Extraction, GoalVerifier, Interpretation,
    Planner, Replan, Replanner, SequencerError, SequencerResult, Verdict,
};
use crate::plan::{Action, ExecutionResult, Operation};

#[derive(Clone)]
pub struct LlmConfig {
    pub api_base: String, // e.g. "https://api.openai.com/v1"
    pub api_key: String,  // env ERRAND_API_KEY
    pub model: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ERRAND_API_BASE")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            api_key: env::var("ERRAND_API_KEY").unwrap_or_default(),
            model: env::var("ERRAND_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            temperature: 0.0,
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    cfg: LlmConfig,
}

impl LlmClient {
    pub fn new(cfg: LlmConfig) -> SequencerResult<Self> {
        if cfg.api_key.is_empty() {
            return Err(SequencerError::Transport("ERRAND_API_KEY missing".into()));
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    /// One chat completion. A response stopped by the token limit is reported
    /// as [`SequencerError::Truncated`] carrying the budget that was used.
    pub async fn complete(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> SequencerResult<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base);
        let req = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "max_tokens": max_tokens,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ]
        });

        let send = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send();
        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(SequencerError::Cancelled),
            r = send => r.map_err(|e| SequencerError::Transport(e.to_string()))?,
        };

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SequencerError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(SequencerError::Transport(format!(
                "completion endpoint returned {status}: {text}"
            )));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| SequencerError::Transport(format!("bad completion JSON: {e}")))?;
        let choice = v
            .pointer("/choices/0")
            .ok_or_else(|| SequencerError::Transport("completion had no choices".into()))?;
        let finish = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if finish == "length" {
            return Err(SequencerError::Truncated { budget: max_tokens });
        }
        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(content.to_string())
    }
}

/// First JSON object in a model reply, tolerating code fences and prose
/// around it.
fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

fn results_digest(results: &[ExecutionResult]) -> String {
    use crate::plan::ActionStatus;
    results
        .iter()
        .map(|r| {
            let status = match r.status {
                ActionStatus::Pending => "pending",
                ActionStatus::InProgress => "in progress",
                ActionStatus::Completed => "completed",
                ActionStatus::Failed => "failed",
                ActionStatus::Cancelled => "cancelled",
            };
            match &r.reason {
                Some(reason) => format!("- {} [{status}]: {reason}", r.action.description),
                None => format!("- {} [{status}]", r.action.description),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ========================= Planner =========================

const PLANNER_SYSTEM: &str = "\
You turn a user's browser request into an ordered list of abstract steps.
Allowed kinds: navigate, click, fill, press, scroll, search, extract, wait.
Reply with JSON only: {\"actions\": [{\"kind\": \"...\", \"description\": \"...\"}]}.
Descriptions must be self-contained; later steps cannot see earlier ones.";

pub struct LlmPlanner {
    client: LlmClient,
}

impl LlmPlanner {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        prompt: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> SequencerResult<Vec<Action>> {
        let mut user = format!("Request: {prompt}");
        if let Some(ctx) = context {
            user.push_str(&format!("\n\nCurrent page:\n{ctx}"));
        }
        let reply = self
            .client
            .complete(PLANNER_SYSTEM, &user, 1024, cancel)
            .await?;
        let actions = extract_json(&reply)
            .and_then(|v| {
                v.get("actions")
                    .cloned()
                    .and_then(|a| serde_json::from_value::<Vec<Action>>(a).ok())
            })
            .filter(|actions: &Vec<Action>| !actions.is_empty());
        Ok(actions.unwrap_or_else(|| {
            // Unparseable plan: fall back to looking it up.
            vec![
                Action::new("navigate", format!("Search the web for: {prompt}")),
                Action::new("extract", "Read the results relevant to the request"),
            ]
        }))
    }
}

// ========================= Interpreter =========================

const INTERPRETER_SYSTEM: &str = "\
You translate one step of a web task into a single concrete browser operation.
Reply with JSON only:
{\"operation\": {\"type\": \"navigate\", \"url\": \"...\"}
 | {\"type\": \"click\", \"selector\": \"...\"}
 | {\"type\": \"fill\", \"selector\": \"...\", \"value\": \"...\"}
 | {\"type\": \"press\", \"key\": \"...\"}
 | {\"type\": \"scroll\", \"dx\": 0, \"dy\": 600}
 | {\"type\": \"wait\", \"ms\": 500}
 | {\"type\": \"extract\", \"selector\": null},
 \"explanation\": \"...\"}
Selectors must match the provided markup. Prefer ids, names, and stable
attributes over positional selectors.";

pub struct LlmInterpreter {
    client: LlmClient,
}

impl LlmInterpreter {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ActionInterpreter for LlmInterpreter {
    async fn interpret(
        &self,
        context: &str,
        action: &Action,
        index: usize,
        feedback: Option<&str>,
        cancel: &CancellationToken,
        token_budget: u32,
    ) -> SequencerResult<Interpretation> {
        let mut user = format!(
            "Step {} ({}): {}\n\nPage markup:\n{}",
            index + 1,
            action.kind,
            action.description,
            context
        );
        if let Some(feedback) = feedback {
            user.push_str(&format!(
                "\n\nEarlier tries of this step failed; do something different:\n{feedback}"
            ));
        }
        let reply = self
            .client
            .complete(INTERPRETER_SYSTEM, &user, token_budget, cancel)
            .await?;
        let parsed = extract_json(&reply)
            .ok_or_else(|| SequencerError::Interpreter(format!("unparseable reply: {reply}")))?;
        let operation = parsed
            .get("operation")
            .cloned()
            .and_then(|op| serde_json::from_value::<Operation>(op).ok())
            .ok_or_else(|| SequencerError::Interpreter("reply had no valid operation".into()))?;
        let explanation = parsed
            .get("explanation")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Interpretation {
            operation,
            explanation,
        })
    }
}

// ========================= Replanner =========================

const REPLANNER_SYSTEM: &str = "\
You revise the unexecuted tail of a browser task plan against the current
page. Reply with JSON only: {\"keep\": true, \"reasoning\": \"...\"} to leave
the plan alone, or {\"actions\": [{\"kind\": \"...\", \"description\": \"...\"}],
\"reasoning\": \"...\"} to replace the tail. Keep the plan unless the page
makes a step impossible or redundant.";

pub struct LlmReplanner {
    client: LlmClient,
}

impl LlmReplanner {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Replanner for LlmReplanner {
    async fn replan(
        &self,
        context: &str,
        prompt: &str,
        completed: &[CompletedStep],
        tail: &[Action],
        cancel: &CancellationToken,
    ) -> SequencerResult<Replan> {
        let done = serde_json::to_string(completed)
            .map_err(|e| SequencerError::Replanner(e.to_string()))?;
        let remaining = serde_json::to_string(tail)
            .map_err(|e| SequencerError::Replanner(e.to_string()))?;
        let user = format!(
            "Goal: {prompt}\n\nSteps so far:\n{done}\n\nRemaining plan:\n{remaining}\n\nCurrent page:\n{context}"
        );
        let reply = self
            .client
            .complete(REPLANNER_SYSTEM, &user, 1024, cancel)
            .await?;
        let parsed = extract_json(&reply)
            .ok_or_else(|| SequencerError::Replanner(format!("unparseable reply: {reply}")))?;
        let reasoning = parsed
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let updated_actions = if parsed.get("keep").and_then(Value::as_bool) == Some(true) {
            None
        } else {
            parsed
                .get("actions")
                .cloned()
                .and_then(|a| serde_json::from_value::<Vec<Action>>(a).ok())
        };
        Ok(Replan {
            updated_actions,
            reasoning,
        })
    }
}

// ========================= Verifier =========================

const VERIFIER_SYSTEM: &str = "\
You judge whether a user's browser task actually achieved its goal, from the
final page and the step outcomes. Individual step success does not imply the
goal was met. Reply with JSON only:
{\"achieved\": true|false, \"message\": \"...\", \"whats_missing\": \"...\"|null}";

pub struct LlmVerifier {
    client: LlmClient,
}

impl LlmVerifier {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GoalVerifier for LlmVerifier {
    async fn verify_goal(
        &self,
        context: &str,
        prompt: &str,
        results: &[ExecutionResult],
        cancel: &CancellationToken,
    ) -> SequencerResult<Verdict> {
        let user = format!(
            "Goal: {prompt}\n\nSteps:\n{}\n\nFinal page:\n{context}",
            results_digest(results)
        );
        let reply = self
            .client
            .complete(VERIFIER_SYSTEM, &user, 1024, cancel)
            .await?;
        let parsed = extract_json(&reply)
            .ok_or_else(|| SequencerError::Verifier(format!("unparseable reply: {reply}")))?;
        Ok(Verdict {
            achieved: parsed
                .get("achieved")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            message: parsed
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            whats_missing: parsed
                .get("whats_missing")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .filter(|s| !s.trim().is_empty()),
        })
    }
}

// ========================= Answer Extraction =========================

const EXTRACTOR_SYSTEM: &str = "\
The user asked a question and a browser task gathered the page that should
contain the answer. Answer the question from the page content, concisely and
in plain text. If the page does not contain the answer, say so.";

pub struct LlmExtractor {
    client: LlmClient,
}

impl LlmExtractor {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AnswerExtractor for LlmExtractor {
    async fn extract(
        &self,
        context: &str,
        prompt: &str,
        results: &[ExecutionResult],
        cancel: &CancellationToken,
    ) -> SequencerResult<Extraction> {
        let user = format!(
            "Question: {prompt}\n\nSteps taken:\n{}\n\nFinal page:\n{context}",
            results_digest(results)
        );
        let answer = self
            .client
            .complete(EXTRACTOR_SYSTEM, &user, 1024, cancel)
            .await?;
        let answer = answer.trim().to_string();
        Ok(Extraction {
            success: !answer.is_empty(),
            answer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_tolerates_fences_and_prose() {
        let reply = "Sure, here you go:\n```json\n{\"achieved\": true, \"message\": \"done\"}\n```";
        let v = extract_json(reply).unwrap();
        assert_eq!(v.get("achieved").and_then(Value::as_bool), Some(true));
    }

    #[test]
    fn extract_json_rejects_garbage() {
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("} backwards {").is_none());
    }

    #[test]
    fn operations_deserialize_from_tagged_json() {
        let op: Operation =
            serde_json::from_value(json!({"type": "fill", "selector": "#q", "value": "rust"}))
                .unwrap();
        assert_eq!(
            op,
            Operation::Fill {
                selector: "#q".into(),
                value: "rust".into()
            }
        );
    }
}
