use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::detect::FieldMeta;
use crate::plan::{Action, ActionStatus, ExecutionResult, Operation, Outcome};

// ========================= Errors =========================

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("planner error: {0}")]
    Planner(String),
    #[error("interpreter error: {0}")]
    Interpreter(String),
    #[error("response truncated at {budget} tokens")]
    Truncated { budget: u32 },
    #[error("replanner error: {0}")]
    Replanner(String),
    #[error("verifier error: {0}")]
    Verifier(String),
    #[error("answer extraction error: {0}")]
    Extraction(String),
    #[error("interaction error: {0}")]
    Interaction(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("cancelled")]
    Cancelled,
}

pub type SequencerResult<T> = Result<T, SequencerError>;

// ========================= Page Seams =========================

/// Read-only view of the live page.
#[async_trait]
pub trait PagePerceiver: Send + Sync {
    /// Current markup snapshot. Returns an empty string when the page cannot
    /// be read; never errors.
    async fn markup(&self) -> String;

    /// Address of the current page, when known.
    async fn current_url(&self) -> Option<String>;
}

/// Performs one concrete operation against the page. Failures are reported in
/// the outcome, never raised.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn run(&self, operation: &Operation) -> Outcome;
}

// ========================= Model-backed Seams =========================

/// Turns the user's request into the initial ordered action list.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        prompt: &str,
        context: Option<&str>,
        cancel: &CancellationToken,
    ) -> SequencerResult<Vec<Action>>;
}

#[derive(Clone, Debug)]
pub struct Interpretation {
    pub operation: Operation,
    pub explanation: String,
}

/// Maps one abstract action plus page context to a concrete operation.
/// A response cut short by the token budget is signalled as
/// [`SequencerError::Truncated`] carrying the budget that was used.
#[async_trait]
pub trait ActionInterpreter: Send + Sync {
    async fn interpret(
        &self,
        context: &str,
        action: &Action,
        index: usize,
        feedback: Option<&str>,
        cancel: &CancellationToken,
        token_budget: u32,
    ) -> SequencerResult<Interpretation>;
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CompletedStep {
    pub description: String,
    pub status: ActionStatus,
    pub reason: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Replan {
    /// Replacement for the unexecuted tail, or `None` to keep the plan.
    pub updated_actions: Option<Vec<Action>>,
    pub reasoning: String,
}

#[async_trait]
pub trait Replanner: Send + Sync {
    async fn replan(
        &self,
        context: &str,
        prompt: &str,
        completed: &[CompletedStep],
        tail: &[Action],
        cancel: &CancellationToken,
    ) -> SequencerResult<Replan>;
}

#[derive(Clone, Debug)]
pub struct Verdict {
    pub achieved: bool,
    pub message: String,
    pub whats_missing: Option<String>,
}

#[async_trait]
pub trait GoalVerifier: Send + Sync {
    async fn verify_goal(
        &self,
        context: &str,
        prompt: &str,
        results: &[ExecutionResult],
        cancel: &CancellationToken,
    ) -> SequencerResult<Verdict>;
}

#[derive(Clone, Debug)]
pub struct Extraction {
    pub success: bool,
    pub answer: String,
}

#[async_trait]
pub trait AnswerExtractor: Send + Sync {
    async fn extract(
        &self,
        context: &str,
        prompt: &str,
        results: &[ExecutionResult],
        cancel: &CancellationToken,
    ) -> SequencerResult<Extraction>;
}

// ========================= Human Seams =========================

/// Asks the human a question and awaits the answer. Blank answers mean the
/// user declined; callers skip the field rather than failing.
#[async_trait]
pub trait InteractionChannel: Send + Sync {
    async fn ask(&self, prompt: &str, field: Option<&FieldMeta>) -> SequencerResult<String>;
}

/// Always answers with a blank string.
pub struct NullInteraction;

#[async_trait]
impl InteractionChannel for NullInteraction {
    async fn ask(&self, _prompt: &str, _field: Option<&FieldMeta>) -> SequencerResult<String> {
        Ok(String::new())
    }
}

/// Prompts on stdout and reads one line from stdin.
pub struct ConsoleInteraction;

#[async_trait]
impl InteractionChannel for ConsoleInteraction {
    async fn ask(&self, prompt: &str, _field: Option<&FieldMeta>) -> SequencerResult<String> {
        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            use std::io::{BufRead, Write};
            let stdout = std::io::stdout();
            {
                let mut out = stdout.lock();
                let _ = writeln!(out, "{prompt}");
                let _ = write!(out, "> ");
                let _ = out.flush();
            }
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .map(|_| line.trim().to_string())
                .map_err(|e| SequencerError::Interaction(e.to_string()))
        })
        .await
        .map_err(|e| SequencerError::Interaction(e.to_string()))?
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Starting,
    Running,
    Replanned,
    Finished,
}

/// Receives rendered status updates. Best effort; implementations must not
/// block the execution loop on their own failures.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, rendered_plan: &str, step: usize, total: usize, phase: ProgressPhase);
}

pub struct NullProgress;

#[async_trait]
impl ProgressSink for NullProgress {
    async fn on_progress(&self, _rendered: &str, _step: usize, _total: usize, _phase: ProgressPhase) {}
}

/// Logs progress through `tracing`.
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn on_progress(&self, rendered: &str, step: usize, total: usize, phase: ProgressPhase) {
        tracing::info!(step, total, ?phase, "plan progress");
        tracing::debug!("\n{rendered}");
    }
}

// ========================= Default-target Resolution =========================

#[derive(Clone, Debug)]
pub struct ResolvedTarget {
    pub service: String,
    pub url: String,
}

/// Supplies a default address when a navigation names a known service without
/// one. Product policy lives behind this seam, not in the execution loop.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, description: &str) -> Option<ResolvedTarget>;
}

pub struct KnownServiceResolver {
    table: Vec<(&'static str, &'static str)>,
}

impl Default for KnownServiceResolver {
    fn default() -> Self {
        Self {
            table: vec![
                ("gmail", "https://mail.google.com"),
                ("google docs", "https://docs.google.com"),
                ("google", "https://www.google.com"),
                ("youtube", "https://www.youtube.com"),
                ("github", "https://github.com"),
                ("wikipedia", "https://www.wikipedia.org"),
                ("amazon", "https://www.amazon.com"),
                ("twitter", "https://twitter.com"),
                ("linkedin", "https://www.linkedin.com"),
                ("reddit", "https://www.reddit.com"),
                ("spotify", "https://open.spotify.com"),
            ],
        }
    }
}

impl TargetResolver for KnownServiceResolver {
    fn resolve(&self, description: &str) -> Option<ResolvedTarget> {
        let lowered = description.to_lowercase();
        // An explicit address wins over any service name mentioned next to it.
        if lowered.contains("http://") || lowered.contains("https://") {
            return None;
        }
        self.table
            .iter()
            .find(|(name, _)| lowered.contains(name))
            .map(|(name, url)| ResolvedTarget {
                service: (*name).to_string(),
                url: (*url).to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_matches_known_service_without_address() {
        let resolver = KnownServiceResolver::default();
        let hit = resolver.resolve("Go to GitHub and open the first repository");
        assert_eq!(hit.unwrap().url, "https://github.com");
    }

    #[test]
    fn resolver_leaves_explicit_addresses_alone() {
        let resolver = KnownServiceResolver::default();
        assert!(resolver
            .resolve("Navigate to https://github.example.com/login")
            .is_none());
    }

    #[test]
    fn resolver_prefers_the_more_specific_service_name() {
        let resolver = KnownServiceResolver::default();
        let hit = resolver.resolve("Open Gmail").unwrap();
        assert_eq!(hit.url, "https://mail.google.com");
    }
}
