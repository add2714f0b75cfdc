//! The execution control loop. One sequencer invocation owns a mutable,
//! growable plan and drives it strictly sequentially: interpret each action
//! against fresh page context, perform it, retry bounded, revise the tail,
//! pull the user in for missing form values, and finally judge whether the
//! original goal was met.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nanoid::nanoid;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{
    ActionInterpreter, AnswerExtractor, CompletedStep, GoalVerifier, InteractionChannel,
    KnownServiceResolver, NullProgress, PageDriver, PagePerceiver, ProgressPhase, ProgressSink,
    Replanner, SequencerError, SequencerResult, TargetResolver, Verdict,
};
use crate::detect;
use crate::plan::{
    Action, ActionStatus, AttemptRecord, ExecutionResult, ExecutionSummary, Outcome, Plan,
    SessionValues,
};
use crate::verify;

// ========================= Configuration =========================

#[derive(Clone, Debug)]
pub struct SequencerConfig {
    /// Attempts per action, truncation re-issues excluded.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Pause between actions so the page can settle.
    pub settle_delay: Duration,
    /// Character cap applied to every context snapshot before it reaches an
    /// adapter.
    pub context_char_budget: usize,
    pub token_budget_start: u32,
    pub token_budget_cap: u32,
    /// Revise the unexecuted tail after each action.
    pub adaptive: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            settle_delay: Duration::from_millis(800),
            context_char_budget: 16_000,
            token_budget_start: 1024,
            token_budget_cap: 8192,
            adaptive: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ExecuteOptions {
    /// Per-call override of the adaptive flag.
    pub adaptive: Option<bool>,
    /// Remembered form values, reused instead of re-asking the user.
    pub session: SessionValues,
}

/// Deterministic head slice with a trailing notice, applied to every context
/// payload before it leaves the sequencer.
pub fn clip_context(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    let head: String = text.chars().take(budget).collect();
    format!("{head}… [truncated]")
}

// ========================= Sequencer =========================

pub struct Sequencer {
    perceiver: Arc<dyn PagePerceiver>,
    driver: Arc<dyn PageDriver>,
    interpreter: Arc<dyn ActionInterpreter>,
    verifier: Arc<dyn GoalVerifier>,
    replanner: Option<Arc<dyn Replanner>>,
    extractor: Option<Arc<dyn AnswerExtractor>>,
    interaction: Option<Arc<dyn InteractionChannel>>,
    progress: Arc<dyn ProgressSink>,
    resolver: Arc<dyn TargetResolver>,
    cfg: SequencerConfig,
}

struct AttemptSeries {
    attempts: Vec<AttemptRecord>,
    success: bool,
    cancelled: bool,
    reason: Option<String>,
    observation: Option<String>,
}

impl Sequencer {
    pub fn new(
        perceiver: Arc<dyn PagePerceiver>,
        driver: Arc<dyn PageDriver>,
        interpreter: Arc<dyn ActionInterpreter>,
        verifier: Arc<dyn GoalVerifier>,
        cfg: SequencerConfig,
    ) -> Self {
        Self {
            perceiver,
            driver,
            interpreter,
            verifier,
            replanner: None,
            extractor: None,
            interaction: None,
            progress: Arc::new(NullProgress),
            resolver: Arc::new(KnownServiceResolver::default()),
            cfg,
        }
    }

    pub fn with_replanner(mut self, replanner: Arc<dyn Replanner>) -> Self {
        self.replanner = Some(replanner);
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn AnswerExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_interaction(mut self, interaction: Arc<dyn InteractionChannel>) -> Self {
        self.interaction = Some(interaction);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn TargetResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Run the plan to completion and report what happened. Expected failures
    /// never escape as errors; they are reflected in statuses and the summary.
    pub async fn execute(
        &self,
        actions: Vec<Action>,
        original_prompt: &str,
        mut opts: ExecuteOptions,
        cancel: CancellationToken,
    ) -> ExecutionSummary {
        let run_id = nanoid!();
        let adaptive = opts.adaptive.unwrap_or(self.cfg.adaptive);
        let mut plan = Plan::new(actions);
        let mut results: Vec<ExecutionResult> = Vec::new();
        // Navigations whose description we rewrote to a default address, and
        // which of those already asked the user for a custom one.
        let mut substituted: HashMap<usize, String> = HashMap::new();
        let mut asked_for_address: HashSet<usize> = HashSet::new();
        let mut was_cancelled = false;

        info!(run_id = %run_id, steps = plan.len(), "starting plan");
        self.progress
            .on_progress(&plan.render(None), 0, plan.len(), ProgressPhase::Starting)
            .await;

        let mut i = 0usize;
        while i < plan.len() {
            if cancel.is_cancelled() {
                self.cancel_rest(&mut plan, &mut results, i);
                was_cancelled = true;
                break;
            }

            plan.set_status(i, ActionStatus::InProgress);
            self.progress
                .on_progress(&plan.render(Some(i)), i + 1, plan.len(), ProgressPhase::Running)
                .await;

            if plan.action(i).kind == "navigate" && !substituted.contains_key(&i) {
                if let Some(target) = self.resolver.resolve(&plan.action(i).description) {
                    debug!(index = i, service = %target.service, url = %target.url, "using default address");
                    let rewritten = format!("{} (address: {})", plan.action(i).description, target.url);
                    plan.set_description(i, rewritten);
                    substituted.insert(i, target.service);
                }
            }

            let context = clip_context(&self.perceiver.markup().await, self.cfg.context_char_budget);
            let action = plan.action(i).clone();
            let series = self.run_action(&context, &action, i, &cancel).await;

            if series.cancelled {
                plan.cancel_from(i);
                results.push(ExecutionResult {
                    action: action.clone(),
                    status: ActionStatus::Cancelled,
                    reason: series.reason,
                    observation: series.observation,
                    attempts: series.attempts,
                });
                self.cancel_rest(&mut plan, &mut results, i + 1);
                was_cancelled = true;
                break;
            }

            let status = if series.success {
                ActionStatus::Completed
            } else {
                ActionStatus::Failed
            };
            plan.set_status(i, status);
            results.push(ExecutionResult {
                action: action.clone(),
                status,
                reason: series.reason,
                observation: series.observation,
                attempts: series.attempts,
            });
            if series.success {
                info!(index = i, "action completed");
            } else {
                warn!(index = i, reason = ?results.last().and_then(|r| r.reason.as_deref()), "action failed");
            }
            self.progress
                .on_progress(&plan.render(Some(i)), i + 1, plan.len(), ProgressPhase::Running)
                .await;

            // A failed default-address navigation gets one chance at a
            // user-supplied address before it counts as failed.
            if !series.success
                && substituted.contains_key(&i)
                && !asked_for_address.contains(&i)
            {
                asked_for_address.insert(i);
                if let Some(address) = self.ask_for_address(&substituted[&i], &cancel).await {
                    plan.set_description(i, format!("Navigate to {address}"));
                    plan.set_status(i, ActionStatus::Pending);
                    results.pop();
                    continue;
                }
            }

            if let Some(channel) = self.interaction.clone() {
                if let Err(e) = self
                    .augment_from_page(&mut plan, i, series.success, channel.as_ref(), &mut opts.session, &cancel)
                    .await
                {
                    warn!(error = %e, "form augmentation skipped");
                }
            }

            if adaptive && i + 1 < plan.len() && !cancel.is_cancelled() {
                if let Some(replanner) = self.replanner.clone() {
                    self.try_replan(&mut plan, i, original_prompt, &results, replanner.as_ref(), &cancel)
                        .await;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(self.cfg.settle_delay) => {}
            }

            i += 1;

            // Reaching the end with an unfilled form means the plan stopped
            // short, not that the task is done.
            if i == plan.len() && adaptive && !original_prompt.is_empty() {
                if let Some(channel) = self.interaction.clone() {
                    if let Err(e) = self
                        .extend_at_end(&mut plan, channel.as_ref(), &mut opts.session, &cancel)
                        .await
                    {
                        warn!(error = %e, "end-of-plan check skipped");
                    }
                }
            }
        }

        let summary = self
            .summarize(&plan, results, original_prompt, was_cancelled || cancel.is_cancelled(), &cancel)
            .await;
        self.progress
            .on_progress(&plan.render(None), plan.len(), plan.len(), ProgressPhase::Finished)
            .await;
        info!(run_id = %run_id, success = summary.success, goal_achieved = summary.goal_achieved, "plan finished");
        summary
    }

    fn cancel_rest(&self, plan: &mut Plan, results: &mut Vec<ExecutionResult>, from: usize) {
        plan.cancel_from(from);
        for index in from..plan.len() {
            results.push(ExecutionResult {
                action: plan.action(index).clone(),
                status: ActionStatus::Cancelled,
                reason: Some("cancelled by user".to_string()),
                observation: None,
                attempts: Vec::new(),
            });
        }
        info!(from, "remaining actions cancelled");
    }

    // ========================= Retry Protocol =========================

    async fn run_action(
        &self,
        context: &str,
        action: &Action,
        index: usize,
        cancel: &CancellationToken,
    ) -> AttemptSeries {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut observation: Option<String> = None;
        let mut budget = self.cfg.token_budget_start;
        let mut attempt_no: u32 = 1;

        while attempt_no <= self.cfg.max_attempts {
            if cancel.is_cancelled() {
                return Self::cancelled_series(attempts);
            }

            let feedback = Self::feedback_from(&attempts);
            // Truncated responses re-issue the same attempt with a doubled
            // budget; they do not consume an attempt.
            let interpreted = loop {
                match self
                    .interpreter
                    .interpret(context, action, index, feedback.as_deref(), cancel, budget)
                    .await
                {
                    Ok(value) => break Ok(value),
                    Err(SequencerError::Truncated { budget: used }) => {
                        let doubled = used.saturating_mul(2);
                        if doubled > self.cfg.token_budget_cap {
                            let reason = format!(
                                "model response kept exceeding the {} token cap",
                                self.cfg.token_budget_cap
                            );
                            warn!(index, reason = %reason, "giving up on action");
                            return AttemptSeries {
                                attempts,
                                success: false,
                                cancelled: false,
                                reason: Some(reason),
                                observation,
                            };
                        }
                        warn!(index, budget = doubled, "response truncated; re-issuing with a larger budget");
                        budget = doubled;
                    }
                    Err(SequencerError::Cancelled) => return Self::cancelled_series(attempts),
                    Err(e) => break Err(e),
                }
            };

            match interpreted {
                Err(e) => {
                    attempts.push(AttemptRecord {
                        attempt: attempt_no,
                        operation: None,
                        outcome: Outcome::fail(e.to_string()),
                    });
                }
                Ok(interpretation) => {
                    if cancel.is_cancelled() {
                        return Self::cancelled_series(attempts);
                    }
                    debug!(index, op = %interpretation.operation.describe(), "performing operation");
                    let outcome = self.driver.run(&interpretation.operation).await;
                    let succeeded = outcome.success;
                    if succeeded && !outcome.message.is_empty() {
                        observation = Some(outcome.message.clone());
                    }
                    attempts.push(AttemptRecord {
                        attempt: attempt_no,
                        operation: Some(interpretation.operation),
                        outcome,
                    });
                    if succeeded {
                        return AttemptSeries {
                            attempts,
                            success: true,
                            cancelled: false,
                            reason: None,
                            observation,
                        };
                    }
                }
            }

            if attempt_no < self.cfg.max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Self::cancelled_series(attempts),
                    _ = sleep(self.cfg.retry_backoff) => {}
                }
            }
            attempt_no += 1;
        }

        let reason = attempts
            .last()
            .map(|record| record.outcome.message.clone())
            .filter(|m| !m.is_empty());
        AttemptSeries {
            attempts,
            success: false,
            cancelled: false,
            reason,
            observation,
        }
    }

    fn cancelled_series(attempts: Vec<AttemptRecord>) -> AttemptSeries {
        AttemptSeries {
            attempts,
            success: false,
            cancelled: true,
            reason: Some("cancelled by user".to_string()),
            observation: None,
        }
    }

    /// Prior failures of this action, rendered so the interpreter can avoid
    /// repeating an approach that did not work.
    fn feedback_from(attempts: &[AttemptRecord]) -> Option<String> {
        if attempts.is_empty() {
            return None;
        }
        let lines: Vec<String> = attempts
            .iter()
            .map(|record| {
                let op = record
                    .operation
                    .as_ref()
                    .map(|o| o.describe())
                    .unwrap_or_else(|| "no operation produced".to_string());
                format!(
                    "attempt {}: {} -> {}",
                    record.attempt,
                    op,
                    if record.outcome.message.is_empty() {
                        "failed"
                    } else {
                        record.outcome.message.as_str()
                    }
                )
            })
            .collect();
        Some(lines.join("\n"))
    }

    // ========================= Replanning =========================

    async fn try_replan(
        &self,
        plan: &mut Plan,
        index: usize,
        prompt: &str,
        results: &[ExecutionResult],
        replanner: &dyn Replanner,
        cancel: &CancellationToken,
    ) {
        let context = clip_context(&self.perceiver.markup().await, self.cfg.context_char_budget);
        let completed: Vec<CompletedStep> = results
            .iter()
            .map(|r| CompletedStep {
                description: r.action.description.clone(),
                status: r.status,
                reason: r.reason.clone(),
            })
            .collect();
        let tail = plan.tail_from(index + 1).to_vec();

        match replanner.replan(&context, prompt, &completed, &tail, cancel).await {
            Ok(replan) => {
                if let Some(updated) = replan.updated_actions {
                    info!(index, reasoning = %replan.reasoning, old = tail.len(), new = updated.len(), "plan tail revised");
                    plan.splice_tail(index + 1, updated);
                    self.progress
                        .on_progress(
                            &plan.render(Some(index)),
                            index + 1,
                            plan.len(),
                            ProgressPhase::Replanned,
                        )
                        .await;
                } else {
                    debug!(index, reasoning = %replan.reasoning, "replanner kept the plan");
                }
            }
            // Replanning never aborts execution.
            Err(e) => warn!(index, error = %e, "replanning failed; keeping current plan"),
        }
    }

    // ========================= Interaction-driven Augmentation =========================

    async fn augment_from_page(
        &self,
        plan: &mut Plan,
        index: usize,
        last_ok: bool,
        channel: &dyn InteractionChannel,
        session: &mut SessionValues,
        cancel: &CancellationToken,
    ) -> SequencerResult<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let context = clip_context(&self.perceiver.markup().await, self.cfg.context_char_budget);
        let error = detect::find_error_message(&context);
        let fields = detect::find_empty_fields(&context);
        if fields.is_empty() {
            return Ok(());
        }
        // An error banner always warrants asking; otherwise only a settled,
        // successful action does (a failed one may simply not have reached
        // the form yet).
        if error.is_none() && !last_ok {
            return Ok(());
        }

        if let Some(message) = &error {
            channel
                .ask(&format!("The page reports a problem: {message}"), None)
                .await?;
        }

        let additions = self
            .collect_field_actions(plan, &context, &fields, channel, session)
            .await?;
        if additions.is_empty() {
            return Ok(());
        }
        plan.prune_pending_kind_after(index, "fill");
        let added = additions.len();
        plan.insert_after(index, additions);
        info!(index, added, "spliced form steps into the plan");
        self.progress
            .on_progress(&plan.render(Some(index)), index + 1, plan.len(), ProgressPhase::Running)
            .await;
        Ok(())
    }

    async fn extend_at_end(
        &self,
        plan: &mut Plan,
        channel: &dyn InteractionChannel,
        session: &mut SessionValues,
        cancel: &CancellationToken,
    ) -> SequencerResult<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let context = clip_context(&self.perceiver.markup().await, self.cfg.context_char_budget);
        let fields = detect::find_empty_fields(&context);
        if fields.is_empty() {
            return Ok(());
        }
        let additions = self
            .collect_field_actions(plan, &context, &fields, channel, session)
            .await?;
        if additions.is_empty() {
            return Ok(());
        }
        let added = additions.len();
        plan.append(additions);
        info!(added, "form still unfilled at end of plan; continuing");
        Ok(())
    }

    async fn collect_field_actions(
        &self,
        plan: &Plan,
        context: &str,
        fields: &[detect::FieldMeta],
        channel: &dyn InteractionChannel,
        session: &mut SessionValues,
    ) -> SequencerResult<Vec<Action>> {
        let mut additions = Vec::new();
        for field in fields {
            let key = field.key();
            let value = match session.get(&key) {
                Some(known) => known.to_string(),
                None => {
                    let answer = channel
                        .ask(
                            &format!("What should I enter for \"{}\"?", field.label),
                            Some(field),
                        )
                        .await?;
                    answer.trim().to_string()
                }
            };
            if value.is_empty() {
                continue;
            }
            session.remember(&key, &value);
            let description = format!("Fill the \"{}\" field with \"{}\"", field.label, value);
            // Do not queue a fill that is already queued; a page that keeps
            // reporting the same empty field must not grow the plan forever.
            if plan.has_pending_description(&description) {
                continue;
            }
            additions.push(Action::new("fill", description));
        }
        if !additions.is_empty() {
            if let Some(label) = detect::find_submit_control(context) {
                additions.push(Action::new(
                    "click",
                    format!("Click the \"{label}\" control to submit the form"),
                ));
            }
        }
        Ok(additions)
    }

    async fn ask_for_address(&self, service: &str, cancel: &CancellationToken) -> Option<String> {
        if cancel.is_cancelled() {
            return None;
        }
        let channel = self.interaction.as_ref()?;
        match channel
            .ask(
                &format!("I couldn't reach {service} at its usual address. What address should I use?"),
                None,
            )
            .await
        {
            Ok(answer) if !answer.trim().is_empty() => Some(answer.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(service, error = %e, "address prompt failed");
                None
            }
        }
    }

    // ========================= Final Verdict =========================

    async fn summarize(
        &self,
        plan: &Plan,
        results: Vec<ExecutionResult>,
        prompt: &str,
        was_cancelled: bool,
        cancel: &CancellationToken,
    ) -> ExecutionSummary {
        let total = plan.len();
        let completed = results
            .iter()
            .filter(|r| r.status == ActionStatus::Completed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == ActionStatus::Failed)
            .count();

        if was_cancelled {
            return ExecutionSummary {
                success: false,
                message: format!("Stopped at your request after {completed} of {total} steps."),
                results,
                goal_achieved: false,
                next_steps: None,
            };
        }

        // Goal verification is meaningless when nothing ran to completion.
        let verdict = if completed > 0 {
            let context = clip_context(&self.perceiver.markup().await, self.cfg.context_char_budget);
            match self
                .verifier
                .verify_goal(&context, prompt, &results, cancel)
                .await
            {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "goal verification failed");
                    Some(Verdict {
                        achieved: false,
                        message: format!("Could not confirm whether the goal was met: {e}"),
                        whats_missing: None,
                    })
                }
            }
        } else {
            None
        };

        let goal_achieved = verdict.as_ref().map(|v| v.achieved).unwrap_or(false);
        let verdict_message = verdict
            .as_ref()
            .map(|v| v.message.trim().to_string())
            .filter(|m| !m.is_empty());

        if failed == 0 && goal_achieved {
            let mut message = verdict_message
                .unwrap_or_else(|| "All steps completed and the goal was achieved.".to_string());
            if self.extractor.is_some() && verify::is_research_question(prompt) {
                message = self.extract_answer(prompt, &results, cancel).await.unwrap_or_else(|| {
                    "I completed the task, but couldn't put together a written answer.".to_string()
                });
            }
            return ExecutionSummary {
                success: true,
                message,
                results,
                goal_achieved: true,
                next_steps: None,
            };
        }

        if goal_achieved {
            // The goal was reached despite step failures; report it, but do
            // not claim a clean run.
            let message = format!(
                "The goal appears to be met, though {failed} of {total} steps failed along the way."
            );
            return ExecutionSummary {
                success: false,
                message,
                results,
                goal_achieved: true,
                next_steps: None,
            };
        }

        let final_url = self.perceiver.current_url().await;
        let steps = verify::derive_next_steps(
            verdict.as_ref().and_then(|v| v.whats_missing.as_deref()),
            &results,
            final_url.as_deref(),
            prompt,
        );
        let next_steps = if steps.is_empty() { None } else { Some(steps) };
        let detail = match verdict_message {
            Some(m) => format!(" {m}"),
            None => String::new(),
        };

        let message = if completed == 0 {
            format!("I wasn't able to complete any of the {total} planned steps.{detail}")
        } else if failed > 0 {
            format!("Completed {completed} of {total} steps, but the goal wasn't fully met.{detail}")
        } else {
            format!("All steps ran, but the goal doesn't appear to be met.{detail}")
        };

        ExecutionSummary {
            success: false,
            message,
            results,
            goal_achieved: false,
            next_steps,
        }
    }

    async fn extract_answer(
        &self,
        prompt: &str,
        results: &[ExecutionResult],
        cancel: &CancellationToken,
    ) -> Option<String> {
        let extractor = self.extractor.as_ref()?;
        let context = clip_context(&self.perceiver.markup().await, self.cfg.context_char_budget);
        match extractor.extract(&context, prompt, results, cancel).await {
            Ok(extraction) if extraction.success && !extraction.answer.trim().is_empty() => {
                Some(extraction.answer.trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "answer extraction failed");
                None
            }
        }
    }
}
