use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ========================= Core Types =========================

/// One planned step: an abstract kind tag plus a human-readable description.
/// The concrete page operation is decided later, against the live page.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: String,
    pub description: String,
}

impl Action {
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// A concrete operation against the page, produced by interpreting one
/// abstract action in the context of the current markup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Navigate { url: String },
    Click { selector: String },
    Fill { selector: String, value: String },
    Press { key: String },
    Scroll { dx: i64, dy: i64 },
    Wait { ms: u64 },
    Extract { selector: Option<String> },
}

impl Operation {
    pub fn describe(&self) -> String {
        match self {
            Operation::Navigate { url } => format!("navigate to {url}"),
            Operation::Click { selector } => format!("click {selector}"),
            Operation::Fill { selector, value } => format!("fill {selector} with \"{value}\""),
            Operation::Press { key } => format!("press {key}"),
            Operation::Scroll { dx, dy } => format!("scroll by ({dx}, {dy})"),
            Operation::Wait { ms } => format!("wait {ms}ms"),
            Operation::Extract { selector } => match selector {
                Some(s) => format!("extract text from {s}"),
                None => "extract page text".to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// One try of one action. Budget re-issues after a truncated model response
/// reuse the same attempt number and do not add a record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub operation: Option<Operation>,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action: Action,
    pub status: ActionStatus,
    pub reason: Option<String>,
    pub observation: Option<String>,
    pub attempts: Vec<AttemptRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub success: bool,
    pub message: String,
    pub results: Vec<ExecutionResult>,
    pub goal_achieved: bool,
    pub next_steps: Option<Vec<String>>,
}

// ========================= Session Values =========================

/// Answers the user already gave for form fields, keyed by field name/label.
/// Scoped to one session and handed to the sequencer explicitly.
#[derive(Clone, Debug, Default)]
pub struct SessionValues {
    values: HashMap<String, String>,
}

impl SessionValues {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn remember(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

// ========================= Plan =========================

/// The ordered, growable list of actions for one request, with a status per
/// action. The two sequences always have the same length; mutations either
/// splice pending entries at or after the execution point or overwrite the
/// unexecuted tail.
#[derive(Clone, Debug)]
pub struct Plan {
    actions: Vec<Action>,
    statuses: Vec<ActionStatus>,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        let statuses = vec![ActionStatus::Pending; actions.len()];
        Self { actions, statuses }
    }

    pub fn len(&self) -> usize {
        debug_assert_eq!(self.actions.len(), self.statuses.len());
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn action(&self, index: usize) -> &Action {
        &self.actions[index]
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn tail_from(&self, index: usize) -> &[Action] {
        &self.actions[index.min(self.actions.len())..]
    }

    pub fn status(&self, index: usize) -> ActionStatus {
        self.statuses[index]
    }

    pub fn statuses(&self) -> &[ActionStatus] {
        &self.statuses
    }

    pub fn set_status(&mut self, index: usize, status: ActionStatus) {
        self.statuses[index] = status;
    }

    pub fn set_description(&mut self, index: usize, description: impl Into<String>) {
        self.actions[index].description = description.into();
    }

    /// Mark everything from `index` to the end as cancelled.
    pub fn cancel_from(&mut self, index: usize) {
        for status in self.statuses.iter_mut().skip(index) {
            *status = ActionStatus::Cancelled;
        }
    }

    /// Replace the unexecuted tail starting at `from` with new pending actions.
    pub fn splice_tail(&mut self, from: usize, replacement: Vec<Action>) {
        let from = from.min(self.actions.len());
        self.statuses.truncate(from);
        self.actions.truncate(from);
        self.statuses
            .extend(std::iter::repeat(ActionStatus::Pending).take(replacement.len()));
        self.actions.extend(replacement);
        debug_assert_eq!(self.actions.len(), self.statuses.len());
    }

    /// Splice new pending actions immediately after `index`.
    pub fn insert_after(&mut self, index: usize, additions: Vec<Action>) {
        let at = (index + 1).min(self.actions.len());
        for (offset, action) in additions.into_iter().enumerate() {
            self.actions.insert(at + offset, action);
            self.statuses.insert(at + offset, ActionStatus::Pending);
        }
        debug_assert_eq!(self.actions.len(), self.statuses.len());
    }

    /// Append pending actions at the end of the plan.
    pub fn append(&mut self, additions: Vec<Action>) {
        self.statuses
            .extend(std::iter::repeat(ActionStatus::Pending).take(additions.len()));
        self.actions.extend(additions);
        debug_assert_eq!(self.actions.len(), self.statuses.len());
    }

    /// Drop pending actions of the given kind beyond `index`. Used to clear
    /// stale fill steps once the user has supplied the real values.
    pub fn prune_pending_kind_after(&mut self, index: usize, kind: &str) {
        let mut j = self.actions.len();
        while j > index + 1 {
            j -= 1;
            if self.statuses[j] == ActionStatus::Pending && self.actions[j].kind == kind {
                self.actions.remove(j);
                self.statuses.remove(j);
            }
        }
        debug_assert_eq!(self.actions.len(), self.statuses.len());
    }

    /// True when an identical description is already queued as pending.
    pub fn has_pending_description(&self, description: &str) -> bool {
        self.actions
            .iter()
            .zip(&self.statuses)
            .any(|(a, s)| *s == ActionStatus::Pending && a.description == description)
    }

    /// Render the plan as a numbered checklist for progress updates.
    pub fn render(&self, current: Option<usize>) -> String {
        let mut out = String::new();
        for (i, (action, status)) in self.actions.iter().zip(&self.statuses).enumerate() {
            let glyph = match status {
                ActionStatus::Completed => '✔',
                ActionStatus::Failed => '✖',
                ActionStatus::Cancelled => '⊘',
                ActionStatus::InProgress => '➤',
                ActionStatus::Pending => '·',
            };
            let marker = if current == Some(i) { '➤' } else { glyph };
            out.push_str(&format!("{marker} {}. {}\n", i + 1, action.description));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan3() -> Plan {
        Plan::new(vec![
            Action::new("navigate", "Go to the site"),
            Action::new("click", "Open the form"),
            Action::new("extract", "Read the result"),
        ])
    }

    #[test]
    fn splice_tail_keeps_lengths_in_step() {
        let mut plan = plan3();
        plan.set_status(0, ActionStatus::Completed);
        plan.splice_tail(1, vec![Action::new("fill", "Fill the name field")]);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.actions().len(), plan.statuses().len());
        assert_eq!(plan.status(0), ActionStatus::Completed);
        assert_eq!(plan.status(1), ActionStatus::Pending);
    }

    #[test]
    fn insert_after_grows_both_sequences() {
        let mut plan = plan3();
        plan.insert_after(
            0,
            vec![
                Action::new("fill", "Fill username"),
                Action::new("click", "Submit"),
            ],
        );
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.actions().len(), plan.statuses().len());
        assert_eq!(plan.action(1).kind, "fill");
        assert_eq!(plan.action(2).kind, "click");
        assert_eq!(plan.action(3).kind, "click");
    }

    #[test]
    fn cancel_from_is_monotonic() {
        let mut plan = plan3();
        plan.set_status(0, ActionStatus::Completed);
        plan.cancel_from(1);
        let statuses = plan.statuses();
        let first = statuses
            .iter()
            .position(|s| *s == ActionStatus::Cancelled)
            .unwrap();
        assert!(statuses[first..]
            .iter()
            .all(|s| *s == ActionStatus::Cancelled));
    }

    #[test]
    fn prune_drops_only_pending_fills_beyond_index() {
        let mut plan = Plan::new(vec![
            Action::new("navigate", "Go"),
            Action::new("fill", "Old fill one"),
            Action::new("click", "Submit"),
            Action::new("fill", "Old fill two"),
        ]);
        plan.set_status(0, ActionStatus::Completed);
        plan.set_status(1, ActionStatus::Completed);
        plan.prune_pending_kind_after(0, "fill");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.action(1).description, "Old fill one");
        assert_eq!(plan.action(2).kind, "click");
    }
}
