//! Post-run judgment helpers: classifying the original request, and turning a
//! not-achieved verdict into concrete remediation steps.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::plan::{ActionStatus, ExecutionResult};

static INTERROGATIVE_LEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(what|who|whom|whose|when|where|why|how|which|is|are|was|were|does|do|did|can|could|should|would|will)\b")
        .unwrap()
});

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|yo|thanks|thank you|ok|okay|cool|great|nice)[\s!.?]*$").unwrap()
});

static SELF_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bthis (page|article|site|tab|document)\b").unwrap());

static INTENT_TO_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(play|watch|listen|open|read|download|buy)\b").unwrap());

/// True when the request asks for information rather than a page action, so
/// the final message should be a synthesized answer.
pub fn is_research_question(prompt: &str) -> bool {
    let trimmed = prompt.trim();
    if trimmed.is_empty() || GREETING.is_match(trimmed) || SELF_REFERENCE.is_match(trimmed) {
        return false;
    }
    trimmed.ends_with('?') || INTERROGATIVE_LEAD.is_match(trimmed)
}

// Service keywords worth checking the final page's host against. Gmail lives
// on a google.com host, hence the separate host fragment.
const SERVICE_HOSTS: [(&str, &str); 10] = [
    ("gmail", "google"),
    ("youtube", "youtube"),
    ("github", "github"),
    ("google", "google"),
    ("wikipedia", "wikipedia"),
    ("amazon", "amazon"),
    ("twitter", "twitter"),
    ("linkedin", "linkedin"),
    ("reddit", "reddit"),
    ("spotify", "spotify"),
];

/// Service named in the prompt whose host does not match the final page, if
/// any. Returns the named service.
pub fn domain_mismatch(prompt: &str, final_url: Option<&str>) -> Option<String> {
    let final_url = final_url?;
    let host = Url::parse(final_url).ok()?.host_str()?.to_lowercase();
    let lowered = prompt.to_lowercase();
    for (keyword, fragment) in SERVICE_HOSTS {
        if lowered.contains(keyword) && !host.contains(fragment) {
            return Some(keyword.to_string());
        }
    }
    None
}

/// Remediation guidance for a run whose goal was not achieved: the verifier's
/// own hint, the failed step kinds, a "one more step" heuristic, and a check
/// that we ended up on the site the prompt named.
pub fn derive_next_steps(
    whats_missing: Option<&str>,
    results: &[ExecutionResult],
    final_url: Option<&str>,
    prompt: &str,
) -> Vec<String> {
    let mut steps = Vec::new();

    if let Some(hint) = whats_missing.map(str::trim).filter(|h| !h.is_empty()) {
        steps.push(hint.to_string());
    }

    let mut failed_kinds: Vec<&str> = results
        .iter()
        .filter(|r| r.status == ActionStatus::Failed)
        .map(|r| r.action.kind.as_str())
        .collect();
    failed_kinds.dedup();
    if !failed_kinds.is_empty() {
        steps.push(format!(
            "Try these steps manually: {}",
            failed_kinds.join(", ")
        ));
    }

    // A search that completed without anything being opened usually means the
    // request wanted the result itself, not the result list.
    let last_completed = results
        .iter()
        .rev()
        .find(|r| r.status == ActionStatus::Completed);
    if let Some(last) = last_completed {
        let searched = last.action.kind == "search"
            || last.action.description.to_lowercase().contains("search");
        if searched && INTENT_TO_OPEN.is_match(prompt) {
            steps.push("Open the first matching result; the search finished but nothing was selected.".to_string());
        }
    }

    if let Some(service) = domain_mismatch(prompt, final_url) {
        steps.push(format!(
            "The final page was not on {service}; navigate there and retry."
        ));
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Action;

    fn result(kind: &str, description: &str, status: ActionStatus) -> ExecutionResult {
        ExecutionResult {
            action: Action::new(kind, description),
            status,
            reason: None,
            observation: None,
            attempts: Vec::new(),
        }
    }

    #[test]
    fn questions_classify_as_research() {
        assert!(is_research_question("What is the tallest building in Europe?"));
        assert!(is_research_question("how many moons does jupiter have"));
        assert!(is_research_question("Population of Portugal?"));
    }

    #[test]
    fn greetings_and_page_references_do_not() {
        assert!(!is_research_question("thanks!"));
        assert!(!is_research_question("hello"));
        assert!(!is_research_question("What does this page say about pricing?"));
        assert!(!is_research_question("Summarize this article"));
    }

    #[test]
    fn commands_are_not_research() {
        assert!(!is_research_question("Log in to my email and archive everything"));
    }

    #[test]
    fn mismatch_flags_a_named_service_on_the_wrong_host() {
        let found = domain_mismatch(
            "Play lofi beats on youtube",
            Some("https://www.bing.com/search?q=lofi"),
        );
        assert_eq!(found.as_deref(), Some("youtube"));
        assert_eq!(
            domain_mismatch("Play lofi beats on youtube", Some("https://www.youtube.com/results")),
            None
        );
    }

    #[test]
    fn gmail_accepts_a_google_host() {
        assert_eq!(
            domain_mismatch("Check gmail for the invoice", Some("https://mail.google.com/mail")),
            None
        );
    }

    #[test]
    fn next_steps_combine_all_sources() {
        let results = vec![
            result("navigate", "Go to youtube", ActionStatus::Completed),
            result("search", "Search for lofi beats", ActionStatus::Completed),
            result("click", "Open the first video", ActionStatus::Failed),
        ];
        let steps = derive_next_steps(
            Some("The video never started playing"),
            &results,
            Some("https://www.bing.com/videos"),
            "Play lofi beats on youtube",
        );
        assert_eq!(steps.len(), 4);
        assert!(steps[0].contains("never started"));
        assert!(steps[1].contains("click"));
        assert!(steps[2].contains("Open the first matching result"));
        assert!(steps[3].contains("youtube"));
    }

    #[test]
    fn no_steps_when_nothing_applies() {
        let results = vec![result("navigate", "Go somewhere", ActionStatus::Completed)];
        let steps = derive_next_steps(None, &results, None, "Do the thing");
        assert!(steps.is_empty());
    }
}
