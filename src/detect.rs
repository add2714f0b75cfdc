//! Page-text detectors used between actions: failure banners, empty form
//! fields, and submit controls. Everything here is pure string scanning over
//! a markup snapshot so it stays cheap and deterministic.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;

/// What we know about one visible input field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FieldMeta {
    pub name: String,
    pub label: String,
    pub input_type: String,
    pub required: bool,
}

impl FieldMeta {
    /// Session-store key: the field name when present, otherwise its label.
    pub fn key(&self) -> String {
        if self.name.is_empty() {
            self.label.to_lowercase()
        } else {
            self.name.to_lowercase()
        }
    }
}

static INPUT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(input|textarea)\b[^>]*>").unwrap());

static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)([a-z][a-z0-9-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

static BARE_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(required|hidden|disabled|readonly)\b(?:[\s>/]|$)").unwrap());

static MARKER_ELEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<([a-z][a-z0-9]*)\b[^>]*(?:class\s*=\s*["'][^"']*(?:\berror\b|\balert\b|\binvalid\b|\bdanger\b|\bwarning\b)[^"']*["']|role\s*=\s*["']alert["'])[^>]*>(.*?)</[a-z][a-z0-9]*>"#,
    )
    .unwrap()
});

static FAILURE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(invalid (?:user ?name|password|email|credentials|code)|incorrect (?:user ?name|password|email|code)|wrong password|(?:login|log ?in|sign ?in|authentication) (?:failed|error)|could not (?:log|sign) you in|(?:is|are) required|must not be (?:blank|empty)|please (?:enter|provide|fill in) [^.<]{0,60}|verification (?:code )?(?:failed|expired)|too many attempts|access denied|session (?:has )?expired)",
    )
    .unwrap()
});

static TAG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static SUBMIT_CONTROL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<button\b[^>]*>(.*?)</button>|<input\b[^>]*type\s*=\s*["'](?:submit|button)["'][^>]*>"#,
    )
    .unwrap()
});

static SUBMIT_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(log ?in|sign ?(?:in|up)|submit|continue|next|search|send|go|save|confirm|apply)\b").unwrap()
});

fn strip_tags(fragment: &str) -> String {
    let text = TAG_STRIP.replace_all(fragment, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn attrs(tag: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for cap in ATTR.captures_iter(tag) {
        let key = cap[1].to_lowercase();
        let value = cap
            .get(2)
            .or_else(|| cap.get(3))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        map.insert(key, value);
    }
    map
}

fn has_bare_attr(tag: &str, name: &str) -> bool {
    BARE_ATTR
        .captures_iter(tag)
        .any(|cap| cap[1].eq_ignore_ascii_case(name))
}

/// Most specific failure text on the page, if any. Marked-up error containers
/// win over free-floating failure phrases.
pub fn find_error_message(markup: &str) -> Option<String> {
    for cap in MARKER_ELEMENT.captures_iter(markup) {
        let text = strip_tags(&cap[2]);
        if !text.is_empty() && FAILURE_PHRASE.is_match(&text) {
            return Some(text);
        }
    }
    // Fall back to the first marker container with any text at all.
    for cap in MARKER_ELEMENT.captures_iter(markup) {
        let text = strip_tags(&cap[2]);
        if !text.is_empty() {
            return Some(text);
        }
    }
    let visible = strip_tags(markup);
    FAILURE_PHRASE
        .find(&visible)
        .map(|m| m.as_str().trim().to_string())
}

const TEXT_LIKE: [&str; 8] = ["text", "email", "password", "tel", "url", "search", "number", ""];

/// Visible text-like inputs whose value is blank, with the best label we can
/// resolve for each: associated label, then aria-label, placeholder, name,
/// and finally the input type.
pub fn find_empty_fields(markup: &str) -> Vec<FieldMeta> {
    let mut fields = Vec::new();
    for tag_match in INPUT_TAG.find_iter(markup) {
        let tag = tag_match.as_str();
        let attributes = attrs(tag);
        let input_type = attributes.get("type").cloned().unwrap_or_default();
        if !TEXT_LIKE.contains(&input_type.to_lowercase().as_str()) {
            continue;
        }
        if has_bare_attr(tag, "hidden") || has_bare_attr(tag, "disabled") {
            continue;
        }
        if let Some(style) = attributes.get("style") {
            if style.replace(' ', "").contains("display:none") {
                continue;
            }
        }
        if attributes.get("value").map(|v| !v.trim().is_empty()) == Some(true) {
            continue;
        }

        let name = attributes
            .get("name")
            .or_else(|| attributes.get("id"))
            .cloned()
            .unwrap_or_default();
        let label = resolve_label(markup, &attributes)
            .unwrap_or_else(|| if name.is_empty() { input_type.clone() } else { name.clone() });
        if label.is_empty() {
            continue;
        }
        fields.push(FieldMeta {
            name,
            label,
            input_type: if input_type.is_empty() {
                "text".to_string()
            } else {
                input_type.to_lowercase()
            },
            required: has_bare_attr(tag, "required"),
        });
    }
    fields
}

fn resolve_label(markup: &str, attributes: &HashMap<String, String>) -> Option<String> {
    if let Some(id) = attributes.get("id").filter(|id| !id.is_empty()) {
        let pattern = format!(
            r#"(?is)<label\b[^>]*for\s*=\s*["']{}["'][^>]*>(.*?)</label>"#,
            regex::escape(id)
        );
        if let Ok(re) = Regex::new(&pattern) {
            if let Some(cap) = re.captures(markup) {
                let text = strip_tags(&cap[1]);
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }
    for key in ["aria-label", "placeholder", "name"] {
        if let Some(value) = attributes.get(key).filter(|v| !v.trim().is_empty()) {
            return Some(value.trim().to_string());
        }
    }
    None
}

/// Label of the nearest submit-capable control, if one exists.
pub fn find_submit_control(markup: &str) -> Option<String> {
    for cap in SUBMIT_CONTROL.captures_iter(markup) {
        let whole = cap.get(0).map(|m| m.as_str()).unwrap_or_default();
        if let Some(inner) = cap.get(1) {
            // <button>: honor an explicit type=submit, otherwise match by text.
            let attributes = attrs(whole);
            let text = strip_tags(inner.as_str());
            let is_submit_type = attributes.get("type").map(String::as_str) == Some("submit");
            if is_submit_type && !text.is_empty() {
                return Some(text);
            }
            if SUBMIT_WORD.is_match(&text) {
                return Some(text);
            }
        } else {
            let attributes = attrs(whole);
            if let Some(value) = attributes.get("value").filter(|v| !v.trim().is_empty()) {
                return Some(value.trim().to_string());
            }
            return Some("Submit".to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_FORM: &str = r#"
        <html><body>
          <form action="/session" method="post">
            <label for="user">Username</label>
            <input type="text" id="user" name="username" value="">
            <label for="pw">Password</label>
            <input type="password" id="pw" name="password">
            <input type="hidden" name="csrf" value="abc123">
            <button type="submit">Sign in</button>
          </form>
        </body></html>
    "#;

    #[test]
    fn login_form_yields_two_empty_fields() {
        let fields = find_empty_fields(LOGIN_FORM);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].label, "Username");
        assert_eq!(fields[0].name, "username");
        assert_eq!(fields[1].label, "Password");
        assert_eq!(fields[1].input_type, "password");
    }

    #[test]
    fn prefilled_and_hidden_inputs_are_skipped() {
        let markup = r#"
            <input type="text" name="city" value="Lisbon">
            <input type="text" name="ghost" hidden>
            <input type="text" name="styled" style="display: none">
            <input type="email" placeholder="Work email">
        "#;
        let fields = find_empty_fields(markup);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].label, "Work email");
    }

    #[test]
    fn label_resolution_falls_back_through_the_chain() {
        let markup = r#"<input type="text" aria-label="Search query" name="q">"#;
        let fields = find_empty_fields(markup);
        assert_eq!(fields[0].label, "Search query");
    }

    #[test]
    fn clean_login_page_has_no_error() {
        assert_eq!(find_error_message(LOGIN_FORM), None);
    }

    #[test]
    fn marked_up_error_text_is_extracted() {
        let markup = r#"
            <div class="form-error">Invalid password. Please try again.</div>
            <input type="password" name="password">
        "#;
        let found = find_error_message(markup).unwrap();
        assert!(found.contains("Invalid password"));
    }

    #[test]
    fn role_alert_counts_as_a_marker() {
        let markup = r#"<span role="alert">Email is required</span>"#;
        assert_eq!(find_error_message(markup).unwrap(), "Email is required");
    }

    #[test]
    fn free_floating_failure_phrase_is_found() {
        let markup = "<p>Sorry, authentication failed for this account.</p>";
        let found = find_error_message(markup).unwrap();
        assert!(found.to_lowercase().contains("authentication failed"));
    }

    #[test]
    fn submit_button_is_found_by_type_and_text() {
        assert_eq!(find_submit_control(LOGIN_FORM).unwrap(), "Sign in");
        let markup = r#"<button class="primary">Continue</button>"#;
        assert_eq!(find_submit_control(markup).unwrap(), "Continue");
        let markup = r#"<input type="submit" value="Search">"#;
        assert_eq!(find_submit_control(markup).unwrap(), "Search");
    }

    #[test]
    fn field_key_prefers_name_over_label() {
        let field = FieldMeta {
            name: "username".into(),
            label: "Your name".into(),
            input_type: "text".into(),
            required: true,
        };
        assert_eq!(field.key(), "username");
    }
}
