//! Utility helpers shared by the handlers.
//!
//! Repository URL detection and the conversion of event values into prompt
//! parameters live here so every handler renders its inputs the same way.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static GITHUB_REPO_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://github\.com/[a-zA-Z0-9_\-]+/[a-zA-Z0-9_\-]+")
        .expect("repository URL pattern compiles")
});

/// First GitHub repository URL (`https://github.com/<owner>/<repo>`) in `text`.
pub fn extract_repo_url(text: &str) -> Option<&str> {
    GITHUB_REPO_URL.find(text).map(|m| m.as_str())
}

/// Last path segment of a repository URL, used as the knowledge base prefix.
pub fn repo_prefix(repo_url: &str) -> &str {
    repo_url.rsplit('/').next().unwrap_or(repo_url)
}

/// Render an event value as a prompt parameter.
///
/// Strings are inserted verbatim, null becomes the empty string and
/// everything else is serialized as compact JSON.
pub fn render_param(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Round seconds to three decimals for `latency_sec` fields.
pub fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_repo_url_inside_text() {
        let text = "please scan https://github.com/acme-corp/infra_live.git now";
        assert_eq!(
            extract_repo_url(text),
            Some("https://github.com/acme-corp/infra_live")
        );
    }

    #[test]
    fn rejects_non_github_urls() {
        assert_eq!(extract_repo_url("https://gitlab.com/a/b"), None);
        assert_eq!(extract_repo_url("https://github.com/only-owner"), None);
    }

    #[test]
    fn prefix_is_last_segment() {
        assert_eq!(repo_prefix("https://github.com/acme/infra"), "infra");
    }

    #[test]
    fn renders_params() {
        assert_eq!(render_param(&Value::Null), "");
        assert_eq!(render_param(&json!("log text")), "log text");
        assert_eq!(render_param(&json!(["a", 1])), r#"["a",1]"#);
        assert_eq!(render_param(&json!({"k": true})), r#"{"k":true}"#);
    }

    #[test]
    fn rounds_to_millis() {
        assert_eq!(round_millis(1.23456), 1.235);
    }
}
