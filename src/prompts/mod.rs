//! Prompt templates for the agent.
//!
//! Templates use `{name}` placeholders with `{{` / `}}` as literal braces.
//! Every placeholder must be supplied at render time: callers pass empty
//! strings for absent data because the templates themselves tell the agent
//! to fall back to the knowledge base when a section is empty.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Template key for CICD log parsing.
pub const CICD_LOG: &str = "cicd_log";
/// Template key for repository-wide scans.
pub const FULL_SCAN: &str = "full_scan";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no prompt template configured for '{key}'")]
    KeyNotFound { key: String },
    #[error("prompt template '{key}' requires parameter '{name}'")]
    MissingParameter { key: String, name: String },
    #[error("prompt template '{key}' has an unbalanced brace at byte {offset}")]
    Malformed { key: String, offset: usize },
}

/// Named values substituted into a template.
pub type Params<'a> = HashMap<&'a str, String>;

/// An immutable set of templates keyed by detection/remediation/parse type.
#[derive(Debug, Clone, Default)]
pub struct PromptCatalog {
    templates: HashMap<String, String>,
}

impl PromptCatalog {
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            templates: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.templates.contains_key(key)
    }

    /// Configured keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Select the template for `key` and substitute `params` into it.
    pub fn resolve(&self, key: &str, params: &Params<'_>) -> Result<String, TemplateError> {
        let template = self
            .templates
            .get(key)
            .ok_or_else(|| TemplateError::KeyNotFound { key: key.to_string() })?;
        render(key, template, params)
    }

    fn merge(&mut self, extra: HashMap<String, String>) {
        self.templates.extend(extra);
    }
}

/// Substitute `{name}` placeholders in `template`.
pub fn render(key: &str, template: &str, params: &Params<'_>) -> Result<String, TemplateError> {
    let malformed = |offset| TemplateError::Malformed {
        key: key.to_string(),
        offset,
    };
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;
    let mut offset = 0;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let at = offset + pos;
        let tail = &rest[pos..];
        let consumed = if tail.starts_with("{{") {
            out.push('{');
            2
        } else if tail.starts_with("}}") {
            out.push('}');
            2
        } else if tail.starts_with('}') {
            return Err(malformed(at));
        } else {
            let close = tail.find('}').ok_or_else(|| malformed(at))?;
            let name = &tail[1..close];
            if !is_placeholder_name(name) {
                return Err(malformed(at));
            }
            let value = params
                .get(name)
                .ok_or_else(|| TemplateError::MissingParameter {
                    key: key.to_string(),
                    name: name.to_string(),
                })?;
            out.push_str(value);
            close + 1
        };
        rest = &tail[consumed..];
        offset = at + consumed;
    }
    out.push_str(rest);
    Ok(out)
}

fn is_placeholder_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Optional template overrides loaded from `DRIFT_PROMPTS_FILE`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptOverrides {
    #[serde(default)]
    pub detection: HashMap<String, String>,
    #[serde(default)]
    pub remediation: HashMap<String, String>,
    #[serde(default)]
    pub parser: HashMap<String, String>,
}

/// The three catalogs used by the handlers.
#[derive(Debug, Clone)]
pub struct PromptCatalogs {
    pub detection: PromptCatalog,
    pub remediation: PromptCatalog,
    pub parser: PromptCatalog,
}

impl PromptCatalogs {
    pub fn builtin() -> Self {
        Self {
            detection: PromptCatalog::from_entries([
                ("normal", include_str!("templates/detection/normal.txt")),
                ("policy", include_str!("templates/detection/policy.txt")),
                ("semantic", include_str!("templates/detection/semantic.txt")),
                ("hidden", include_str!("templates/detection/hidden.txt")),
                ("cross", include_str!("templates/detection/cross.txt")),
                ("behavioral", include_str!("templates/detection/behavioral.txt")),
                ("version", include_str!("templates/detection/version.txt")),
            ]),
            remediation: PromptCatalog::from_entries([
                ("update_iac", include_str!("templates/remediation/update_iac.txt")),
                (
                    "remove_source",
                    include_str!("templates/remediation/remove_source.txt"),
                ),
            ]),
            parser: PromptCatalog::from_entries([
                (CICD_LOG, include_str!("templates/parser/cicd_log.txt")),
                (FULL_SCAN, include_str!("templates/parser/full_scan.txt")),
            ]),
        }
    }

    /// Add or replace templates from an override file.
    pub fn with_overrides(mut self, overrides: PromptOverrides) -> Self {
        self.detection.merge(overrides.detection);
        self.remediation.merge(overrides.remediation);
        self.parser.merge(overrides.parser);
        self
    }
}

impl Default for PromptCatalogs {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&'static str, &str)]) -> Params<'static> {
        entries.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn substitutes_named_placeholders() {
        let catalog = PromptCatalog::from_entries([("t", "repo {repo_url} in {region}")]);
        let out = catalog
            .resolve("t", &params(&[("repo_url", "https://github.com/a/b"), ("region", "eu-west-1")]))
            .unwrap();
        assert_eq!(out, "repo https://github.com/a/b in eu-west-1");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let out = render("t", r#"{{"repo": "{repo}"}}"#, &params(&[("repo", "x")])).unwrap();
        assert_eq!(out, r#"{"repo": "x"}"#);
    }

    #[test]
    fn empty_values_are_accepted() {
        let out = render("t", "data: [{iac_data}]", &params(&[("iac_data", "")])).unwrap();
        assert_eq!(out, "data: []");
    }

    #[test]
    fn unknown_key_is_an_error() {
        let catalog = PromptCatalog::default();
        let err = catalog.resolve("nope", &Params::new()).unwrap_err();
        assert_eq!(err, TemplateError::KeyNotFound { key: "nope".into() });
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let err = render("normal", "a {present} b {absent}", &params(&[("present", "1")])).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingParameter {
                key: "normal".into(),
                name: "absent".into()
            }
        );
    }

    #[test]
    fn unbalanced_braces_are_malformed() {
        assert!(matches!(
            render("t", "open { never", &Params::new()),
            Err(TemplateError::Malformed { offset: 5, .. })
        ));
        assert!(matches!(
            render("t", "stray } here", &Params::new()),
            Err(TemplateError::Malformed { offset: 6, .. })
        ));
        assert!(matches!(
            render("t", "{not a name}", &Params::new()),
            Err(TemplateError::Malformed { offset: 0, .. })
        ));
    }

    #[test]
    fn extra_parameters_are_ignored() {
        let out = render("t", "{a}", &params(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(out, "1");
    }

    #[test]
    fn builtin_detection_templates_render() {
        let catalogs = PromptCatalogs::builtin();
        let p = params(&[
            ("repo_url", "https://github.com/acme/infra"),
            ("repo_prefix", "infra"),
            ("region", "us-east-1"),
            ("iac_data", "[]"),
            ("state_data", "[]"),
            ("cicd_drift", "{}"),
        ]);
        for key in catalogs.detection.keys() {
            let prompt = catalogs.detection.resolve(key, &p).unwrap();
            assert!(prompt.contains("iac_config/infra"), "template {}", key);
            assert!(prompt.contains(&format!("\"detection_type\": \"{}\"", key)));
        }
    }

    #[test]
    fn builtin_remediation_templates_carry_their_type() {
        let catalogs = PromptCatalogs::builtin();
        for key in ["update_iac", "remove_source"] {
            let mut p = params(&[
                ("normal_result", ""),
                ("policy_result", ""),
                ("semantic_result", ""),
                ("hidden_result", ""),
                ("behavioral_result", ""),
                ("cross_result", ""),
                ("version_result", ""),
                ("overlap_result", ""),
                ("detection_reports_json", "[]"),
            ]);
            p.insert("remediation_type", key.to_string());
            let prompt = catalogs.remediation.resolve(key, &p).unwrap();
            assert!(prompt.contains(&format!("\"remediation_type\": \"{}\"", key)));
        }
    }

    #[test]
    fn builtin_parser_templates_render() {
        let catalogs = PromptCatalogs::builtin();
        let log = catalogs
            .parser
            .resolve(CICD_LOG, &params(&[("log_text", "Refreshing state..."), ("region", "us-east-1")]))
            .unwrap();
        assert!(log.contains("Refreshing state..."));
        let scan = catalogs
            .parser
            .resolve(
                FULL_SCAN,
                &params(&[
                    ("repo_url", "https://github.com/acme/infra"),
                    ("repo_prefix", "infra"),
                    ("region", "us-east-1"),
                ]),
            )
            .unwrap();
        assert!(scan.contains("\"repo_url\": \"infra\""));
    }

    #[test]
    fn overrides_add_and_replace() {
        let overrides: PromptOverrides = serde_json::from_value(serde_json::json!({
            "detection": {"overlap": "overlap {repo_url}", "cross": "custom"}
        }))
        .unwrap();
        let catalogs = PromptCatalogs::builtin().with_overrides(overrides);
        assert!(catalogs.detection.contains("overlap"));
        assert_eq!(
            catalogs.detection.resolve("cross", &Params::new()).unwrap(),
            "custom"
        );
        assert!(catalogs.remediation.contains("remove_source"));
    }
}
