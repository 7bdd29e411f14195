use std::env;
use std::fs;

use anyhow::{anyhow, bail, Context, Result};

use crate::prompts::{PromptCatalogs, PromptOverrides};
use crate::telemetry::RotationConfig;

pub const DEFAULT_AGENT_ENDPOINT: &str = "http://127.0.0.1:8787";
pub const DEFAULT_AGENT_ID: &str = "LBQSCKGFJM";
pub const DEFAULT_DETECTION_ALIAS_ID: &str = "NTCPG9HUZF";
pub const DEFAULT_REMEDIATION_ALIAS_ID: &str = "DTC1TK3HZA";
pub const DEFAULT_PARSER_ALIAS_ID: &str = "DTC1TK3HZA";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_DETECTION_TYPE: &str = "cross";
pub const DEFAULT_REMEDIATION_TYPE: &str = "remove_source";

/// Agent identity and gateway location.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: String,
    pub agent_id: String,
    pub detection_alias_id: String,
    pub remediation_alias_id: String,
    pub parser_alias_id: String,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub region: String,
    pub detection_type: String,
    pub remediation_type: String,
    pub prompts: PromptCatalogs,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub max_request_bytes: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let prompts = match env_string("DRIFT_PROMPTS_FILE") {
            Some(path) => {
                let content = fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read DRIFT_PROMPTS_FILE '{}': file unreadable", path)
                })?;
                let overrides: PromptOverrides = serde_json::from_str(&content).with_context(|| {
                    format!(
                        "Failed to parse DRIFT_PROMPTS_FILE '{}': invalid JSON template overrides",
                        path
                    )
                })?;
                PromptCatalogs::builtin().with_overrides(overrides)
            }
            None => PromptCatalogs::builtin(),
        };

        let detection_type = env_or("DETECTION_TYPE", DEFAULT_DETECTION_TYPE);
        if !prompts.detection.contains(&detection_type) {
            bail!(
                "DETECTION_TYPE '{}' has no prompt template (configured: {})",
                detection_type,
                prompts.detection.keys().join(", ")
            );
        }
        let remediation_type = env_or("REMEDIATION_TYPE", DEFAULT_REMEDIATION_TYPE);
        if !prompts.remediation.contains(&remediation_type) {
            bail!(
                "REMEDIATION_TYPE '{}' has no prompt template (configured: {})",
                remediation_type,
                prompts.remediation.keys().join(", ")
            );
        }

        let agent = AgentConfig {
            endpoint: env_or("AGENT_ENDPOINT", DEFAULT_AGENT_ENDPOINT),
            agent_id: env_or("AGENT_ID", DEFAULT_AGENT_ID),
            detection_alias_id: env_or("DETECTION_AGENT_ALIAS_ID", DEFAULT_DETECTION_ALIAS_ID),
            remediation_alias_id: env_or("REMEDIATION_AGENT_ALIAS_ID", DEFAULT_REMEDIATION_ALIAS_ID),
            parser_alias_id: env_or("PARSER_AGENT_ALIAS_ID", DEFAULT_PARSER_ALIAS_ID),
            bearer_token: env_string("AGENT_BEARER_TOKEN"),
        };

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            agent,
            region: env_or("AWS_REGION", DEFAULT_REGION),
            detection_type,
            remediation_type,
            prompts,
            log_file: env_string("LOG_FILE"),
            rotation,
            log_stdout: parse_bool_env("DRIFT_LOG_STDOUT")?.unwrap_or(false),
            max_request_bytes: parse_optional_u64("DRIFT_MAX_REQUEST_BYTES")?.map(|v| v as usize),
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig {
                endpoint: DEFAULT_AGENT_ENDPOINT.to_string(),
                agent_id: DEFAULT_AGENT_ID.to_string(),
                detection_alias_id: DEFAULT_DETECTION_ALIAS_ID.to_string(),
                remediation_alias_id: DEFAULT_REMEDIATION_ALIAS_ID.to_string(),
                parser_alias_id: DEFAULT_PARSER_ALIAS_ID.to_string(),
                bearer_token: None,
            },
            region: DEFAULT_REGION.to_string(),
            detection_type: DEFAULT_DETECTION_TYPE.to_string(),
            remediation_type: DEFAULT_REMEDIATION_TYPE.to_string(),
            prompts: PromptCatalogs::builtin(),
            log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
            max_request_bytes: None,
        }
    }
}

fn env_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or(var: &str, default: &str) -> String {
    env_string(var).unwrap_or_else(|| default.to_string())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
