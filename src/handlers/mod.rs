//! Request handlers.
//!
//! Each handler extracts its fields from the incoming event, resolves a
//! prompt template, invokes the agent once and stitches fixed metadata onto
//! whatever JSON could be recovered from the answer. When nothing usable
//! comes back the handler answers with a deterministic fallback envelope
//! instead of an error; only an unconfigured template key is raised.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::agent::AgentInvoker;
use crate::prompts::TemplateError;
use crate::recover::{recover_json, Recovered};

pub mod detection;
pub mod parser;
pub mod remediation;

pub use self::detection::DetectionHandler;
pub use self::parser::ParserHandler;
pub use self::remediation::RemediationHandler;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Which entry point a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Detection,
    Remediation,
    Parser,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 3] = [
        HandlerKind::Detection,
        HandlerKind::Remediation,
        HandlerKind::Parser,
    ];

    pub fn name(self) -> &'static str {
        match self {
            HandlerKind::Detection => "detection",
            HandlerKind::Remediation => "remediation",
            HandlerKind::Parser => "parser",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Agent output was recovered and returned.
    Parsed,
    /// Nothing usable was recovered; the fixed fallback envelope was returned.
    Fallback,
    /// The event was rejected before the agent was called (typed `error` envelope).
    Rejected,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Parsed => "parsed",
            Outcome::Fallback => "fallback",
            Outcome::Rejected => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerResponse {
    pub envelope: Value,
    pub outcome: Outcome,
    /// `object`, `array` or `none`.
    pub shape: &'static str,
    pub agent_chars: usize,
    pub agent_failed: bool,
}

impl HandlerResponse {
    fn rejected(envelope: Value) -> Self {
        Self {
            envelope,
            outcome: Outcome::Rejected,
            shape: "none",
            agent_chars: 0,
            agent_failed: false,
        }
    }
}

#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    fn kind(&self) -> HandlerKind;
    async fn handle(&self, event: &Value) -> Result<HandlerResponse, HandlerError>;
}

/// Whether a request carries a CICD log or asks for a repository scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    CicdLog,
    FullScan,
}

impl ScanKind {
    /// Anything other than `cicd_log`, including a missing type, is a full scan.
    pub fn from_type(value: Option<&str>) -> Self {
        match value {
            Some(crate::prompts::CICD_LOG) => ScanKind::CicdLog,
            _ => ScanKind::FullScan,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanKind::CicdLog => crate::prompts::CICD_LOG,
            ScanKind::FullScan => crate::prompts::FULL_SCAN,
        }
    }
}

/// Agent answer after recovery.
struct Exchange {
    recovered: Recovered,
    agent_chars: usize,
    agent_failed: bool,
}

async fn ask(agent: &AgentInvoker, prompt: &str) -> Exchange {
    let reply = agent.invoke(prompt).await;
    let recovered = recover_json(&reply.text);
    tracing::debug!(
        session_id = %reply.session_id,
        shape = recovered.shape(),
        agent_chars = reply.text.len(),
        "agent answer recovered"
    );
    Exchange {
        recovered,
        agent_chars: reply.text.len(),
        agent_failed: reply.failed,
    }
}

/// Build the outbound envelope.
///
/// A non-empty recovered object gets `metadata` written over it; a non-empty
/// array is wrapped under `array_key` first. Anything else yields `metadata`
/// followed by `fallback`.
fn envelope(
    exchange: Exchange,
    array_key: &str,
    metadata: Map<String, Value>,
    fallback: Map<String, Value>,
) -> HandlerResponse {
    let shape = exchange.recovered.shape();
    let body = match exchange.recovered {
        Recovered::Object(map) if !map.is_empty() => Some(map),
        Recovered::Array(items) if !items.is_empty() => {
            let mut map = Map::new();
            map.insert(array_key.to_string(), Value::Array(items));
            Some(map)
        }
        _ => None,
    };
    let (envelope, outcome) = match body {
        Some(mut map) => {
            map.extend(metadata);
            (map, Outcome::Parsed)
        }
        None => {
            let mut map = metadata;
            map.extend(fallback);
            (map, Outcome::Fallback)
        }
    };
    HandlerResponse {
        envelope: Value::Object(envelope),
        outcome,
        shape,
        agent_chars: exchange.agent_chars,
        agent_failed: exchange.agent_failed,
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
