use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Map, Value};

use super::{ask, envelope, object, Handler, HandlerError, HandlerKind, HandlerResponse};
use crate::agent::AgentInvoker;
use crate::prompts::{Params, PromptCatalog, CICD_LOG, FULL_SCAN};
use crate::util::{extract_repo_url, repo_prefix, round_millis};

/// Normalizes a raw query (CICD log text or a repository reference) into
/// structured resources.
///
/// Unlike detection and remediation, the parser reads `query` and `type`
/// from the top level of the event only.
pub struct ParserHandler {
    agent: AgentInvoker,
    catalog: Arc<PromptCatalog>,
    region: String,
}

impl ParserHandler {
    pub fn new(agent: AgentInvoker, catalog: Arc<PromptCatalog>, region: impl Into<String>) -> Self {
        Self {
            agent,
            catalog,
            region: region.into(),
        }
    }
}

#[async_trait::async_trait]
impl Handler for ParserHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Parser
    }

    async fn handle(&self, event: &Value) -> Result<HandlerResponse, HandlerError> {
        let start = Instant::now();
        let query = event
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();
        // the default only applies when the key is absent
        let query_type = match event.get("type") {
            None => FULL_SCAN,
            Some(Value::String(value)) => value.as_str(),
            Some(other) => {
                tracing::warn!(query_type = %other, "query type is not a string");
                return Ok(HandlerResponse::rejected(json!({
                    "error": "Invalid type",
                    "type": other,
                })));
            }
        };
        tracing::info!(
            query_type,
            query_chars = query.len(),
            "parsing query"
        );

        let mut params = Params::new();
        params.insert("region", self.region.clone());
        let fallback = match query_type {
            CICD_LOG => {
                params.insert("log_text", query.to_string());
                object(json!({
                    "cicd_drift": {
                        "total_refreshed": 0,
                        "managed_count": 0,
                        "drifted": [],
                        "unmanaged": [],
                    },
                    "summary": "No CICD drift parsed",
                }))
            }
            FULL_SCAN => {
                let Some(repo_url) = extract_repo_url(query) else {
                    tracing::warn!(query_chars = query.len(), "no repository URL in query");
                    return Ok(HandlerResponse::rejected(json!({
                        "error": "No repo_url found",
                        "type": query_type,
                    })));
                };
                let prefix = repo_prefix(repo_url);
                params.insert("repo_url", repo_url.to_string());
                params.insert("repo_prefix", prefix.to_string());
                object(json!({
                    "repo_url": prefix,
                    "iac_resources": [],
                    "aws_state_resources": [],
                    "total_iac": 0,
                    "total_state": 0,
                    "summary": "No resources parsed",
                }))
            }
            other => {
                tracing::warn!(query_type = other, "unsupported query type");
                return Ok(HandlerResponse::rejected(json!({
                    "error": "Invalid type",
                    "type": other,
                })));
            }
        };

        let prompt = self.catalog.resolve(query_type, &params)?;
        let exchange = ask(&self.agent, &prompt).await;

        let latency_sec = round_millis(start.elapsed().as_secs_f64());
        let mut metadata = Map::new();
        metadata.insert("type".to_string(), Value::from(query_type));
        metadata.insert("latency_sec".to_string(), Value::from(latency_sec));

        let response = envelope(exchange, "resources", metadata, fallback);
        tracing::info!(
            query_type,
            outcome = response.outcome.as_str(),
            latency_sec,
            "query parsed"
        );
        Ok(response)
    }
}
