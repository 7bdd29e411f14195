use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::{ask, envelope, object, Handler, HandlerError, HandlerKind, HandlerResponse, ScanKind};
use crate::agent::AgentInvoker;
use crate::extract::{extract_fields, Field};
use crate::prompts::{Params, PromptCatalog};
use crate::util::{extract_repo_url, render_param, repo_prefix};

const FIELDS: &[Field] = &[
    Field::null("query"),
    Field::null("type"),
    Field::array("iac_resources"),
    Field::array("aws_state_resources"),
    Field::object("cicd_drift"),
];

const CICD_REPO_PLACEHOLDER: &str = "(N/A - CICD log)";

/// Runs the configured drift-detection pass over parsed resources or CICD drift.
pub struct DetectionHandler {
    agent: AgentInvoker,
    catalog: Arc<PromptCatalog>,
    detection_type: String,
    region: String,
}

impl DetectionHandler {
    pub fn new(
        agent: AgentInvoker,
        catalog: Arc<PromptCatalog>,
        detection_type: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            catalog,
            detection_type: detection_type.into(),
            region: region.into(),
        }
    }

    fn metadata(&self, scan: ScanKind) -> Map<String, Value> {
        object(json!({
            "detection_type": self.detection_type,
            "type": scan.as_str(),
        }))
    }
}

#[async_trait::async_trait]
impl Handler for DetectionHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Detection
    }

    async fn handle(&self, event: &Value) -> Result<HandlerResponse, HandlerError> {
        let fields = extract_fields(event, FIELDS);
        let scan = ScanKind::from_type(fields.str("type"));
        let query = fields.str("query").unwrap_or_default().trim();

        let mut params = Params::new();
        params.insert("region", self.region.clone());
        params.insert("cicd_drift", render_param(fields.get("cicd_drift")));
        match scan {
            ScanKind::CicdLog => {
                if query.is_empty() {
                    tracing::warn!(
                        detection_type = %self.detection_type,
                        "cicd_log detection without log text"
                    );
                }
                params.insert("repo_url", CICD_REPO_PLACEHOLDER.to_string());
                params.insert("repo_prefix", String::new());
                params.insert("iac_data", "[]".to_string());
                params.insert("state_data", "[]".to_string());
            }
            ScanKind::FullScan => {
                let Some(repo_url) = extract_repo_url(query) else {
                    tracing::warn!(
                        detection_type = %self.detection_type,
                        query_chars = query.len(),
                        "no repository URL in full_scan query"
                    );
                    return Ok(HandlerResponse::rejected(json!({
                        "error": "No repo_url found",
                        "type": scan.as_str(),
                        "detection_type": self.detection_type,
                    })));
                };
                params.insert("repo_url", repo_url.to_string());
                params.insert("repo_prefix", repo_prefix(repo_url).to_string());
                params.insert("iac_data", render_param(fields.get("iac_resources")));
                params.insert("state_data", render_param(fields.get("aws_state_resources")));
            }
        }

        let prompt = self.catalog.resolve(&self.detection_type, &params)?;
        tracing::info!(
            detection_type = %self.detection_type,
            scan = scan.as_str(),
            alias_id = self.agent.alias_id(),
            prompt_chars = prompt.len(),
            "running drift detection"
        );

        let exchange = ask(&self.agent, &prompt).await;
        Ok(envelope(
            exchange,
            "drifted_resources",
            self.metadata(scan),
            object(json!({
                "drifted_resources": [],
                "summary": "No drift detected or parsing failed",
            })),
        ))
    }
}
