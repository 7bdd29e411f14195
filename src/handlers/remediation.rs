use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::{ask, envelope, object, Handler, HandlerError, HandlerKind, HandlerResponse};
use crate::agent::AgentInvoker;
use crate::extract::{extract_fields, Field};
use crate::prompts::{Params, PromptCatalog};
use crate::util::render_param;

/// Detection reports and the template parameter each one fills.
const REPORTS: [(&str, &str); 8] = [
    ("normal", "normal_result"),
    ("policy", "policy_result"),
    ("semantic", "semantic_result"),
    ("hidden", "hidden_result"),
    ("behavioral", "behavioral_result"),
    ("cross", "cross_result"),
    ("version", "version_result"),
    ("overlap_result", "overlap_result"),
];

const FIELDS: &[Field] = &[
    Field::null(REPORTS[0].0),
    Field::null(REPORTS[1].0),
    Field::null(REPORTS[2].0),
    Field::null(REPORTS[3].0),
    Field::null(REPORTS[4].0),
    Field::null(REPORTS[5].0),
    Field::null(REPORTS[6].0),
    Field::null(REPORTS[7].0),
];

/// Turns the collected detection reports into remediation suggestions.
pub struct RemediationHandler {
    agent: AgentInvoker,
    catalog: Arc<PromptCatalog>,
    remediation_type: String,
}

impl RemediationHandler {
    pub fn new(
        agent: AgentInvoker,
        catalog: Arc<PromptCatalog>,
        remediation_type: impl Into<String>,
    ) -> Self {
        Self {
            agent,
            catalog,
            remediation_type: remediation_type.into(),
        }
    }

    fn metadata(&self) -> Map<String, Value> {
        object(json!({ "remediation_type": self.remediation_type }))
    }
}

#[async_trait::async_trait]
impl Handler for RemediationHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Remediation
    }

    async fn handle(&self, event: &Value) -> Result<HandlerResponse, HandlerError> {
        let fields = extract_fields(event, FIELDS);

        let mut params = Params::new();
        let mut present = 0usize;
        for (field, param) in REPORTS {
            let value = fields.get(field);
            if !value.is_null() {
                present += 1;
            }
            params.insert(param, render_param(value));
        }
        // Only the top level is consulted for the raw report list.
        let reports = event
            .get("detections")
            .map_or_else(|| "[]".to_string(), Value::to_string);
        params.insert("detection_reports_json", reports);
        params.insert("remediation_type", self.remediation_type.clone());

        let prompt = self.catalog.resolve(&self.remediation_type, &params)?;
        tracing::info!(
            remediation_type = %self.remediation_type,
            reports = present,
            alias_id = self.agent.alias_id(),
            prompt_chars = prompt.len(),
            "running remediation"
        );

        let exchange = ask(&self.agent, &prompt).await;
        Ok(envelope(
            exchange,
            "remediation_suggestions",
            self.metadata(),
            object(json!({
                "remediation_suggestions": [],
                "summary": "No remediation needed",
            })),
        ))
    }
}
