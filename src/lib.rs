//! Core library for driftwatch. This module wires the drift handlers to
//! their agent aliases and exposes them, together with health and metrics
//! endpoints, as an axum router.

mod config;
pub mod agent;
pub mod extract;
pub mod handlers;
pub mod prompts;
pub mod recover;
pub mod telemetry;
pub mod util;

pub use config::{AgentConfig, AppConfig};

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    DefaultBodyLimit, State,
};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use crate::agent::{AgentInvoker, AgentTransport, HttpAgentTransport};
use crate::handlers::{
    DetectionHandler, Handler, HandlerKind, Outcome, ParserHandler, RemediationHandler,
};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: i32,
    pub message: String,
    pub http_status: u16,
}

/// Invocation counters for one handler.
#[derive(Debug, Default)]
pub struct HandlerMetrics {
    pub invocations: AtomicU64,
    pub fallbacks: AtomicU64,
    pub errors: AtomicU64,
}

impl HandlerMetrics {
    pub fn snapshot(&self) -> [u64; 3] {
        [
            self.invocations.load(Ordering::Relaxed),
            self.fallbacks.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        ]
    }
}

/// Application state shared across requests.
#[derive(Clone)]
pub struct AppState {
    pub detection: Arc<dyn Handler>,
    pub remediation: Arc<dyn Handler>,
    pub parser: Arc<dyn Handler>,
    pub detection_type: String,
    pub remediation_type: String,
    /// Maximum accepted request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    pub telemetry: TelemetrySink,
    /// Indexed by [`HandlerKind::index`].
    pub handler_metrics: Arc<[HandlerMetrics; 3]>,
    pub metric_agent_failures_total: Arc<AtomicU64>,
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

impl AppState {
    /// Build the handlers from `config`, all talking through `transport`.
    pub fn new(config: AppConfig, transport: Arc<dyn AgentTransport>) -> Self {
        let AppConfig {
            agent,
            region,
            detection_type,
            remediation_type,
            prompts,
            log_file,
            rotation,
            log_stdout,
            max_request_bytes,
        } = config;

        let invoker = |alias_id: &str, prefix: &str| {
            AgentInvoker::new(transport.clone(), agent.agent_id.clone(), alias_id, prefix)
        };
        let detection = DetectionHandler::new(
            invoker(&agent.detection_alias_id, "detect"),
            Arc::new(prompts.detection),
            detection_type.clone(),
            region.clone(),
        );
        let remediation = RemediationHandler::new(
            invoker(&agent.remediation_alias_id, "remediate"),
            Arc::new(prompts.remediation),
            remediation_type.clone(),
        );
        let parser = ParserHandler::new(
            invoker(&agent.parser_alias_id, "parse"),
            Arc::new(prompts.parser),
            region,
        );

        let telemetry = TelemetrySink::from_path(log_file.as_deref(), rotation, log_stdout);

        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();

        Self {
            detection: Arc::new(detection),
            remediation: Arc::new(remediation),
            parser: Arc::new(parser),
            detection_type,
            remediation_type,
            max_request_bytes,
            telemetry,
            handler_metrics: Arc::new(Default::default()),
            metric_agent_failures_total: Arc::new(AtomicU64::new(0)),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    pub fn metrics(&self, kind: HandlerKind) -> &HandlerMetrics {
        &self.handler_metrics[kind.index()]
    }
}

/// Build state from environment variables (see [`AppConfig::from_env`]),
/// talking to the agent gateway over HTTP.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    let transport = HttpAgentTransport::new(
        config.agent.endpoint.clone(),
        config.agent.bearer_token.clone(),
    )
    .context("Failed to build agent HTTP client")?;
    tracing::info!(
        endpoint = %config.agent.endpoint,
        detection_type = %config.detection_type,
        remediation_type = %config.remediation_type,
        "agent gateway configured"
    );
    Ok(AppState::new(config, Arc::new(transport)))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/detect", post(detect_handler))
        .route("/remediate", post(remediate_handler))
        .route("/parse", post(parse_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn respond_with_error(err: ErrorResponse) -> Response {
    let status = StatusCode::from_u16(err.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err)).into_response()
}

async fn detect_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let handler = state.detection.clone();
    run_handler(&state, handler.as_ref(), payload).await
}

async fn remediate_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let handler = state.remediation.clone();
    run_handler(&state, handler.as_ref(), payload).await
}

async fn parse_handler(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let handler = state.parser.clone();
    run_handler(&state, handler.as_ref(), payload).await
}

/// Run one handler over the request event, record the invocation and answer
/// with its envelope. Envelopes, including typed `error` ones, are HTTP 200.
async fn run_handler(
    state: &AppState,
    handler: &dyn Handler,
    payload: Result<Json<Value>, JsonRejection>,
) -> Response {
    let event = match payload {
        Ok(Json(event)) => event,
        Err(rejection) => return handle_json_rejection(state, rejection),
    };
    let kind = handler.kind();
    let metrics = state.metrics(kind);
    metrics.invocations.fetch_add(1, Ordering::Relaxed);

    let start = Instant::now();
    match handler.handle(&event).await {
        Ok(response) => {
            let latency_ms = start.elapsed().as_millis() as u64;
            match response.outcome {
                Outcome::Parsed => {}
                Outcome::Fallback => {
                    metrics.fallbacks.fetch_add(1, Ordering::Relaxed);
                }
                Outcome::Rejected => {
                    metrics.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
            if response.agent_failed {
                state
                    .metric_agent_failures_total
                    .fetch_add(1, Ordering::Relaxed);
            }
            state.telemetry.emit_invocation(kind, &response, latency_ms);
            (StatusCode::OK, Json(response.envelope)).into_response()
        }
        Err(err) => {
            metrics.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(handler = kind.name(), error = %err, "handler is misconfigured");
            respond_with_error(ErrorResponse {
                error_code: 5001,
                message: err.to_string(),
                http_status: 500,
            })
        }
    }
}

fn handle_json_rejection(state: &AppState, rejection: JsonRejection) -> Response {
    match rejection {
        JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
            FailedToBufferBody::LengthLimitError(_),
        )) => {
            let message = match state.max_request_bytes {
                Some(limit) => {
                    tracing::warn!(limit, "request body exceeded configured limit");
                    format!("Request too large (body exceeded limit {} bytes)", limit)
                }
                None => "Request too large".to_string(),
            };
            respond_with_error(ErrorResponse {
                error_code: 4001,
                message,
                http_status: 413,
            })
        }
        JsonRejection::BytesRejection(bytes) => bytes.into_response(),
        other => respond_with_error(ErrorResponse {
            error_code: 4000,
            message: format!("Invalid JSON event: {}", other.body_text()),
            http_status: 400,
        }),
    }
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "detectionType": state.detection_type,
        "remediationType": state.remediation_type,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Per-handler counter families, in [`HandlerMetrics::snapshot`] order.
const HANDLER_FAMILIES: [(&str, &str); 3] = [
    (
        "driftwatch_invocations_total",
        "Handler invocations with a well-formed event",
    ),
    (
        "driftwatch_fallbacks_total",
        "Invocations answered with the fallback envelope",
    ),
    (
        "driftwatch_errors_total",
        "Invocations answered with an error envelope or response",
    ),
];

fn write_family(buf: &mut String, name: &str, kind: &str, help: &str) {
    writeln!(buf, "# HELP {} {}\n# TYPE {} {}", name, help, name, kind).ok();
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut buf = String::new();

    for (idx, (name, help)) in HANDLER_FAMILIES.iter().enumerate() {
        write_family(&mut buf, name, "counter", help);
        for kind in HandlerKind::ALL {
            let value = state.metrics(kind).snapshot()[idx];
            writeln!(buf, "{}{{handler=\"{}\"}} {}", name, kind.name(), value).ok();
        }
    }

    write_family(
        &mut buf,
        "driftwatch_agent_failures_total",
        "counter",
        "Agent invocations that ended in a transport or stream failure",
    );
    writeln!(
        buf,
        "driftwatch_agent_failures_total {}",
        state.metric_agent_failures_total.load(Ordering::Relaxed)
    )
    .ok();

    write_family(
        &mut buf,
        "driftwatch_telemetry_lines_total",
        "counter",
        "Invocation JSON lines written",
    );
    writeln!(
        buf,
        "driftwatch_telemetry_lines_total {}",
        state.telemetry.lines_total()
    )
    .ok();
    write_family(
        &mut buf,
        "driftwatch_telemetry_write_errors_total",
        "counter",
        "Invocation JSON line write failures",
    );
    writeln!(
        buf,
        "driftwatch_telemetry_write_errors_total {}",
        state.telemetry.write_errors_total()
    )
    .ok();

    write_family(&mut buf, "driftwatch_build_info", "gauge", "Build information");
    writeln!(
        buf,
        "driftwatch_build_info{{version=\"{}\",schemaVersion=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION"),
        telemetry::SCHEMA_VERSION
    )
    .ok();

    write_family(
        &mut buf,
        "driftwatch_process_start_time_seconds",
        "gauge",
        "Process start time (Unix epoch seconds)",
    );
    writeln!(
        buf,
        "driftwatch_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    write_family(
        &mut buf,
        "driftwatch_process_uptime_seconds",
        "gauge",
        "Process uptime seconds",
    );
    writeln!(
        buf,
        "driftwatch_process_uptime_seconds {}",
        state.process_start_instant.elapsed().as_secs_f64()
    )
    .ok();

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
