#[path = "common/mod.rs"]
mod common;

use common::{get_text, post_json, StaticTransport};
use driftwatch::{app, AppConfig, AppState};

#[tokio::test]
async fn metrics_count_outcomes_per_handler() {
    let state = AppState::new(AppConfig::default(), StaticTransport::answering(&["no JSON in this answer"]));
    let router = app(state);

    for _ in 0..2 {
        post_json(
            router.clone(),
            "/parse",
            r#"{"type": "cicd_log", "query": "Refreshing state..."}"#,
        )
        .await;
    }
    post_json(router.clone(), "/detect", r#"{"query": "no repository here"}"#).await;

    let (status, text) = get_text(router, "/metrics").await;
    assert!(status.is_success());
    assert!(text.contains("driftwatch_invocations_total{handler=\"parser\"} 2"));
    assert!(text.contains("driftwatch_fallbacks_total{handler=\"parser\"} 2"));
    assert!(text.contains("driftwatch_invocations_total{handler=\"detection\"} 1"));
    assert!(text.contains("driftwatch_errors_total{handler=\"detection\"} 1"));
    assert!(text.contains("driftwatch_invocations_total{handler=\"remediation\"} 0"));
    assert!(text.contains("driftwatch_agent_failures_total 0"));
    assert!(text.contains("driftwatch_telemetry_lines_total 0"));
    assert!(text.contains("driftwatch_build_info{version=\""));
    assert!(text.contains("driftwatch_process_uptime_seconds"));
    assert_eq!(
        text.matches("# HELP driftwatch_invocations_total").count(),
        1,
        "HELP line should appear once per family"
    );
}
