#[path = "common/mod.rs"]
mod common;

use common::{post_json, StaticTransport};
use driftwatch::telemetry::RotationConfig;
use driftwatch::{app, AppConfig, AppState};
use std::fs;

fn config_with_log(path: &std::path::Path) -> AppConfig {
    AppConfig {
        log_file: Some(path.to_string_lossy().to_string()),
        ..AppConfig::default()
    }
}

#[tokio::test]
async fn one_line_per_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("invocations.jsonl");
    let transport = StaticTransport::answering(&[r#"{"drifted_resources": ["aws_instance.web"]}"#]);
    let router = app(AppState::new(config_with_log(&path), transport));

    post_json(router.clone(), "/detect", r#"{"query": "https://github.com/acme/infra"}"#).await;
    post_json(router.clone(), "/detect", r#"{"query": "nothing"}"#).await;
    post_json(router, "/parse", r#"{"type": "cicd_log", "query": "log"}"#).await;

    let content = fs::read_to_string(&path).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["handler"], "detection");
    assert_eq!(lines[0]["outcome"], "parsed");
    assert_eq!(lines[0]["shape"], "object");
    assert_eq!(lines[1]["outcome"], "error");
    assert_eq!(lines[1]["agentChars"], 0);
    assert_eq!(lines[2]["handler"], "parser");
    for line in &lines {
        assert_eq!(line["schemaVersion"].as_i64(), Some(1));
        assert!(line["ts"].is_string());
        assert!(line["latencyMs"].is_u64());
    }
}

#[tokio::test]
async fn rotation_applies_to_invocation_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("invocations.jsonl");
    let config = AppConfig {
        rotation: RotationConfig {
            max_bytes: Some(64),
            keep: 2,
            compress: false,
        },
        ..config_with_log(&path)
    };
    let router = app(AppState::new(config, StaticTransport::answering(&["{}"])));
    for _ in 0..3 {
        post_json(router.clone(), "/parse", r#"{"type": "cicd_log", "query": "log"}"#).await;
    }
    let backup = dir.path().join("invocations.jsonl.1");
    assert!(backup.exists());
    assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
}

#[tokio::test]
async fn concurrent_invocations_write_every_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stress.jsonl");
    let transport = StaticTransport::answering(&["[1, 2, 3]"]);
    let state = AppState::new(config_with_log(&path), transport.clone());
    let router = app(state);

    let total = 100usize;
    let mut tasks = Vec::new();
    for i in 0..total {
        let router = router.clone();
        let body = format!(r#"{{"type": "cicd_log", "query": "run {}"}}"#, i);
        tasks.push(tokio::spawn(async move {
            post_json(router, "/parse", body).await
        }));
    }
    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert!(status.is_success());
        assert_eq!(body["resources"], serde_json::json!([1, 2, 3]));
    }

    let content = fs::read_to_string(&path).unwrap();
    assert_eq!(content.lines().count(), total);

    let mut sessions: Vec<String> = transport.calls().into_iter().map(|(s, _)| s).collect();
    sessions.sort();
    sessions.dedup();
    assert_eq!(sessions.len(), total);
}
