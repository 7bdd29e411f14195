#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use driftwatch::agent::{AgentError, AgentTransport, FragmentSink, InvokeRequest};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn set_many(&mut self, entries: &[(&str, &str)]) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// In-memory agent: streams the same fragments for every call, optionally
/// failing afterwards, and remembers each request.
pub struct StaticTransport {
    fragments: Vec<String>,
    fail: bool,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl StaticTransport {
    pub fn answering(fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fragments: Vec::new(),
            fail: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// `(session id, prompt)` per call.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AgentTransport for StaticTransport {
    async fn invoke(
        &self,
        request: &InvokeRequest<'_>,
        sink: &mut FragmentSink,
    ) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push((
            request.session_id.to_string(),
            request.input_text.to_string(),
        ));
        for fragment in &self.fragments {
            sink.push(fragment.as_bytes());
        }
        if self.fail {
            return Err(AgentError::Stream {
                kind: "dependencyFailedException".into(),
                message: "knowledge base unavailable".into(),
            });
        }
        Ok(())
    }
}

/// Send `body` to `uri` through the router and decode the JSON answer.
pub async fn post_json(app: Router, uri: &str, body: impl Into<Body>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

pub async fn get_text(app: Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// A completion event carrying answer text.
pub fn chunk(text: &str) -> Value {
    json!({ "chunk": { "bytes": text } })
}

#[derive(Clone, Debug)]
pub enum GatewayReply {
    Events(Vec<Value>),
    Status(u16, String),
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub agent_id: String,
    pub alias_id: String,
    pub session_id: String,
    pub input_text: String,
    pub authorization: Option<String>,
}

/// Mock agent gateway speaking the NDJSON completion protocol. Replies are
/// looked up by alias id; unknown aliases get an empty stream.
#[derive(Clone, Default)]
pub struct MockGateway {
    replies: Arc<HashMap<String, GatewayReply>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl MockGateway {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

async fn converse(
    State(gateway): State<MockGateway>,
    Path((agent_id, alias_id, session_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    gateway.calls.lock().unwrap().push(RecordedCall {
        agent_id,
        alias_id: alias_id.clone(),
        session_id,
        input_text: body["inputText"].as_str().unwrap_or_default().to_string(),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
    match gateway.replies.get(&alias_id) {
        Some(GatewayReply::Status(code, text)) => {
            (StatusCode::from_u16(*code).unwrap(), text.clone()).into_response()
        }
        Some(GatewayReply::Events(events)) => {
            let body: String = events.iter().map(|e| format!("{}\n", e)).collect();
            ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
        }
        None => StatusCode::OK.into_response(),
    }
}

pub async fn spawn_gateway(
    replies: Vec<(&str, GatewayReply)>,
) -> (String, MockGateway, JoinHandle<()>) {
    let gateway = MockGateway {
        replies: Arc::new(
            replies
                .into_iter()
                .map(|(alias, reply)| (alias.to_string(), reply))
                .collect(),
        ),
        calls: Arc::default(),
    };
    let app = Router::new()
        .route(
            "/agents/:agent/agentAliases/:alias/sessions/:session/text",
            post(converse),
        )
        .with_state(gateway.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), gateway, handle)
}
