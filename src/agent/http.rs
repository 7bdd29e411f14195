use futures::StreamExt;
use memchr::memchr;
use serde_json::Value;

use super::{AgentError, AgentTransport, FragmentSink, InvokeRequest};

const ERROR_BODY_CHARS: usize = 300;

/// Talks to an agent gateway over HTTP.
///
/// The request is `POST {endpoint}/agents/{agent}/agentAliases/{alias}/sessions/{session}/text`
/// with body `{"inputText": ...}`. The response is newline-delimited JSON
/// completion events: `{"chunk": {"bytes": "..."}}` carries answer text, an
/// event keyed `*Exception` aborts the stream, anything else (traces,
/// metadata) is skipped. No timeout or retry is layered on top of the
/// gateway's own.
pub struct HttpAgentTransport {
    endpoint: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl HttpAgentTransport {
    pub fn new(endpoint: impl Into<String>, bearer_token: Option<String>) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            bearer_token,
            client,
        })
    }

    fn url(&self, request: &InvokeRequest<'_>) -> String {
        format!(
            "{}/agents/{}/agentAliases/{}/sessions/{}/text",
            self.endpoint.trim_end_matches('/'),
            request.agent_id,
            request.alias_id,
            request.session_id
        )
    }
}

#[async_trait::async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn invoke(
        &self,
        request: &InvokeRequest<'_>,
        sink: &mut FragmentSink,
    ) -> Result<(), AgentError> {
        let mut rb = self
            .client
            .post(self.url(request))
            .json(&serde_json::json!({ "inputText": request.input_text }));
        if let Some(tok) = &self.bearer_token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let mut stream = resp.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);
            while let Some(pos) = memchr(b'\n', &pending) {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                handle_event_line(&line, sink)?;
            }
        }
        handle_event_line(&pending, sink)
    }
}

fn handle_event_line(line: &[u8], sink: &mut FragmentSink) -> Result<(), AgentError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| AgentError::Protocol(format!("event is not UTF-8: {}", e)))?
        .trim();
    if text.is_empty() {
        return Ok(());
    }
    let event: Value =
        serde_json::from_str(text).map_err(|e| AgentError::Protocol(e.to_string()))?;

    if let Some(bytes) = event.pointer("/chunk/bytes").and_then(Value::as_str) {
        sink.push(bytes.as_bytes());
        return Ok(());
    }
    let failure = event
        .as_object()
        .and_then(|map| map.iter().find(|(kind, _)| kind.ends_with("Exception")));
    if let Some((kind, detail)) = failure {
        return Err(AgentError::Stream {
            kind: kind.clone(),
            message: detail
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    tracing::trace!(event = %text, "skipping non-chunk completion event");
    Ok(())
}
