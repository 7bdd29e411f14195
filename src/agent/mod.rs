//! Invocation of the external drift-analysis agent.
//!
//! Every call opens exactly one request/response exchange with a fresh
//! session id and accumulates the streamed answer into a single buffer.
//! Fragments that are re-delivered byte-for-byte within one stream are
//! dropped. Transport failures never reach the caller: whatever arrived
//! before the failure is returned, which is usually nothing, and the
//! handlers treat an empty answer as "no usable output".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ahash::{AHashSet, RandomState};
use thiserror::Error;

pub mod http;

pub use self::http::HttpAgentTransport;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("agent stream reported {kind}: {message}")]
    Stream { kind: String, message: String },
    #[error("malformed completion event: {0}")]
    Protocol(String),
}

/// One exchange with the agent.
#[derive(Debug, Clone, Copy)]
pub struct InvokeRequest<'a> {
    pub agent_id: &'a str,
    pub alias_id: &'a str,
    pub session_id: &'a str,
    pub input_text: &'a str,
}

/// Accumulates streamed fragments, keeping the first copy of each distinct
/// fragment in arrival order.
#[derive(Debug, Default)]
pub struct FragmentSink {
    seen: AHashSet<Vec<u8>>,
    buffer: Vec<u8>,
    duplicates: usize,
}

impl FragmentSink {
    /// Append `fragment` unless an identical one was already accepted.
    /// Returns whether it was appended.
    pub fn push(&mut self, fragment: &[u8]) -> bool {
        if self.seen.contains(fragment) {
            self.duplicates += 1;
            return false;
        }
        self.seen.insert(fragment.to_vec());
        self.buffer.extend_from_slice(fragment);
        true
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    /// Decode the accumulated bytes. Decoding happens once, at the end, so a
    /// character split across two fragments is reassembled.
    pub fn into_text(self) -> String {
        match String::from_utf8(self.buffer) {
            Ok(text) => text,
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }
}

/// A channel to the agent. Implementations push every received fragment into
/// `sink` and return an error on transport or protocol failure, possibly
/// after some fragments were already pushed.
#[async_trait::async_trait]
pub trait AgentTransport: Send + Sync {
    async fn invoke(
        &self,
        request: &InvokeRequest<'_>,
        sink: &mut FragmentSink,
    ) -> Result<(), AgentError>;
}

/// Generates session ids that stay unique under rapid sequential calls:
/// `<prefix>-<unix millis>-<sequence>-<random token>`.
#[derive(Debug)]
pub struct SessionIdGenerator {
    prefix: String,
    sequence: AtomicU64,
    seed: RandomState,
}

impl SessionIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            sequence: AtomicU64::new(0),
            seed: RandomState::new(),
        }
    }

    pub fn next_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let millis = chrono::Utc::now().timestamp_millis();
        let token = self.seed.hash_one((millis, seq)) as u32;
        format!("{}-{}-{}-{:08x}", self.prefix, millis, seq, token)
    }
}

/// Result of one agent call.
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub session_id: String,
    pub text: String,
    /// True when the transport reported a failure. `text` then holds
    /// whatever arrived before it.
    pub failed: bool,
}

/// Binds a transport to one `(agent id, alias id)` pair.
#[derive(Clone)]
pub struct AgentInvoker {
    transport: Arc<dyn AgentTransport>,
    agent_id: String,
    alias_id: String,
    sessions: Arc<SessionIdGenerator>,
}

impl AgentInvoker {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        agent_id: impl Into<String>,
        alias_id: impl Into<String>,
        session_prefix: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            agent_id: agent_id.into(),
            alias_id: alias_id.into(),
            sessions: Arc::new(SessionIdGenerator::new(session_prefix)),
        }
    }

    pub fn alias_id(&self) -> &str {
        &self.alias_id
    }

    /// Send `prompt` and return the deduplicated answer text.
    pub async fn invoke(&self, prompt: &str) -> AgentReply {
        let session_id = self.sessions.next_id();
        let request = InvokeRequest {
            agent_id: &self.agent_id,
            alias_id: &self.alias_id,
            session_id: &session_id,
            input_text: prompt,
        };
        tracing::debug!(session_id = %session_id, alias_id = %self.alias_id, prompt_chars = prompt.len(), "invoking agent");
        let start = Instant::now();
        let mut sink = FragmentSink::default();
        let failed = match self.transport.invoke(&request, &mut sink).await {
            Ok(()) => {
                tracing::debug!(
                    session_id = %session_id,
                    bytes = sink.len(),
                    duplicates = sink.duplicates(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "agent stream complete"
                );
                false
            }
            Err(err) => {
                tracing::error!(
                    session_id = %session_id,
                    error = %err,
                    received_bytes = sink.len(),
                    "agent invocation failed"
                );
                true
            }
        };
        AgentReply {
            session_id,
            text: sink.into_text(),
            failed,
        }
    }
}
