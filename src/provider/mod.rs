//! Model provider abstraction
//!
//! Every vendor protocol is normalized into one event discipline before the
//! orchestrator sees it: text deltas, tool-call lifecycle events with
//! fragment reassembly, a single terminal `ResponseCompleted`, and traces
//! for everything diagnostic. Adapters never yield errors — transport and
//! parse failures become events in the stream.

pub mod anthropic;
pub mod openai;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::tool::{ToolDescriptor, ToolOutcome};

/// One message in the conversation the orchestrator maintains.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        call_id: String,
        tool_name: String,
        result: ToolOutcome,
    },
}

/// An assistant's request to invoke a tool. `args_json` is always a
/// complete JSON document; partial fragments live only inside adapters.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args_json: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Error,
    ParseError,
    Ignored,
}

/// The normalized event stream variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelEvent {
    TextDelta {
        text: String,
    },
    ToolCallStarted {
        call_id: String,
        tool_name: String,
    },
    ToolCallArgsDelta {
        call_id: String,
        fragment: String,
    },
    ToolCallReady {
        call_id: String,
        tool_name: String,
        args_json: String,
    },
    ResponseCompleted {
        stop_reason: String,
        usage: Option<Usage>,
    },
    Trace {
        trace: TraceKind,
        raw: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Stop reasons that mean "the assistant finished its turn".
pub fn is_terminal_stop_reason(reason: &str) -> bool {
    matches!(reason, "end_turn" | "stop")
}

/// A fully assembled request for one model turn.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

pub type EventStream = BoxStream<'static, ModelEvent>;

/// A provider adapter. The returned stream is finite, not restartable, and
/// never an error: failures are embedded as trace events followed by a
/// terminal `ResponseCompleted("error")`.
#[async_trait]
pub trait ModelProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> EventStream;
}

/// Serialize a tool result for the model: data when present, then stdout,
/// then a bare OK; failures send stderr or the first diagnostic.
pub fn tool_result_content(result: &ToolOutcome) -> String {
    if result.ok {
        if let Some(data) = &result.data {
            return serde_json::to_string(data).unwrap_or_else(|_| "OK".to_string());
        }
        if let Some(stdout) = &result.stdout {
            if !stdout.is_empty() {
                return stdout.clone();
            }
        }
        "OK".to_string()
    } else {
        if let Some(stderr) = &result.stderr {
            if !stderr.trim().is_empty() {
                return stderr.clone();
            }
        }
        result
            .first_diagnostic()
            .unwrap_or("tool failed")
            .to_string()
    }
}

/// Parse a tool's schema text defensively; a bad schema must not kill the
/// whole turn.
pub fn parse_schema(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({}))
}

/// Reassembles SSE lines from raw byte chunks, carrying partial lines
/// across chunk boundaries.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: String,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            lines.push(line);
        }
        lines
    }
}

/// Extract the payload of a `data:` SSE line.
pub(crate) fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

/// Provider-default models, used when neither the request nor the config
/// file names one.
pub fn default_model(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("gpt-4o"),
        "anthropic" => Some("claude-sonnet-4-20250514"),
        _ => None,
    }
}

pub fn known_provider(provider: &str) -> bool {
    matches!(provider, "openai" | "anthropic" | "openai-compatible")
}

/// Construct the adapter for a provider name. A missing API key for a
/// provider that requires one is an error here, which makes it fatal at
/// startup.
pub fn build_provider(
    provider: &str,
    endpoint: Option<&str>,
) -> Result<Arc<dyn ModelProvider>> {
    match provider {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is not set"))?;
            let base_url = std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| openai::OPENAI_API_BASE.to_string());
            Ok(Arc::new(openai::OpenAiProvider::with_base_url(
                api_key, base_url, "openai",
            )))
        }
        "anthropic" => {
            let api_key = std::env::var("ANTHROPIC_API_KEY")
                .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY is not set"))?;
            Ok(Arc::new(anthropic::AnthropicProvider::new(api_key)))
        }
        "openai-compatible" => {
            let endpoint = endpoint.ok_or_else(|| {
                anyhow::anyhow!("openai-compatible provider requires an explicit endpoint")
            })?;
            // Compatible endpoints often run without authentication; the key
            // is attached only when present.
            let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
            Ok(Arc::new(openai::OpenAiProvider::with_base_url(
                api_key,
                endpoint.to_string(),
                "openai-compatible",
            )))
        }
        other => anyhow::bail!("unknown provider: {other}"),
    }
}
