//! Anthropic provider adapter (Messages API, streaming)
//!
//! Reference: https://docs.anthropic.com/en/api/messages-streaming
//!
//! The SSE event sequence (`message_start`, `content_block_start`,
//! `content_block_delta`, `content_block_stop`, `message_delta`,
//! `message_stop`) is folded into the normalized event model. Tool-use
//! argument fragments arrive as `input_json_delta` pieces and are buffered
//! per content block until `content_block_stop` declares them complete.

use std::collections::HashMap;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{
    parse_schema, sse_data, tool_result_content, ChatMessage, EventStream, ModelEvent,
    ModelProvider, ModelRequest, SseLineBuffer, TraceKind, Usage,
};

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_key", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, ANTHROPIC_API_BASE.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("failed to build http client");
        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Convert the conversation into the Messages API shape. Tool results
    /// become `tool_result` blocks inside user messages; consecutive results
    /// are merged into one user message.
    fn convert_messages(messages: &[ChatMessage]) -> Vec<Value> {
        let mut api_messages: Vec<Value> = Vec::new();

        for message in messages {
            match message {
                ChatMessage::User { content } => {
                    api_messages.push(json!({
                        "role": "user",
                        "content": content,
                    }));
                }
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut parts: Vec<Value> = Vec::new();
                    if let Some(text) = content {
                        if !text.is_empty() {
                            parts.push(json!({"type": "text", "text": text}));
                        }
                    }
                    for call in tool_calls {
                        let input: Value = serde_json::from_str(&call.args_json)
                            .unwrap_or_else(|_| json!({"raw": call.args_json}));
                        parts.push(json!({
                            "type": "tool_use",
                            "id": call.call_id,
                            "name": call.name,
                            "input": input,
                        }));
                    }
                    if parts.is_empty() {
                        parts.push(json!({"type": "text", "text": " "}));
                    }
                    api_messages.push(json!({
                        "role": "assistant",
                        "content": parts,
                    }));
                }
                ChatMessage::Tool {
                    call_id, result, ..
                } => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": tool_result_content(result),
                        "is_error": !result.ok,
                    });
                    let mut merged = false;
                    if let Some(last) = api_messages.last_mut() {
                        if last["role"] == "user" {
                            if let Some(content) = last["content"].as_array_mut() {
                                content.push(block.clone());
                                merged = true;
                            }
                        }
                    }
                    if !merged {
                        api_messages.push(json!({
                            "role": "user",
                            "content": [block],
                        }));
                    }
                }
            }
        }

        api_messages
    }

    fn build_body(request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": Self::convert_messages(&request.messages),
            "stream": true,
        });
        if let Some(system) = &request.system_prompt {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": parse_schema(&t.input_schema),
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

fn map_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "end_turn".to_string(),
        "stop_sequence" => "stop".to_string(),
        other => other.to_string(),
    }
}

struct ToolBlock {
    call_id: String,
    tool_name: String,
    args: String,
}

/// Per-turn state machine over the decoded SSE payloads.
#[derive(Default)]
struct AnthropicTurn {
    blocks: HashMap<u64, ToolBlock>,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    saw_usage: bool,
    completed: bool,
}

impl AnthropicTurn {
    fn usage(&self) -> Option<Usage> {
        self.saw_usage.then_some(Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }

    fn handle_data(&mut self, data: &str) -> Vec<ModelEvent> {
        let payload: Value = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(_) => {
                return vec![ModelEvent::Trace {
                    trace: TraceKind::ParseError,
                    raw: data.to_string(),
                }];
            }
        };

        match payload["type"].as_str() {
            Some("ping") => Vec::new(),
            Some("message_start") => {
                if let Some(tokens) = payload["message"]["usage"]["input_tokens"].as_u64() {
                    self.input_tokens = tokens;
                    self.saw_usage = true;
                }
                Vec::new()
            }
            Some("content_block_start") => {
                let block = &payload["content_block"];
                if block["type"].as_str() == Some("tool_use") {
                    let index = payload["index"].as_u64().unwrap_or(0);
                    let call_id = block["id"].as_str().unwrap_or_default().to_string();
                    let tool_name = block["name"].as_str().unwrap_or_default().to_string();
                    self.blocks.insert(
                        index,
                        ToolBlock {
                            call_id: call_id.clone(),
                            tool_name: tool_name.clone(),
                            args: String::new(),
                        },
                    );
                    vec![ModelEvent::ToolCallStarted { call_id, tool_name }]
                } else {
                    Vec::new()
                }
            }
            Some("content_block_delta") => {
                let delta = &payload["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        vec![ModelEvent::TextDelta {
                            text: text.to_string(),
                        }]
                    }
                    Some("input_json_delta") => {
                        let index = payload["index"].as_u64().unwrap_or(0);
                        let fragment = delta["partial_json"].as_str().unwrap_or_default();
                        if let Some(block) = self.blocks.get_mut(&index) {
                            block.args.push_str(fragment);
                            vec![ModelEvent::ToolCallArgsDelta {
                                call_id: block.call_id.clone(),
                                fragment: fragment.to_string(),
                            }]
                        } else {
                            Vec::new()
                        }
                    }
                    _ => Vec::new(),
                }
            }
            Some("content_block_stop") => {
                let index = payload["index"].as_u64().unwrap_or(0);
                match self.blocks.remove(&index) {
                    Some(block) => vec![ready_event(block)],
                    None => Vec::new(),
                }
            }
            Some("message_delta") => {
                if let Some(reason) = payload["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
                if let Some(tokens) = payload["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = tokens;
                    self.saw_usage = true;
                }
                Vec::new()
            }
            Some("message_stop") => self.finish(None),
            Some("error") => {
                let mut events = vec![ModelEvent::Trace {
                    trace: TraceKind::Error,
                    raw: payload.to_string(),
                }];
                events.extend(self.finish(Some("error")));
                events
            }
            // Unknown event types are ignorable per the streaming contract.
            _ => Vec::new(),
        }
    }

    /// Emit whatever is still pending plus the single terminal event. Safe
    /// to call more than once; later calls are no-ops.
    fn finish(&mut self, fallback_reason: Option<&str>) -> Vec<ModelEvent> {
        if self.completed {
            return Vec::new();
        }
        self.completed = true;

        let mut events: Vec<ModelEvent> = Vec::new();
        let mut indices: Vec<u64> = self.blocks.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            if let Some(block) = self.blocks.remove(&index) {
                events.push(ready_event(block));
            }
        }

        let stop_reason = self
            .stop_reason
            .take()
            .or_else(|| fallback_reason.map(str::to_string))
            .unwrap_or_else(|| "end_turn".to_string());
        events.push(ModelEvent::ResponseCompleted {
            stop_reason,
            usage: self.usage(),
        });
        events
    }
}

fn ready_event(block: ToolBlock) -> ModelEvent {
    let args_json = if block.args.trim().is_empty() {
        "{}".to_string()
    } else {
        block.args
    };
    ModelEvent::ToolCallReady {
        call_id: block.call_id,
        tool_name: block.tool_name,
        args_json,
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> EventStream {
        let body = Self::build_body(&request);
        let url = format!("{}/v1/messages", self.base_url);
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        Box::pin(stream! {
            let request = client
                .post(&url)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body);

            // Cancellation must reach the request itself, not just the byte
            // stream after headers arrive.
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    yield ModelEvent::ResponseCompleted { stop_reason: "cancelled".to_string(), usage: None };
                    return;
                }
                response = request.send() => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    yield ModelEvent::Trace { trace: TraceKind::Error, raw: err.to_string() };
                    yield ModelEvent::ResponseCompleted { stop_reason: "error".to_string(), usage: None };
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let raw = response.text().await.unwrap_or_default();
                yield ModelEvent::Trace {
                    trace: TraceKind::Error,
                    raw: format!("{status}: {raw}"),
                };
                yield ModelEvent::ResponseCompleted { stop_reason: "error".to_string(), usage: None };
                return;
            }

            let mut turn = AnthropicTurn::default();
            let mut lines = SseLineBuffer::default();
            let mut bytes = response.bytes_stream();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        for event in turn.finish(Some("cancelled")) {
                            yield event;
                        }
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };

                match chunk {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&chunk) {
                            let Some(data) = sse_data(&line) else { continue };
                            for event in turn.handle_data(data) {
                                yield event;
                            }
                            if turn.completed {
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        yield ModelEvent::Trace { trace: TraceKind::Error, raw: err.to_string() };
                        for event in turn.finish(Some("error")) {
                            yield event;
                        }
                        return;
                    }
                    None => {
                        for event in turn.finish(Some("error")) {
                            yield event;
                        }
                        return;
                    }
                }
            }
        })
    }
}
