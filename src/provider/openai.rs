//! OpenAI chat-completions adapter (streaming)
//!
//! Also serves any OpenAI-compatible endpoint through a custom base URL;
//! the wire format is the chat-completions SSE stream either way. Tool-call
//! argument fragments arrive indexed and are buffered per index until the
//! vendor signals the turn is over.

use std::collections::BTreeMap;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    parse_schema, sse_data, tool_result_content, ChatMessage, EventStream, ModelEvent,
    ModelProvider, ModelRequest, SseLineBuffer, TraceKind, Usage,
};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    provider_name: String,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("provider_name", &self.provider_name)
            .field("base_url", &self.base_url)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, OPENAI_API_BASE.to_string(), "openai")
    }

    /// Custom base URL, reused for openai-compatible endpoints.
    pub fn with_base_url(api_key: String, base_url: String, provider_name: &str) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .expect("failed to build http client");
        Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            provider_name: provider_name.to_string(),
        }
    }
}

// ============== Request types ==============

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

// ============== Streaming response types ==============

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: u64,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamToolFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamToolFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn convert_messages(request: &ModelRequest) -> Vec<WireMessage> {
    let mut wire = Vec::new();

    if let Some(system) = &request.system_prompt {
        wire.push(WireMessage {
            role: "system",
            content: Some(system.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in &request.messages {
        match message {
            ChatMessage::User { content } => wire.push(WireMessage {
                role: "user",
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: None,
            }),
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                let calls: Vec<WireToolCall> = tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.call_id.clone(),
                        r#type: "function",
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.args_json.clone(),
                        },
                    })
                    .collect();
                wire.push(WireMessage {
                    role: "assistant",
                    // Some endpoints insist on a content field whenever
                    // tool_calls are present.
                    content: content
                        .clone()
                        .or_else(|| (!calls.is_empty()).then(String::new)),
                    tool_calls: (!calls.is_empty()).then_some(calls),
                    tool_call_id: None,
                });
            }
            ChatMessage::Tool {
                call_id, result, ..
            } => wire.push(WireMessage {
                role: "tool",
                content: Some(tool_result_content(result)),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            }),
        }
    }

    wire
}

fn convert_tools(request: &ModelRequest) -> Option<Vec<WireTool>> {
    if request.tools.is_empty() {
        return None;
    }
    Some(
        request
            .tools
            .iter()
            .map(|t| WireTool {
                r#type: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: parse_schema(&t.input_schema),
                },
            })
            .collect(),
    )
}

#[derive(Default)]
struct PendingCall {
    id: Option<String>,
    name: Option<String>,
    args: String,
    announced: bool,
}

impl PendingCall {
    fn call_id(&self, index: u64) -> String {
        self.id.clone().unwrap_or_else(|| format!("call_{index}"))
    }
}

/// Per-turn state machine over decoded `data:` payloads.
#[derive(Default)]
struct OpenAiTurn {
    calls: BTreeMap<u64, PendingCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    completed: bool,
}

impl OpenAiTurn {
    fn handle_data(&mut self, data: &str) -> Vec<ModelEvent> {
        if data.trim() == "[DONE]" {
            return self.finish(None);
        }

        let payload: StreamResponse = match serde_json::from_str(data) {
            Ok(payload) => payload,
            Err(_) => {
                return vec![ModelEvent::Trace {
                    trace: TraceKind::ParseError,
                    raw: data.to_string(),
                }];
            }
        };

        if let Some(usage) = payload.usage {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            });
        }

        let mut events = Vec::new();
        if let Some(choice) = payload.choices.into_iter().next() {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    events.push(ModelEvent::TextDelta { text });
                }
            }

            for delta in choice.delta.tool_calls.unwrap_or_default() {
                let index = delta.index;
                let call = self.calls.entry(index).or_default();
                if let Some(id) = delta.id {
                    call.id.get_or_insert(id);
                }
                if let Some(function) = delta.function {
                    if let Some(name) = function.name {
                        call.name.get_or_insert(name);
                    }
                    // Announce once the identity is settled; fragments that
                    // arrive before that are buffered silently so the delta
                    // events always carry the call's final id.
                    if !call.announced && call.id.is_some() && call.name.is_some() {
                        call.announced = true;
                        events.push(ModelEvent::ToolCallStarted {
                            call_id: call.call_id(index),
                            tool_name: call.name.clone().unwrap_or_default(),
                        });
                    }
                    if let Some(fragment) = function.arguments {
                        if !fragment.is_empty() {
                            call.args.push_str(&fragment);
                            if call.announced {
                                events.push(ModelEvent::ToolCallArgsDelta {
                                    call_id: call.call_id(index),
                                    fragment,
                                });
                            }
                        }
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        events
    }

    /// `[DONE]` or stream end: flush the buffered calls in index order,
    /// then the single terminal event.
    fn finish(&mut self, fallback_reason: Option<&str>) -> Vec<ModelEvent> {
        if self.completed {
            return Vec::new();
        }
        self.completed = true;

        let mut events = Vec::new();
        let calls = std::mem::take(&mut self.calls);
        for (index, call) in calls {
            // Every ready event needs its started event, even when the
            // vendor never named the call until the final chunk.
            if !call.announced {
                events.push(ModelEvent::ToolCallStarted {
                    call_id: call.call_id(index),
                    tool_name: call.name.clone().unwrap_or_default(),
                });
            }
            let args_json = if call.args.trim().is_empty() {
                "{}".to_string()
            } else {
                call.args.clone()
            };
            events.push(ModelEvent::ToolCallReady {
                call_id: call.call_id(index),
                tool_name: call.name.clone().unwrap_or_default(),
                args_json,
            });
        }

        let stop_reason = self
            .finish_reason
            .take()
            .or_else(|| fallback_reason.map(str::to_string))
            .unwrap_or_else(|| "stop".to_string());
        events.push(ModelEvent::ResponseCompleted {
            stop_reason,
            usage: self.usage.take(),
        });
        events
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> EventStream {
        let wire_request = WireRequest {
            model: request.model.clone(),
            messages: convert_messages(&request),
            tools: convert_tools(&request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: true,
        };
        let url = format!("{}/chat/completions", self.base_url);
        let client = self.client.clone();
        let api_key = self.api_key.clone();

        Box::pin(stream! {
            let mut builder = client
                .post(&url)
                .header("Content-Type", "application/json");
            if !api_key.is_empty() {
                builder = builder.header("Authorization", format!("Bearer {api_key}"));
            }

            // Cancellation must reach the request itself, not just the byte
            // stream after headers arrive.
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    yield ModelEvent::ResponseCompleted { stop_reason: "cancelled".to_string(), usage: None };
                    return;
                }
                response = builder.json(&wire_request).send() => response,
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

            let mut turn = OpenAiTurn::default();
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
                        for event in turn.finish(Some("stop")) {
                            yield event;
                        }
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ToolCallRequest;
    use crate::tool::ToolOutcome;
    use serde_json::json;

    #[test]
    fn indexed_tool_call_deltas_are_reassembled() {
        let mut turn = OpenAiTurn::default();

        turn.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"SearchText","arguments":""}}]}}]}"#,
        );
        turn.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"pattern\":"}}]}}]}"#,
        );
        turn.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"todo\"}"}}]}}]}"#,
        );
        turn.handle_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);
        let events = turn.handle_data("[DONE]");

        assert_eq!(events.len(), 2);
        match &events[0] {
            ModelEvent::ToolCallReady {
                call_id,
                tool_name,
                args_json,
            } => {
                assert_eq!(call_id, "call_a");
                assert_eq!(tool_name, "SearchText");
                let parsed: Value = serde_json::from_str(args_json).unwrap();
                assert_eq!(parsed["pattern"], "todo");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            events[1],
            ModelEvent::ResponseCompleted {
                stop_reason: "tool_calls".to_string(),
                usage: None
            }
        );
    }

    #[test]
    fn parallel_calls_flush_in_index_order() {
        let mut turn = OpenAiTurn::default();
        turn.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"b","function":{"name":"GitDiff"}},{"index":0,"id":"a","function":{"name":"GitStatus"}}]}}]}"#,
        );
        let events = turn.handle_data("[DONE]");
        let names: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::ToolCallReady { tool_name, .. } => Some(tool_name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["GitStatus", "GitDiff"]);
    }

    #[test]
    fn started_precedes_args_deltas() {
        let mut turn = OpenAiTurn::default();
        let events = turn.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c","function":{"name":"ReadFile","arguments":"{}"}}]}}]}"#,
        );
        assert!(matches!(events[0], ModelEvent::ToolCallStarted { .. }));
        assert!(matches!(events[1], ModelEvent::ToolCallArgsDelta { .. }));
    }

    #[test]
    fn text_only_turn_completes_on_done() {
        let mut turn = OpenAiTurn::default();
        let text = turn.handle_data(r#"{"choices":[{"delta":{"content":"hello"}}]}"#);
        assert_eq!(
            text,
            vec![ModelEvent::TextDelta {
                text: "hello".to_string()
            }]
        );
        turn.handle_data(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        let done = turn.handle_data("[DONE]");
        assert_eq!(
            done,
            vec![ModelEvent::ResponseCompleted {
                stop_reason: "stop".to_string(),
                usage: None
            }]
        );
        // Only one terminal event per turn.
        assert!(turn.handle_data("[DONE]").is_empty());
    }

    #[test]
    fn malformed_chunk_is_a_parse_error_and_stream_continues() {
        let mut turn = OpenAiTurn::default();
        let events = turn.handle_data("{broken");
        assert_eq!(
            events,
            vec![ModelEvent::Trace {
                trace: TraceKind::ParseError,
                raw: "{broken".to_string()
            }]
        );
        assert!(!turn.completed);
    }

    #[test]
    fn usage_from_final_chunk_is_reported() {
        let mut turn = OpenAiTurn::default();
        turn.handle_data(r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":3}}"#);
        let events = turn.handle_data("[DONE]");
        assert_eq!(
            events,
            vec![ModelEvent::ResponseCompleted {
                stop_reason: "stop".to_string(),
                usage: Some(Usage {
                    input_tokens: 10,
                    output_tokens: 3
                })
            }]
        );
    }

    #[tokio::test]
    async fn cancelling_during_the_request_send_ends_the_stream() {
        use std::time::Duration;

        // Accepts connections and never answers, like a hung endpoint.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let provider = OpenAiProvider::with_base_url(
            "key".to_string(),
            format!("http://{addr}"),
            "openai-compatible",
        );
        let request = ModelRequest {
            model: "local".to_string(),
            system_prompt: None,
            messages: vec![ChatMessage::User {
                content: "hi".to_string(),
            }],
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
        };
        let cancel = CancellationToken::new();
        let stream = provider.stream(request, cancel.clone()).await;

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let events: Vec<ModelEvent> =
            tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
                .await
                .expect("stream did not end after cancellation");
        assert_eq!(
            events,
            vec![ModelEvent::ResponseCompleted {
                stop_reason: "cancelled".to_string(),
                usage: None
            }]
        );
    }

    #[test]
    fn conversation_converts_to_wire_roles() {
        let request = ModelRequest {
            model: "gpt-4o".to_string(),
            system_prompt: Some("be brief".to_string()),
            messages: vec![
                ChatMessage::User {
                    content: "hi".to_string(),
                },
                ChatMessage::Assistant {
                    content: None,
                    tool_calls: vec![ToolCallRequest {
                        call_id: "c1".to_string(),
                        name: "ListFiles".to_string(),
                        args_json: "{}".to_string(),
                    }],
                },
                ChatMessage::Tool {
                    call_id: "c1".to_string(),
                    tool_name: "ListFiles".to_string(),
                    result: ToolOutcome::success(json!({"files": []})),
                },
            ],
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
        };

        let wire = convert_messages(&request);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
        assert_eq!(wire[2].role, "assistant");
        // content is forced to an empty string alongside tool_calls
        assert_eq!(wire[2].content.as_deref(), Some(""));
        assert_eq!(wire[3].role, "tool");
        assert_eq!(wire[3].tool_call_id.as_deref(), Some("c1"));
    }
}
