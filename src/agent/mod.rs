//! Orchestrator
//!
//! Drives the turn loop: stream one model response, fold it into the
//! conversation, execute whatever tool calls it produced under policy and
//! approval, feed the results back, repeat until the model signals it is
//! done or the iteration budget runs out. Tool failures never escape as
//! errors; they are values sent back to the model.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::policy::{PolicyDecision, PolicyEngine};
use crate::provider::{
    is_terminal_stop_reason, ChatMessage, ModelEvent, ModelProvider, ModelRequest,
    ToolCallRequest, TraceKind, Usage,
};
use crate::session::SessionLogger;
use crate::tool::{descriptor_of, ToolContext, ToolOutcome, ToolRegistry};

pub const DEFAULT_MAX_ITERATIONS: u32 = 20;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a coding assistant working inside the user's \
repository. Use the available tools to inspect and modify the code; prefer small verifiable \
steps, and report what you changed when you are done.";

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub repo_root: PathBuf,
    pub model: String,
    pub system_prompt: String,
    pub max_iterations: u32,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl AgentOptions {
    pub fn new(repo_root: PathBuf, model: impl Into<String>) -> Self {
        Self {
            repo_root,
            model: model.into(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
        }
    }
}

/// Where the orchestrator surfaces user-visible activity. The terminal
/// prints it, the server forwards it to the session event channel; the
/// termination state machine is identical for both.
pub trait AgentSink: Send + Sync {
    fn text_delta(&self, text: &str);

    fn tool_call_started(&self, _call_id: &str, _tool_name: &str) {}

    fn tool_call(&self, call_id: &str, tool_name: &str, args_json: &str);

    fn tool_result(&self, call_id: &str, tool_name: &str, result: &ToolOutcome);

    /// Terminal status of a run: `[Agent completed]`, `[No response]`, and
    /// friends, plus whatever token usage the provider reported.
    fn completed(&self, status: &str, usage: Option<Usage>);

    fn provider_error(&self, message: &str);
}

/// Line-based terminal surface.
pub struct ConsoleSink;

impl AgentSink for ConsoleSink {
    fn text_delta(&self, text: &str) {
        use std::io::Write;
        print!("{text}");
        let _ = std::io::stdout().flush();
    }

    fn tool_call(&self, _call_id: &str, tool_name: &str, args_json: &str) {
        println!("\n[tool] {tool_name} args={args_json}");
    }

    fn tool_result(&self, _call_id: &str, tool_name: &str, result: &ToolOutcome) {
        if !result.ok {
            println!(
                "[tool] {tool_name} failed: {}",
                result.first_diagnostic().unwrap_or("unknown error")
            );
        }
    }

    fn completed(&self, status: &str, usage: Option<Usage>) {
        match usage {
            Some(usage) => println!(
                "\n{status} ({} in / {} out tokens)",
                usage.input_tokens, usage.output_tokens
            ),
            None => println!("\n{status}"),
        }
    }

    fn provider_error(&self, message: &str) {
        eprintln!("\n[provider error] {message}");
    }
}

pub struct Agent {
    options: AgentOptions,
    provider: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    policy: Arc<dyn PolicyEngine>,
    logger: Arc<SessionLogger>,
    sink: Arc<dyn AgentSink>,
    ctx: ToolContext,
}

impl Agent {
    pub fn new(
        options: AgentOptions,
        provider: Arc<dyn ModelProvider>,
        tools: ToolRegistry,
        policy: Arc<dyn PolicyEngine>,
        logger: Arc<SessionLogger>,
        sink: Arc<dyn AgentSink>,
        ctx: ToolContext,
    ) -> Self {
        Self {
            options,
            provider,
            tools,
            policy,
            logger,
            sink,
            ctx,
        }
    }

    /// Run one user prompt to completion, mutating `messages` in place.
    pub async fn run(
        &self,
        prompt: &str,
        messages: &mut Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let user = ChatMessage::User {
            content: prompt.to_string(),
        };
        self.logger.log_user_prompt(prompt);
        self.logger.log_message(&user);
        messages.push(user);

        let mut run_usage: Option<Usage> = None;

        for iteration in 0..self.options.max_iterations {
            if cancel.is_cancelled() {
                self.sink.completed("[Cancelled]", run_usage);
                return Ok(());
            }

            tracing::debug!(
                iteration,
                model = %self.options.model,
                message_count = messages.len(),
                "starting model turn"
            );

            let request = ModelRequest {
                model: self.options.model.clone(),
                system_prompt: Some(self.options.system_prompt.clone()),
                messages: messages.clone(),
                tools: self.tools.descriptors(),
                max_tokens: Some(self.options.max_tokens),
                temperature: self.options.temperature,
            };

            let mut stream = self.provider.stream(request, cancel.child_token()).await;

            let mut text = String::new();
            let mut pending: Vec<ToolCallRequest> = Vec::new();
            let mut completed = false;
            let mut stop_reason = String::new();
            let mut turn_usage: Option<Usage> = None;
            let mut provider_error: Option<String> = None;

            while let Some(event) = stream.next().await {
                self.logger.log_event(&event);
                match event {
                    ModelEvent::TextDelta { text: delta } => {
                        text.push_str(&delta);
                        self.sink.text_delta(&delta);
                    }
                    ModelEvent::ToolCallStarted { call_id, tool_name } => {
                        self.sink.tool_call_started(&call_id, &tool_name);
                    }
                    ModelEvent::ToolCallArgsDelta { .. } => {}
                    ModelEvent::ToolCallReady {
                        call_id,
                        tool_name,
                        args_json,
                    } => {
                        self.sink.tool_call(&call_id, &tool_name, &args_json);
                        pending.push(ToolCallRequest {
                            call_id,
                            name: tool_name,
                            args_json,
                        });
                    }
                    ModelEvent::Trace { trace, raw } => {
                        if trace == TraceKind::Error {
                            self.sink.provider_error(&raw);
                            provider_error = Some(raw);
                        }
                    }
                    ModelEvent::ResponseCompleted {
                        stop_reason: reason,
                        usage,
                    } => {
                        completed = is_terminal_stop_reason(&reason);
                        stop_reason = reason;
                        turn_usage = usage;
                        break;
                    }
                }
            }

            if let Some(usage) = turn_usage {
                let total = run_usage.get_or_insert(Usage::default());
                total.input_tokens += usage.input_tokens;
                total.output_tokens += usage.output_tokens;
            }

            if cancel.is_cancelled() {
                self.sink.completed("[Cancelled]", run_usage);
                return Ok(());
            }

            if !text.is_empty() || !pending.is_empty() {
                let assistant = ChatMessage::Assistant {
                    content: (!text.is_empty()).then(|| text.clone()),
                    tool_calls: pending.clone(),
                };
                self.logger.log_message(&assistant);
                messages.push(assistant);
            }

            if pending.is_empty() && completed {
                self.sink.completed("[Agent completed]", run_usage);
                return Ok(());
            }

            if pending.is_empty() && text.is_empty() && !completed {
                let detail = match provider_error {
                    Some(error) => format!(" ({stop_reason}: {error})"),
                    None => format!(" ({stop_reason})"),
                };
                self.sink.completed(&format!("[No response]{detail}"), run_usage);
                return Ok(());
            }

            if !pending.is_empty() {
                for call in &pending {
                    let result = self.execute_call(call, &cancel).await;
                    self.sink.tool_result(&call.call_id, &call.name, &result);
                    self.logger
                        .log_tool_result(&call.call_id, &call.name, &result);
                    let message = ChatMessage::Tool {
                        call_id: call.call_id.clone(),
                        tool_name: call.name.clone(),
                        result,
                    };
                    self.logger.log_message(&message);
                    messages.push(message);
                }
                continue;
            }

            // Text only and the model is not done: nothing to execute, so
            // there is no point asking again.
            return Ok(());
        }

        self.sink.completed("[Max iterations reached]", run_usage);
        Ok(())
    }

    async fn execute_call(
        &self,
        call: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> ToolOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutcome::failure("UnknownTool", format!("Unknown tool: {}", call.name));
        };

        let descriptor = descriptor_of(tool.as_ref());
        match self.policy.evaluate(&descriptor, &call.args_json) {
            PolicyDecision::Denied => {
                return ToolOutcome::failure("PolicyDenied", "Tool execution denied by policy");
            }
            PolicyDecision::RequiresApproval => {
                let approved = self
                    .ctx
                    .approvals
                    .request_approval(
                        &call.name,
                        &call.args_json,
                        Some(&call.call_id),
                        cancel.child_token(),
                    )
                    .await;
                if !approved {
                    return ToolOutcome::failure("ApprovalDenied", "User denied approval");
                }
            }
            PolicyDecision::Allowed => {}
        }

        let args: Value = match serde_json::from_str(&call.args_json) {
            Ok(args) => args,
            Err(err) => {
                return ToolOutcome::failure(
                    "InvalidArguments",
                    format!("Tool execution failed: {err}"),
                );
            }
        };

        match tool.execute(args, &self.ctx, cancel.child_token()).await {
            Ok(result) => result,
            Err(err) => {
                ToolOutcome::failure("ToolError", format!("Tool execution failed: {err}"))
            }
        }
    }
}
