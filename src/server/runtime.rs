//! Per-session server runtime
//!
//! Each session owns its provider adapter, tool registry, policy engine,
//! logger, pending-approval table, and one unbounded event channel with a
//! single-slot reader latch. Runs are serialized per session by holding the
//! message-list mutex for the whole run; sessions run in parallel with each
//! other.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Agent, AgentOptions, AgentSink};
use crate::approval::PendingApprovals;
use crate::config::{resolve_provider, Config};
use crate::policy::{DefaultPolicyEngine, PolicyEngine};
use crate::provider::{build_provider, ChatMessage, ModelProvider, Usage};
use crate::session::{
    append_index_record, read_messages, session_log_path, SessionInfo, SessionLogger,
};
use crate::tool::{ToolContext, ToolOutcome, ToolRegistry};
use crate::workspace::Workspace;

use super::ServerEvent;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub workspace_path: PathBuf,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Concurrent map of live sessions.
#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionRuntime>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, runtime: Arc<SessionRuntime>) {
        self.sessions.insert(runtime.info.id.clone(), runtime);
    }

    pub fn try_get(&self, id: &str) -> Option<Arc<SessionRuntime>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }
}

pub struct SessionRuntime {
    pub info: SessionInfo,
    options: AgentOptions,
    provider: Arc<dyn ModelProvider>,
    tools: ToolRegistry,
    policy: Arc<dyn PolicyEngine>,
    logger: Arc<SessionLogger>,
    pub approvals: Arc<PendingApprovals>,
    events: mpsc::UnboundedSender<ServerEvent>,
    stream_slot: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    workspace: Workspace,
    messages: Mutex<Vec<ChatMessage>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRuntime")
            .field("id", &self.info.id)
            .finish_non_exhaustive()
    }
}

impl SessionRuntime {
    /// Build a runtime for a fresh session.
    pub fn create(request: &CreateSessionRequest, config: &Config) -> Result<Arc<Self>> {
        let id = Uuid::new_v4().to_string();
        Self::build(id, request, config, Vec::new(), "created")
    }

    /// Rebuild a runtime with a known id from its existing log.
    pub fn resume(id: &str, request: &CreateSessionRequest, config: &Config) -> Result<Arc<Self>> {
        let workspace_root = std::fs::canonicalize(&request.workspace_path).with_context(|| {
            format!("workspace {} not found", request.workspace_path.display())
        })?;
        let log_path = session_log_path(&workspace_root, id);
        let messages = read_messages(&log_path, |line, warning| {
            tracing::warn!(session_id = id, line, warning, "skipping session log line");
        })?;
        Self::build(id.to_string(), request, config, messages, "resumed")
    }

    fn build(
        id: String,
        request: &CreateSessionRequest,
        config: &Config,
        messages: Vec<ChatMessage>,
        index_event: &str,
    ) -> Result<Arc<Self>> {
        let workspace_root = std::fs::canonicalize(&request.workspace_path).with_context(|| {
            format!("workspace {} not found", request.workspace_path.display())
        })?;

        let resolved = resolve_provider(
            config,
            request.provider.as_deref(),
            request.model.as_deref(),
        )?;
        let provider = build_provider(&resolved.provider, resolved.endpoint.as_deref())?;

        let workspace = Workspace::new(&workspace_root)?;
        let logger = Arc::new(SessionLogger::open(session_log_path(&workspace_root, &id))?);

        let info = SessionInfo {
            id,
            workspace_root: workspace_root.clone(),
            provider: resolved.provider.clone(),
            model: resolved.model.clone(),
            created_at: Utc::now(),
        };
        append_index_record(&workspace_root, &info, index_event)?;
        logger.log_session_start(&info);

        let (events, receiver) = mpsc::unbounded_channel();
        let approvals = Arc::new(PendingApprovals::new(events.clone()));

        let runtime = Arc::new(Self {
            options: AgentOptions::new(workspace_root, resolved.model),
            info,
            provider,
            tools: ToolRegistry::with_defaults(),
            policy: Arc::new(DefaultPolicyEngine::new(false)),
            logger,
            approvals,
            events,
            stream_slot: std::sync::Mutex::new(Some(receiver)),
            workspace,
            messages: Mutex::new(messages),
            cancel: CancellationToken::new(),
        });
        Ok(runtime)
    }

    pub fn send_event(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Claim the single event-stream reader slot. `None` when another
    /// stream is already connected.
    pub fn take_stream(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.stream_slot.lock().ok()?.take()
    }

    /// Give the reader slot back on disconnect so the next subscriber picks
    /// up the buffered events.
    pub fn return_stream(&self, receiver: mpsc::UnboundedReceiver<ServerEvent>) {
        if let Ok(mut slot) = self.stream_slot.lock() {
            *slot = Some(receiver);
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one chat turn. Holding the message-list lock for the duration is
    /// what serializes concurrent runs on a session.
    pub async fn run_chat(self: Arc<Self>, prompt: String) {
        let mut messages = self.messages.lock().await;

        let sink: Arc<dyn AgentSink> = Arc::new(ChannelSink {
            events: self.events.clone(),
        });
        let ctx = ToolContext {
            repo_root: self.options.repo_root.clone(),
            workspace: self.workspace.clone(),
            approvals: self.approvals.clone(),
        };
        let agent = Agent::new(
            self.options.clone(),
            self.provider.clone(),
            self.tools.clone(),
            self.policy.clone(),
            self.logger.clone(),
            sink,
            ctx,
        );

        if let Err(err) = agent
            .run(&prompt, &mut messages, self.cancel.child_token())
            .await
        {
            tracing::error!(session_id = %self.info.id, error = %err, "session run failed");
            self.send_event(ServerEvent::Error {
                message: err.to_string(),
            });
        }
    }
}

/// Forwards orchestrator activity onto the session event channel.
pub struct ChannelSink {
    pub events: mpsc::UnboundedSender<ServerEvent>,
}

impl AgentSink for ChannelSink {
    fn text_delta(&self, text: &str) {
        let _ = self.events.send(ServerEvent::TextDelta {
            text: text.to_string(),
        });
    }

    fn tool_call(&self, call_id: &str, tool_name: &str, args_json: &str) {
        let _ = self.events.send(ServerEvent::ToolCall {
            call_id: call_id.to_string(),
            tool: tool_name.to_string(),
            args: args_json.to_string(),
        });
    }

    fn tool_result(&self, call_id: &str, tool_name: &str, result: &ToolOutcome) {
        let _ = self.events.send(ServerEvent::ToolResult {
            call_id: call_id.to_string(),
            tool: tool_name.to_string(),
            ok: result.ok,
        });
    }

    fn completed(&self, status: &str, usage: Option<Usage>) {
        let _ = self.events.send(ServerEvent::Completed {
            status: status.to_string(),
            usage,
        });
    }

    fn provider_error(&self, message: &str) {
        let _ = self.events.send(ServerEvent::Trace {
            kind: "error".to_string(),
            raw: message.to_string(),
        });
    }
}
