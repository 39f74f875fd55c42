//! Shared fixtures: a scripted provider and a recording sink

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use codewright::agent::{Agent, AgentOptions, AgentSink};
use codewright::approval::ApprovalArbiter;
use codewright::policy::DefaultPolicyEngine;
use codewright::provider::{EventStream, ModelEvent, ModelProvider, ModelRequest, Usage};
use codewright::session::{session_log_path, SessionLogger};
use codewright::tool::{ToolContext, ToolOutcome, ToolRegistry};
use codewright::workspace::Workspace;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Plays back a fixed list of event turns and records every request it was
/// asked to stream.
#[derive(Debug)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<ModelEvent>>>,
    pub requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<ModelEvent>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ModelRequest, _cancel: CancellationToken) -> EventStream {
        self.requests.lock().unwrap().push(request);
        let events = self.turns.lock().unwrap().pop_front().unwrap_or_else(|| {
            vec![ModelEvent::ResponseCompleted {
                stop_reason: "end_turn".to_string(),
                usage: None,
            }]
        });
        Box::pin(futures::stream::iter(events))
    }
}

/// Collects everything the orchestrator surfaces.
#[derive(Default)]
pub struct RecordingSink {
    pub notices: Mutex<Vec<String>>,
    pub usages: Mutex<Vec<Option<Usage>>>,
    pub tool_calls: Mutex<Vec<(String, String)>>,
    pub tool_results: Mutex<Vec<(String, bool)>>,
    pub text: Mutex<String>,
}

impl RecordingSink {
    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap().clone()
    }

    pub fn usages(&self) -> Vec<Option<Usage>> {
        self.usages.lock().unwrap().clone()
    }
}

impl AgentSink for RecordingSink {
    fn text_delta(&self, text: &str) {
        self.text.lock().unwrap().push_str(text);
    }

    fn tool_call(&self, _call_id: &str, tool_name: &str, args_json: &str) {
        self.tool_calls
            .lock()
            .unwrap()
            .push((tool_name.to_string(), args_json.to_string()));
    }

    fn tool_result(&self, _call_id: &str, tool_name: &str, result: &ToolOutcome) {
        self.tool_results
            .lock()
            .unwrap()
            .push((tool_name.to_string(), result.ok));
    }

    fn completed(&self, status: &str, usage: Option<Usage>) {
        self.notices.lock().unwrap().push(status.to_string());
        self.usages.lock().unwrap().push(usage);
    }

    fn provider_error(&self, _message: &str) {}
}

pub struct TestAgent {
    pub agent: Agent,
    pub sink: Arc<RecordingSink>,
    pub workspace: TempDir,
}

/// Agent over a temp workspace with the default tools and policy.
pub fn build_agent(
    provider: Arc<ScriptedProvider>,
    approvals: Arc<dyn ApprovalArbiter>,
    max_iterations: u32,
) -> TestAgent {
    let workspace = TempDir::new().unwrap();
    build_agent_in(workspace, provider, approvals, max_iterations)
}

pub fn build_agent_in(
    workspace: TempDir,
    provider: Arc<ScriptedProvider>,
    approvals: Arc<dyn ApprovalArbiter>,
    max_iterations: u32,
) -> TestAgent {
    let root = workspace.path().to_path_buf();
    let logger = Arc::new(SessionLogger::open(session_log_path(&root, "test")).unwrap());
    let sink = Arc::new(RecordingSink::default());

    let mut options = AgentOptions::new(root.clone(), "scripted-model");
    options.max_iterations = max_iterations;

    let ctx = ToolContext {
        repo_root: root.clone(),
        workspace: Workspace::new(&root).unwrap(),
        approvals,
    };

    let agent = Agent::new(
        options,
        provider,
        ToolRegistry::with_defaults(),
        Arc::new(DefaultPolicyEngine::new(false)),
        logger,
        sink.clone(),
        ctx,
    );

    TestAgent {
        agent,
        sink,
        workspace,
    }
}
