//! Tool system
//!
//! Tools are the executable capabilities the model can invoke. Each tool
//! carries a JSON-Schema description of its arguments and a static policy;
//! execution happens against a [`ToolContext`] that scopes it to the
//! workspace. Predictable failures are values: a tool returns a failed
//! [`ToolOutcome`] with diagnostics, never an `Err`, so the failure can be
//! fed back to the model. `Err` is reserved for genuinely unexpected
//! breakage, which the orchestrator traps and converts.

pub mod apply_patch;
pub mod git;
pub mod list_files;
pub mod read_file;
pub mod run_command;
pub mod search_text;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::approval::ApprovalArbiter;
use crate::workspace::Workspace;

/// Result from executing a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// A machine-readable note attached to a tool result. Failed results carry
/// at least one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Diagnostic {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl ToolOutcome {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            stdout: None,
            stderr: None,
            data: Some(data),
            diagnostics: Vec::new(),
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            stdout: None,
            stderr: None,
            data: None,
            diagnostics: vec![Diagnostic::new(code, message)],
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: Diagnostic) -> Self {
        self.diagnostics.push(diagnostic);
        self
    }

    /// First diagnostic message, used when formatting failures for the model.
    pub fn first_diagnostic(&self) -> Option<&str> {
        self.diagnostics.first().map(|d| d.message.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Static description of how dangerous a tool is and whether it needs a
/// human in the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolPolicy {
    pub requires_approval: bool,
    pub read_only: bool,
    pub risk: RiskLevel,
}

impl ToolPolicy {
    /// Read-only observation of the workspace; runs without approval.
    pub const fn observational() -> Self {
        Self {
            requires_approval: false,
            read_only: true,
            risk: RiskLevel::Low,
        }
    }

    /// Mutates the workspace or spawns processes; gated on approval.
    pub const fn mutating(risk: RiskLevel) -> Self {
        Self {
            requires_approval: true,
            read_only: false,
            risk,
        }
    }
}

/// What the provider adapter sees: the schema travels as text and is parsed
/// defensively on the far side.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: String,
    pub policy: ToolPolicy,
}

/// Everything a tool may touch while executing.
pub struct ToolContext {
    pub repo_root: PathBuf,
    pub workspace: Workspace,
    pub approvals: Arc<dyn ApprovalArbiter>,
}

/// A tool that can be executed by the agent.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as advertised to the model.
    fn name(&self) -> &str;

    /// Description for the model.
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn input_schema(&self) -> Value;

    fn policy(&self) -> ToolPolicy {
        ToolPolicy::observational()
    }

    /// Execute with parsed arguments. Predictable failures come back as a
    /// failed outcome; `Err` only for unexpected breakage.
    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> Result<ToolOutcome>;
}

/// Case-insensitive registry of available tools.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_ascii_lowercase(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.values().map(|t| t.name()).collect()
    }

    /// Descriptor listing for the provider adapter.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> =
            self.tools.values().map(|t| descriptor_of(t.as_ref())).collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Registry with the full default tool set.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(Arc::new(read_file::ReadFileTool));
        registry.register(Arc::new(list_files::ListFilesTool));
        registry.register(Arc::new(search_text::SearchTextTool::new()));
        registry.register(Arc::new(git::GitStatusTool));
        registry.register(Arc::new(git::GitDiffTool));
        registry.register(Arc::new(apply_patch::ApplyPatchTool));
        registry.register(Arc::new(run_command::RunCommandTool));

        registry
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub fn descriptor_of(tool: &dyn Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema().to_string(),
        policy: tool.policy(),
    }
}

/// Directories never walked by the file tools.
pub(crate) const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", "bin", "obj"];

pub(crate) fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.iter().any(|d| name.eq_ignore_ascii_case(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let registry = ToolRegistry::with_defaults();
        assert!(registry.get("readfile").is_some());
        assert!(registry.get("READFILE").is_some());
        assert!(registry.get("ReadFile").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn descriptors_cover_all_tools_and_parse_as_schemas() {
        let registry = ToolRegistry::with_defaults();
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 7);
        for descriptor in &descriptors {
            let schema: serde_json::Value =
                serde_json::from_str(&descriptor.input_schema).expect("schema text parses");
            assert_eq!(schema["type"], "object");
        }
    }

    #[test]
    fn mutating_tools_require_approval() {
        let registry = ToolRegistry::with_defaults();
        let patch = registry.get("ApplyPatch").unwrap();
        assert!(patch.policy().requires_approval);
        assert_eq!(patch.policy().risk, RiskLevel::Medium);
        let run = registry.get("RunCommand").unwrap();
        assert!(run.policy().requires_approval);
        assert_eq!(run.policy().risk, RiskLevel::High);
    }

    #[test]
    fn failure_outcome_carries_a_diagnostic() {
        let outcome = ToolOutcome::failure("Nope", "did not work");
        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.first_diagnostic(), Some("did not work"));
    }
}
