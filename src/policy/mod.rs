//! Policy engine
//!
//! Decides per call whether a tool runs freely, needs a human approval, or
//! is refused outright. The default engine is deliberately coarse; finer
//! gates belong in alternative engines implementing the same trait.

use serde_json::Value;

use crate::tool::ToolDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    RequiresApproval,
    Denied,
}

pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, descriptor: &ToolDescriptor, args_json: &str) -> PolicyDecision;
}

/// Executable-name fragments that force an approval for RunCommand even
/// though the arguments parsed. Substring matching on purpose: `rm` also
/// catches `rmdir`, `sh` also catches `bash` and `ssh`.
const EXE_DENYLIST: &[&str] = &[
    "rm",
    "del",
    "rmdir",
    "format",
    "curl",
    "wget",
    "ssh",
    "powershell",
    "cmd",
    "bash",
    "sh",
];

pub struct DefaultPolicyEngine {
    auto_approve: bool,
}

impl DefaultPolicyEngine {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve }
    }
}

impl PolicyEngine for DefaultPolicyEngine {
    fn evaluate(&self, descriptor: &ToolDescriptor, args_json: &str) -> PolicyDecision {
        if self.auto_approve {
            return PolicyDecision::Allowed;
        }

        if descriptor.policy.requires_approval {
            return PolicyDecision::RequiresApproval;
        }

        if descriptor.name.eq_ignore_ascii_case("runcommand") {
            let Ok(args) = serde_json::from_str::<Value>(args_json) else {
                return PolicyDecision::RequiresApproval;
            };
            let exe = args["exe"].as_str().unwrap_or("").to_lowercase();
            if EXE_DENYLIST.iter().any(|fragment| exe.contains(fragment)) {
                return PolicyDecision::RequiresApproval;
            }
        }

        PolicyDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{RiskLevel, ToolPolicy};

    fn descriptor(name: &str, requires_approval: bool) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: String::new(),
            input_schema: "{}".to_string(),
            policy: if requires_approval {
                ToolPolicy::mutating(RiskLevel::Medium)
            } else {
                ToolPolicy::observational()
            },
        }
    }

    #[test]
    fn auto_approve_short_circuits_everything() {
        let engine = DefaultPolicyEngine::new(true);
        let decision = engine.evaluate(&descriptor("ApplyPatch", true), "{}");
        assert_eq!(decision, PolicyDecision::Allowed);
    }

    #[test]
    fn static_requires_approval_wins() {
        let engine = DefaultPolicyEngine::new(false);
        let decision = engine.evaluate(&descriptor("ApplyPatch", true), "{}");
        assert_eq!(decision, PolicyDecision::RequiresApproval);
    }

    #[test]
    fn read_only_tools_are_allowed() {
        let engine = DefaultPolicyEngine::new(false);
        let decision = engine.evaluate(&descriptor("ReadFile", false), r#"{"path":"a.txt"}"#);
        assert_eq!(decision, PolicyDecision::Allowed);
    }

    #[test]
    fn run_command_denylist_forces_approval() {
        let engine = DefaultPolicyEngine::new(false);
        for exe in ["rm", "curl", "bash", "ssh", "/bin/sh", "powershell.exe"] {
            let args = format!(r#"{{"exe":"{exe}"}}"#);
            let decision = engine.evaluate(&descriptor("RunCommand", false), &args);
            assert_eq!(
                decision,
                PolicyDecision::RequiresApproval,
                "expected approval for {exe}"
            );
        }
    }

    #[test]
    fn run_command_with_unparseable_args_requires_approval() {
        let engine = DefaultPolicyEngine::new(false);
        let decision = engine.evaluate(&descriptor("RunCommand", false), "not json");
        assert_eq!(decision, PolicyDecision::RequiresApproval);
    }
}
