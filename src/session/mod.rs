//! Session persistence
//!
//! A session is a durable id plus an append-only JSONL log. Every line is
//! `{timestamp, data}` and parses on its own, so a truncated or partially
//! corrupt file still yields everything readable. Only `data.type ==
//! "message"` lines participate in conversation reconstruction; the rest
//! (prompts, normalized events, tool results, session markers) is
//! diagnostic.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::provider::{ChatMessage, ModelEvent, ToolCallRequest};
use crate::tool::ToolOutcome;

pub const AGENT_DIR: &str = ".agent";

pub fn agent_dir(repo_root: &Path) -> PathBuf {
    repo_root.join(AGENT_DIR)
}

pub fn session_log_path(repo_root: &Path, session_id: &str) -> PathBuf {
    agent_dir(repo_root).join(format!("session_{session_id}.jsonl"))
}

pub fn index_path(repo_root: &Path) -> PathBuf {
    agent_dir(repo_root).join("sessions.jsonl")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub workspace_root: PathBuf,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// One record per create/resume in `.agent/sessions.jsonl`.
pub fn append_index_record(repo_root: &Path, info: &SessionInfo, event: &str) -> Result<()> {
    let path = index_path(repo_root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let record = json!({
        "event": event,
        "sessionId": info.id,
        "provider": info.provider,
        "model": info.model,
        "workspace": info.workspace_root,
        "timestamp": Utc::now().to_rfc3339(),
    });
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{record}")?;
    Ok(())
}

/// Thread-safe append-only writer. Logging never raises: I/O trouble is
/// traced, serialization trouble becomes a synthetic error entry.
pub struct SessionLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl SessionLogger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening session log {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, data: Value) {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                // Keep the log line-parseable even when the payload refuses
                // to serialize.
                json!({
                    "timestamp": Utc::now().to_rfc3339(),
                    "data": {"type": "error", "message": format!("serialization failed: {err}")},
                })
                .to_string()
            }
        };

        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            tracing::warn!(error = %err, path = %self.path.display(), "session log write failed");
        }
    }

    pub fn log_session_start(&self, info: &SessionInfo) {
        self.log(json!({
            "type": "session_start",
            "sessionId": info.id,
            "provider": info.provider,
            "model": info.model,
            "workspace": info.workspace_root,
        }));
    }

    pub fn log_user_prompt(&self, prompt: &str) {
        self.log(json!({"type": "user_prompt", "prompt": prompt}));
    }

    pub fn log_event(&self, event: &ModelEvent) {
        let payload = serde_json::to_value(event).unwrap_or_else(|_| json!(null));
        self.log(json!({"type": "event", "event": payload}));
    }

    pub fn log_tool_result(&self, call_id: &str, tool: &str, result: &ToolOutcome) {
        let diagnostics = serde_json::to_value(&result.diagnostics).unwrap_or_else(|_| json!([]));
        self.log(json!({
            "type": "tool_result",
            "callId": call_id,
            "tool": tool,
            "ok": result.ok,
            "diagnostics": diagnostics,
        }));
    }

    pub fn log_message(&self, message: &ChatMessage) {
        self.log(message_to_wire(message));
    }
}

pub fn message_to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::User { content } => json!({
            "type": "message",
            "role": "user",
            "content": content,
        }),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut wire = json!({
                "type": "message",
                "role": "assistant",
                "content": content,
            });
            if !tool_calls.is_empty() {
                let calls: Vec<Value> = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "callId": call.call_id,
                            "name": call.name,
                            "argsJson": call.args_json,
                        })
                    })
                    .collect();
                wire["toolCalls"] = json!(calls);
            }
            wire
        }
        ChatMessage::Tool {
            call_id,
            tool_name,
            result,
        } => json!({
            "type": "message",
            "role": "tool",
            "callId": call_id,
            "toolName": tool_name,
            "result": serde_json::to_value(result).unwrap_or_else(|_| json!({"ok": false})),
        }),
    }
}

pub fn message_from_wire(data: &Value) -> Option<ChatMessage> {
    match data["role"].as_str()? {
        "user" => Some(ChatMessage::User {
            content: data["content"].as_str()?.to_string(),
        }),
        "assistant" => {
            let content = data["content"].as_str().map(str::to_string);
            let tool_calls = data["toolCalls"]
                .as_array()
                .map(|calls| {
                    calls
                        .iter()
                        .filter_map(|call| {
                            Some(ToolCallRequest {
                                call_id: call["callId"].as_str()?.to_string(),
                                name: call["name"].as_str()?.to_string(),
                                args_json: call["argsJson"].as_str()?.to_string(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            Some(ChatMessage::Assistant {
                content,
                tool_calls,
            })
        }
        "tool" => {
            let result: ToolOutcome = serde_json::from_value(data["result"].clone()).ok()?;
            Some(ChatMessage::Tool {
                call_id: data["callId"].as_str()?.to_string(),
                tool_name: data["toolName"].as_str()?.to_string(),
                result,
            })
        }
        _ => None,
    }
}

/// Rebuild the conversation from a session log. Lines that fail to parse
/// are reported through `warn` and skipped; the reader never gives up on
/// the rest of the file.
pub fn read_messages(
    path: &Path,
    mut warn: impl FnMut(usize, String),
) -> Result<Vec<ChatMessage>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading session log {}", path.display()))?;

    let mut messages = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: Value = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(err) => {
                warn(index + 1, format!("unparseable log line: {err}"));
                continue;
            }
        };
        let data = &entry["data"];
        if data["type"].as_str() != Some("message") {
            continue;
        }
        match message_from_wire(data) {
            Some(message) => messages.push(message),
            None => warn(index + 1, "malformed message entry".to_string()),
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::Diagnostic;
    use tempfile::TempDir;

    fn sample_messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::User {
                content: "hi".to_string(),
            },
            ChatMessage::Assistant {
                content: Some("ok".to_string()),
                tool_calls: vec![ToolCallRequest {
                    call_id: "c1".to_string(),
                    name: "ReadFile".to_string(),
                    args_json: "{}".to_string(),
                }],
            },
            ChatMessage::Tool {
                call_id: "c1".to_string(),
                tool_name: "ReadFile".to_string(),
                result: ToolOutcome {
                    ok: true,
                    stdout: None,
                    stderr: None,
                    data: Some(json!({"content": "x"})),
                    diagnostics: vec![],
                },
            },
        ]
    }

    #[test]
    fn messages_round_trip_through_the_log() {
        let dir = TempDir::new().unwrap();
        let path = session_log_path(dir.path(), "t1");
        let logger = SessionLogger::open(&path).unwrap();

        for message in sample_messages() {
            logger.log_message(&message);
        }
        // Diagnostic entries must not disturb reconstruction.
        logger.log_user_prompt("hi");
        logger.log(json!({"type": "tool_result", "callId": "c1", "ok": true}));

        let read = read_messages(&path, |_, _| panic!("no warnings expected")).unwrap();
        assert_eq!(read, sample_messages());
    }

    #[test]
    fn unparseable_lines_warn_and_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"timestamp":"2025-01-01T00:00:00Z","data":{"type":"message","role":"user","content":"a"}}"#,
                "\n",
                "this is not json\n",
                r#"{"timestamp":"2025-01-01T00:00:01Z","data":{"type":"message","role":"user","content":"b"}}"#,
                "\n",
            ),
        )
        .unwrap();

        let mut warnings = Vec::new();
        let read = read_messages(&path, |line, message| warnings.push((line, message))).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, 2);
    }

    #[test]
    fn tool_message_with_minimal_result_parses() {
        let data = json!({
            "type": "message",
            "role": "tool",
            "callId": "c1",
            "toolName": "ReadFile",
            "result": {"ok": true},
        });
        let message = message_from_wire(&data).unwrap();
        match message {
            ChatMessage::Tool { result, .. } => {
                assert!(result.ok);
                assert!(result.diagnostics.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn failed_outcome_round_trips_diagnostics() {
        let message = ChatMessage::Tool {
            call_id: "c9".to_string(),
            tool_name: "RunCommand".to_string(),
            result: ToolOutcome {
                ok: false,
                stdout: Some("partial".to_string()),
                stderr: Some("boom".to_string()),
                data: None,
                diagnostics: vec![Diagnostic::new("ExitCode", "exited with 1")],
            },
        };
        let wire = message_to_wire(&message);
        let back = message_from_wire(&wire).unwrap();
        match back {
            ChatMessage::Tool { result, .. } => {
                assert!(!result.ok);
                assert_eq!(result.diagnostics[0].code, "ExitCode");
                assert_eq!(result.stderr.as_deref(), Some("boom"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn index_records_append() {
        let dir = TempDir::new().unwrap();
        let info = SessionInfo {
            id: "s1".to_string(),
            workspace_root: dir.path().to_path_buf(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            created_at: Utc::now(),
        };
        append_index_record(dir.path(), &info, "created").unwrap();
        append_index_record(dir.path(), &info, "resumed").unwrap();

        let content = std::fs::read_to_string(index_path(dir.path())).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "created");
        assert_eq!(first["sessionId"], "s1");
    }

    #[test]
    fn every_log_line_parses_independently() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = SessionLogger::open(&path).unwrap();
        logger.log_user_prompt("p");
        logger.log_event(&ModelEvent::TextDelta {
            text: "t".to_string(),
        });
        logger.log_message(&ChatMessage::User {
            content: "u".to_string(),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        for line in content.lines() {
            let entry: Value = serde_json::from_str(line).unwrap();
            assert!(entry["timestamp"].as_str().is_some());
            assert!(entry["data"].is_object());
        }
    }
}
