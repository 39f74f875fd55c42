//! ReadFile tool: read a workspace file, optionally a line range

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolContext, ToolOutcome};

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "ReadFile"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Optional startLine/endLine select an inclusive 1-based line range."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root"
                },
                "startLine": {
                    "type": "integer",
                    "description": "First line to include (1-based, inclusive)"
                },
                "endLine": {
                    "type": "integer",
                    "description": "Last line to include (1-based, inclusive)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let Some(path) = args["path"].as_str() else {
            return Ok(ToolOutcome::failure("InvalidArguments", "path is required"));
        };

        let Some(resolved) = ctx.workspace.resolve(path) else {
            return Ok(ToolOutcome::failure(
                "UnsafePath",
                format!("path is outside the workspace: {path}"),
            ));
        };

        let content = match fs::read_to_string(&resolved).await {
            Ok(content) => content,
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "ReadFailed",
                    format!("could not read {path}: {err}"),
                ));
            }
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();

        let (start, end) = if total == 0 {
            (0, 0)
        } else {
            let start = args["startLine"]
                .as_u64()
                .map(|n| n as usize)
                .unwrap_or(1)
                .clamp(1, total);
            let end = args["endLine"]
                .as_u64()
                .map(|n| n as usize)
                .unwrap_or(total)
                .clamp(start, total);
            (start, end)
        };

        let selected = if total == 0 {
            String::new()
        } else {
            lines[start - 1..end].join("\n")
        };

        Ok(ToolOutcome::success(json!({
            "path": path,
            "startLine": start,
            "endLine": end,
            "totalLines": total,
            "content": selected,
        })))
    }
}
