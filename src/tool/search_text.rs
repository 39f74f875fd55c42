//! SearchText tool: regex search across the workspace
//!
//! Uses ripgrep's JSON output when an `rg` binary is discoverable on PATH,
//! otherwise walks the tree itself. Both backends apply the same directory
//! blacklist; the builtin walk also skips known-binary extensions.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::{is_excluded_dir, Tool, ToolContext, ToolOutcome};

const DEFAULT_MAX_RESULTS: usize = 50;

const BINARY_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "a", "o", "obj", "lib", "class", "jar", "png", "jpg", "jpeg",
    "gif", "bmp", "ico", "pdf", "zip", "gz", "tar", "7z", "rar", "mp3", "mp4", "avi", "mov",
    "woff", "woff2", "ttf", "eot", "wasm", "bin",
];

pub struct SearchTextTool {
    rg_path: Option<PathBuf>,
}

impl SearchTextTool {
    pub fn new() -> Self {
        Self {
            rg_path: which::which("rg").ok(),
        }
    }

    #[cfg(test)]
    fn builtin_only() -> Self {
        Self { rg_path: None }
    }

    async fn search_with_rg(
        &self,
        rg: &Path,
        pattern: &str,
        root: &Path,
        max_results: usize,
    ) -> Result<Vec<Value>> {
        let output = Command::new(rg)
            .arg("--json")
            .arg("--ignore-case")
            .arg("-e")
            .arg(pattern)
            .arg(".")
            .current_dir(root)
            .output()
            .await?;

        // rg exits 1 for "no matches", which is still a successful search.
        if !output.status.success() && output.status.code() != Some(1) {
            anyhow::bail!(
                "rg exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let mut matches = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if matches.len() >= max_results {
                break;
            }
            let Ok(record) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if record["type"].as_str() != Some("match") {
                continue;
            }
            let data = &record["data"];
            let Some(file) = data["path"]["text"].as_str() else {
                continue;
            };
            let Some(line_number) = data["line_number"].as_u64() else {
                continue;
            };
            let content = data["lines"]["text"].as_str().unwrap_or("");
            matches.push(json!({
                "file": file.trim_start_matches("./").replace('\\', "/"),
                "line": line_number,
                "content": content.trim_end(),
            }));
        }
        Ok(matches)
    }

    fn search_builtin(
        pattern: &regex::Regex,
        root: &Path,
        max_results: usize,
    ) -> Vec<Value> {
        let mut matches = Vec::new();

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            !(entry.file_type().is_dir() && is_excluded_dir(&entry.file_name().to_string_lossy()))
        });

        'files: for entry in walker {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
                if BINARY_EXTENSIONS.iter().any(|b| ext.eq_ignore_ascii_case(b)) {
                    continue;
                }
            }
            // Binary or unreadable content just gets skipped.
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let relative = path
                .strip_prefix(root)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/");
            for (index, line) in content.lines().enumerate() {
                if pattern.is_match(line) {
                    matches.push(json!({
                        "file": relative,
                        "line": index + 1,
                        "content": line.trim_end(),
                    }));
                    if matches.len() >= max_results {
                        break 'files;
                    }
                }
            }
        }

        matches
    }
}

impl Default for SearchTextTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for SearchTextTool {
    fn name(&self) -> &str {
        "SearchText"
    }

    fn description(&self) -> &str {
        "Case-insensitive regex search over workspace files. Returns file, line number and matching line."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression to search for (case-insensitive)"
                },
                "maxResults": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (default 50)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let Some(pattern) = args["pattern"].as_str() else {
            return Ok(ToolOutcome::failure("InvalidArguments", "pattern is required"));
        };
        let max_results = args["maxResults"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS)
            .max(1);

        // Validate the regex up front so both backends agree on what counts
        // as a bad pattern.
        let compiled = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => regex,
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "InvalidRegex",
                    format!("invalid regex {pattern}: {err}"),
                ));
            }
        };

        let root = ctx.workspace.root().to_path_buf();

        let (matches, backend) = if let Some(rg) = &self.rg_path {
            match self.search_with_rg(rg, pattern, &root, max_results).await {
                Ok(matches) => (matches, "rg"),
                Err(err) => {
                    tracing::warn!(error = %err, "rg search failed, falling back to builtin walk");
                    let matches = tokio::task::spawn_blocking(move || {
                        Self::search_builtin(&compiled, &root, max_results)
                    })
                    .await
                    .unwrap_or_default();
                    (matches, "builtin")
                }
            }
        } else {
            let matches = tokio::task::spawn_blocking(move || {
                Self::search_builtin(&compiled, &root, max_results)
            })
            .await
            .unwrap_or_default();
            (matches, "builtin")
        };

        Ok(ToolOutcome::success(json!({
            "matches": matches,
            "count": matches.len(),
            "truncated": matches.len() >= max_results,
            "backend": backend,
        })))
    }
}
