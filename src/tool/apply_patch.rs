//! ApplyPatch tool
//!
//! Accepts either standard unified-diff text or a Begin Patch / Update File /
//! Add File / Delete File envelope. Application strategy: let `git apply`
//! take the whole patch when every target path is contained in the
//! workspace; when git refuses (or some paths are unsafe) fall back to an
//! in-process applier that works file by file, so one bad file-patch does
//! not sink the rest.

use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Diagnostic, RiskLevel, Tool, ToolContext, ToolOutcome, ToolPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub is_delete: bool,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    fn target(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }
}

/// `old_start` is the 1-based line number from a `@@` header; 0 means the
/// hunk carries no position and must be located by content.
#[derive(Debug, Clone, PartialEq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,
}

impl Hunk {
    fn new(old_start: usize) -> Self {
        Self {
            old_start,
            old_lines: Vec::new(),
            new_lines: Vec::new(),
        }
    }
}

pub fn parse_patch(text: &str) -> Vec<FilePatch> {
    if text.contains("Begin Patch") {
        parse_envelope(text)
    } else {
        parse_unified(text)
    }
}

/// Strip the `a/` / `b/` prefixes git puts on paths; `/dev/null` means the
/// file does not exist on that side.
fn parse_diff_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" || raw.is_empty() {
        return None;
    }
    let raw = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(raw.to_string())
}

fn parse_unified(text: &str) -> Vec<FilePatch> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut hunk: Option<Hunk> = None;

    fn flush_hunk(current: &mut Option<FilePatch>, hunk: &mut Option<Hunk>) {
        if let (Some(patch), Some(done)) = (current.as_mut(), hunk.take()) {
            patch.hunks.push(done);
        }
    }

    for line in text.lines() {
        if let Some(raw) = line.strip_prefix("--- ") {
            flush_hunk(&mut current, &mut hunk);
            if let Some(done) = current.take() {
                patches.push(done);
            }
            current = Some(FilePatch {
                old_path: parse_diff_path(raw),
                new_path: None,
                is_delete: false,
                hunks: Vec::new(),
            });
        } else if let Some(raw) = line.strip_prefix("+++ ") {
            if let Some(patch) = current.as_mut() {
                patch.new_path = parse_diff_path(raw);
                patch.is_delete = patch.new_path.is_none() && patch.old_path.is_some();
            }
        } else if let Some(header) = line.strip_prefix("@@") {
            flush_hunk(&mut current, &mut hunk);
            // "@@ -start,count +start,count @@"
            let old_start = header
                .split_whitespace()
                .find_map(|part| part.strip_prefix('-'))
                .and_then(|range| range.split(',').next())
                .and_then(|s| s.parse::<usize>().ok())
                .unwrap_or(1);
            hunk = Some(Hunk::new(old_start));
        } else if let Some(active) = hunk.as_mut() {
            if line.starts_with('\\') {
                // "\ No newline at end of file"
            } else if let Some(added) = line.strip_prefix('+') {
                active.new_lines.push(added.to_string());
            } else if let Some(removed) = line.strip_prefix('-') {
                active.old_lines.push(removed.to_string());
            } else {
                let context = line.strip_prefix(' ').unwrap_or(line);
                active.old_lines.push(context.to_string());
                active.new_lines.push(context.to_string());
            }
        }
    }

    flush_hunk(&mut current, &mut hunk);
    if let Some(done) = current.take() {
        patches.push(done);
    }
    patches.retain(|p| p.target().is_some());
    patches
}

fn envelope_directive<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let line = line.strip_prefix("*** ").unwrap_or(line);
    line.strip_prefix(name).map(str::trim)
}

fn parse_envelope(text: &str) -> Vec<FilePatch> {
    let mut patches: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut hunk: Option<Hunk> = None;

    fn flush(patches: &mut Vec<FilePatch>, current: &mut Option<FilePatch>, hunk: &mut Option<Hunk>) {
        if let (Some(patch), Some(done)) = (current.as_mut(), hunk.take()) {
            if !done.old_lines.is_empty() || !done.new_lines.is_empty() {
                patch.hunks.push(done);
            }
        }
        if let Some(done) = current.take() {
            patches.push(done);
        }
    }

    for line in text.lines() {
        let trimmed = line.trim_end();
        if envelope_directive(trimmed, "Begin Patch").is_some() {
            continue;
        }
        if envelope_directive(trimmed, "End Patch").is_some() {
            flush(&mut patches, &mut current, &mut hunk);
            break;
        }
        if let Some(path) = envelope_directive(trimmed, "Update File:") {
            flush(&mut patches, &mut current, &mut hunk);
            current = Some(FilePatch {
                old_path: Some(path.to_string()),
                new_path: Some(path.to_string()),
                is_delete: false,
                hunks: Vec::new(),
            });
        } else if let Some(path) = envelope_directive(trimmed, "Add File:") {
            flush(&mut patches, &mut current, &mut hunk);
            current = Some(FilePatch {
                old_path: None,
                new_path: Some(path.to_string()),
                is_delete: false,
                hunks: Vec::new(),
            });
        } else if let Some(path) = envelope_directive(trimmed, "Delete File:") {
            flush(&mut patches, &mut current, &mut hunk);
            current = Some(FilePatch {
                old_path: Some(path.to_string()),
                new_path: None,
                is_delete: true,
                hunks: Vec::new(),
            });
        } else if trimmed.starts_with("@@") {
            if let (Some(patch), Some(done)) = (current.as_mut(), hunk.take()) {
                patch.hunks.push(done);
            }
            hunk = Some(Hunk::new(0));
        } else if current.is_some() {
            let active = hunk.get_or_insert_with(|| Hunk::new(0));
            if let Some(added) = trimmed.strip_prefix('+') {
                active.new_lines.push(added.to_string());
            } else if let Some(removed) = trimmed.strip_prefix('-') {
                active.old_lines.push(removed.to_string());
            } else if let Some(context) = trimmed.strip_prefix(' ') {
                active.old_lines.push(context.to_string());
                active.new_lines.push(context.to_string());
            }
        }
    }

    flush(&mut patches, &mut current, &mut hunk);
    patches.retain(|p| p.target().is_some());
    patches
}

/// Apply one hunk to the line buffer. Hunks with a line number are applied
/// positionally without verifying context content; hunks without one are
/// located by matching their old lines.
fn apply_hunk(lines: &mut Vec<String>, hunk: &Hunk) -> std::result::Result<(), String> {
    if hunk.old_lines.is_empty() {
        let at = hunk.old_start.min(lines.len());
        lines.splice(at..at, hunk.new_lines.iter().cloned());
        return Ok(());
    }

    let at = if hunk.old_start > 0 {
        (hunk.old_start - 1).min(lines.len())
    } else {
        let needle: Vec<&str> = hunk.old_lines.iter().map(|l| l.trim()).collect();
        let mut found = None;
        if lines.len() >= needle.len() {
            for start in 0..=lines.len() - needle.len() {
                if lines[start..start + needle.len()]
                    .iter()
                    .map(|l| l.trim())
                    .eq(needle.iter().copied())
                {
                    found = Some(start);
                    break;
                }
            }
        }
        found.ok_or_else(|| "could not locate hunk context".to_string())?
    };

    let removed = hunk.old_lines.len().min(lines.len() - at);
    lines.splice(at..at + removed, hunk.new_lines.iter().cloned());
    Ok(())
}

fn apply_file_patch(root_relative: &Path, patch: &FilePatch) -> std::result::Result<(), String> {
    if patch.is_delete {
        if root_relative.exists() {
            std::fs::remove_file(root_relative).map_err(|e| e.to_string())?;
        }
        return Ok(());
    }

    if !root_relative.exists() || patch.old_path.is_none() {
        // New file: content is the added lines only.
        let mut content: Vec<String> = Vec::new();
        for hunk in &patch.hunks {
            content.extend(hunk.new_lines.iter().cloned());
        }
        if let Some(parent) = root_relative.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let mut body = content.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        std::fs::write(root_relative, body).map_err(|e| e.to_string())?;
        return Ok(());
    }

    let original = std::fs::read_to_string(root_relative).map_err(|e| e.to_string())?;
    let had_newline = original.ends_with('\n');
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();

    // Descending start order keeps earlier hunks' line numbers valid.
    let mut hunks: Vec<&Hunk> = patch.hunks.iter().collect();
    hunks.sort_by(|a, b| b.old_start.cmp(&a.old_start));
    for hunk in hunks {
        apply_hunk(&mut lines, hunk)?;
    }

    let mut body = lines.join("\n");
    if had_newline && !body.is_empty() {
        body.push('\n');
    }
    std::fs::write(root_relative, body).map_err(|e| e.to_string())?;
    Ok(())
}

async fn git_apply(root: &Path, patch_text: &str, check: bool) -> Result<bool> {
    let mut args = vec!["apply"];
    if check {
        args.push("--check");
    }
    args.push("-");

    let mut child = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(patch_text.as_bytes()).await?;
    }
    let status = child.wait().await?;
    Ok(status.success())
}

pub struct ApplyPatchTool;

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "ApplyPatch"
    }

    fn description(&self) -> &str {
        "Apply a unified diff (or Begin Patch envelope) to workspace files. Supports file creation, update and deletion."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "Unified diff text or a Begin Patch envelope"
                }
            },
            "required": ["patch"]
        })
    }

    fn policy(&self) -> ToolPolicy {
        ToolPolicy::mutating(RiskLevel::Medium)
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let Some(patch_text) = args["patch"].as_str() else {
            return Ok(ToolOutcome::failure("InvalidArguments", "patch is required"));
        };

        let patches = parse_patch(patch_text);
        if patches.is_empty() {
            return Ok(ToolOutcome::failure(
                "ParseError",
                "no file patches found in input",
            ));
        }

        let mut safe: Vec<(std::path::PathBuf, &FilePatch)> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        for patch in &patches {
            let target = patch.target().unwrap_or_default().to_string();
            match ctx.workspace.resolve(&target) {
                Some(resolved) => safe.push((resolved, patch)),
                None => failed.push((target, "path is outside the workspace".to_string())),
            }
        }

        let mut applied: Vec<String> = Vec::new();

        // Whole-patch git path only when every target is contained; otherwise
        // git would refuse the lot for one bad path.
        let git_done = if failed.is_empty() {
            match git_apply(ctx.workspace.root(), patch_text, true).await {
                Ok(true) => git_apply(ctx.workspace.root(), patch_text, false)
                    .await
                    .unwrap_or(false),
                _ => false,
            }
        } else {
            false
        };

        if git_done {
            applied = safe
                .iter()
                .map(|(_, p)| p.target().unwrap_or_default().to_string())
                .collect();
        } else {
            for (resolved, patch) in &safe {
                let target = patch.target().unwrap_or_default().to_string();
                match apply_file_patch(resolved, patch) {
                    Ok(()) => applied.push(target),
                    Err(reason) => failed.push((target, reason)),
                }
            }
        }

        let failed_patches: Vec<Value> = failed
            .iter()
            .map(|(path, reason)| json!({"path": path, "reason": reason}))
            .collect();
        let data = json!({
            "applied": applied,
            "failedPatches": failed_patches,
        });

        if applied.is_empty() {
            let summary = failed
                .iter()
                .map(|(path, reason)| format!("{path}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(
                ToolOutcome::failure("ApplyFailed", format!("no file patches applied: {summary}"))
                    .with_data(data),
            );
        }

        let mut outcome = ToolOutcome::success(data);
        if !failed.is_empty() {
            outcome = outcome.with_diagnostic(Diagnostic::new(
                "PartialApply",
                format!("{} of {} file patches applied", applied.len(), patches.len()),
            ));
        }
        Ok(outcome)
    }
}
