//! Git tools: status and diff via the git binary

use std::path::Path;
use std::process::Stdio;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Tool, ToolContext, ToolOutcome};

async fn run_git(root: &Path, args: &[&str]) -> Result<(bool, String, String)> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    Ok((
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
    ))
}

pub struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "GitStatus"
    }

    fn description(&self) -> &str {
        "Show the current git branch and the list of changed files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(
        &self,
        _args: Value,
        ctx: &ToolContext,
        _cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let (ok, stdout, stderr) =
            match run_git(ctx.workspace.root(), &["status", "--porcelain", "-b"]).await {
                Ok(result) => result,
                Err(err) => {
                    return Ok(ToolOutcome::failure(
                        "GitError",
                        format!("failed to run git: {err}"),
                    ));
                }
            };

        if !ok {
            return Ok(ToolOutcome::failure("GitError", stderr.trim().to_string())
                .with_stderr(stderr));
        }

        let mut branch = String::new();
        let mut changes = Vec::new();
        for line in stdout.lines() {
            if let Some(rest) = line.strip_prefix("## ") {
                // "## main...origin/main [ahead 1]" -> "main"
                branch = rest
                    .split("...")
                    .next()
                    .unwrap_or(rest)
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string();
            } else if line.len() > 3 {
                changes.push(json!({
                    "status": line[..2].trim(),
                    "path": line[3..].trim(),
                }));
            }
        }

        let clean = changes.is_empty();
        Ok(ToolOutcome::success(json!({
            "branch": branch,
            "changes": changes,
            "clean": clean,
        }))
        .with_stdout(stdout))
    }
}

pub struct GitDiffTool;

#[async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "GitDiff"
    }

    fn description(&self) -> &str {
        "Show the git diff for the workspace, optionally staged only or limited to one file."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "staged": {
                    "type": "boolean",
                    "description": "Diff the index instead of the working tree"
                },
                "file": {
                    "type": "string",
                    "description": "Limit the diff to one workspace-relative file"
                }
            }
        })
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        _cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let staged = args["staged"].as_bool().unwrap_or(false);
        let file = args["file"].as_str().map(str::to_string);

        if let Some(file) = &file {
            if ctx.workspace.resolve(file).is_none() {
                return Ok(ToolOutcome::failure(
                    "UnsafePath",
                    format!("path is outside the workspace: {file}"),
                ));
            }
        }

        let mut git_args: Vec<&str> = vec!["diff"];
        if staged {
            git_args.push("--cached");
        }
        if let Some(file) = &file {
            git_args.push("--");
            git_args.push(file);
        }

        let (ok, stdout, stderr) = match run_git(ctx.workspace.root(), &git_args).await {
            Ok(result) => result,
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "GitError",
                    format!("failed to run git: {err}"),
                ));
            }
        };

        if !ok {
            return Ok(ToolOutcome::failure("GitError", stderr.trim().to_string())
                .with_stderr(stderr));
        }

        Ok(ToolOutcome::success(json!({
            "staged": staged,
            "file": file,
            "hasDiff": !stdout.trim().is_empty(),
            "diff": stdout,
        }))
        .with_stdout(stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::AutoDeny;
    use crate::workspace::Workspace;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> ToolContext {
        ToolContext {
            repo_root: dir.path().to_path_buf(),
            workspace: Workspace::new(dir.path()).unwrap(),
            approvals: Arc::new(AutoDeny),
        }
    }

    async fn git(dir: &TempDir, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir.path())
            .args(args)
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    async fn init_repo(dir: &TempDir) {
        git(dir, &["init", "-q", "-b", "main"]).await;
        git(dir, &["config", "user.email", "test@example.com"]).await;
        git(dir, &["config", "user.name", "Test"]).await;
    }

    #[tokio::test]
    async fn status_reports_branch_and_changes() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        std::fs::write(dir.path().join("new.txt"), "hi\n").unwrap();
        let ctx = context(&dir);

        let outcome = GitStatusTool
            .execute(json!({}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.ok);
        let data = outcome.data.unwrap();
        assert_eq!(data["branch"], "main");
        assert_eq!(data["clean"], false);
        assert_eq!(data["changes"][0]["path"], "new.txt");
    }

    #[tokio::test]
    async fn status_outside_a_repo_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = GitStatusTool
            .execute(json!({}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "GitError");
    }

    #[tokio::test]
    async fn diff_reports_modified_content() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        std::fs::write(dir.path().join("f.txt"), "one\n").unwrap();
        git(&dir, &["add", "."]).await;
        git(&dir, &["commit", "-q", "-m", "init"]).await;
        std::fs::write(dir.path().join("f.txt"), "two\n").unwrap();
        let ctx = context(&dir);

        let outcome = GitDiffTool
            .execute(json!({"file": "f.txt"}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.ok);
        let data = outcome.data.unwrap();
        assert_eq!(data["hasDiff"], true);
        assert!(data["diff"].as_str().unwrap().contains("+two"));
        assert!(outcome.stdout.unwrap().contains("+two"));
    }

    #[tokio::test]
    async fn diff_refuses_unsafe_file() {
        let dir = TempDir::new().unwrap();
        init_repo(&dir).await;
        let ctx = context(&dir);

        let outcome = GitDiffTool
            .execute(
                json!({"file": "../outside.txt"}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "UnsafePath");
    }
}
