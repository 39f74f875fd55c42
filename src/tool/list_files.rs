//! ListFiles tool: glob-filtered listing of workspace files

use anyhow::Result;
use async_trait::async_trait;
use ignore::WalkBuilder;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{is_excluded_dir, Tool, ToolContext, ToolOutcome};

const MAX_RESULTS: usize = 500;

pub struct ListFilesTool;

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "ListFiles"
    }

    fn description(&self) -> &str {
        "List files under the workspace root matching a glob pattern (e.g. **/*.rs). Build output and VCS directories are skipped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern applied to workspace-relative paths (default **/*)"
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
        let pattern = args["pattern"].as_str().unwrap_or("**/*");
        let matcher = match glob::Pattern::new(pattern) {
            Ok(matcher) => matcher,
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "InvalidPattern",
                    format!("invalid glob pattern {pattern}: {err}"),
                ));
            }
        };

        let root = ctx.workspace.root().to_path_buf();
        // The walk is blocking filesystem work; hand it to the blocking pool.
        let result = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            let mut truncated = false;

            let walker = WalkBuilder::new(&root)
                .hidden(false)
                .git_ignore(false)
                .filter_entry(|entry| {
                    let name = entry.file_name().to_string_lossy();
                    !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                        && is_excluded_dir(&name))
                })
                .build();

            for entry in walker {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let relative = relative.to_string_lossy().replace('\\', "/");
                if !matcher.matches(&relative) {
                    continue;
                }
                if files.len() >= MAX_RESULTS {
                    truncated = true;
                    break;
                }
                files.push(relative);
            }

            files.sort();
            (files, truncated)
        })
        .await;

        let (files, truncated) = match result {
            Ok(listing) => listing,
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "ListFailed",
                    format!("directory walk failed: {err}"),
                ));
            }
        };

        Ok(ToolOutcome::success(json!({
            "files": files,
            "count": files.len(),
            "truncated": truncated,
        })))
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

    #[tokio::test]
    async fn lists_matching_files_with_forward_slashes() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
        std::fs::write(dir.path().join("src/deep/a.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();
        let ctx = context(&dir);

        let outcome = ListFilesTool
            .execute(json!({"pattern": "**/*.rs"}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.ok);
        let data = outcome.data.unwrap();
        let files: Vec<String> = serde_json::from_value(data["files"].clone()).unwrap();
        assert_eq!(files, vec!["src/b.rs", "src/deep/a.rs"]);
    }

    #[tokio::test]
    async fn skips_blacklisted_directories() {
        let dir = TempDir::new().unwrap();
        for hidden in ["node_modules", ".git", "bin", "obj"] {
            std::fs::create_dir_all(dir.path().join(hidden)).unwrap();
            std::fs::write(dir.path().join(hidden).join("x.js"), "").unwrap();
        }
        std::fs::write(dir.path().join("keep.js"), "").unwrap();
        let ctx = context(&dir);

        let outcome = ListFilesTool
            .execute(json!({}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        let data = outcome.data.unwrap();
        let files: Vec<String> = serde_json::from_value(data["files"].clone()).unwrap();
        assert_eq!(files, vec!["keep.js"]);
    }

    #[tokio::test]
    async fn caps_results_at_500() {
        let dir = TempDir::new().unwrap();
        for i in 0..520 {
            std::fs::write(dir.path().join(format!("f{i:04}.txt")), "").unwrap();
        }
        let ctx = context(&dir);

        let outcome = ListFilesTool
            .execute(json!({}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        let data = outcome.data.unwrap();
        assert_eq!(data["count"], 500);
        assert_eq!(data["truncated"], true);
    }

    #[tokio::test]
    async fn invalid_pattern_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = ListFilesTool
            .execute(json!({"pattern": "[unclosed"}), &ctx, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "InvalidPattern");
    }
}
