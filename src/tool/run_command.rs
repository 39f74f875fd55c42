//! RunCommand tool: subprocess execution with scrubbed environment
//!
//! Secrets are stripped from the child environment by variable-name
//! fragment before launch. Output capture is concurrent and capped on both
//! streams; a timed-out or cancelled process is killed rather than awaited.

use std::process::Stdio;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use super::{RiskLevel, Tool, ToolContext, ToolOutcome, ToolPolicy};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_CAPTURE_CHARS: usize = 50_000;

/// Variable-name fragments that mark an environment variable as secret.
const SECRET_ENV_FRAGMENTS: &[&str] = &[
    "API_KEY",
    "SECRET",
    "PASSWORD",
    "TOKEN",
    "CREDENTIAL",
    "PRIVATE_KEY",
    "AUTH",
];

fn is_secret_env_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_ENV_FRAGMENTS.iter().any(|f| upper.contains(f))
}

/// SIGKILL the command's whole process group. The child is spawned into its
/// own group, so this takes down grandchildren too, not just the direct
/// process.
#[cfg(unix)]
fn kill_process_tree(pgid: Option<i32>) {
    if let Some(pgid) = pgid {
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_tree(_pgid: Option<i32>) {}

/// Drain a pipe fully, keeping at most `MAX_CAPTURE_CHARS` characters.
async fn read_capped(mut reader: impl AsyncRead + Unpin) -> (String, bool) {
    let mut captured = String::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if captured.len() < MAX_CAPTURE_CHARS {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    let room = MAX_CAPTURE_CHARS - captured.len();
                    if chunk.len() > room {
                        captured.extend(chunk.chars().take(room));
                        truncated = true;
                    } else {
                        captured.push_str(&chunk);
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    (captured, truncated)
}

pub struct RunCommandTool;

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "RunCommand"
    }

    fn description(&self) -> &str {
        "Run a program with arguments inside the workspace. Secret-looking environment variables are removed before launch."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "exe": {
                    "type": "string",
                    "description": "Executable to run"
                },
                "args": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Arguments to pass"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory relative to the workspace root"
                },
                "timeoutSec": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 60)"
                }
            },
            "required": ["exe"]
        })
    }

    fn policy(&self) -> ToolPolicy {
        ToolPolicy::mutating(RiskLevel::High)
    }

    async fn execute(
        &self,
        args: Value,
        ctx: &ToolContext,
        cancel: CancellationToken,
    ) -> Result<ToolOutcome> {
        let Some(exe) = args["exe"].as_str() else {
            return Ok(ToolOutcome::failure("InvalidArguments", "exe is required"));
        };
        let argv: Vec<String> = args["args"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let timeout_secs = args["timeoutSec"].as_u64().unwrap_or(DEFAULT_TIMEOUT_SECS);

        let cwd = match args["cwd"].as_str() {
            Some(dir) => match ctx.workspace.resolve(dir) {
                Some(resolved) => resolved,
                None => {
                    return Ok(ToolOutcome::failure(
                        "UnsafePath",
                        format!("cwd is outside the workspace: {dir}"),
                    ));
                }
            },
            None => ctx.workspace.root().to_path_buf(),
        };

        let command_line = std::iter::once(exe.to_string())
            .chain(argv.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(exe);
        cmd.args(&argv)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group on Unix so a timeout can take the whole tree
        // down, not just the direct child.
        #[cfg(unix)]
        cmd.process_group(0);
        for (name, _) in std::env::vars_os() {
            if is_secret_env_name(&name.to_string_lossy()) {
                cmd.env_remove(&name);
            }
        }

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "SpawnFailed",
                    format!("failed to start {exe}: {err}"),
                ));
            }
        };

        // With process_group(0) the child's pid doubles as the group id.
        let pgid = child.id().map(|id| id as i32);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // The child is owned by this future; dropping it on timeout or
        // cancellation kills the process via kill_on_drop.
        let wait = async move {
            let ((stdout, stdout_truncated), (stderr, stderr_truncated)) = tokio::join!(
                async {
                    match stdout {
                        Some(out) => read_capped(out).await,
                        None => (String::new(), false),
                    }
                },
                async {
                    match stderr {
                        Some(err) => read_capped(err).await,
                        None => (String::new(), false),
                    }
                },
            );
            let status = child.wait().await;
            (status, stdout, stdout_truncated, stderr, stderr_truncated)
        };
        tokio::pin!(wait);

        let waited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = timeout(Duration::from_secs(timeout_secs), &mut wait) => Some(result),
        };

        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, stdout, stdout_truncated, stderr, stderr_truncated) = match waited {
            None => {
                kill_process_tree(pgid);
                return Ok(ToolOutcome::failure(
                    "Cancelled",
                    format!("{exe} cancelled after {duration_ms}ms"),
                ));
            }
            Some(Err(_)) => {
                kill_process_tree(pgid);
                return Ok(ToolOutcome::failure(
                    "Timeout",
                    format!("{exe} timed out after {timeout_secs}s"),
                )
                .with_data(json!({
                    "command": command_line,
                    "durationMs": duration_ms,
                })));
            }
            Some(Ok(result)) => result,
        };

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(err) => {
                return Ok(ToolOutcome::failure(
                    "WaitFailed",
                    format!("failed to wait for {exe}: {err}"),
                ));
            }
        };

        let data = json!({
            "command": command_line,
            "exitCode": exit_code,
            "durationMs": duration_ms,
            "stdoutTruncated": stdout_truncated,
            "stderrTruncated": stderr_truncated,
        });

        let outcome = if exit_code == 0 {
            ToolOutcome::success(data)
        } else {
            ToolOutcome::failure(
                "ExitCode",
                format!("{exe} exited with code {exit_code}"),
            )
            .with_data(data)
        };

        Ok(outcome.with_stdout(stdout).with_stderr(stderr))
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

    #[test]
    fn secret_env_names_are_detected() {
        assert!(is_secret_env_name("OPENAI_API_KEY"));
        assert!(is_secret_env_name("my_github_token"));
        assert!(is_secret_env_name("DB_PASSWORD"));
        assert!(is_secret_env_name("AWS_SECRET_ACCESS_KEY"));
        assert!(is_secret_env_name("OAUTH_THING"));
        assert!(!is_secret_env_name("PATH"));
        assert!(!is_secret_env_name("HOME"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = RunCommandTool
            .execute(
                json!({"exe": "sh", "args": ["-c", "echo out; echo err >&2"]}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.ok);
        assert_eq!(outcome.stdout.as_deref(), Some("out\n"));
        assert_eq!(outcome.stderr.as_deref(), Some("err\n"));
        assert_eq!(outcome.data.unwrap()["exitCode"], 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_exit_code_diagnostic() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = RunCommandTool
            .execute(
                json!({"exe": "sh", "args": ["-c", "exit 3"]}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "ExitCode");
        assert_eq!(outcome.data.unwrap()["exitCode"], 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn times_out_and_reports_it() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = RunCommandTool
            .execute(
                json!({"exe": "sh", "args": ["-c", "sleep 2"], "timeoutSec": 1}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert!(outcome
            .first_diagnostic()
            .unwrap()
            .contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_whole_process_tree() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let marker = dir.path().join("marker.txt");

        // The backgrounded subshell would write the marker at t=2s; the
        // group kill at t=1s must reach it, not just the direct sh.
        let script = format!("(sleep 2; echo late > {}) & sleep 30", marker.display());
        let outcome = RunCommandTool
            .execute(
                json!({"exe": "sh", "args": ["-c", script], "timeoutSec": 1}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert!(outcome.first_diagnostic().unwrap().contains("timed out"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!marker.exists(), "grandchild survived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = RunCommandTool
            .execute(
                json!({"exe": "sh", "args": ["-c", "sleep 30"]}),
                &ctx,
                cancel,
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "Cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secret_environment_is_scrubbed() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        std::env::set_var("CODEWRIGHT_TEST_TOKEN", "hunter2");

        let outcome = RunCommandTool
            .execute(
                json!({"exe": "sh", "args": ["-c", "echo ${CODEWRIGHT_TEST_TOKEN:-scrubbed}"]}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        std::env::remove_var("CODEWRIGHT_TEST_TOKEN");
        assert_eq!(outcome.stdout.as_deref(), Some("scrubbed\n"));
    }

    #[tokio::test]
    async fn unsafe_cwd_is_refused() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = RunCommandTool
            .execute(
                json!({"exe": "true", "cwd": "../somewhere"}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "UnsafePath");
    }

    #[tokio::test]
    async fn missing_executable_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        let outcome = RunCommandTool
            .execute(
                json!({"exe": "definitely-not-a-real-binary-1234"}),
                &ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.ok);
        assert_eq!(outcome.diagnostics[0].code, "SpawnFailed");
    }
}
