//! Interactive chat loop and the one-shot `run` command

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{Agent, AgentOptions, AgentSink, ConsoleSink};
use crate::approval::TerminalApprover;
use crate::cli::{ChatArgs, RunArgs};
use crate::config::{resolve_provider, Config};
use crate::policy::DefaultPolicyEngine;
use crate::provider::{build_provider, ChatMessage};
use crate::session::{
    append_index_record, read_messages, session_log_path, SessionInfo, SessionLogger,
};
use crate::tool::{ToolContext, ToolRegistry};
use crate::workspace::Workspace;

const HELP: &str = "\
Commands:
  /help   show this help
  /exit   leave the session
  /quit   same as /exit
Anything else is sent to the model.";

struct ChatSession {
    agent: Agent,
    messages: Vec<ChatMessage>,
    session_id: String,
}

/// Wire up a terminal-backed session from CLI flags. Fatal configuration
/// problems (unknown provider, missing key, missing workspace) surface
/// here, before any prompt is read.
fn build_session(args: &ChatArgs) -> Result<ChatSession> {
    let workspace_root = match &args.workspace {
        Some(path) => std::fs::canonicalize(path)
            .with_context(|| format!("workspace {} not found", path.display()))?,
        None => std::env::current_dir()?,
    };

    let config = Config::load(&workspace_root)?;
    let resolved = resolve_provider(&config, args.provider.as_deref(), args.model.as_deref())?;
    let provider = build_provider(&resolved.provider, resolved.endpoint.as_deref())?;
    let workspace = Workspace::new(&workspace_root)?;

    let (session_id, messages, index_event) = match &args.session {
        Some(id) => {
            let log_path = session_log_path(&workspace_root, id);
            let messages = read_messages(&log_path, |line, warning| {
                tracing::warn!(line, warning, "skipping session log line");
            })?;
            println!("[resumed session {id} with {} messages]", messages.len());
            (id.clone(), messages, "resumed")
        }
        None => (Uuid::new_v4().to_string(), Vec::new(), "created"),
    };

    let logger = Arc::new(SessionLogger::open(session_log_path(
        &workspace_root,
        &session_id,
    ))?);
    let info = SessionInfo {
        id: session_id.clone(),
        workspace_root: workspace_root.clone(),
        provider: resolved.provider.clone(),
        model: resolved.model.clone(),
        created_at: Utc::now(),
    };
    append_index_record(&workspace_root, &info, index_event)?;
    logger.log_session_start(&info);

    let mut options = AgentOptions::new(workspace_root.clone(), resolved.model);
    if let Some(max_iterations) = args.max_iterations {
        options.max_iterations = max_iterations;
    }

    let ctx = ToolContext {
        repo_root: workspace_root,
        workspace,
        approvals: Arc::new(TerminalApprover),
    };
    let sink: Arc<dyn AgentSink> = Arc::new(ConsoleSink);
    let agent = Agent::new(
        options,
        provider,
        ToolRegistry::with_defaults(),
        Arc::new(DefaultPolicyEngine::new(args.auto_approve)),
        logger,
        sink,
        ctx,
    );

    Ok(ChatSession {
        agent,
        messages,
        session_id,
    })
}

/// Run one prompt with ctrl-c wired to cooperative cancellation.
async fn run_prompt(session: &mut ChatSession, prompt: &str) {
    let cancel = CancellationToken::new();
    let run = session.agent.run(prompt, &mut session.messages, cancel.clone());
    tokio::pin!(run);

    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            run.await
        }
    };

    if let Err(err) = result {
        println!("\n[Error] {err}");
    }
}

/// Interactive line-based session.
pub async fn interactive(args: ChatArgs) -> Result<()> {
    let mut session = build_session(&args)?;
    println!("codewright session {} - /help for commands", session.session_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "/exit" | "/quit" => break,
            "/help" => {
                println!("{HELP}");
                continue;
            }
            prompt => run_prompt(&mut session, prompt).await,
        }
    }

    Ok(())
}

/// One prompt, then exit.
pub async fn run_once(args: RunArgs) -> Result<()> {
    let mut session = build_session(&args.chat)?;
    run_prompt(&mut session, &args.prompt).await;
    Ok(())
}
