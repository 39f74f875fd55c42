//! CLI command definitions and the interactive terminal surface

pub mod chat;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Codewright - local coding assistant
///
/// Runs an interactive chat against the current repository by default. Use
/// `serve` to expose the same loop over HTTP with a streamed event channel.
#[derive(Parser, Debug)]
#[command(name = "codewright")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive terminal chat (the default)
    Chat(ChatArgs),

    /// Run a single prompt and exit
    Run(RunArgs),

    /// Start the HTTP server
    Serve(ServeArgs),
}

#[derive(Parser, Debug, Default, Clone)]
pub struct ChatArgs {
    /// Workspace root (defaults to the current directory)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Provider: openai, anthropic, or openai-compatible
    #[arg(short, long, env = "CODEWRIGHT_PROVIDER")]
    pub provider: Option<String>,

    /// Model id (provider default when omitted)
    #[arg(short, long, env = "CODEWRIGHT_MODEL")]
    pub model: Option<String>,

    /// Skip all approval prompts
    #[arg(long)]
    pub auto_approve: bool,

    /// Maximum model/tool iterations per prompt
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Resume an existing session id
    #[arg(short, long)]
    pub session: Option<String>,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// The prompt to run
    pub prompt: String,

    #[command(flatten)]
    pub chat: ChatArgs,
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    pub port: u16,

    /// Hostname to bind to
    #[arg(long, default_value = "127.0.0.1")]
    pub hostname: String,
}
