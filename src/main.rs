//! Codewright - local coding assistant
//!
//! `codewright` drops into an interactive chat against the current
//! repository; `codewright serve` exposes the same loop over HTTP. Fatal
//! startup problems (unknown provider, missing API key, missing workspace,
//! invalid config) exit non-zero before any conversation starts.

use clap::Parser;
use codewright::cli::{chat, Cli, ChatArgs, Command};
use codewright::server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Local .env for developer workflows; the process environment still
    // takes precedence over .env values.
    let _ = dotenvy::dotenv();

    // Logs go to stderr so the conversation surface on stdout stays clean.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        None => chat::interactive(ChatArgs::default()).await,
        Some(Command::Chat(args)) => chat::interactive(args).await,
        Some(Command::Run(args)) => chat::run_once(args).await,
        Some(Command::Serve(args)) => server::serve(args).await,
    }
}
