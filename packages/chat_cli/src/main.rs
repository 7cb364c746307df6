use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, warn};
use tracing_subscriber::prelude::*;

mod config;
mod shell;

use crate::config::{FileConfig, Settings};

#[derive(Parser)]
#[command(name = "chat")]
#[command(about = "Terminal client for a WebSocket chat room")]
struct Cli {
    /// Chat server endpoint (ws:// or wss://)
    #[arg(short, long)]
    server: Option<String>,

    /// Username to join as (prompted for when not configured)
    #[arg(short, long)]
    username: Option<String>,

    /// Config file (defaults to <config dir>/chat/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also pass the username as a ?username= query parameter
    #[arg(long)]
    username_in_url: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they don't interleave with the rendered chat
    let default_directive = if cli.debug {
        "chat_cli=debug,chat_session=debug,info"
    } else {
        "chat_cli=info,chat_session=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();

    let path = config::config_path(cli.config.as_deref());
    if let (Some(explicit), Some(path)) = (&cli.config, &path) {
        if !path.exists() {
            warn!(path = %explicit.display(), "config file not found, using defaults");
        }
    }
    let fc: FileConfig = config::load_config(path.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let mut settings = Settings::from_file(&fc);

    // CLI flags override file and env
    if let Some(server) = cli.server {
        settings.server_url = server;
    }
    if cli.username_in_url {
        settings.session.username_in_url = true;
    }
    if let Some(username) = cli.username {
        settings.username = Some(username);
    }
    debug!(?settings, "resolved settings");

    let username = match settings.username.clone() {
        Some(username) => username,
        None => prompt_username()?,
    };

    shell::run(settings, username).await
}

/// Ask on the terminal until a non-blank name is given.
fn prompt_username() -> Result<String> {
    let stdin = io::stdin();
    loop {
        print!("username: ");
        io::stdout().flush()?;
        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            bail!("no username given");
        }
        let name = input.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
        println!("username must not be empty");
    }
}
