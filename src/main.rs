// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sven_bootstrap::{AgentBuilder, App};
use sven_core::AgentEvent;
use sven_runtime::lsp::LspSupervisor;
use sven_runtime::permission::PermissionService;
use sven_runtime::store::InMemoryStore;

use cli::{Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(dir) = &cli.cwd {
        if let Err(e) = std::env::set_current_dir(dir) {
            eprintln!("sven: cannot change to {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    }

    init_logging(cli.debug);

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("sven: failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sven: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        None => launch_interactive_ui(),
        Some(Commands::Run { prompt, quiet }) => run_once(&cli, prompt, quiet).await,
    }
}

/// The interactive TUI is out of scope for this build; the CLI only needs
/// to dispatch to it, so the default command is a stub.
fn launch_interactive_ui() -> anyhow::Result<()> {
    eprintln!("sven: the interactive UI is not built into this binary; use `sven run <prompt>`.");
    Ok(())
}

async fn run_once(cli: &Cli, prompt_words: Vec<String>, quiet: bool) -> anyhow::Result<()> {
    let prompt = Cli::effective_run_prompt(&prompt_words);
    anyhow::ensure!(!prompt.trim().is_empty(), "no prompt given (pass words, or pipe one in on stdin)");

    let config = Arc::new(sven_config::load(None)?);

    let runtime_ctx = sven_bootstrap::auto_detect_runtime_context();

    let sessions = InMemoryStore::new();
    let messages = sessions.clone();
    let permissions = if cli.yolo {
        let svc = PermissionService::headless();
        svc.set_dangerous_mode(true);
        svc
    } else {
        PermissionService::headless()
    };

    let agent = AgentBuilder::new(config)
        .with_runtime_context(runtime_ctx)
        .build(sessions.clone(), messages.clone(), permissions.clone())?;

    let lsp = LspSupervisor::new();
    let (app, _ui_rx) = App::new(agent, lsp, sessions.clone(), messages, permissions);
    app.start_forwarding().await;

    if !quiet {
        eprintln!("sven: running…");
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let result = run_to_completion(&app, &session_id, &prompt, &sessions).await;

    app.shutdown().await;
    result
}

async fn run_to_completion(
    app: &App,
    session_id: &str,
    prompt: &str,
    sessions: &Arc<InMemoryStore>,
) -> anyhow::Result<()> {
    let mut rx = app.agent.run(session_id, prompt, vec![]).await?;

    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::Response { message_id, done } => {
                if done {
                    let msg = sven_runtime::store::MessageStore::get(&**sessions, &message_id).await?;
                    println!("{}", msg.text());
                    return Ok(());
                }
            }
            AgentEvent::Error { err } => anyhow::bail!(err),
            AgentEvent::Summarize { .. } => {}
        }
    }

    anyhow::bail!("agent run ended without a terminal event")
}

/// Logging bootstrap: `tracing`/`tracing-subscriber` with an `EnvFilter`.
/// Written to `SVEN_LOG_FILE` when set (so stderr stays free for an
/// interactive surface to own), otherwise to stderr directly — `run` has no
/// terminal UI competing for stderr, so this is safe for both commands.
fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("SVEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match std::env::var("SVEN_LOG_FILE") {
        Ok(path) => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                builder.with_writer(file).with_ansi(false).init();
                return;
            }
        }
        Err(_) => {}
    }
    builder.with_writer(std::io::stderr).init();
}
