// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Command-line surface: a default command that launches the
//! interactive UI (out of scope for this build — see `main::launch_interactive_ui`)
//! plus one `run` sub-command for non-interactive use.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "sven",
    version,
    about = "A terminal coding assistant's agent execution engine"
)]
pub struct Cli {
    /// Working directory to run in (defaults to the current directory)
    #[arg(short = 'c', long = "cwd", global = true, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Dangerous mode: auto-approve every tool call without prompting
    #[arg(short = 'y', long = "yolo", global = true)]
    pub yolo: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single prompt non-interactively and exit
    Run {
        /// The prompt text. When stdin is piped, its contents are prepended.
        prompt: Vec<String>,

        /// Suppress the progress spinner
        #[arg(short = 'q', long = "quiet")]
        quiet: bool,
    },
}

impl Cli {
    /// Reads stdin and prepends it to the given prompt words when stdin is
    /// not a TTY (i.e. piped in). Returns the effective prompt text.
    pub fn effective_run_prompt(words: &[String]) -> String {
        let typed = words.join(" ");
        if is_stdin_piped() {
            let mut piped = String::new();
            use std::io::Read;
            if std::io::stdin().read_to_string(&mut piped).is_ok() && !piped.trim().is_empty() {
                if typed.is_empty() {
                    return piped;
                }
                return format!("{piped}\n\n{typed}");
            }
        }
        typed
    }
}

fn is_stdin_piped() -> bool {
    use std::io::IsTerminal;
    !std::io::stdin().is_terminal()
}
