// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser, Debug)]
#[command(
    name = "quorum",
    version,
    about = "Multi-agent orchestration server",
    long_about = "Supervises agent sub-processes and routes messages to them from the \
                  local web UI, the on-chain chat, webhooks, and Slack; drives councils, \
                  workflows, and schedules."
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective merged configuration and exit
    ShowConfig,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
