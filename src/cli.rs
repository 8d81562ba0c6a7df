// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "miko",
    about = "Realtime character companion runtime",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the standard search paths)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start all processes and supervise them
    Launch,
    /// Run the main process (user WebSocket, character sessions)
    Main,
    /// Run the agent process (task dispatch, MCP aggregation)
    Agent,
}
