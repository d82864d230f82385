//! CLI interface for Warden
//!
//! Command-line interface using clap's derive API. The CLI is a thin layer:
//! every command maps onto one handler in [`crate::handlers`].

use crate::config::StrategyKind;
use clap::{Parser, Subcommand};
use sdk::types::{Capability, Priority};
use std::path::PathBuf;

/// Warden security-assessment orchestrator
///
/// Plans multi-step assessments against a host, URL, domain, or file, picks
/// a tool for each step, and runs the external tools under strict timeouts.
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by `run` and `plan`
#[derive(clap::Args, Debug, Clone)]
pub struct RequestArgs {
    /// Free-form request, e.g. "pentest" or "scan the network"
    pub request: String,

    /// Host, URL, or absolute file path to assess
    #[arg(short, long)]
    pub target: String,

    /// Restrict the plan to these capabilities (repeatable)
    #[arg(long = "capability", value_name = "CAPABILITY")]
    pub capabilities: Vec<Capability>,

    /// Override the request priority (low, medium, high, critical)
    #[arg(long)]
    pub priority: Option<Priority>,

    /// Force a strategy for every step (fuzzy, evolutionary, q_learning)
    #[arg(long)]
    pub strategy: Option<StrategyKind>,

    /// Step option as key=value; prefix the key with a tool name to scope it
    #[arg(short = 'o', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Per-step timeout in seconds, capped at each tool's ceiling
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan and execute an assessment
    Run {
        #[command(flatten)]
        args: RequestArgs,

        /// Maximum concurrent tool invocations
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Print the plan for a request without executing it
    Plan {
        #[command(flatten)]
        args: RequestArgs,
    },

    /// Show tool availability per capability
    Health {
        /// Only this capability
        #[arg(long)]
        capability: Option<Capability>,
    },

    /// List registered tool adapters
    Tools,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Print the configuration file location
    Path,
}
