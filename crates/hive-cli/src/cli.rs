//! Clap CLI definitions for hive.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  hive config init              Write a default hive.toml
  hive start                    Run a node from hive.toml
  hive ping 10.0.0.7:7100 7     Round-trip a ping to node 7";

/// Hive: an actor-style RPC and messaging runtime.
#[derive(Parser)]
#[command(name = "hive", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a node until Ctrl+C.
    Start,
    /// Send pings to a remote node and report round-trip times.
    Ping {
        /// Address the remote node listens on.
        addr: String,
        /// Node id of the remote node.
        node_id: i64,
        /// Number of pings.
        #[arg(long, short = 'n', default_value_t = 3)]
        count: u32,
    },
    /// Inspect or create configuration.
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration.
    Show,
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}
