//! hive: run, ping and configure hive nodes.

mod cli;
mod cmd;
mod sys;

use crate::cli::{Cli, Commands, ConfigCommands};
use clap::Parser;
use hive_types::load_config;

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let result = match cli.command {
        Commands::Config(ConfigCommands::Init { force }) => {
            cmd::config_init(cli.config.as_deref(), force).map(|path| {
                println!("Wrote {}", path.display());
            })
        }
        Commands::Config(ConfigCommands::Show) => {
            cmd::config_show(&load_config(cli.config.as_deref()))
        }
        Commands::Start => run(cmd::start(load_config(cli.config.as_deref()))),
        Commands::Ping {
            addr,
            node_id,
            count,
        } => run(cmd::ping(
            load_config(cli.config.as_deref()),
            addr,
            node_id,
            count,
        )),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run<F>(fut: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(fut)
}
