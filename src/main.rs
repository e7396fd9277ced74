//! cloudframe: UDP point-cloud frame receiver.
//!
//! Reassembles point-cloud frames that senders split across many UDP
//! datagrams and delivers each completed frame in order. Run
//! `cloudframe --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod capture;
mod cli;
mod config;
mod listen;
mod replay;
mod send;

use cli::{Cli, Commands};
use config::ReceiverConfig;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => ReceiverConfig::default(),
        _ if !cli.config.exists() => {
            eprintln!(
                "No '{}' found, using defaults (run `cloudframe init` to write one).",
                cli.config.display()
            );
            ReceiverConfig::default()
        }
        _ => ReceiverConfig::load(&cli.config)?,
    };

    let level = if config.debug_log { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .init();

    match cli.command {
        Commands::Init => {
            let example = ReceiverConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Listen { interval, port } => {
            listen::run(&config, interval, port)?;
        }
        Commands::Send {
            target,
            points,
            chunk_points,
            fps,
            frames,
            start_id,
            shuffle,
            duplicate_pct,
            json,
        } => {
            send::run(&send::SendOptions {
                target,
                points,
                chunk_points,
                fps,
                frames,
                start_id,
                shuffle,
                duplicate_pct,
                json,
            })?;
        }
        Commands::Replay { pcap, port, verbose } => {
            replay::run(&config, &pcap, port, verbose)?;
        }
    }

    Ok(())
}
