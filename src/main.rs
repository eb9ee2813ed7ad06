mod args;
mod commands;
mod gnss;
mod ntrip;
mod persist;
mod pipeline;
mod record;
mod shared;
mod witmotion;

use anyhow::Result;
use clap::Parser;

use args::{AppCommand, Cli};
use commands::{run_backup, run_gnss, run_imu, run_mode};

// Top-level entrypoint: parse CLI args and dispatch to a concrete command module.
fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        AppCommand::Imu(args) => run_imu(args),
        AppCommand::Gnss(args) => run_gnss(args),
        AppCommand::Run(args) => run_mode(args),
        AppCommand::Backup(args) => run_backup(args),
    }
}
