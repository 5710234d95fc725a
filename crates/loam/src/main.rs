//! loam - inspect storage locations written by the loam runtime

mod cli;
mod commands;
mod output;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Command};

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let result = match &cli.command {
        Command::Status { dir } => commands::status::run(&cli, dir),
        Command::Log { dir, status } => commands::log::run(&cli, dir, status.as_deref()),
        Command::Export { dir, what, out } => commands::export::run(&cli, dir, *what, out),
    };

    if let Err(e) = result {
        output::Printer::new(&cli).error(&e);
        std::process::exit(e.exit_code());
    }
}
