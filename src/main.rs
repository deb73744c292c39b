//! Cohort CLI entry point.

use clap::Parser;

use cohort::cli::{commands, handle_error, Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Simulate(args) => commands::simulate::execute(args, cli.config, cli.json).await,
        Commands::Config(args) => commands::config::execute(args, cli.config, cli.json).await,
        Commands::Snapshot(args) => commands::snapshot::execute(args, cli.json).await,
    };

    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
