use std::process::ExitCode;

use clap::{Parser, Subcommand};

mod commands;
mod dotenv;

#[derive(Parser)]
#[command(name = "via", about = "Vector Incident Atlas - log intelligence daemon")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the VIA daemon (default)
    Serve(commands::serve::ServeArgs),
    /// Generate demo log traffic
    Demo(commands::demo::DemoArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::load(".env");

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or_default() {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Demo(args) => commands::demo::run(args).await,
    }
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Serve(commands::serve::ServeArgs::default())
    }
}
