//! swarmkit CLI binary entry point.

use clap::Parser;
use swarmkit::cli::{commands, Cli, Commands};
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "SWARMKIT_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Tools(args) => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::handle_tools(&config, args.collision.into()).await
        }
        Commands::Call(args) => {
            let config = commands::load_config(cli.config.as_deref())?;
            commands::handle_call(&config, args.collision.into(), &args.tool, &args.args).await
        }
        Commands::Citations(args) => {
            commands::handle_citations(args.dir.as_deref(), args.thread.as_deref())
        }
    }
}
