//! The `repoxy` binary: a read-only pull-through caching proxy for artifact
//! repositories.

mod config;
mod serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "repoxy", about = "A repository proxy", version)]
struct Cli {
    /// Log filter, e.g. `info` or `repoxy=debug` (overridden by RUST_LOG).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version and exit.
    Version,

    /// Start the repository proxy server.
    Serve {
        /// Path or glob of the configuration files.
        #[arg(long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let result = match cli.command {
        Commands::Version => {
            println!("repoxy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Serve { config } => serve::run(&config).await,
    };

    if let Err(error) = result {
        tracing::error!("{error:#}");
        std::process::exit(1);
    }
}

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
