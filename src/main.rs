// ABOUTME: CLI entry point for table-sync
// ABOUTME: Parses commands and routes to the list and run handlers

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use table_sync::commands;
use table_sync::registry::Operation;

#[derive(Parser)]
#[command(name = "table-sync")]
#[command(about = "Keep PostgreSQL tables in sync across connections", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the TOML file describing connections and links
    #[arg(long, global = true, env = "TABLE_SYNC_CONFIG", default_value = "table-sync.toml")]
    config: PathBuf,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured links
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Bring links up to date using the cheapest applicable strategy
    Update {
        /// Links to run (default: all)
        links: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Drop and rebuild destination tables
    Droppy {
        links: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Upsert changed rows and delete rows missing from the source
    Diffy {
        links: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete (or flag) destination rows missing from the source
    FindDeletes {
        links: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log; stdout is reserved for command output
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    table_sync::postgres::init_tls_policy(cli.allow_self_signed_certs);

    let (operation, links, json) = match cli.command {
        Commands::List { json } => return commands::list(&cli.config, json).await,
        Commands::Update { links, json } => (Operation::Update, links, json),
        Commands::Droppy { links, json } => (Operation::Droppy, links, json),
        Commands::Diffy { links, json } => (Operation::Diffy, links, json),
        Commands::FindDeletes { links, json } => (Operation::FindDeletes, links, json),
    };

    commands::run(&cli.config, operation, &links, json).await
}
