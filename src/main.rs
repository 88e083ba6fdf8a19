//! univrs-resource CLI - run store operations against a configured table

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use univrs_resource::{dispatch, Operation, ResourceStore, StoreConfig};

#[derive(Parser)]
#[command(name = "univrs-resource")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a JSON store configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database file (overrides the configured backend)
    #[arg(short, long = "db")]
    db_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the members of a collection
    List { collection: String },

    /// Show a single resource
    Get { path: String },

    /// Create a resource in a collection
    Create {
        collection: String,
        /// JSON object body, e.g. '{"name":"X","unique":"name"}'
        body: String,
    },

    /// Update attributes of a resource
    Update {
        path: String,
        /// JSON object body with the attributes to set
        body: String,
    },

    /// Delete a resource
    Delete { path: String },

    /// Create a collection's id counter ahead of first use
    Provision { collection: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(db_path) = cli.db_path {
        config = StoreConfig {
            backend: StoreConfig::sqlite(db_path).backend,
            ..config
        };
    }

    let store = ResourceStore::open(&config)
        .await
        .context("opening resource store")?;

    let output = match cli.command {
        Commands::List { collection } => {
            dispatch(&store, Operation::List, &collection, None).await?
        }
        Commands::Get { path } => dispatch(&store, Operation::Get, &path, None).await?,
        Commands::Create { collection, body } => {
            dispatch(&store, Operation::Create, &collection, Some(parse_body(&body)?)).await?
        }
        Commands::Update { path, body } => {
            dispatch(&store, Operation::Update, &path, Some(parse_body(&body)?)).await?
        }
        Commands::Delete { path } => dispatch(&store, Operation::Delete, &path, None).await?,
        Commands::Provision { collection } => {
            let created = store.provision(&collection).await?;
            serde_json::json!({ "collection": collection, "created": created })
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    store.close().await;
    Ok(())
}

fn parse_body(body: &str) -> Result<Value> {
    serde_json::from_str(body).context("body is not valid JSON")
}
