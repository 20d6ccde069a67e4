//! Persistent context CLI - inspect and maintain a context cache directory
//!
//! Opens the cache with the same configuration the plugin would use
//! (`CONTEXT_*` environment variables), runs one command and shuts down.

use clap::{Parser, Subcommand};
use persistent_context::{ContextCacheConfig, ContextError, ContextService, Result};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "persistent-context")]
#[command(about = "Inspect and maintain a persistent context cache")]
struct Cli {
    /// Cache directory (overrides CONTEXT_CACHE_DIR)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Entry count and disk usage
    Stats,
    /// List keys with their value kind and last access time
    List,
    /// Print a context's value as JSON
    Show { key: String },
    /// Delete a context
    Remove { key: String },
    /// Enforce the configured size ceilings now
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter =
        EnvFilter::from_default_env().add_directive("persistent_context=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let cli = Cli::parse();

    let mut config = ContextCacheConfig::from_env();
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }
    // Reads from the CLI must not rewrite entries behind the plugin's back
    config.auto_save = false;
    config.lazy_initialization = false;

    info!("Cache dir: {:?}", config.cache_dir);
    info!("Max cache size: {} MB", config.max_cache_size / (1024 * 1024));
    info!(
        "Absolute max cache size: {} MB",
        config.absolute_max_cache_size / (1024 * 1024)
    );

    let service = ContextService::new(config)?;
    let result = run(&service, cli.command).await;
    service.shutdown();
    result
}

async fn run(service: &ContextService, command: Command) -> Result<()> {
    let cache = service.cache()?;

    match command {
        Command::Stats => {
            print_json(&cache.stats())?;
        }
        Command::List => {
            for key in cache.keys() {
                let context = cache.get_context(&key)?;
                println!(
                    "{}\t{}\t{}",
                    key,
                    context.value_kind(),
                    context.last_access_time().to_rfc3339()
                );
            }
        }
        Command::Show { key } => {
            let context = cache.get_context(&key)?;
            print_json(&context.get_value())?;
        }
        Command::Remove { key } => {
            service.remove(&key)?;
            info!(key = %key, "Removed context");
        }
        Command::Cleanup => {
            let cache = cache.clone();
            let report = tokio::task::spawn_blocking(move || cache.run_cleanup())
                .await
                .map_err(|e| ContextError::Config(format!("Cleanup task failed: {}", e)))?;
            print_json(&report)?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ContextError::Config(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}
