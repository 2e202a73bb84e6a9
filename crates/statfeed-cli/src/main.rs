use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use statfeed_store::{BatchStore, MemoryBatchStore, PgBatchStore};
use statfeed_sync::{load_feed_registry, Scheduler, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "statfeed")]
#[command(about = "Periodic ingestion of public statistics feeds into Postgres")]
struct Cli {
    /// Environment variable holding the Postgres connection string.
    #[arg(long, global = true, default_value = "DATABASE_URL")]
    dsn_env: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Schedule every feed and run until interrupted.
    Run {
        #[arg(long)]
        no_initial_run: bool,
    },
    /// Run every feed once and exit.
    Once {
        /// Write into an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    CheckConfig,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init()
    };
}

async fn connect_store(config: &SyncConfig) -> Result<PgBatchStore> {
    let store = PgBatchStore::connect(&config.store_config()).await?;
    store.ping().await.context("store unreachable at startup")?;
    info!(max_connections = config.db_max_connections, "connected to store");
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let config = SyncConfig::from_env_with_dsn_var(&cli.dsn_env);

    match cli.command.unwrap_or(Commands::Run {
        no_initial_run: false,
    }) {
        Commands::Run { no_initial_run } => {
            let store = Arc::new(connect_store(&config).await?);
            let scheduler = Scheduler::from_config(&config, Arc::clone(&store) as _).await?;
            info!(feeds = scheduler.runners().len(), "starting scheduler");
            scheduler.run_forever(!no_initial_run).await?;
            store.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Once { dry_run } => {
            let pg = if dry_run {
                None
            } else {
                Some(Arc::new(connect_store(&config).await?))
            };
            let store: Arc<dyn BatchStore> = match &pg {
                Some(pg) => Arc::clone(pg) as _,
                None => Arc::new(MemoryBatchStore::new()),
            };

            let scheduler = Scheduler::from_config(&config, store).await?;
            let results = scheduler.run_all_once().await;
            if let Some(pg) = pg {
                pg.close().await;
            }

            let mut failed = 0usize;
            for result in &results {
                match &result.error {
                    None => println!(
                        "{}: ok received={} written={}",
                        result.feed, result.received, result.written
                    ),
                    Some(err) => {
                        failed += 1;
                        println!(
                            "{}: failed kind={} error={err}",
                            result.feed,
                            result.error_kind.as_deref().unwrap_or("unknown")
                        );
                    }
                }
            }
            Ok(if failed == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::CheckConfig => {
            let feeds = load_feed_registry(&config.feeds_file).await?;
            for feed in &feeds {
                println!(
                    "{} -> {} ({}, {:?}, {})",
                    feed.name,
                    feed.table,
                    feed.policy.label(),
                    feed.shape,
                    feed.cadence
                );
            }
            println!("{} feeds ok", feeds.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}
