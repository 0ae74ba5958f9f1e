use std::path::PathBuf;
use std::sync::Arc;

use agrofund_core::CatalogStats;
use agrofund_guard::{SecurityConfig, SecurityGuard};
use agrofund_storage::{read_merge_stats, ResponseCache};
use agrofund_sync::{RefreshPipeline, RefreshSummary, SyncConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "agrofund")]
#[command(about = "Agricultural funding opportunities catalog")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and merge into the catalog.
    Sync,
    /// Keep refreshing on the configured interval until interrupted.
    Schedule,
    /// Serve the HTTP API.
    Serve,
    /// Merge a local CSV or JSON file into the catalog.
    Import { path: PathBuf },
    /// Print catalog statistics and the last merge summary.
    Stats,
    /// Drop expired cache entries, or every entry with --all.
    CacheCleanup {
        #[arg(long)]
        all: bool,
    },
    /// List active IP blocks, optionally pruning expired ones first.
    Blocks {
        #[arg(long)]
        cleanup: bool,
    },
    /// Block an address by hand.
    Block {
        ip: String,
        #[arg(long, default_value = "manual block")]
        reason: String,
        /// Defaults to AGROFUND_BLOCK_HOURS; very long blocks are capped.
        #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
        hours: Option<i64>,
    },
    /// Lift a block.
    Unblock { ip: String },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

fn print_summary(label: &str, summary: &RefreshSummary) {
    println!(
        "{label} complete: run_id={} added={} duplicates={} rejected={} total={} persisted={}",
        summary.run_id, summary.added, summary.duplicates, summary.rejected, summary.total, summary.persisted
    );
    for source in &summary.sources {
        match &source.error {
            Some(err) => println!("  {}: failed ({err})", source.source_id),
            None => println!(
                "  {}: fetched={} accepted={} rejected={}",
                source.source_id, source.fetched, source.accepted, source.rejected
            ),
        }
    }
    if let Some(backup) = &summary.backup_path {
        println!("  backup: {backup}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = agrofund_sync::run_refresh_once_from_env().await?;
            print_summary("sync", &summary);
        }
        Commands::Schedule => {
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(RefreshPipeline::new(config)?);
            let summary = pipeline.run_once().await?;
            print_summary("initial sync", &summary);

            let Some(mut sched) = RefreshPipeline::maybe_build_scheduler(Arc::clone(&pipeline)).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            agrofund_web::serve_from_env().await?;
        }
        Commands::Import { path } => {
            let pipeline = RefreshPipeline::new(SyncConfig::from_env())?;
            let summary = pipeline.import_file(&path).await?;
            print_summary("import", &summary);
        }
        Commands::Stats => {
            let config = SyncConfig::from_env();
            let pipeline = RefreshPipeline::new(config.clone())?;
            let stats = CatalogStats::from_records(&pipeline.store().load().await);
            println!("{}", serde_json::to_string_pretty(&stats)?);
            if let Some(last) = read_merge_stats(&config.stats_path).await {
                println!("{}", serde_json::to_string_pretty(&last)?);
            }
        }
        Commands::CacheCleanup { all } => {
            let cache = ResponseCache::new(SyncConfig::from_env().cache_dir);
            let removed = if all {
                cache.clear(None).await
            } else {
                cache.cleanup_expired().await
            };
            println!("removed {removed} cache entries");
        }
        Commands::Blocks { cleanup } => {
            let guard = SecurityGuard::new(SecurityConfig::from_env());
            if cleanup {
                let removed = guard.cleanup_expired_blocks().await?;
                println!("removed {removed} expired blocks");
            }
            for block in guard.active_blocks().await? {
                println!("{}\tuntil {}\t{}", block.ip, block.expires_at, block.reason);
            }
        }
        Commands::Block { ip, reason, hours } => {
            let guard = SecurityGuard::new(SecurityConfig::from_env());
            let hours = hours.unwrap_or(guard.config().block_duration_hours);
            let block = guard.block_ip(&ip, &reason, hours).await?;
            println!("blocked {} until {}", block.ip, block.expires_at);
        }
        Commands::Unblock { ip } => {
            let guard = SecurityGuard::new(SecurityConfig::from_env());
            if guard.unblock_ip(&ip).await? {
                println!("unblocked {ip}");
            } else {
                println!("{ip} was not blocked");
            }
        }
    }

    Ok(())
}
