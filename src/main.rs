use anyhow::{bail, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use mailsync::{config, db, synchronize_list, SyncError};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Mailing list id to synchronize (repeatable)
    #[arg(long = "list", conflicts_with = "all")]
    lists: Vec<i64>,

    /// Synchronize every list that has remote credentials
    #[arg(long)]
    all: bool,

    /// Clear the in-progress flag left by a crashed run instead of syncing
    #[arg(long)]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let list_ids: Vec<i64> = if args.all {
        db::list_remote_mailing_lists(&pool)
            .await?
            .into_iter()
            .map(|list| list.id)
            .collect()
    } else {
        args.lists
    };
    if list_ids.is_empty() {
        bail!("nothing to do: pass --list <id> or --all");
    }

    if args.reset {
        for list_id in list_ids {
            let cleared = db::reset_syncing(&pool, list_id).await?;
            println!(
                "list {list_id}: {}",
                if cleared { "flag cleared" } else { "not syncing" }
            );
        }
        return Ok(());
    }

    info!(lists = list_ids.len(), "starting synchronization");
    let concurrency = cfg.sync.concurrency.max(1);
    let failures = stream::iter(list_ids)
        .map(|list_id| {
            let pool = &pool;
            let cfg = &cfg;
            async move { (list_id, synchronize_list(pool, cfg, list_id).await) }
        })
        .buffer_unordered(concurrency)
        .fold(0usize, |failures, (list_id, outcome)| async move {
            match outcome {
                Ok(result) => {
                    println!("list {list_id}: {}", result.status());
                    failures
                }
                Err(SyncError::AlreadySyncing(_)) => {
                    info!(list_id, "skipped, already syncing");
                    failures
                }
                Err(err) => {
                    error!(list_id, %err, "synchronization failed");
                    failures + 1
                }
            }
        })
        .await;

    if failures > 0 {
        bail!("{failures} list(s) failed to synchronize");
    }
    Ok(())
}
