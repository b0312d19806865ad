use anyhow::Result;
use clap::Parser;
use mailsync::{config, db};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Print the last synchronization result of each mailing list")]
struct Args {
    /// Path to YAML config file (reads only `app`)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only show this list
    #[arg(long)]
    list: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let lists = match args.list {
        Some(id) => vec![db::fetch_mailing_list(&pool, id).await?],
        None => db::list_mailing_lists(&pool).await?,
    };

    for list in lists {
        let synced = list
            .last_synced_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        let flag = if list.syncing { " (syncing)" } else { "" };
        match &list.sync_result {
            Some(result) => {
                println!(
                    "#{} {}: {} [{}] last synced {}{}",
                    list.id,
                    list.name,
                    result.status(),
                    result.badge().as_str(),
                    synced,
                    flag
                );
                for (kind, outcome) in result.outcomes() {
                    let counts = outcome.counts();
                    println!(
                        "  {:<16} {:?} ok={} unfinished={} failed={} total={}",
                        kind.as_str(),
                        outcome.state(),
                        outcome.success_count(),
                        outcome.partial_count(),
                        outcome.failed_count(),
                        counts.total
                    );
                }
                if let Some(exception) = result.exception() {
                    println!("  error: {exception}");
                }
            }
            None => println!("#{} {}: no result, last synced {}{}", list.id, list.name, synced, flag),
        }
    }
    Ok(())
}
