use anyhow::{anyhow, Result};
use clap::Parser;
use mailsync::remote::MailingApi;
use mailsync::{config, db, synchronizer};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Show what the remote side holds for a mailing list")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Local mailing list id
    #[arg(long)]
    list: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.app.database_url()).await?;
    db::run_migrations(&pool).await?;

    let list = db::fetch_mailing_list(&pool, args.list).await?;
    let (remote_list_id, api_key) = list
        .remote()
        .ok_or_else(|| anyhow!("list {} has no remote credentials", list.id))?;
    let client = synchronizer::client_for(&cfg, remote_list_id, api_key)?;
    let api = client.api();

    println!("Remote list: {}", remote_list_id);
    println!("Merge fields:");
    for field in api.fetch_fields().await? {
        println!("  {} -> {{ id: {}, name: {} }}", field.tag, field.id, field.name);
    }
    println!("Segments:");
    for segment in api.fetch_segments().await? {
        println!("  {} -> {}", segment.id, segment.name);
    }
    let page = api.fetch_members_page(0, 1).await?;
    println!("Members: {}", page.total_items);
    Ok(())
}
