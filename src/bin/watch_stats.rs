use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use watchlog::config;
use watchlog::db;

#[derive(Debug, Parser)]
#[command(author, version, about = "Print a summary of the imported watch history")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Number of channels to list
    #[arg(long, default_value = "10")]
    top: i64,

    /// Show the stored record for one video id
    #[arg(long)]
    video: Option<String>,
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

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| db::sqlite_url_for(&cfg.app.database_path()));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    if let Some(id) = args.video.as_deref() {
        let record = db::fetch_video(&pool, id)
            .await?
            .with_context(|| format!("video {id} is not in the store"))?;
        println!("id:        {}", record.id);
        println!("title:     {}", record.title.as_deref().unwrap_or("-"));
        println!("channel:   {}", record.channel_title.as_deref().unwrap_or("-"));
        println!("state:     {}", record.state.as_str());
        println!("duration:  {}", record.duration.as_deref().unwrap_or("-"));
        if let Some(views) = record.view_count {
            println!("views:     {views}");
        }
        if !record.tags.is_empty() {
            println!("tags:      {}", record.tags.join(", "));
        }
        println!("watched:   {} time(s)", record.timestamps.len());
        for ts in &record.timestamps {
            println!("  {ts}");
        }
        return Ok(());
    }

    let stats = db::store_stats(&pool).await?;
    println!("videos:              {}", stats.videos);
    println!("  enriched:          {}", stats.enriched);
    println!("  unenriched:        {}", stats.unenriched);
    println!("  unavailable:       {}", stats.unavailable);
    println!("watch timestamps:    {}", stats.timestamps);
    println!("unknown timestamps:  {}", stats.unknown_timestamps);

    let channels = db::top_channels(&pool, args.top).await?;
    if !channels.is_empty() {
        println!();
        println!("top channels:");
        for (channel, views) in channels {
            println!("  {views:>6}  {channel}");
        }
    }
    Ok(())
}
