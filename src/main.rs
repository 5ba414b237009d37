use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use watchlog::config;
use watchlog::db;
use watchlog::pipeline::{self, RunOptions, RunStatus};
use watchlog::youtube::YoutubeClient;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Import YouTube watch history from Takeout exports and enrich it with video metadata"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Export file or directory to import (overrides takeout.path)
    #[arg(long)]
    takeout: Option<PathBuf>,
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

    let data_dir = PathBuf::from(cfg.app.resolved_data_dir());
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| db::sqlite_url_for(&cfg.app.database_path()));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let takeout_path = args
        .takeout
        .unwrap_or_else(|| PathBuf::from(&cfg.takeout.path));
    let client = YoutubeClient::from_config(&cfg)?;
    let options = RunOptions::from_config(&cfg);
    let summary = pipeline::import(&pool, &takeout_path, &client, &options).await?;

    for (path, reason) in &summary.failed_documents {
        warn!(file = %path.display(), %reason, "skipped export document");
    }

    if let Some(path) = pipeline::write_parse_failures(&data_dir, &summary.parse_failures).await? {
        warn!(
            count = summary.parse_failures.len(),
            file = %path.display(),
            "some entries could not be parsed"
        );
    }

    info!(
        documents = summary.documents,
        skipped_documents = summary.failed_documents.len(),
        entries = summary.entries,
        videos = summary.videos_seen,
        novel = summary.novel_timestamps,
        novel_unknown = summary.novel_unknown,
        duplicates = summary.duplicate_timestamps,
        api_calls = summary.api_calls,
        quota_spent = summary.quota_spent,
        enriched = summary.enriched,
        unavailable = summary.unavailable,
        deferred = summary.deferred.len(),
        "import finished"
    );
    let pending_file = pipeline::write_pending_ids(&data_dir, &summary.status).await?;
    match &summary.status {
        RunStatus::Complete => info!("run complete"),
        RunStatus::Partial { reason, pending_ids } => warn!(
            %reason,
            pending = pending_ids.len(),
            ?pending_ids,
            file = ?pending_file,
            "run partial; rerun later to continue enrichment"
        ),
    }

    Ok(())
}
