//! One import run: parse, reconcile, persist, enrich.
//!
//! Novelty is always derived from what the store holds at the time, never
//! from state of an earlier run, so an interrupted run is resumed by simply
//! running again over the same inputs.

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::config::{Config, MAX_REFRESH_AFTER_HOURS};
use crate::db::{self, Pool};
use crate::enrich::{BatchOutcome, EnrichSettings, Enricher, Halt};
use crate::model::{Enrichment, Identity, RawEntry, VideoKey};
use crate::quota::QuotaLedger;
use crate::reconcile;
use crate::takeout::{self, ParseFailure, TakeoutDocument};
use crate::youtube::VideoMetadataService;

pub const PARSE_FAILURES_FILE: &str = "parse_fails.json";
pub const PENDING_IDS_FILE: &str = "pending_ids.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub enrich: EnrichSettings,
    pub quota_ceiling: u64,
    /// Enriched or unavailable ids last checked longer ago than this get
    /// one more lookup.
    pub refresh_after: Duration,
}

impl RunOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            enrich: cfg.enrich_settings(),
            quota_ceiling: cfg.quota.ceiling,
            refresh_after: Duration::hours(
                cfg.quota.refresh_after_hours.min(MAX_REFRESH_AFTER_HOURS) as i64,
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    /// Enrichment stopped early; `pending_ids` are left for a later run.
    Partial {
        reason: String,
        pending_ids: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub documents: usize,
    /// Export files that were skipped, with the reason.
    pub failed_documents: Vec<(PathBuf, String)>,
    pub entries: usize,
    pub parse_failures: Vec<ParseFailure>,
    pub videos_seen: usize,
    pub novel_timestamps: u64,
    pub novel_unknown: u64,
    pub duplicate_timestamps: usize,
    pub api_calls: u32,
    pub quota_spent: u64,
    pub enriched: usize,
    pub unavailable: usize,
    pub deferred: Vec<String>,
    pub status: RunStatus,
}

impl RunSummary {
    fn new(documents: usize) -> Self {
        Self {
            documents,
            failed_documents: Vec::new(),
            entries: 0,
            parse_failures: Vec::new(),
            videos_seen: 0,
            novel_timestamps: 0,
            novel_unknown: 0,
            duplicate_timestamps: 0,
            api_calls: 0,
            quota_spent: 0,
            enriched: 0,
            unavailable: 0,
            deferred: Vec::new(),
            status: RunStatus::Complete,
        }
    }
}

/// Documents found under a takeout path, plus the ones that could not be used.
#[derive(Debug, Default)]
pub struct LoadedDocuments {
    pub documents: Vec<TakeoutDocument>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Discover and read every export document under `path`. Unreadable files
/// and files without any entries are reported, not fatal.
#[instrument(skip_all)]
pub async fn load_documents(path: &Path) -> Result<LoadedDocuments> {
    let mut loaded = LoadedDocuments::default();
    for doc_path in takeout::discover_documents(path).await? {
        match TakeoutDocument::load(&doc_path).await {
            Ok(doc) if doc.has_entries() => loaded.documents.push(doc),
            Ok(_) => {
                warn!(file = %doc_path.display(), "no watch entries found; file corrupt or changed");
                loaded
                    .failed
                    .push((doc_path, "no watch entries found".to_string()));
            }
            Err(err) => {
                warn!(?err, file = %doc_path.display(), "failed to read export document");
                loaded.failed.push((doc_path, format!("{err:#}")));
            }
        }
    }
    Ok(loaded)
}

#[derive(Debug, Default)]
struct Group {
    identity: Identity,
    candidates: Vec<NaiveDateTime>,
}

/// Group entries by video id, keeping first-seen order of keys and of
/// timestamps within each key.
fn group_entries(entries: Vec<RawEntry>) -> (Vec<VideoKey>, HashMap<VideoKey, Group>) {
    let mut order = Vec::new();
    let mut groups: HashMap<VideoKey, Group> = HashMap::new();
    for entry in entries {
        let key = entry.key();
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Group::default()
        });
        group.identity.merge_missing(&entry.identity());
        group.candidates.push(entry.timestamp);
    }

    // An unknown entry at the exact instant of an identified one is the same
    // event exported without its link.
    if let Some(unknown) = groups.get(&VideoKey::Unknown) {
        let identified: HashSet<NaiveDateTime> = groups
            .iter()
            .filter(|(k, _)| **k != VideoKey::Unknown)
            .flat_map(|(_, g)| g.candidates.iter().copied())
            .collect();
        let kept: Vec<NaiveDateTime> = unknown
            .candidates
            .iter()
            .copied()
            .filter(|t| !identified.contains(t))
            .collect();
        if let Some(unknown) = groups.get_mut(&VideoKey::Unknown) {
            unknown.candidates = kept;
        }
    }
    (order, groups)
}

/// Load everything under `takeout_path` and run over it. Fails only when
/// no usable document is found or the store cannot be written.
pub async fn import(
    pool: &Pool,
    takeout_path: &Path,
    service: &dyn VideoMetadataService,
    options: &RunOptions,
) -> Result<RunSummary> {
    let loaded = load_documents(takeout_path).await?;
    if loaded.documents.is_empty() {
        anyhow::bail!(
            "no usable watch-history documents under {}",
            takeout_path.display()
        );
    }
    let mut summary = run(pool, &loaded.documents, service, options).await?;
    summary.failed_documents = loaded.failed;
    Ok(summary)
}

/// Drive a full run over already-loaded documents.
#[instrument(skip_all)]
pub async fn run(
    pool: &Pool,
    documents: &[TakeoutDocument],
    service: &dyn VideoMetadataService,
    options: &RunOptions,
) -> Result<RunSummary> {
    let mut summary = RunSummary::new(documents.len());

    let mut entries = Vec::new();
    for doc in documents {
        for item in doc.entries() {
            match item {
                Ok(entry) => entries.push(entry),
                Err(err) => summary.parse_failures.push(ParseFailure {
                    source: doc.source.display().to_string(),
                    index: match &err {
                        takeout::EntryError::Timestamp { index, .. } => *index,
                    },
                    reason: err.to_string(),
                }),
            }
        }
    }
    summary.entries = entries.len();
    info!(
        documents = documents.len(),
        entries = summary.entries,
        parse_failures = summary.parse_failures.len(),
        "parsed export documents"
    );

    let (order, mut groups) = group_entries(entries);
    let input_ids: Vec<String> = order
        .iter()
        .filter_map(|k| k.video_id().map(str::to_string))
        .collect();
    summary.videos_seen = input_ids.len();

    for key in &order {
        let Some(group) = groups.remove(key) else {
            continue;
        };
        let existing = db::existing_timestamps(pool, key)
            .await
            .context("failed to read stored timestamps")?;
        let offered = group.candidates.len();
        let novel = reconcile::novel_timestamps(existing, group.candidates);
        summary.duplicate_timestamps += offered - novel.len();

        let inserted = match key {
            VideoKey::Unknown if novel.is_empty() => 0,
            VideoKey::Unknown => db::upsert(pool, key, None, &novel, None)
                .await
                .context("failed to persist unknown-bucket timestamps")?,
            VideoKey::Video(id) => db::upsert(pool, key, Some(&group.identity), &novel, None)
                .await
                .with_context(|| format!("failed to persist video {id}"))?,
        };
        match key {
            VideoKey::Unknown => summary.novel_unknown += inserted,
            VideoKey::Video(_) => summary.novel_timestamps += inserted,
        }
    }
    info!(
        videos = summary.videos_seen,
        novel = summary.novel_timestamps,
        novel_unknown = summary.novel_unknown,
        duplicates = summary.duplicate_timestamps,
        "reconciled timestamps"
    );

    let stale_before = Utc::now()
        .checked_sub_signed(options.refresh_after)
        .map_or(i64::MIN, |t| t.timestamp());
    let pending = db::ids_needing_enrichment(pool, &input_ids, stale_before).await?;
    info!(pending = pending.len(), ceiling = options.quota_ceiling, "starting enrichment");

    let mut ledger = QuotaLedger::new(options.quota_ceiling);
    let enricher = Enricher::new(service, options.enrich.clone());
    let batches: Vec<&[String]> = enricher.batches(&pending).collect();
    let mut halted: Option<Halt> = None;

    for (i, batch) in batches.iter().enumerate() {
        let outcome = enricher.enrich_batch(batch, &mut ledger).await;
        summary.api_calls += outcome.calls;
        let halt = outcome.halt.clone();
        persist_outcome(pool, outcome, &mut summary).await?;

        if let Some(halt) = halt {
            summary
                .deferred
                .extend(batches[i + 1..].iter().flat_map(|b| b.iter().cloned()));
            warn!(reason = %halt, pending = summary.deferred.len(), "enrichment halted");
            halted = Some(halt);
            break;
        }
    }
    summary.quota_spent = ledger.spent();

    if let Some(halt) = halted {
        summary.status = RunStatus::Partial {
            reason: halt.to_string(),
            pending_ids: summary.deferred.clone(),
        };
    }
    info!(
        calls = summary.api_calls,
        spent = summary.quota_spent,
        enriched = summary.enriched,
        unavailable = summary.unavailable,
        deferred = summary.deferred.len(),
        "enrichment finished"
    );
    Ok(summary)
}

async fn persist_outcome(pool: &Pool, outcome: BatchOutcome, summary: &mut RunSummary) -> Result<()> {
    for meta in outcome.enriched {
        let key = VideoKey::Video(meta.id.clone());
        db::upsert(pool, &key, None, &[], Some(&Enrichment::Enriched(meta)))
            .await
            .context("failed to persist video metadata")?;
        summary.enriched += 1;
    }
    for id in outcome.unavailable {
        db::upsert(pool, &VideoKey::Video(id), None, &[], Some(&Enrichment::Unavailable))
            .await
            .context("failed to mark video unavailable")?;
        summary.unavailable += 1;
    }
    summary.deferred.extend(outcome.deferred);
    Ok(())
}

/// Dump skipped entries next to the database for the operator.
pub async fn write_parse_failures(dir: &Path, failures: &[ParseFailure]) -> Result<Option<PathBuf>> {
    if failures.is_empty() {
        return Ok(None);
    }
    let path = dir.join(PARSE_FAILURES_FILE);
    let body = serde_json::to_string_pretty(failures)?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(Some(path))
}

/// Record the ids a partial run left unenriched. A complete run removes any
/// list left behind by an earlier partial one.
pub async fn write_pending_ids(dir: &Path, status: &RunStatus) -> Result<Option<PathBuf>> {
    let path = dir.join(PENDING_IDS_FILE);
    match status {
        RunStatus::Partial { pending_ids, .. } => {
            let body = serde_json::to_string_pretty(pending_ids)?;
            tokio::fs::write(&path, body)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(Some(path))
        }
        RunStatus::Complete => {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
            Ok(None)
        }
    }
}
