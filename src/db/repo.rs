use super::model::{StoreStats, VideoRecord};
use crate::config::expand_home;
use crate::model::{Enrichment, EnrichmentState, Identity, VideoKey, VideoMetadata};
use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::path::Path;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Build a `sqlite://` URL for a database file, creating it on first open.
pub fn sqlite_url_for(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

/// Normalise a `DATABASE_URL` or configured store URL before opening it.
///
/// File-backed URLs get `~/` expanded, their parent directory created, and
/// `mode=rwc` added when no mode is given, so the first import creates the
/// store. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }

    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let store_path = expand_home(path_part);
    if let Some(parent) = Path::new(&store_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.split('&').any(|kv| kv.starts_with("mode=")) => q.to_string(),
        Some(q) if !q.is_empty() => format!("{q}&mode=rwc"),
        _ => "mode=rwc".to_string(),
    };
    format!("sqlite://{store_path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Watch timestamps already stored for a video or for the unknown bucket.
#[instrument(skip_all)]
pub async fn existing_timestamps(pool: &Pool, key: &VideoKey) -> Result<Vec<NaiveDateTime>> {
    let rows = match key {
        VideoKey::Video(id) => {
            sqlx::query_scalar::<_, NaiveDateTime>(
                "SELECT watched_at FROM watch_timestamps WHERE video_id = ? ORDER BY watched_at",
            )
            .bind(id)
            .fetch_all(pool)
            .await?
        }
        VideoKey::Unknown => {
            sqlx::query_scalar::<_, NaiveDateTime>(
                "SELECT watched_at FROM unknown_timestamps ORDER BY watched_at",
            )
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows)
}

#[instrument(skip_all)]
pub async fn enrichment_state(pool: &Pool, video_id: &str) -> Result<Option<EnrichmentState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT enrichment_state FROM videos WHERE id = ?")
            .bind(video_id)
            .fetch_optional(pool)
            .await?;
    match state {
        None => Ok(None),
        Some(s) => EnrichmentState::parse_state(&s)
            .map(Some)
            .ok_or_else(|| anyhow!("video {} has unknown enrichment state {}", video_id, s)),
    }
}

/// Append `timestamps` to the row for `key`, creating it if needed, and
/// record `enrichment` when given. Runs in one transaction; repeating a call
/// with the same arguments leaves the store unchanged. Returns the number of
/// timestamps actually inserted.
///
/// Export identity fields only fill columns that are still empty; enriched
/// metadata overwrites them. `identity` and `enrichment` are ignored for the
/// unknown bucket.
#[instrument(skip_all)]
pub async fn upsert(
    pool: &Pool,
    key: &VideoKey,
    identity: Option<&Identity>,
    timestamps: &[NaiveDateTime],
    enrichment: Option<&Enrichment>,
) -> Result<u64> {
    let mut tx = pool.begin().await?;
    let inserted = match key {
        VideoKey::Unknown => {
            let mut inserted = 0;
            for ts in timestamps {
                inserted += sqlx::query("INSERT OR IGNORE INTO unknown_timestamps (watched_at) VALUES (?)")
                    .bind(ts)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
            }
            inserted
        }
        VideoKey::Video(id) => {
            let identity = identity.cloned().unwrap_or_default();
            sqlx::query(
                "INSERT INTO videos (id, title, channel_id, channel_title) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                    title = COALESCE(videos.title, excluded.title), \
                    channel_id = COALESCE(videos.channel_id, excluded.channel_id), \
                    channel_title = COALESCE(videos.channel_title, excluded.channel_title)",
            )
            .bind(id)
            .bind(&identity.title)
            .bind(&identity.channel_id)
            .bind(&identity.channel_title)
            .execute(&mut *tx)
            .await?;

            let mut inserted = 0;
            for ts in timestamps {
                inserted += sqlx::query(
                    "INSERT OR IGNORE INTO watch_timestamps (video_id, watched_at) VALUES (?, ?)",
                )
                .bind(id)
                .bind(ts)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            }

            match enrichment {
                Some(Enrichment::Enriched(meta)) => apply_metadata_tx(&mut tx, id, meta).await?,
                Some(Enrichment::Unavailable) => mark_unavailable_tx(&mut tx, id).await?,
                None => {}
            }
            inserted
        }
    };
    tx.commit().await?;
    Ok(inserted)
}

async fn apply_metadata_tx(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    meta: &VideoMetadata,
) -> Result<()> {
    sqlx::query(
        "UPDATE videos SET \
            title = COALESCE(?, title), \
            channel_id = COALESCE(?, channel_id), \
            channel_title = COALESCE(?, channel_title), \
            description = ?, published_at = ?, category_id = ?, duration = ?, \
            view_count = ?, like_count = ?, dislike_count = ?, comment_count = ?, \
            enrichment_state = ?, last_checked_at = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ?",
    )
    .bind(&meta.title)
    .bind(&meta.channel_id)
    .bind(&meta.channel_title)
    .bind(&meta.description)
    .bind(&meta.published_at)
    .bind(&meta.category_id)
    .bind(&meta.duration)
    .bind(meta.view_count)
    .bind(meta.like_count)
    .bind(meta.dislike_count)
    .bind(meta.comment_count)
    .bind(EnrichmentState::Enriched.as_str())
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM video_tags WHERE video_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    for tag in &meta.tags {
        sqlx::query("INSERT OR IGNORE INTO video_tags (video_id, tag) VALUES (?, ?)")
            .bind(id)
            .bind(tag)
            .execute(&mut **tx)
            .await?;
    }

    sqlx::query("DELETE FROM video_topics WHERE video_id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    for topic in &meta.topics {
        sqlx::query("INSERT OR IGNORE INTO video_topics (video_id, topic) VALUES (?, ?)")
            .bind(id)
            .bind(topic)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// Previously gathered metadata is kept; only the state changes.
async fn mark_unavailable_tx(tx: &mut Transaction<'_, Sqlite>, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE videos SET enrichment_state = ?, last_checked_at = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(EnrichmentState::PermanentlyUnavailable.as_str())
    .bind(Utc::now().timestamp())
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Ids to query this run: every unenriched id in the store, then ids from
/// `input_ids` that are enriched or unavailable but were last checked before
/// `stale_before` (unix seconds). Each id appears once.
#[instrument(skip_all)]
pub async fn ids_needing_enrichment(
    pool: &Pool,
    input_ids: &[String],
    stale_before: i64,
) -> Result<Vec<String>> {
    let mut ids: Vec<String> =
        sqlx::query_scalar("SELECT id FROM videos WHERE enrichment_state = ? ORDER BY rowid")
            .bind(EnrichmentState::Unenriched.as_str())
            .fetch_all(pool)
            .await?;

    let stale: HashSet<String> = sqlx::query_scalar(
        "SELECT id FROM videos WHERE enrichment_state IN (?, ?) \
         AND (last_checked_at IS NULL OR last_checked_at < ?)",
    )
    .bind(EnrichmentState::Enriched.as_str())
    .bind(EnrichmentState::PermanentlyUnavailable.as_str())
    .bind(stale_before)
    .fetch_all(pool)
    .await?
    .into_iter()
    .collect();

    let mut seen: HashSet<String> = ids.iter().cloned().collect();
    for id in input_ids {
        if stale.contains(id) && seen.insert(id.clone()) {
            ids.push(id.clone());
        }
    }
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn fetch_video(pool: &Pool, video_id: &str) -> Result<Option<VideoRecord>> {
    let row = sqlx::query(
        "SELECT id, title, channel_id, channel_title, enrichment_state, like_count, view_count, \
                comment_count, duration, last_checked_at \
         FROM videos WHERE id = ?",
    )
    .bind(video_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let state_str: String = row.get("enrichment_state");
    let state = EnrichmentState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("video {} has unknown enrichment state {}", video_id, state_str))?;

    let tags: Vec<String> =
        sqlx::query_scalar("SELECT tag FROM video_tags WHERE video_id = ? ORDER BY tag")
            .bind(video_id)
            .fetch_all(pool)
            .await?;
    let timestamps = existing_timestamps(pool, &VideoKey::Video(video_id.to_string())).await?;

    Ok(Some(VideoRecord {
        id: row.get("id"),
        title: row.try_get::<Option<String>, _>("title").ok().flatten(),
        channel_id: row.try_get::<Option<String>, _>("channel_id").ok().flatten(),
        channel_title: row
            .try_get::<Option<String>, _>("channel_title")
            .ok()
            .flatten(),
        state,
        like_count: row.try_get::<Option<i64>, _>("like_count").ok().flatten(),
        view_count: row.try_get::<Option<i64>, _>("view_count").ok().flatten(),
        comment_count: row.try_get::<Option<i64>, _>("comment_count").ok().flatten(),
        duration: row.try_get::<Option<String>, _>("duration").ok().flatten(),
        tags,
        timestamps,
        last_checked_at: row
            .try_get::<Option<i64>, _>("last_checked_at")
            .ok()
            .flatten(),
    }))
}

#[instrument(skip_all)]
pub async fn store_stats(pool: &Pool) -> Result<StoreStats> {
    let count = |sql: &'static str| async move {
        sqlx::query_scalar::<_, i64>(sql)
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to run {sql}"))
    };
    let by_state = |state: EnrichmentState| async move {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM videos WHERE enrichment_state = ?")
            .bind(state.as_str())
            .fetch_one(pool)
            .await
            .context("failed to count videos by state")
    };

    Ok(StoreStats {
        videos: count("SELECT COUNT(*) FROM videos").await?,
        timestamps: count("SELECT COUNT(*) FROM watch_timestamps").await?,
        unknown_timestamps: count("SELECT COUNT(*) FROM unknown_timestamps").await?,
        unenriched: by_state(EnrichmentState::Unenriched).await?,
        enriched: by_state(EnrichmentState::Enriched).await?,
        unavailable: by_state(EnrichmentState::PermanentlyUnavailable).await?,
    })
}

/// Most-watched channels by stored timestamp count.
#[instrument(skip_all)]
pub async fn top_channels(pool: &Pool, limit: i64) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT v.channel_title AS channel, COUNT(*) AS views \
         FROM watch_timestamps t JOIN videos v ON v.id = t.video_id \
         WHERE v.channel_title IS NOT NULL \
         GROUP BY v.channel_title ORDER BY views DESC, channel ASC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>("channel"), row.get::<i64, _>("views")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn prepare_url_passthrough_and_rebuild() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");

        let td = tempfile::tempdir().unwrap();
        let plain = td.path().join("store").join("youtube.db");
        assert_eq!(
            prepare_sqlite_url(&format!("sqlite://{}", plain.display())),
            format!("sqlite://{}?mode=rwc", plain.display())
        );
        assert_eq!(
            prepare_sqlite_url(&format!("sqlite://{}?cache=shared", plain.display())),
            format!("sqlite://{}?cache=shared&mode=rwc", plain.display())
        );
        assert_eq!(
            prepare_sqlite_url(&format!("sqlite://{}?mode=ro", plain.display())),
            format!("sqlite://{}?mode=ro", plain.display())
        );
        assert!(plain.parent().unwrap().exists());
        assert_eq!(prepare_sqlite_url(&sqlite_url_for(&plain)), sqlite_url_for(&plain));

        let nested = td.path().join("a").join("b.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}?mode=rwc", nested.display()));
        assert!(url.ends_with("b.db?mode=rwc"));
        assert!(nested.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let pool = setup_pool().await;
        let key = VideoKey::Video("vid00000001".into());
        let identity = Identity {
            title: Some("Title".into()),
            channel_id: None,
            channel_title: Some("Chan".into()),
        };
        let stamps = [ts("2021-06-01 14:30:15"), ts("2021-07-01 10:00:00")];

        assert_eq!(upsert(&pool, &key, Some(&identity), &stamps, None).await.unwrap(), 2);
        assert_eq!(upsert(&pool, &key, Some(&identity), &stamps, None).await.unwrap(), 0);

        let rec = fetch_video(&pool, "vid00000001").await.unwrap().unwrap();
        assert_eq!(rec.timestamps, stamps.to_vec());
        assert_eq!(rec.state, EnrichmentState::Unenriched);
        assert_eq!(rec.title.as_deref(), Some("Title"));
        assert_eq!(store_stats(&pool).await.unwrap().videos, 1);
    }

    #[tokio::test]
    async fn identity_only_fills_gaps() {
        let pool = setup_pool().await;
        let key = VideoKey::Video("v".into());
        let first = Identity {
            title: Some("Original".into()),
            ..Identity::default()
        };
        let second = Identity {
            title: Some("Renamed".into()),
            channel_title: Some("Chan".into()),
            ..Identity::default()
        };
        upsert(&pool, &key, Some(&first), &[], None).await.unwrap();
        upsert(&pool, &key, Some(&second), &[], None).await.unwrap();
        let rec = fetch_video(&pool, "v").await.unwrap().unwrap();
        assert_eq!(rec.title.as_deref(), Some("Original"));
        assert_eq!(rec.channel_title.as_deref(), Some("Chan"));
    }

    #[tokio::test]
    async fn unknown_bucket_is_a_single_set() {
        let pool = setup_pool().await;
        let stamps = [ts("2021-06-01 12:00:00"), ts("2021-06-01 12:10:00")];
        upsert(&pool, &VideoKey::Unknown, None, &stamps, None).await.unwrap();
        upsert(&pool, &VideoKey::Unknown, None, &stamps, None).await.unwrap();
        let stored = existing_timestamps(&pool, &VideoKey::Unknown).await.unwrap();
        assert_eq!(stored, stamps.to_vec());
        assert_eq!(store_stats(&pool).await.unwrap().videos, 0);
    }

    #[tokio::test]
    async fn enrichment_states_and_refresh_selection() {
        let pool = setup_pool().await;
        for id in ["a", "b", "c"] {
            upsert(&pool, &VideoKey::Video(id.into()), None, &[], None)
                .await
                .unwrap();
        }
        let meta = VideoMetadata {
            id: "b".into(),
            title: Some("B".into()),
            like_count: Some(5),
            tags: vec!["x".into(), "y".into()],
            ..VideoMetadata::default()
        };
        upsert(&pool, &VideoKey::Video("b".into()), None, &[], Some(&Enrichment::Enriched(meta)))
            .await
            .unwrap();
        upsert(&pool, &VideoKey::Video("c".into()), None, &[], Some(&Enrichment::Unavailable))
            .await
            .unwrap();

        assert_eq!(enrichment_state(&pool, "a").await.unwrap(), Some(EnrichmentState::Unenriched));
        assert_eq!(enrichment_state(&pool, "b").await.unwrap(), Some(EnrichmentState::Enriched));
        assert_eq!(
            enrichment_state(&pool, "c").await.unwrap(),
            Some(EnrichmentState::PermanentlyUnavailable)
        );
        assert_eq!(enrichment_state(&pool, "zzz").await.unwrap(), None);

        let rec = fetch_video(&pool, "b").await.unwrap().unwrap();
        assert_eq!(rec.like_count, Some(5));
        assert_eq!(rec.tags, vec!["x".to_string(), "y".to_string()]);

        let input: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        // freshly checked: only the unenriched id is due
        let due = ids_needing_enrichment(&pool, &input, Utc::now().timestamp() - 3600)
            .await
            .unwrap();
        assert_eq!(due, vec!["a".to_string()]);
        // stale: enriched and unavailable ids both get one more lookup
        let due = ids_needing_enrichment(&pool, &input, Utc::now().timestamp() + 3600)
            .await
            .unwrap();
        assert_eq!(due, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        // refreshes only for ids present in this run's input
        let due = ids_needing_enrichment(&pool, &[], Utc::now().timestamp() + 3600)
            .await
            .unwrap();
        assert_eq!(due, vec!["a".to_string()]);

        let stats = store_stats(&pool).await.unwrap();
        assert_eq!((stats.unenriched, stats.enriched, stats.unavailable), (1, 1, 1));
    }
}
