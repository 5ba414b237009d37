//! Reading of Google Takeout `watch-history.html` exports.
//!
//! Each watch event is rendered as one `content-cell` div holding a
//! "Watched …" line, optional links to the video and its channel, and a
//! timestamp like `Jun 1, 2021, 2:30:15 PM EDT`. The timezone abbreviation
//! carries no usable offset and is dropped; timestamps stay naive.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use regex::{CaptureMatches, Regex};
use reqwest::Url;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::RawEntry;

static CELL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<div class="content-cell mdl-cell mdl-cell--6-col mdl-typography--body-1">(.*?)</div>"#,
    )
    .expect("valid cell regex")
});
static LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?s)<a\s+href="([^"]*)"[^>]*>(.*?)</a>"#).expect("valid link regex"));
static BREAK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid br regex"));
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

const TIMESTAMP_FORMAT: &str = "%b %d, %Y, %I:%M:%S %p";
const REMOVED_PREFIX: &str = "Watched a video that has been removed";
const STORY_PREFIX: &str = "Watched story";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntryError {
    #[error("entry {index}: unparseable timestamp {raw:?}")]
    Timestamp { index: usize, raw: String },
}

/// A skipped entry, kept for the operator's failure report.
#[derive(Debug, Clone, Serialize)]
pub struct ParseFailure {
    pub source: String,
    pub index: usize,
    pub reason: String,
}

/// One export file held in memory.
#[derive(Debug, Clone)]
pub struct TakeoutDocument {
    pub source: PathBuf,
    content: String,
}

impl TakeoutDocument {
    pub fn new(source: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self::new(path, content))
    }

    /// A fresh pass over the document's entries. Calling it again restarts
    /// from the first entry.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            cells: CELL_RE.captures_iter(&self.content),
            index: 0,
        }
    }

    pub fn has_entries(&self) -> bool {
        CELL_RE.is_match(&self.content)
    }
}

/// Lazy iterator over the entries of one document.
pub struct Entries<'a> {
    cells: CaptureMatches<'static, 'a>,
    index: usize,
}

impl<'a> Iterator for Entries<'a> {
    type Item = Result<RawEntry, EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        let caps = self.cells.next()?;
        let index = self.index;
        self.index += 1;
        let cell = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        Some(parse_cell(index, cell))
    }
}

fn parse_cell(index: usize, cell: &str) -> Result<RawEntry, EntryError> {
    let text = normalize_text(&TAG_RE.replace_all(&BREAK_RE.replace_all(cell, "\n"), ""));
    let raw_timestamp = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or_default()
        .to_string();
    let timestamp = parse_watched_at(&raw_timestamp).ok_or_else(|| EntryError::Timestamp {
        index,
        raw: raw_timestamp.clone(),
    })?;

    let mut entry = RawEntry {
        timestamp,
        video_id: None,
        title: None,
        channel_id: None,
        channel_title: None,
    };
    let lead = text.trim_start();
    if lead.starts_with(REMOVED_PREFIX) || lead.starts_with(STORY_PREFIX) {
        return Ok(entry);
    }

    let mut links = LINK_RE.captures_iter(cell).map(|c| {
        let href = decode_entities(c.get(1).map(|m| m.as_str()).unwrap_or_default());
        let label = normalize_text(&TAG_RE.replace_all(c.get(2).map(|m| m.as_str()).unwrap_or_default(), ""));
        (href, label.trim().to_string())
    });

    let Some((video_href, video_label)) = links.by_ref().find(|(href, _)| href.contains("watch?v=")) else {
        return Ok(entry);
    };
    entry.video_id = extract_video_id(&video_href);
    // Links titled with their own URL usually point at videos that are gone;
    // such entries carry no usable title or channel.
    if video_label.is_empty() || video_label == video_href {
        return Ok(entry);
    }
    entry.title = Some(video_label);

    if let Some((channel_href, channel_label)) =
        links.find(|(href, _)| href.contains("youtube.com/channel/"))
    {
        entry.channel_id = channel_href
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if !channel_label.is_empty() {
            entry.channel_title = Some(channel_label);
        }
    }
    Ok(entry)
}

/// Parse a rendered watch time, ignoring any trailing zone abbreviation.
pub fn parse_watched_at(raw: &str) -> Option<NaiveDateTime> {
    let text = normalize_text(raw);
    let text = text.trim();
    let without_zone = match text.rsplit_once(' ') {
        Some((head, tail))
            if !tail.eq_ignore_ascii_case("AM") && !tail.eq_ignore_ascii_case("PM") =>
        {
            head
        }
        _ => text,
    };
    NaiveDateTime::parse_from_str(without_zone, TIMESTAMP_FORMAT).ok()
}

/// The `v` parameter of a watch URL, without any `&t=` suffix.
pub fn extract_video_id(href: &str) -> Option<String> {
    if let Ok(url) = Url::parse(href) {
        return url
            .query_pairs()
            .find(|(k, _)| k == "v")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty());
    }
    let (_, rest) = href.split_once("v=")?;
    let id = rest.split('&').next().unwrap_or_default();
    (!id.is_empty()).then(|| id.to_string())
}

fn normalize_text(s: &str) -> String {
    decode_entities(s).replace(['\u{a0}', '\u{202f}'], " ")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Locate export documents under `path`.
///
/// Accepts a single file, or a directory holding `watch-history*.html`
/// files and/or extracted Takeout archives
/// (`takeout-*/Takeout/YouTube*/history/watch-history.html`). Loose files
/// come first in name order, then archives in name order.
pub async fn discover_documents(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("takeout path {} not found", path.display()))?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut loose = Vec::new();
    let mut archives = Vec::new();
    let mut dir = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("failed to list {}", path.display()))?;
    while let Some(item) = dir.next_entry().await? {
        let name = item.file_name().to_string_lossy().into_owned();
        let file_type = item.file_type().await?;
        if file_type.is_file() && name.starts_with("watch-history") && name.ends_with(".html") {
            loose.push(item.path());
        } else if file_type.is_dir() && name.starts_with("takeout-") {
            match find_in_archive(&item.path()).await? {
                Some(found) => archives.push(found),
                None => warn!(archive = %name, "expected watch-history.html in takeout archive, found none"),
            }
        }
    }
    loose.sort();
    archives.sort();
    loose.extend(archives);
    debug!(count = loose.len(), root = %path.display(), "discovered watch-history documents");
    Ok(loose)
}

async fn find_in_archive(archive: &Path) -> Result<Option<PathBuf>> {
    let takeout = archive.join("Takeout");
    if !tokio::fs::try_exists(&takeout).await.unwrap_or(false) {
        return Ok(None);
    }
    let mut dir = tokio::fs::read_dir(&takeout).await?;
    let mut candidates = Vec::new();
    while let Some(item) = dir.next_entry().await? {
        if !item.file_name().to_string_lossy().starts_with("YouTube") {
            continue;
        }
        let candidate = item.path().join("history").join("watch-history.html");
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            candidates.push(candidate);
        }
    }
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELL_OPEN: &str =
        r#"<div class="content-cell mdl-cell mdl-cell--6-col mdl-typography--body-1">"#;
    const RIGHT_CELL: &str = r#"<div class="content-cell mdl-cell mdl-cell--6-col mdl-typography--body-1 mdl-typography--text-right"></div>"#;

    fn wrap(cells: &[&str]) -> String {
        let mut html = String::from("<html><body><div class=\"mdl-grid\">");
        for c in cells {
            html.push_str(r#"<div class="outer-cell mdl-cell mdl-cell--12-col mdl-shadow--2dp">"#);
            html.push_str(CELL_OPEN);
            html.push_str(c);
            html.push_str("</div>");
            html.push_str(RIGHT_CELL);
            html.push_str("</div>");
        }
        html.push_str("</div></body></html>");
        html
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[test]
    fn parses_full_entry() {
        let html = wrap(&[
            r#"Watched&nbsp;<a href="https://www.youtube.com/watch?v=abc123XYZ_-&amp;t=42s">Rust &amp; You</a><br><a href="https://www.youtube.com/channel/UCchan01">Some Channel</a><br>Jun 1, 2021, 2:30:15 PM EDT<br>"#,
        ]);
        let doc = TakeoutDocument::new("a.html", html);
        let entries: Vec<_> = doc.entries().collect();
        assert_eq!(entries.len(), 1);
        let e = entries[0].as_ref().unwrap();
        assert_eq!(e.timestamp, ts("2021-06-01 14:30:15"));
        assert_eq!(e.video_id.as_deref(), Some("abc123XYZ_-"));
        assert_eq!(e.title.as_deref(), Some("Rust & You"));
        assert_eq!(e.channel_id.as_deref(), Some("UCchan01"));
        assert_eq!(e.channel_title.as_deref(), Some("Some Channel"));
    }

    #[test]
    fn removed_and_story_entries_have_no_id() {
        let html = wrap(&[
            "Watched a video that has been removed<br>Jan 3, 2019, 11:05:00 AM CET<br>",
            r#"Watched story<br><a href="https://www.youtube.com/watch?v=story1">x</a><br>Jan 4, 2019, 1:00:01 AM CET"#,
        ]);
        let doc = TakeoutDocument::new("b.html", html);
        let entries: Vec<RawEntry> = doc.entries().map(Result::unwrap).collect();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.video_id.is_none()));
        assert_eq!(entries[0].timestamp, ts("2019-01-03 11:05:00"));
        assert_eq!(entries[1].timestamp, ts("2019-01-04 01:00:01"));
    }

    #[test]
    fn url_as_title_means_no_title() {
        let html = wrap(&[
            r#"Watched <a href="https://www.youtube.com/watch?v=gone0000001">https://www.youtube.com/watch?v=gone0000001</a><br>Feb 10, 2020, 9:15:30 PM PST"#,
        ]);
        let doc = TakeoutDocument::new("c.html", html);
        let e = doc.entries().next().unwrap().unwrap();
        assert_eq!(e.video_id.as_deref(), Some("gone0000001"));
        assert!(e.title.is_none());
        assert!(e.channel_title.is_none());
    }

    #[test]
    fn bad_timestamp_is_reported_not_fatal() {
        let html = wrap(&[
            "Watched a video that has been removed<br>not a date<br>",
            "Watched a video that has been removed<br>Mar 3, 2020, 3:03:03 AM UTC<br>",
        ]);
        let doc = TakeoutDocument::new("d.html", html);
        let results: Vec<_> = doc.entries().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results[0],
            Err(EntryError::Timestamp { index: 0, .. })
        ));
        assert!(results[1].is_ok());
    }

    #[test]
    fn entries_restart_from_the_top() {
        let html = wrap(&[
            "Watched a video that has been removed<br>Mar 3, 2020, 3:03:03 AM UTC<br>",
            "Watched a video that has been removed<br>Mar 4, 2020, 3:03:03 AM UTC<br>",
        ]);
        let doc = TakeoutDocument::new("e.html", html);
        let mut first = doc.entries();
        first.next();
        assert_eq!(doc.entries().count(), 2);
        assert!(doc.has_entries());
        assert!(!TakeoutDocument::new("f.html", "<html></html>").has_entries());
    }

    #[test]
    fn timestamp_variants() {
        assert_eq!(
            parse_watched_at("Dec 31, 2020, 11:59:59\u{202f}PM GMT"),
            Some(ts("2020-12-31 23:59:59"))
        );
        assert_eq!(
            parse_watched_at("Dec 31, 2020, 12:00:00 AM"),
            Some(ts("2020-12-31 00:00:00"))
        );
        assert_eq!(parse_watched_at("yesterday"), None);
    }

    #[test]
    fn video_id_extraction() {
        assert_eq!(
            extract_video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10s").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(extract_video_id("watch?v=abc&t=1").as_deref(), Some("abc"));
        assert_eq!(extract_video_id("https://www.youtube.com/watch"), None);
    }

    #[tokio::test]
    async fn discovers_loose_files_and_archives() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        std::fs::write(root.join("watch-history_002.html"), "x").unwrap();
        std::fs::write(root.join("watch-history_001.html"), "x").unwrap();
        std::fs::write(root.join("notes.txt"), "x").unwrap();
        let hist = root
            .join("takeout-20181120T163352Z-001")
            .join("Takeout")
            .join("YouTube")
            .join("history");
        std::fs::create_dir_all(&hist).unwrap();
        std::fs::write(hist.join("watch-history.html"), "x").unwrap();
        std::fs::create_dir_all(root.join("takeout-20190101T000000Z-001")).unwrap();

        let found = discover_documents(root).await.unwrap();
        assert_eq!(found.len(), 3);
        assert!(found[0].ends_with("watch-history_001.html"));
        assert!(found[1].ends_with("watch-history_002.html"));
        assert!(found[2].ends_with("history/watch-history.html"));

        let single = discover_documents(&root.join("watch-history_001.html"))
            .await
            .unwrap();
        assert_eq!(single.len(), 1);
        assert!(discover_documents(&root.join("missing")).await.is_err());
    }
}
