//! Row models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Reconciliation
//! and enrichment decisions live in higher layers.

use chrono::NaiveDateTime;

use crate::model::EnrichmentState;

/// A stored video identity with its accumulated watch timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRecord {
    pub id: String,
    pub title: Option<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
    pub state: EnrichmentState,
    pub like_count: Option<i64>,
    pub view_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub duration: Option<String>,
    pub tags: Vec<String>,
    pub timestamps: Vec<NaiveDateTime>,
    pub last_checked_at: Option<i64>,
}

/// Row counts for the run summary and the stats binary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub videos: i64,
    pub timestamps: i64,
    pub unknown_timestamps: i64,
    pub unenriched: i64,
    pub enriched: i64,
    pub unavailable: i64,
}
