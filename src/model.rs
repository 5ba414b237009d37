use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// One watch event as read from an export document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    pub timestamp: NaiveDateTime,
    pub video_id: Option<String>,
    pub title: Option<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
}

impl RawEntry {
    pub fn key(&self) -> VideoKey {
        match &self.video_id {
            Some(id) => VideoKey::Video(id.clone()),
            None => VideoKey::Unknown,
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            title: self.title.clone(),
            channel_id: self.channel_id.clone(),
            channel_title: self.channel_title.clone(),
        }
    }
}

/// Grouping key for timestamps: a video id or the unknown bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VideoKey {
    Video(String),
    Unknown,
}

impl VideoKey {
    pub fn video_id(&self) -> Option<&str> {
        match self {
            VideoKey::Video(id) => Some(id),
            VideoKey::Unknown => None,
        }
    }
}

/// Identification fields taken from the export itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub title: Option<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
}

impl Identity {
    /// Keep already-set fields, fill the gaps from `other`.
    pub fn merge_missing(&mut self, other: &Identity) {
        if self.title.is_none() {
            self.title = other.title.clone();
        }
        if self.channel_id.is_none() {
            self.channel_id = other.channel_id.clone();
        }
        if self.channel_title.is_none() {
            self.channel_title = other.channel_title.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EnrichmentState {
    Unenriched,
    Enriched,
    PermanentlyUnavailable,
}

impl EnrichmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentState::Unenriched => "unenriched",
            EnrichmentState::Enriched => "enriched",
            EnrichmentState::PermanentlyUnavailable => "permanently_unavailable",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "unenriched" => Some(EnrichmentState::Unenriched),
            "enriched" => Some(EnrichmentState::Enriched),
            "permanently_unavailable" => Some(EnrichmentState::PermanentlyUnavailable),
            _ => None,
        }
    }
}

/// Metadata returned by the external API for one video.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub id: String,
    pub title: Option<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<String>,
    pub category_id: Option<String>,
    pub duration: Option<String>,
    pub view_count: Option<i64>,
    pub like_count: Option<i64>,
    pub dislike_count: Option<i64>,
    pub comment_count: Option<i64>,
    pub tags: Vec<String>,
    pub topics: Vec<String>,
}

/// What an enrichment attempt concluded for a single id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enrichment {
    Enriched(VideoMetadata),
    Unavailable,
}

impl Enrichment {
    pub fn state(&self) -> EnrichmentState {
        match self {
            Enrichment::Enriched(_) => EnrichmentState::Enriched,
            Enrichment::Unavailable => EnrichmentState::PermanentlyUnavailable,
        }
    }
}
