use serde::Deserialize;

use crate::model::VideoMetadata;

#[derive(Debug, Deserialize)]
pub struct VideoListResponse {
    #[serde(default)]
    pub items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoItem {
    pub id: String,
    #[serde(default)]
    pub snippet: Option<Snippet>,
    #[serde(default)]
    pub statistics: Option<Statistics>,
    #[serde(default)]
    pub content_details: Option<ContentDetails>,
    #[serde(default)]
    pub topic_details: Option<TopicDetails>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    pub title: Option<String>,
    pub channel_id: Option<String>,
    pub channel_title: Option<String>,
    pub description: Option<String>,
    pub published_at: Option<String>,
    pub category_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Counts arrive as decimal strings.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub view_count: Option<String>,
    pub like_count: Option<String>,
    pub dislike_count: Option<String>,
    pub comment_count: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContentDetails {
    pub duration: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDetails {
    #[serde(default)]
    pub relevant_topic_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub reason: String,
}

fn count(v: &Option<String>) -> Option<i64> {
    v.as_deref().and_then(|s| s.trim().parse().ok())
}

impl From<VideoItem> for VideoMetadata {
    fn from(item: VideoItem) -> Self {
        let snippet = item.snippet.unwrap_or_default();
        let stats = item.statistics.unwrap_or_default();
        VideoMetadata {
            id: item.id,
            title: snippet.title,
            channel_id: snippet.channel_id,
            channel_title: snippet.channel_title,
            description: snippet.description,
            published_at: snippet.published_at,
            category_id: snippet.category_id,
            duration: item.content_details.and_then(|c| c.duration),
            view_count: count(&stats.view_count),
            like_count: count(&stats.like_count),
            dislike_count: count(&stats.dislike_count),
            comment_count: count(&stats.comment_count),
            tags: snippet.tags,
            topics: item
                .topic_details
                .map(|t| t.relevant_topic_ids)
                .unwrap_or_default(),
        }
    }
}
