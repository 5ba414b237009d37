//! Quota-aware batch enrichment against the metadata API.

use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::MAX_BATCH_SIZE;
use crate::model::VideoMetadata;
use crate::quota::{QuotaExceeded, QuotaLedger};
use crate::youtube::{ApiError, VideoMetadataService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichSettings {
    pub batch_size: usize,
    pub cost_per_call: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub max_backoff_seconds: u64,
}

impl Default for EnrichSettings {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            cost_per_call: 11,
            max_retries: 3,
            retry_base_ms: 500,
            max_backoff_seconds: 60,
        }
    }
}

/// Why enrichment must stop for the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Halt {
    #[error(transparent)]
    Budget(#[from] QuotaExceeded),
    #[error("provider quota exhausted: {0}")]
    ProviderQuota(String),
    #[error("API rejected the request: {0}")]
    Rejected(String),
}

/// Result of enriching one batch of ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub enriched: Vec<VideoMetadata>,
    /// Requested ids the API did not return.
    pub unavailable: Vec<String>,
    /// Ids left unenriched, to be picked up by a later run.
    pub deferred: Vec<String>,
    pub calls: u32,
    pub halt: Option<Halt>,
}

pub struct Enricher<'a> {
    service: &'a dyn VideoMetadataService,
    settings: EnrichSettings,
}

impl<'a> Enricher<'a> {
    pub fn new(service: &'a dyn VideoMetadataService, settings: EnrichSettings) -> Self {
        Self { service, settings }
    }

    pub fn settings(&self) -> &EnrichSettings {
        &self.settings
    }

    /// Split `ids` into chunks no larger than one call accepts.
    pub fn batches<'b>(&self, ids: &'b [String]) -> std::slice::Chunks<'b, String> {
        ids.chunks(self.settings.batch_size.clamp(1, MAX_BATCH_SIZE))
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ms = self
            .settings
            .retry_base_ms
            .saturating_mul(1_u64 << attempt.min(10));
        let cap = self.settings.max_backoff_seconds.saturating_mul(1000);
        Duration::from_millis(ms.min(cap))
    }

    /// Query one batch. Every attempt is charged to `ledger` before it is
    /// issued; a refused charge halts without calling the API.
    #[instrument(skip_all, fields(batch = ids.len()))]
    pub async fn enrich_batch(&self, ids: &[String], ledger: &mut QuotaLedger) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut attempt: u32 = 0;
        loop {
            if let Err(exceeded) = ledger.charge(self.settings.cost_per_call) {
                info!(spent = exceeded.spent, ceiling = exceeded.ceiling, "quota ceiling reached; stopping enrichment");
                outcome.deferred = ids.to_vec();
                outcome.halt = Some(Halt::Budget(exceeded));
                return outcome;
            }
            outcome.calls += 1;

            match self.service.fetch_videos(ids).await {
                Ok(items) => {
                    let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
                    let mut found: HashSet<String> = HashSet::new();
                    for meta in items {
                        if !requested.contains(meta.id.as_str()) {
                            debug!(id = %meta.id, "ignoring unrequested id in response");
                            continue;
                        }
                        if found.insert(meta.id.clone()) {
                            outcome.enriched.push(meta);
                        }
                    }
                    outcome.unavailable = ids
                        .iter()
                        .filter(|id| !found.contains(id.as_str()))
                        .cloned()
                        .collect();
                    debug!(
                        enriched = outcome.enriched.len(),
                        unavailable = outcome.unavailable.len(),
                        "batch enriched"
                    );
                    return outcome;
                }
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(%err, attempt, delay_ms = delay.as_millis() as u64, "transient API failure; backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(ApiError::Transient(msg)) => {
                    warn!(error = %msg, attempts = attempt + 1, "retries exhausted; deferring batch");
                    outcome.deferred = ids.to_vec();
                    return outcome;
                }
                Err(ApiError::Decode(msg)) => {
                    warn!(error = %msg, "undecodable response; deferring batch");
                    outcome.deferred = ids.to_vec();
                    return outcome;
                }
                Err(ApiError::QuotaExhausted(msg)) => {
                    outcome.deferred = ids.to_vec();
                    outcome.halt = Some(Halt::ProviderQuota(msg));
                    return outcome;
                }
                Err(ApiError::Rejected(msg)) => {
                    outcome.deferred = ids.to_vec();
                    outcome.halt = Some(Halt::Rejected(msg));
                    return outcome;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Never;

    #[async_trait]
    impl VideoMetadataService for Never {
        async fn fetch_videos(&self, _ids: &[String]) -> Result<Vec<VideoMetadata>, ApiError> {
            panic!("must not be called");
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = EnrichSettings {
            retry_base_ms: 500,
            max_backoff_seconds: 3,
            ..EnrichSettings::default()
        };
        let e = Enricher::new(&Never, settings);
        assert_eq!(e.backoff(0), Duration::from_millis(500));
        assert_eq!(e.backoff(1), Duration::from_millis(1000));
        assert_eq!(e.backoff(2), Duration::from_millis(2000));
        assert_eq!(e.backoff(3), Duration::from_millis(3000));
        assert_eq!(e.backoff(30), Duration::from_millis(3000));
    }

    #[test]
    fn batches_respect_size() {
        let settings = EnrichSettings {
            batch_size: 2,
            ..EnrichSettings::default()
        };
        let e = Enricher::new(&Never, settings);
        let ids: Vec<String> = (0..5).map(|i| format!("v{i}")).collect();
        let sizes: Vec<usize> = e.batches(&ids).map(<[String]>::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn empty_budget_never_calls() {
        let e = Enricher::new(&Never, EnrichSettings::default());
        let mut ledger = QuotaLedger::new(10);
        let ids = vec!["a".to_string()];
        let out = e.enrich_batch(&ids, &mut ledger).await;
        assert_eq!(out.calls, 0);
        assert_eq!(out.deferred, ids);
        assert!(matches!(out.halt, Some(Halt::Budget(_))));
        assert_eq!(ledger.spent(), 0);
    }
}
