use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::DetailLookup;
use crate::dataset::{RawDetail, SimplifiedRecord};
use crate::errors::FetchError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedFetch {
    pub identifier: String,
    pub reason: String,
}

/// Result of one batch run. Every distinct input identifier lands in exactly one bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub dataset: Vec<SimplifiedRecord>,
    pub failures: Vec<FailedFetch>,
    pub dropped: Vec<String>,
}

impl BatchOutcome {
    pub fn failed_ids(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|failure| failure.identifier.clone())
            .collect()
    }

    /// Failed and dropped identifiers merged, for callers that don't care why.
    pub fn excluded(&self) -> Vec<String> {
        let mut excluded = self.failed_ids();
        excluded.extend(self.dropped.iter().cloned());
        excluded
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RawBatch {
    pub results: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, String>,
}

enum Resolution {
    Record(SimplifiedRecord),
    Dropped(String),
    Failed(FailedFetch),
}

#[derive(Clone)]
pub struct BatchFetcher {
    lookup: Arc<dyn DetailLookup>,
}

impl BatchFetcher {
    pub fn new(lookup: Arc<dyn DetailLookup>) -> Self {
        Self { lookup }
    }

    pub async fn fetch_one(&self, identifier: &str) -> Result<RawDetail, FetchError> {
        self.lookup.fetch_details(identifier).await
    }

    /// Fetches and simplifies every identifier with at most `concurrency` requests in flight.
    ///
    /// Individual failures never abort the batch; the call returns once every task is done.
    pub async fn run_batch(&self, identifiers: &[String], concurrency: usize) -> BatchOutcome {
        let ids = distinct(identifiers);
        let total = ids.len();
        let mut outcome = BatchOutcome::default();
        if ids.is_empty() {
            return outcome;
        }

        let mut resolutions = stream::iter(ids)
            .map(|identifier| {
                let lookup = Arc::clone(&self.lookup);
                async move {
                    match lookup.fetch_details(&identifier).await {
                        Ok(raw) => match SimplifiedRecord::from_raw(&identifier, &raw) {
                            Some(record) => Resolution::Record(record),
                            None => Resolution::Dropped(identifier),
                        },
                        Err(err) => Resolution::Failed(FailedFetch {
                            identifier,
                            reason: err.to_string(),
                        }),
                    }
                }
            })
            .buffer_unordered(concurrency.max(1));

        while let Some(resolution) = resolutions.next().await {
            match resolution {
                Resolution::Record(record) => outcome.dataset.push(record),
                Resolution::Dropped(identifier) => {
                    debug!(%identifier, "detail payload empty; dropping identifier");
                    outcome.dropped.push(identifier);
                }
                Resolution::Failed(failure) => {
                    warn!(
                        identifier = %failure.identifier,
                        reason = %failure.reason,
                        "failed to fetch details"
                    );
                    outcome.failures.push(failure);
                }
            }
        }

        info!(
            total,
            records = outcome.dataset.len(),
            failed = outcome.failures.len(),
            dropped = outcome.dropped.len(),
            "batch fetch complete"
        );
        outcome
    }

    /// Fetches raw payloads without simplifying them.
    pub async fn fetch_raw(&self, identifiers: &[String], concurrency: usize) -> RawBatch {
        let mut batch = RawBatch::default();
        let mut responses = stream::iter(distinct(identifiers))
            .map(|identifier| {
                let lookup = Arc::clone(&self.lookup);
                async move {
                    let result = lookup.fetch_details(&identifier).await;
                    (identifier, result)
                }
            })
            .buffer_unordered(concurrency.max(1));

        while let Some((identifier, result)) = responses.next().await {
            match result {
                Ok(raw) => {
                    batch.results.insert(identifier, raw.into_value());
                }
                Err(err) => {
                    batch.errors.insert(identifier, err.to_string());
                }
            }
        }
        batch
    }
}

fn distinct(identifiers: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(identifiers.len());
    identifiers
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
