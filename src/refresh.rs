//! Once-per-day rebuild gate around the batch fetcher.
//!
//! The gate reads a persisted date marker on every trigger. A stale marker takes the
//! rebuild lock and is read again under it, so concurrent triggers on the same day
//! collapse into a single rebuild. A marker only counts while the dataset file exists.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::artifact::ArtifactBuilder;
use crate::config::AppConfig;
use crate::dataset::{load_ids, save_dataset};
use crate::errors::AppResult;
use crate::fetcher::{BatchFetcher, FailedFetch};
use crate::marker::{read_marker, write_marker, Clock, MarkerWrite};
use crate::events::{EventLog, RefreshEvent};

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub date: NaiveDate,
    pub count: usize,
    pub dataset_path: PathBuf,
    pub failures: Vec<FailedFetch>,
    pub dropped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Marker already current; only the idempotent artifact check ran.
    Fresh,
    /// Another caller finished the rebuild while this one waited for the lock.
    RebuiltElsewhere,
    Rebuilt(RefreshSummary),
}

impl RefreshOutcome {
    pub fn rebuilt(&self) -> bool {
        matches!(self, RefreshOutcome::Rebuilt(_))
    }
}

#[derive(Debug, Clone)]
pub struct RefreshPaths {
    pub ids_file: PathBuf,
    pub dataset_path: PathBuf,
    pub marker_path: PathBuf,
}

impl RefreshPaths {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            ids_file: config.ids_file.clone(),
            dataset_path: config.dataset_path.clone(),
            marker_path: config.marker_path.clone(),
        }
    }
}

pub struct RefreshGate {
    paths: RefreshPaths,
    fetcher: BatchFetcher,
    artifact: Arc<dyn ArtifactBuilder>,
    clock: Arc<dyn Clock>,
    events: Option<EventLog>,
    concurrency: usize,
    lock: AsyncMutex<()>,
}

impl RefreshGate {
    pub fn new(
        paths: RefreshPaths,
        fetcher: BatchFetcher,
        artifact: Arc<dyn ArtifactBuilder>,
        clock: Arc<dyn Clock>,
        concurrency: usize,
    ) -> Self {
        Self {
            paths,
            fetcher,
            artifact,
            clock,
            events: None,
            concurrency: concurrency.max(1),
            lock: AsyncMutex::new(()),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn fetcher(&self) -> &BatchFetcher {
        &self.fetcher
    }

    /// Rebuilds the dataset at most once per calendar day, then makes sure the artifact exists.
    #[instrument(level = "debug", skip(self))]
    pub async fn check_and_maybe_rebuild(&self) -> AppResult<RefreshOutcome> {
        let today = self.clock.today();
        if self.is_current(today) {
            self.artifact.ensure(&self.paths.dataset_path, false)?;
            return Ok(RefreshOutcome::Fresh);
        }

        let _guard = self.lock.lock().await;
        // The marker may have been written while this caller waited.
        if self.is_current(today) {
            self.record(RefreshEvent::Skipped { date: today });
            self.artifact.ensure(&self.paths.dataset_path, false)?;
            return Ok(RefreshOutcome::RebuiltElsewhere);
        }

        self.rebuild_locked(today).await.map(RefreshOutcome::Rebuilt)
    }

    /// Unconditional rebuild, serialized with the daily gate.
    pub async fn rebuild_now(&self) -> AppResult<RefreshSummary> {
        let _guard = self.lock.lock().await;
        self.rebuild_locked(self.clock.today()).await
    }

    /// A marker dated today or later counts, but only while the dataset it vouches for exists.
    fn is_current(&self, today: NaiveDate) -> bool {
        let Some(marker) = read_marker(&self.paths.marker_path) else {
            return false;
        };
        if marker.date < today {
            return false;
        }
        if !self.paths.dataset_path.exists() {
            warn!(
                marker = %marker.date,
                path = %self.paths.dataset_path.display(),
                "marker is current but dataset is missing"
            );
            return false;
        }
        true
    }

    async fn rebuild_locked(&self, today: NaiveDate) -> AppResult<RefreshSummary> {
        self.record(RefreshEvent::Started { date: today });

        let result = self.run_rebuild(today).await;
        if let Err(err) = &result {
            warn!(?err, "refresh aborted");
            self.record(RefreshEvent::Failed {
                date: today,
                reason: err.to_string(),
            });
        }
        if let Some(events) = &self.events {
            if let Err(err) = events.flush() {
                warn!(?err, "failed to flush refresh events");
            }
        }
        result
    }

    async fn run_rebuild(&self, today: NaiveDate) -> AppResult<RefreshSummary> {
        let ids = load_ids(&self.paths.ids_file)?;
        info!(identifiers = ids.len(), concurrency = self.concurrency, "starting full refresh");

        let outcome = self.fetcher.run_batch(&ids, self.concurrency).await;
        save_dataset(&self.paths.dataset_path, &outcome.dataset)?;
        if let MarkerWrite::KeptNewer(stored) = write_marker(&self.paths.marker_path, today)? {
            warn!(%stored, %today, "marker already ahead of local clock");
        }
        self.artifact.ensure(&self.paths.dataset_path, true)?;
        self.record(RefreshEvent::completed(today, &outcome));

        info!(
            records = outcome.dataset.len(),
            failed = outcome.failures.len(),
            dropped = outcome.dropped.len(),
            "refresh complete"
        );
        Ok(RefreshSummary {
            date: today,
            count: outcome.dataset.len(),
            dataset_path: self.paths.dataset_path.clone(),
            failures: outcome.failures,
            dropped: outcome.dropped,
        })
    }

    fn record(&self, event: RefreshEvent) {
        if let Some(events) = &self.events {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::client::DetailLookup;
    use crate::dataset::{load_dataset, RawDetail, SimplifiedRecord};
    use crate::errors::{AppError, FetchError};
    use crate::marker::RefreshMarker;

    struct FixedClock(Mutex<NaiveDate>);

    impl FixedClock {
        fn new(date: NaiveDate) -> Self {
            Self(Mutex::new(date))
        }

        fn advance_to(&self, date: NaiveDate) {
            *self.0.lock() = date;
        }
    }

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            *self.0.lock()
        }
    }

    struct StubLookup {
        responses: HashMap<String, Result<serde_json::Value, u16>>,
        calls: AtomicUsize,
    }

    impl StubLookup {
        fn scenario() -> Self {
            let full = |flavor: &str| -> Result<serde_json::Value, u16> {
                Ok(json!({"data": {"restaurant": {"getRestaurantDetails": {
                    "flavors": [{"name": flavor}],
                    "streetAddress": "1 Main",
                    "city": "Madison",
                    "state": "WI",
                    "latitude": 43.0,
                    "longitude": -89.0
                }}}}))
            };
            let mut responses = HashMap::new();
            responses.insert("A".to_string(), full("Turtle"));
            responses.insert("B".to_string(), full("Mint"));
            responses.insert("C".to_string(), Err(500));
            responses.insert(
                "D".to_string(),
                Ok(json!({"data": {"restaurant": {"getRestaurantDetails": {}}}})),
            );
            Self {
                responses,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DetailLookup for StubLookup {
        async fn fetch_details(&self, identifier: &str) -> Result<RawDetail, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            match self.responses.get(identifier) {
                Some(Ok(value)) => Ok(RawDetail(value.clone())),
                Some(Err(status)) => Err(FetchError::RemoteStatus { status: *status }),
                None => Err(FetchError::Decode("unknown identifier".into())),
            }
        }
    }

    #[derive(Default)]
    struct CountingArtifact {
        forced: AtomicUsize,
        unforced: AtomicUsize,
    }

    impl CountingArtifact {
        fn total(&self) -> usize {
            self.forced.load(Ordering::SeqCst) + self.unforced.load(Ordering::SeqCst)
        }
    }

    impl ArtifactBuilder for CountingArtifact {
        fn ensure(&self, _dataset_path: &Path, force: bool) -> AppResult<()> {
            if force {
                self.forced.fetch_add(1, Ordering::SeqCst);
            } else {
                self.unforced.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        paths: RefreshPaths,
        lookup: Arc<StubLookup>,
        artifact: Arc<CountingArtifact>,
        clock: Arc<FixedClock>,
        gate: Arc<RefreshGate>,
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn harness(ids: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = RefreshPaths {
            ids_file: dir.path().join("ids.txt"),
            dataset_path: dir.path().join("html").join("details.json"),
            marker_path: dir.path().join("html").join("last_refresh.json"),
        };
        if let Some(ids) = ids {
            fs::write(&paths.ids_file, ids).unwrap();
        }
        let lookup = Arc::new(StubLookup::scenario());
        let artifact = Arc::new(CountingArtifact::default());
        let clock = Arc::new(FixedClock::new(date(2024, 6, 2)));
        let gate = Arc::new(RefreshGate::new(
            paths.clone(),
            BatchFetcher::new(lookup.clone()),
            artifact.clone(),
            clock.clone(),
            4,
        ));
        Harness {
            dir,
            paths,
            lookup,
            artifact,
            clock,
            gate,
        }
    }

    #[tokio::test]
    async fn stale_marker_triggers_single_rebuild_then_stays_fresh() {
        let h = harness(Some("A\nB\nC\nD\n"));
        write_marker(&h.paths.marker_path, date(2024, 6, 1)).unwrap();

        let outcome = h.gate.check_and_maybe_rebuild().await.unwrap();
        let RefreshOutcome::Rebuilt(summary) = outcome else {
            panic!("expected a rebuild");
        };
        assert_eq!(summary.count, 2);
        assert_eq!(
            summary
                .failures
                .iter()
                .map(|f| f.identifier.as_str())
                .collect::<Vec<_>>(),
            vec!["C"]
        );
        assert_eq!(summary.dropped, vec!["D".to_string()]);
        assert_eq!(
            read_marker(&h.paths.marker_path),
            Some(RefreshMarker {
                date: date(2024, 6, 2)
            })
        );
        let mut saved = load_dataset(&h.paths.dataset_path)
            .unwrap()
            .into_iter()
            .map(|r| r.identifier)
            .collect::<Vec<_>>();
        saved.sort();
        assert_eq!(saved, vec!["A", "B"]);

        let again = h.gate.check_and_maybe_rebuild().await.unwrap();
        assert!(matches!(again, RefreshOutcome::Fresh));
        assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.artifact.forced.load(Ordering::SeqCst), 1);
        assert_eq!(h.artifact.unforced.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn absent_marker_counts_as_stale() {
        let h = harness(Some("A\n"));
        let outcome = h.gate.check_and_maybe_rebuild().await.unwrap();
        assert!(outcome.rebuilt());
    }

    #[tokio::test]
    async fn new_day_triggers_another_rebuild() {
        let h = harness(Some("A\n"));
        assert!(h.gate.check_and_maybe_rebuild().await.unwrap().rebuilt());
        assert!(!h.gate.check_and_maybe_rebuild().await.unwrap().rebuilt());

        h.clock.advance_to(date(2024, 6, 3));
        assert!(h.gate.check_and_maybe_rebuild().await.unwrap().rebuilt());
        assert_eq!(read_marker(&h.paths.marker_path).unwrap().date, date(2024, 6, 3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_rebuild_exactly_once() {
        let h = harness(Some("A\nB\nC\nD\n"));
        let triggers = 16;

        let handles = (0..triggers)
            .map(|_| {
                let gate = Arc::clone(&h.gate);
                tokio::spawn(async move { gate.check_and_maybe_rebuild().await })
            })
            .collect::<Vec<_>>();

        let mut rebuilt = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().rebuilt() {
                rebuilt += 1;
            }
        }

        assert_eq!(rebuilt, 1);
        assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.artifact.forced.load(Ordering::SeqCst), 1);
        assert_eq!(h.artifact.total(), triggers);
    }

    #[tokio::test]
    async fn missing_identifier_source_leaves_marker_untouched() {
        let h = harness(None);
        write_marker(&h.paths.marker_path, date(2024, 6, 1)).unwrap();

        let err = h.gate.check_and_maybe_rebuild().await.unwrap_err();
        assert!(matches!(err, AppError::SourceMissing { .. }));
        assert_eq!(read_marker(&h.paths.marker_path).unwrap().date, date(2024, 6, 1));
        assert!(!h.paths.dataset_path.exists());
        assert_eq!(h.artifact.total(), 0);

        fs::write(&h.paths.ids_file, "A\n").unwrap();
        assert!(h.gate.check_and_maybe_rebuild().await.unwrap().rebuilt());
    }

    fn event_log(h: &Harness) -> EventLog {
        let config = AppConfig::rooted_at(h.dir.path(), "http://localhost/details");
        EventLog::open(&config).unwrap()
    }

    fn logged_events(log: &EventLog) -> Vec<String> {
        fs::read_to_string(log.path())
            .unwrap_or_default()
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn rebuild_now_ignores_fresh_marker_and_records_events() {
        let h = harness(Some("A\nC\n"));
        write_marker(&h.paths.marker_path, date(2024, 6, 2)).unwrap();
        let events = event_log(&h);
        let gate = RefreshGate::new(
            h.paths.clone(),
            BatchFetcher::new(h.lookup.clone()),
            h.artifact.clone(),
            h.clock.clone(),
            2,
        )
        .with_events(events.clone());

        let summary = gate.rebuild_now().await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(h.artifact.forced.load(Ordering::SeqCst), 1);
        assert_eq!(events.pending(), 0);
        assert_eq!(
            logged_events(&events),
            vec!["refresh_started", "refresh_completed"]
        );
    }

    #[tokio::test]
    async fn current_marker_without_dataset_rebuilds() {
        let h = harness(Some("A\nB\nC\nD\n"));
        write_marker(&h.paths.marker_path, date(2024, 6, 2)).unwrap();
        assert!(!h.paths.dataset_path.exists());

        let outcome = h.gate.check_and_maybe_rebuild().await.unwrap();
        assert!(outcome.rebuilt());
        assert!(h.paths.dataset_path.exists());
        assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.artifact.unforced.load(Ordering::SeqCst), 0);

        let again = h.gate.check_and_maybe_rebuild().await.unwrap();
        assert!(matches!(again, RefreshOutcome::Fresh));
        assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn marker_ahead_of_clock_counts_as_fresh() {
        let h = harness(Some("A\nB\n"));
        write_marker(&h.paths.marker_path, date(2024, 6, 3)).unwrap();
        save_dataset(&h.paths.dataset_path, &Vec::<SimplifiedRecord>::new()).unwrap();

        for _ in 0..5 {
            let outcome = h.gate.check_and_maybe_rebuild().await.unwrap();
            assert!(matches!(outcome, RefreshOutcome::Fresh));
        }
        assert_eq!(h.lookup.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.artifact.unforced.load(Ordering::SeqCst), 5);
        assert_eq!(read_marker(&h.paths.marker_path).unwrap().date, date(2024, 6, 3));
    }

    #[tokio::test]
    async fn events_stay_queued_until_rebuild_ends() {
        let h = harness(Some("A\n"));
        let events = event_log(&h);
        let gate = RefreshGate::new(
            h.paths.clone(),
            BatchFetcher::new(h.lookup.clone()),
            h.artifact.clone(),
            h.clock.clone(),
            1,
        )
        .with_events(events.clone());

        events.push(RefreshEvent::AppStart {
            version: "test".into(),
            max_workers: 1,
        });
        assert_eq!(events.pending(), 1);
        assert!(!events.path().exists());

        assert!(gate.check_and_maybe_rebuild().await.unwrap().rebuilt());
        assert_eq!(events.pending(), 0);
        assert_eq!(
            logged_events(&events),
            vec!["app_start", "refresh_started", "refresh_completed"]
        );

        // Fresh triggers queue nothing and write nothing.
        assert!(!gate.check_and_maybe_rebuild().await.unwrap().rebuilt());
        assert_eq!(events.pending(), 0);
        assert_eq!(logged_events(&events).len(), 3);
    }

    struct BrokenArtifact;

    impl ArtifactBuilder for BrokenArtifact {
        fn ensure(&self, _dataset_path: &Path, _force: bool) -> AppResult<()> {
            Err(AppError::Config("artifact directory is read-only".into()))
        }
    }

    #[tokio::test]
    async fn artifact_failure_is_logged_as_failed_not_completed() {
        let h = harness(Some("A\n"));
        let events = event_log(&h);
        let gate = RefreshGate::new(
            h.paths.clone(),
            BatchFetcher::new(h.lookup.clone()),
            Arc::new(BrokenArtifact),
            h.clock.clone(),
            1,
        )
        .with_events(events.clone());

        let err = gate.check_and_maybe_rebuild().await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(
            logged_events(&events),
            vec!["refresh_started", "refresh_failed"]
        );
    }
}
