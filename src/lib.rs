mod artifact;
mod client;
mod config;
mod dataset;
mod errors;
mod events;
mod fetcher;
mod marker;
mod refresh;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use artifact::{ArtifactBuilder, GeoJsonArtifact};
pub use client::{DetailLookup, HttpDetailClient};
pub use config::{AppConfig, PublicAppConfig, DEFAULT_MAX_WORKERS};
pub use dataset::{load_dataset, load_ids, save_dataset, RawDetail, SimplifiedRecord};
pub use errors::{AppError, AppResult, FetchError};
pub use events::{EventLog, RefreshEvent};
pub use fetcher::{BatchFetcher, BatchOutcome, FailedFetch, RawBatch};
pub use marker::{read_marker, write_marker, Clock, MarkerWrite, RefreshMarker, SystemClock};
pub use refresh::{RefreshGate, RefreshOutcome, RefreshPaths, RefreshSummary};

/// Process-wide wiring: one pooled HTTP client and one refresh gate shared by every trigger.
pub struct AppState {
    config: AppConfig,
    gate: Arc<RefreshGate>,
    events: EventLog,
}

impl AppState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        let lookup = HttpDetailClient::new(&config)?.into_lookup();
        let events = EventLog::open(&config)?;
        let gate = RefreshGate::new(
            RefreshPaths::from_config(&config),
            BatchFetcher::new(lookup),
            Arc::new(GeoJsonArtifact::new(config.artifact_path.clone())),
            Arc::new(SystemClock),
            config.max_workers,
        )
        .with_events(events.clone());

        events.push(RefreshEvent::AppStart {
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_workers: config.max_workers,
        });
        debug!(config = ?config.public_profile(), "refresh state initialized");

        Ok(Self {
            config,
            gate: Arc::new(gate),
            events,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn gate(&self) -> Arc<RefreshGate> {
        Arc::clone(&self.gate)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,flavor_map=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
