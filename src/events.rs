use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::fetcher::BatchOutcome;

const LOG_FILE_NAME: &str = "refresh-events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum RefreshEvent {
    #[serde(rename = "app_start")]
    AppStart {
        version: String,
        max_workers: usize,
    },
    #[serde(rename = "refresh_started")]
    Started {
        date: NaiveDate,
    },
    #[serde(rename = "refresh_completed")]
    Completed {
        date: NaiveDate,
        records: usize,
        failed: Vec<String>,
        dropped: usize,
    },
    #[serde(rename = "refresh_failed")]
    Failed {
        date: NaiveDate,
        reason: String,
    },
    /// Another trigger rebuilt while this one waited on the lock.
    #[serde(rename = "refresh_skipped")]
    Skipped {
        date: NaiveDate,
    },
}

impl RefreshEvent {
    pub fn completed(date: NaiveDate, outcome: &BatchOutcome) -> Self {
        RefreshEvent::Completed {
            date,
            records: outcome.dataset.len(),
            failed: outcome.failed_ids(),
            dropped: outcome.dropped.len(),
        }
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a RefreshEvent,
}

/// Buffered JSONL log of refresh lifecycle events.
///
/// Events queue in memory and hit disk once `batch_size` accumulate or on `flush`.
/// When the live file would pass `max_bytes` it shifts to `.1`, `.1` to `.2`, and so
/// on, keeping at most `max_files` files in total.
#[derive(Clone)]
pub struct EventLog {
    enabled: Arc<AtomicBool>,
    pending: Arc<Mutex<Vec<(DateTime<Utc>, RefreshEvent)>>>,
    path: PathBuf,
    batch_size: usize,
    max_bytes: u64,
    max_files: usize,
}

impl EventLog {
    pub fn open(config: &AppConfig) -> AppResult<Self> {
        fs::create_dir_all(&config.event_log_dir)?;
        Ok(Self {
            enabled: Arc::new(AtomicBool::new(config.event_log_enabled)),
            pending: Arc::new(Mutex::new(Vec::new())),
            path: config.event_log_dir.join(LOG_FILE_NAME),
            batch_size: config.event_log_batch_size.max(1),
            max_bytes: config.event_log_max_bytes,
            max_files: config.event_log_max_files.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Queues an event. Write failures are logged; a refresh never fails on its event log.
    pub fn push(&self, event: RefreshEvent) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut pending = self.pending.lock();
        pending.push((Utc::now(), event));
        if pending.len() >= self.batch_size {
            if let Err(err) = self.write_out(&mut pending) {
                warn!(?err, queued = pending.len(), "failed to write refresh events");
            }
        }
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut pending = self.pending.lock();
        self.write_out(&mut pending)
    }

    fn write_out(&self, pending: &mut Vec<(DateTime<Utc>, RefreshEvent)>) -> AppResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut encoded = Vec::new();
        for (at, event) in pending.iter() {
            serde_json::to_writer(&mut encoded, &LogLine { at: *at, event })?;
            encoded.push(b'\n');
        }

        self.shift_if_full(encoded.len() as u64)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&encoded)?;
        writer.flush()?;
        pending.clear();
        Ok(())
    }

    fn shift_if_full(&self, incoming: u64) -> AppResult<()> {
        let size = fs::metadata(&self.path).map(|meta| meta.len()).unwrap_or(0);
        if size == 0 || size + incoming <= self.max_bytes {
            return Ok(());
        }
        if self.max_files == 1 {
            File::create(&self.path)?;
            return Ok(());
        }

        let oldest = self.generation(self.max_files - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..self.max_files - 1).rev() {
            let from = self.generation(n);
            if from.exists() {
                fs::rename(&from, self.generation(n + 1))?;
            }
        }
        fs::rename(&self.path, self.generation(1))?;
        Ok(())
    }

    fn generation(&self, n: usize) -> PathBuf {
        self.path.with_extension(format!("jsonl.{n}"))
    }
}
