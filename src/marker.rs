use std::fs;
use std::io;
use std::path::Path;

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Date of the last completed full rebuild, stored as `{"date": "YYYY-MM-DD"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshMarker {
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerWrite {
    Written,
    /// The stored marker is newer than the requested date and was kept.
    KeptNewer(NaiveDate),
}

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Missing and unreadable markers both read as absent, which forces a rebuild.
pub fn read_marker(path: &Path) -> Option<RefreshMarker> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(target: "refresh", error = ?err, path = %path.display(), "failed to read refresh marker");
            return None;
        }
    };
    match serde_json::from_str::<RefreshMarker>(&contents) {
        Ok(marker) => Some(marker),
        Err(err) => {
            warn!(target: "refresh", error = ?err, path = %path.display(), "ignoring malformed refresh marker");
            None
        }
    }
}

pub fn write_marker(path: &Path, date: NaiveDate) -> AppResult<MarkerWrite> {
    if let Some(existing) = read_marker(path) {
        if existing.date > date {
            warn!(
                target: "refresh",
                stored = %existing.date,
                requested = %date,
                "refusing to move refresh marker backwards"
            );
            return Ok(MarkerWrite::KeptNewer(existing.date));
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_string(&RefreshMarker { date })?;
    fs::write(path, serialized).map_err(AppError::from)?;
    Ok(MarkerWrite::Written)
}
