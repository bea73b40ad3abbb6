use std::path::PathBuf;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_DETAIL_ENDPOINT: &str = "https://www.culvers.com/api/restaurants/getDetails";
const DEFAULT_EVENT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_EVENT_LOG_MAX_FILES: usize = 5;
pub const DEFAULT_MAX_WORKERS: usize = 32;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub detail_endpoint: String,
    pub id_param: String,
    pub request_timeout_secs: u64,
    pub pool_size: usize,
    pub max_workers: usize,
    pub ids_file: PathBuf,
    pub dataset_path: PathBuf,
    pub artifact_path: PathBuf,
    pub marker_path: PathBuf,
    pub event_log_enabled: bool,
    pub event_log_dir: PathBuf,
    pub event_log_batch_size: usize,
    pub event_log_max_bytes: u64,
    pub event_log_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub detail_endpoint: String,
    pub request_timeout_secs: u64,
    pub pool_size: usize,
    pub max_workers: usize,
    pub ids_file: String,
    pub dataset_path: String,
    pub marker_path: String,
    pub event_log_enabled: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            detail_endpoint: env::var("DETAIL_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DETAIL_ENDPOINT.to_string()),
            id_param: env::var("DETAIL_ID_PARAM").unwrap_or_else(|_| "oloID".to_string()),
            request_timeout_secs: parse_u64("REQUEST_TIMEOUT_SECS", 15).max(1),
            pool_size: parse_usize("HTTP_POOL_SIZE", 64).max(1),
            max_workers: parse_usize("MAX_WORKERS", DEFAULT_MAX_WORKERS).max(1),
            ids_file: parse_path("IDS_FILE", "culvers_ids.txt"),
            dataset_path: parse_path("OUTPUT_JSON", "html/culvers_details.json"),
            artifact_path: parse_path("OUTPUT_ARTIFACT", "html/locations.geojson"),
            marker_path: parse_path("LAST_REFRESH_PATH", "html/last_refresh.json"),
            event_log_enabled: parse_bool("EVENT_LOG_ENABLED", true),
            event_log_dir: parse_path("EVENT_LOG_DIR", "html"),
            event_log_batch_size: parse_usize("EVENT_LOG_BATCH_SIZE", 25).max(1),
            event_log_max_bytes: parse_u64("EVENT_LOG_MAX_BYTES", DEFAULT_EVENT_LOG_MAX_BYTES),
            event_log_max_files: parse_usize("EVENT_LOG_MAX_FILES", DEFAULT_EVENT_LOG_MAX_FILES)
                .max(1),
        }
    }

    /// Config rooted in `dir`, pointing the remote client at `endpoint`.
    pub fn rooted_at(dir: &std::path::Path, endpoint: impl Into<String>) -> Self {
        Self {
            detail_endpoint: endpoint.into(),
            id_param: "oloID".to_string(),
            request_timeout_secs: 15,
            pool_size: 64,
            max_workers: DEFAULT_MAX_WORKERS,
            ids_file: dir.join("ids.txt"),
            dataset_path: dir.join("details.json"),
            artifact_path: dir.join("locations.geojson"),
            marker_path: dir.join("last_refresh.json"),
            event_log_enabled: true,
            event_log_dir: dir.to_path_buf(),
            event_log_batch_size: 25,
            event_log_max_bytes: DEFAULT_EVENT_LOG_MAX_BYTES,
            event_log_max_files: DEFAULT_EVENT_LOG_MAX_FILES,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            detail_endpoint: self.detail_endpoint.clone(),
            request_timeout_secs: self.request_timeout_secs,
            pool_size: self.pool_size,
            max_workers: self.max_workers,
            ids_file: self.ids_file.to_string_lossy().to_string(),
            dataset_path: self.dataset_path.to_string_lossy().to_string(),
            marker_path: self.marker_path.to_string_lossy().to_string(),
            event_log_enabled: self.event_log_enabled,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_path(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}
