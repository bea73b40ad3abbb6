use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::dataset::{load_dataset, SimplifiedRecord};
use crate::errors::AppResult;

/// Builds whatever consumes the persisted dataset. Must be idempotent when `force` is false.
pub trait ArtifactBuilder: Send + Sync {
    fn ensure(&self, dataset_path: &Path, force: bool) -> AppResult<()>;
}

/// Exports located records as a GeoJSON `FeatureCollection` for a map front end.
#[derive(Debug, Clone)]
pub struct GeoJsonArtifact {
    output_path: PathBuf,
}

impl GeoJsonArtifact {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl ArtifactBuilder for GeoJsonArtifact {
    fn ensure(&self, dataset_path: &Path, force: bool) -> AppResult<()> {
        if !force && self.output_path.exists() {
            debug!(path = %self.output_path.display(), "artifact present; skipping build");
            return Ok(());
        }

        let records = load_dataset(dataset_path)?;
        let collection = feature_collection(&records);
        if let Some(parent) = self.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.output_path, serde_json::to_string(&collection)?)?;
        info!(
            path = %self.output_path.display(),
            features = collection["features"].as_array().map_or(0, Vec::len),
            "artifact written"
        );
        Ok(())
    }
}

fn feature_collection(records: &[SimplifiedRecord]) -> Value {
    let features = records
        .iter()
        .filter_map(|record| {
            let (lat, lng) = record.coordinates()?;
            Some(json!({
                "type": "Feature",
                "geometry": {"type": "Point", "coordinates": [lng, lat]},
                "properties": {
                    "identifier": record.identifier,
                    "primaryLabel": record.primary_label,
                    "address": record.address,
                }
            }))
        })
        .collect::<Vec<_>>();
    json!({"type": "FeatureCollection", "features": features})
}
