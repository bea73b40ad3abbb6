use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AppError, AppResult};

/// Decoded detail body as returned by the remote endpoint. Shape is not trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetail(pub Value);

impl RawDetail {
    /// The nested detail object, if present and non-empty.
    pub fn details(&self) -> Option<&Map<String, Value>> {
        self.0
            .get("data")
            .and_then(|data| data.get("restaurant"))
            .and_then(|restaurant| restaurant.get("getRestaurantDetails"))
            .and_then(Value::as_object)
            .filter(|details| !details.is_empty())
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimplifiedRecord {
    pub identifier: String,
    pub primary_label: Option<String>,
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl SimplifiedRecord {
    /// Returns `None` when the payload carries no usable detail object.
    pub fn from_raw(identifier: &str, raw: &RawDetail) -> Option<Self> {
        raw.details()
            .map(|details| Self::from_details(identifier, details))
    }

    fn from_details(identifier: &str, details: &Map<String, Value>) -> Self {
        let primary_label = details
            .get("flavors")
            .and_then(Value::as_array)
            .and_then(|flavors| flavors.first())
            .and_then(|flavor| flavor.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let text = |key: &str| details.get(key).and_then(Value::as_str).unwrap_or("");
        let address = format!(
            "{} {} {}",
            text("streetAddress"),
            text("city"),
            text("state")
        )
        .trim()
        .to_string();

        Self {
            identifier: identifier.to_string(),
            primary_label,
            address,
            latitude: details.get("latitude").and_then(Value::as_f64),
            longitude: details.get("longitude").and_then(Value::as_f64),
        }
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        self.latitude.zip(self.longitude)
    }
}

/// Reads the identifier list: one per line, trimmed, blanks skipped.
pub fn load_ids(path: &Path) -> AppResult<Vec<String>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(AppError::SourceMissing {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(AppError::Io(err)),
    };
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

pub fn save_dataset(path: &Path, records: &[SimplifiedRecord]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let serialized = serde_json::to_string_pretty(records)?;
    fs::write(path, serialized)?;
    Ok(())
}

pub fn load_dataset(path: &Path) -> AppResult<Vec<SimplifiedRecord>> {
    let contents = fs::read_to_string(path).map_err(|source| AppError::DatasetUnavailable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&contents)?)
}
