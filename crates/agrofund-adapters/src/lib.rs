//! `FetchSource` capability and the built-in sources: local seed files and remote JSON feeds.

use std::path::{Path, PathBuf};

use agrofund_core::{with_default_source, RawRecord};
use agrofund_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "agrofund-adapters";

/// Wrapper keys accepted around a list of records in a JSON document.
const BUNDLE_KEYS: &[&str] = &["records", "opportunities", "data", "items", "fondos"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    SeedFile,
    JsonFeed,
}

/// One entry of the `sources.yaml` registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source {source_id} returned malformed data: {reason}")]
    Malformed { source_id: String, reason: String },
    #[error("source {source_id} is misconfigured: {reason}")]
    Misconfigured { source_id: String, reason: String },
}

#[async_trait]
pub trait FetchSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    Csv,
    Json,
}

impl RawFormat {
    /// `.csv` is tabular, everything else is read as JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => RawFormat::Csv,
            _ => RawFormat::Json,
        }
    }
}

/// Accepts a bare JSON array of objects or an object wrapping one under a known key.
pub fn parse_json_batch(source_id: &str, bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let malformed = |reason: String| AdapterError::Malformed {
        source_id: source_id.to_string(),
        reason,
    };
    let document: JsonValue = serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;
    let items = match document {
        JsonValue::Array(items) => items,
        JsonValue::Object(mut map) => BUNDLE_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(JsonValue::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| malformed(format!("expected an array or one of {BUNDLE_KEYS:?}")))?,
        other => return Err(malformed(format!("unexpected top-level value {other}"))),
    };

    let total = items.len();
    let records: Vec<RawRecord> = items
        .into_iter()
        .filter_map(|item| match item {
            JsonValue::Object(map) => Some(map),
            _ => None,
        })
        .collect();
    if records.len() < total {
        debug!(source_id, skipped = total - records.len(), "skipping non-object entries");
    }
    Ok(records)
}

/// Header row becomes the field names; blank rows are dropped.
pub fn parse_csv_batch(source_id: &str, bytes: &[u8]) -> Result<Vec<RawRecord>, AdapterError> {
    let malformed = |e: csv::Error| AdapterError::Malformed {
        source_id: source_id.to_string(),
        reason: e.to_string(),
    };
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.headers().map_err(malformed)?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(malformed)?;
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let record: RawRecord = headers
            .iter()
            .zip(row.iter())
            .map(|(header, cell)| (header.to_string(), JsonValue::String(cell.to_string())))
            .collect();
        records.push(record);
    }
    Ok(records)
}

pub async fn read_raw_file(source_id: &str, path: &Path) -> Result<Vec<RawRecord>, AdapterError> {
    let bytes = tokio::fs::read(path).await.map_err(|source| AdapterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match RawFormat::from_path(path) {
        RawFormat::Csv => parse_csv_batch(source_id, &bytes),
        RawFormat::Json => parse_json_batch(source_id, &bytes),
    }
}

fn label_records(mut records: Vec<RawRecord>, default_source: &str) -> Vec<RawRecord> {
    for record in &mut records {
        with_default_source(record, default_source);
    }
    records
}

/// A local CSV or JSON file of records, e.g. curated seed data.
#[derive(Debug, Clone)]
pub struct SeedFileSource {
    source_id: String,
    path: PathBuf,
    default_source: String,
}

impl SeedFileSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>, default_source: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
            default_source: default_source.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FetchSource for SeedFileSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self) -> Result<Vec<RawRecord>, AdapterError> {
        let records = read_raw_file(&self.source_id, &self.path).await?;
        info!(source_id = %self.source_id, path = %self.path.display(), records = records.len(), "read seed file");
        Ok(label_records(records, &self.default_source))
    }
}

/// A remote endpoint returning records as JSON.
#[derive(Debug, Clone)]
pub struct JsonFeedSource {
    source_id: String,
    url: String,
    default_source: String,
    http: HttpFetcher,
}

impl JsonFeedSource {
    pub fn new(
        source_id: impl Into<String>,
        url: impl Into<String>,
        default_source: impl Into<String>,
        http: HttpFetcher,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            default_source: default_source.into(),
            http,
        }
    }
}

#[async_trait]
impl FetchSource for JsonFeedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self) -> Result<Vec<RawRecord>, AdapterError> {
        let response = self.http.fetch_bytes(&self.source_id, &self.url).await?;
        let records = parse_json_batch(&self.source_id, &response.body)?;
        info!(source_id = %self.source_id, url = %response.final_url, records = records.len(), "fetched feed");
        Ok(label_records(records, &self.default_source))
    }
}

/// A fixed batch held in memory. Used for file imports and tests.
#[derive(Debug, Clone)]
pub struct StaticSource {
    source_id: String,
    records: Vec<RawRecord>,
}

impl StaticSource {
    pub fn new(source_id: impl Into<String>, records: Vec<RawRecord>) -> Self {
        Self {
            source_id: source_id.into(),
            records,
        }
    }
}

#[async_trait]
impl FetchSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_batch(&self) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(self.records.clone())
    }
}

/// Builds the source for one registry entry. Relative seed paths resolve against `workspace_root`.
pub fn source_for_config(
    config: &SourceConfig,
    workspace_root: &Path,
    http: &HttpFetcher,
) -> Result<Box<dyn FetchSource>, AdapterError> {
    let misconfigured = |reason: &str| AdapterError::Misconfigured {
        source_id: config.source_id.clone(),
        reason: reason.to_string(),
    };
    match config.kind {
        SourceKind::SeedFile => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| misconfigured("seed_file sources need a `path`"))?;
            Ok(Box::new(SeedFileSource::new(
                config.source_id.clone(),
                workspace_root.join(path),
                config.display_name.clone(),
            )))
        }
        SourceKind::JsonFeed => {
            let url = config
                .url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| misconfigured("json_feed sources need a `url`"))?;
            Ok(Box::new(JsonFeedSource::new(
                config.source_id.clone(),
                url,
                config.display_name.clone(),
                http.clone(),
            )))
        }
    }
}
