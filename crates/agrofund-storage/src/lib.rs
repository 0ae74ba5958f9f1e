//! Catalog persistence, backups, the derived-view cache and HTTP fetch utilities.

use std::path::{Path, PathBuf};

use agrofund_core::FundingOpportunity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod cache;
pub mod fetch;

pub use cache::{cache_key, CacheAges, CacheError, CacheKey, ResponseCache};
pub use fetch::{BackoffPolicy, FeedFailure, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher};

pub const CRATE_NAME: &str = "agrofund-storage";

/// Header row of the tabular catalog format, in column order.
pub const CATALOG_COLUMNS: [&str; 16] = [
    "name",
    "source",
    "closingDate",
    "link",
    "status",
    "amount",
    "areaOfInterest",
    "description",
    "contactEmail",
    "phone",
    "requirements",
    "financingType",
    "complexityLevel",
    "estimatedDuration",
    "cofinancingPercentage",
    "keywords",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("catalog file {0} does not exist")]
    NotFound(PathBuf),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("unsupported catalog format for {0} (expected .csv or .json)")]
    UnsupportedFormat(PathBuf),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogFormat {
    /// Header row of field names, one row per record.
    Csv,
    /// A JSON array of objects.
    Json,
}

impl CatalogFormat {
    pub fn from_path(path: &Path) -> Result<Self, StoreError> {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("csv") => Ok(CatalogFormat::Csv),
            Some("json") => Ok(CatalogFormat::Json),
            _ => Err(StoreError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            CatalogFormat::Csv => "csv",
            CatalogFormat::Json => "json",
        }
    }
}

pub fn encode_records(
    format: CatalogFormat,
    records: &[FundingOpportunity],
) -> Result<Vec<u8>, String> {
    match format {
        CatalogFormat::Json => serde_json::to_vec_pretty(records).map_err(|e| e.to_string()),
        CatalogFormat::Csv => {
            let mut writer = csv::Writer::from_writer(Vec::new());
            if records.is_empty() {
                writer.write_record(CATALOG_COLUMNS).map_err(|e| e.to_string())?;
            }
            for record in records {
                writer.serialize(record).map_err(|e| e.to_string())?;
            }
            writer.into_inner().map_err(|e| e.to_string())
        }
    }
}

/// Decodes catalog bytes. Rows without a name are skipped.
pub fn decode_records(format: CatalogFormat, bytes: &[u8]) -> Result<Vec<FundingOpportunity>, String> {
    let records: Vec<FundingOpportunity> = match format {
        CatalogFormat::Json => {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            serde_json::from_slice(bytes).map_err(|e| e.to_string())?
        }
        CatalogFormat::Csv => csv::Reader::from_reader(bytes)
            .deserialize::<FundingOpportunity>()
            .collect::<Result<_, _>>()
            .map_err(|e: csv::Error| e.to_string())?,
    };
    let before = records.len();
    let records: Vec<_> = records
        .into_iter()
        .filter(|r| !r.name.trim().is_empty())
        .collect();
    if records.len() != before {
        warn!(skipped = before - records.len(), "skipping catalog rows without a name");
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct SavedCatalog {
    pub path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub records: usize,
    pub byte_size: usize,
}

/// File-backed catalog with timestamped backups. One writer at a time per store.
#[derive(Debug)]
pub struct CatalogStore {
    path: PathBuf,
    format: CatalogFormat,
    backup_dir: PathBuf,
    backup_retention: usize,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let format = CatalogFormat::from_path(&path)?;
        Ok(Self {
            path,
            format,
            backup_dir: backup_dir.into(),
            backup_retention: 0,
            write_lock: Mutex::new(()),
        })
    }

    /// Keep at most `retention` backups of this catalog; 0 keeps all of them.
    pub fn with_backup_retention(mut self, retention: usize) -> Self {
        self.backup_retention = retention;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CatalogFormat {
        self.format
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn try_load(&self) -> Result<Vec<FundingOpportunity>, StoreError> {
        read_catalog(&self.path, self.format).await
    }

    /// Loads the catalog. A missing file is an empty catalog; an unreadable one is
    /// logged and also treated as empty.
    pub async fn load(&self) -> Vec<FundingOpportunity> {
        match self.try_load().await {
            Ok(records) => records,
            Err(StoreError::NotFound(_)) => {
                debug!(path = %self.path.display(), "catalog not found, starting empty");
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "failed to load catalog, continuing with an empty one");
                Vec::new()
            }
        }
    }

    /// Overwrites the catalog atomically, then writes a timestamped backup copy.
    pub async fn save(&self, records: &[FundingOpportunity]) -> Result<SavedCatalog, StoreError> {
        self.save_at(records, Utc::now()).await
    }

    pub async fn save_at(
        &self,
        records: &[FundingOpportunity],
        now: DateTime<Utc>,
    ) -> Result<SavedCatalog, StoreError> {
        let span = info_span!("catalog_save", path = %self.path.display(), records = records.len());
        self.save_locked(records, now).instrument(span).await
    }

    async fn save_locked(
        &self,
        records: &[FundingOpportunity],
        now: DateTime<Utc>,
    ) -> Result<SavedCatalog, StoreError> {
        let _writer = self.write_lock.lock().await;
        let bytes = encode_records(self.format, records).map_err(|reason| StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        })?;
        write_atomic(&self.path, &bytes).await?;

        let backup_path = match self.write_backup(&bytes, now).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "catalog saved but backup failed");
                None
            }
        };
        if let Err(err) = self.prune_backups().await {
            warn!(error = %err, "failed to prune old catalog backups");
        }

        info!(bytes = bytes.len(), "catalog saved");
        Ok(SavedCatalog {
            path: self.path.clone(),
            backup_path,
            records: records.len(),
            byte_size: bytes.len(),
        })
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog".to_string())
    }

    pub fn backup_file_name(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}_{}.{}",
            self.stem(),
            at.format("%Y%m%d_%H%M%S"),
            self.format.extension()
        )
    }

    async fn write_backup(&self, bytes: &[u8], now: DateTime<Utc>) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.backup_dir)
            .await
            .map_err(|e| StoreError::io(&self.backup_dir, e))?;

        let base = self.backup_file_name(now);
        let mut candidate = self.backup_dir.join(&base);
        let mut suffix = 1;
        while fs::try_exists(&candidate)
            .await
            .map_err(|e| StoreError::io(&candidate, e))?
        {
            let (stem, ext) = base.rsplit_once('.').unwrap_or((base.as_str(), ""));
            candidate = self.backup_dir.join(format!("{stem}-{suffix}.{ext}"));
            suffix += 1;
        }
        write_atomic(&candidate, bytes).await?;
        Ok(candidate)
    }

    /// Backups of this catalog, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>, StoreError> {
        let prefix = format!("{}_", self.stem());
        let suffix = format!(".{}", self.format.extension());
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.backup_dir, err)),
        };
        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.backup_dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(middle) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            else {
                continue;
            };
            if let Some(order) = backup_order(middle) {
                backups.push((order, entry.path()));
            }
        }
        backups.sort();
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }

    async fn prune_backups(&self) -> Result<usize, StoreError> {
        if self.backup_retention == 0 {
            return Ok(0);
        }
        let backups = self.list_backups().await?;
        let excess = backups.len().saturating_sub(self.backup_retention);
        for old in &backups[..excess] {
            fs::remove_file(old).await.map_err(|e| StoreError::io(old, e))?;
            debug!(path = %old.display(), "pruned catalog backup");
        }
        Ok(excess)
    }
}

/// Sort key for the `<YYYYMMDD_HHMMSS>[-N]` part of a backup name. Names that do not
/// carry a timestamp belong to some other file and yield `None`.
fn backup_order(middle: &str) -> Option<(String, u32)> {
    let (stamp, collision) = match middle.split_once('-') {
        Some((stamp, n)) => (stamp, n.parse().ok()?),
        None => (middle, 0),
    };
    let bytes = stamp.as_bytes();
    let well_formed = bytes.len() == 15
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit());
    well_formed.then(|| (stamp.to_string(), collision))
}

/// Reads any catalog file, picking the format from its extension.
pub async fn read_catalog(path: &Path, format: CatalogFormat) -> Result<Vec<FundingOpportunity>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }
        Err(err) => return Err(StoreError::io(path, err)),
    };
    decode_records(format, &bytes).map_err(|reason| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    })
}

/// Writes via a sibling temp file and rename so readers never see a partial file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StoreError::io(&parent, e))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

/// Summary of the most recent merge, rewritten wholesale on each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub generated_at: DateTime<Utc>,
    pub existing_count: usize,
    pub incoming_count: usize,
    pub added_count: usize,
    pub duplicate_count: usize,
    pub rejected_count: usize,
    pub total_count: usize,
    pub sources: Vec<String>,
    pub areas: Vec<String>,
}

impl MergeStats {
    pub fn describe(
        generated_at: DateTime<Utc>,
        existing_count: usize,
        incoming: &[FundingOpportunity],
        outcome: &agrofund_core::MergeOutcome,
        rejected_count: usize,
    ) -> Self {
        let mut sources: Vec<String> = incoming.iter().map(|r| r.source.clone()).collect();
        sources.sort();
        sources.dedup();
        let mut areas: Vec<String> = incoming.iter().map(|r| r.area_of_interest.clone()).collect();
        areas.sort();
        areas.dedup();
        Self {
            generated_at,
            existing_count,
            incoming_count: incoming.len(),
            added_count: outcome.added,
            duplicate_count: outcome.duplicates,
            rejected_count,
            total_count: outcome.merged.len(),
            sources,
            areas,
        }
    }
}

pub async fn write_merge_stats(path: &Path, stats: &MergeStats) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(stats).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    write_atomic(path, &bytes).await
}

pub async fn read_merge_stats(path: &Path) -> Option<MergeStats> {
    let bytes = fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(stats) => Some(stats),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable merge stats");
            None
        }
    }
}
