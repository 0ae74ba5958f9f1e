//! Refresh orchestration: fetch every enabled source, normalize, merge into the catalog,
//! save with a backup, rewrite the stats sidecar and invalidate cached views.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agrofund_adapters::{read_raw_file, source_for_config, FetchSource, SourceConfig, StaticSource};
use agrofund_core::{env, merge, normalize_batch, DedupKey, FundingOpportunity};
use agrofund_storage::{
    write_merge_stats, CatalogStore, HttpClientConfig, HttpFetcher, MergeStats, ResponseCache, StoreError,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "agrofund-sync";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub catalog_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_retention: usize,
    pub stats_path: PathBuf,
    pub cache_dir: PathBuf,
    pub dedup_key: DedupKey,
    pub scheduler_enabled: bool,
    pub refresh_interval_hours: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl SyncConfig {
    /// Default layout under `workspace_root`.
    pub fn rooted(workspace_root: impl Into<PathBuf>) -> Self {
        let root = workspace_root.into();
        Self {
            sources_path: root.join("sources.yaml"),
            catalog_path: root.join("data/catalog.csv"),
            backup_dir: root.join("data/backups"),
            backup_retention: 30,
            stats_path: root.join("data/merge_stats.json"),
            cache_dir: root.join("data/cache"),
            dedup_key: DedupKey::NameAndSource,
            scheduler_enabled: false,
            refresh_interval_hours: 24,
            user_agent: "agrofund-bot/0.1".to_string(),
            http_timeout_secs: 30,
            workspace_root: root,
        }
    }

    /// Relative paths in the environment resolve against `AGROFUND_WORKSPACE`.
    pub fn from_env() -> Self {
        let root = env::path("AGROFUND_WORKSPACE", ".");
        let dedup_key = env::string("AGROFUND_DEDUP_KEY", "name+source")
            .parse()
            .unwrap_or_else(|err: String| {
                warn!(error = %err, "falling back to the name+source dedup key");
                DedupKey::NameAndSource
            });
        Self {
            sources_path: root.join(env::path("AGROFUND_SOURCES_PATH", "sources.yaml")),
            catalog_path: root.join(env::path("AGROFUND_CATALOG_PATH", "data/catalog.csv")),
            backup_dir: root.join(env::path("AGROFUND_BACKUP_DIR", "data/backups")),
            backup_retention: env::parsed("AGROFUND_BACKUP_RETENTION", 30),
            stats_path: root.join(env::path("AGROFUND_STATS_PATH", "data/merge_stats.json")),
            cache_dir: root.join(env::path("AGROFUND_CACHE_DIR", "data/cache")),
            dedup_key,
            scheduler_enabled: env::flag("AGROFUND_SCHEDULER_ENABLED"),
            refresh_interval_hours: env::parsed("AGROFUND_REFRESH_INTERVAL_HOURS", 24),
            user_agent: env::string("AGROFUND_USER_AGENT", "agrofund-bot/0.1"),
            http_timeout_secs: env::parsed("AGROFUND_HTTP_TIMEOUT_SECS", 30),
            workspace_root: root,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_hours.max(1) * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub fetched: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub existing_count: usize,
    pub incoming_count: usize,
    pub added: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub total: usize,
    /// False when the catalog could not be read or written; the file on disk is untouched.
    pub persisted: bool,
    pub backup_path: Option<String>,
    pub cache_entries_cleared: usize,
}

pub struct RefreshPipeline {
    config: SyncConfig,
    store: CatalogStore,
    cache: ResponseCache,
    http: HttpFetcher,
    sources: Option<Vec<Box<dyn FetchSource>>>,
    run_lock: Mutex<()>,
}

impl RefreshPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let store = CatalogStore::new(&config.catalog_path, &config.backup_dir)
            .context("opening catalog store")?
            .with_backup_retention(config.backup_retention);
        let cache = ResponseCache::new(&config.cache_dir);
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self {
            config,
            store,
            cache,
            http,
            sources: None,
            run_lock: Mutex::new(()),
        })
    }

    /// Replaces the `sources.yaml` registry with a fixed set of sources.
    pub fn with_sources(mut self, sources: Vec<Box<dyn FetchSource>>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Runs one refresh, waiting for any run already in progress.
    pub async fn run_once(&self) -> Result<RefreshSummary> {
        let _running = self.run_lock.lock().await;
        self.refresh_registered().await
    }

    /// Runs one refresh unless another is in progress, in which case returns `None`.
    pub async fn try_run_once(&self) -> Result<Option<RefreshSummary>> {
        let Ok(_running) = self.run_lock.try_lock() else {
            info!("refresh already in progress, skipping");
            return Ok(None);
        };
        self.refresh_registered().await.map(Some)
    }

    /// Merges a local CSV or JSON file into the catalog.
    pub async fn import_file(&self, path: &Path) -> Result<RefreshSummary> {
        let source_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "import".to_string());
        let records = read_raw_file(&source_id, path)
            .await
            .with_context(|| format!("importing {}", path.display()))?;
        let sources: Vec<Box<dyn FetchSource>> = vec![Box::new(StaticSource::new(source_id, records))];

        let _running = self.run_lock.lock().await;
        let span = info_span!("catalog_import", path = %path.display());
        Ok(self.refresh_from(&sources).instrument(span).await)
    }

    async fn refresh_registered(&self) -> Result<RefreshSummary> {
        let built;
        let sources = match &self.sources {
            Some(sources) => sources,
            None => {
                built = self.sources_from_registry().await?;
                &built
            }
        };
        let span = info_span!("refresh", sources = sources.len());
        Ok(self.refresh_from(sources).instrument(span).await)
    }

    async fn sources_from_registry(&self) -> Result<Vec<Box<dyn FetchSource>>> {
        let registry = SourceRegistry::load(&self.config.sources_path).await?;
        let mut sources = Vec::new();
        for config in registry.enabled() {
            match source_for_config(config, &self.config.workspace_root, &self.http) {
                Ok(source) => sources.push(source),
                Err(err) => warn!(source_id = %config.source_id, error = %err, "skipping source"),
            }
        }
        Ok(sources)
    }

    async fn refresh_from(&self, sources: &[Box<dyn FetchSource>]) -> RefreshSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut reports = Vec::with_capacity(sources.len());
        let mut incoming: Vec<FundingOpportunity> = Vec::new();
        let mut rejected = 0usize;
        for source in sources {
            let source_id = source.source_id().to_string();
            let span = info_span!("fetch_source", source_id = %source_id);
            match source.fetch_batch().instrument(span).await {
                Ok(raw) => {
                    let batch = normalize_batch(&raw);
                    rejected += batch.rejected;
                    reports.push(SourceReport {
                        source_id,
                        fetched: raw.len(),
                        accepted: batch.records.len(),
                        rejected: batch.rejected,
                        error: None,
                    });
                    incoming.extend(batch.records);
                }
                Err(err) => {
                    warn!(source_id = %source_id, error = %err, "source failed, continuing without it");
                    reports.push(SourceReport {
                        source_id,
                        fetched: 0,
                        accepted: 0,
                        rejected: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        // An unreadable catalog is never overwritten by a merge that could not see it.
        let (existing, writable) = match self.store.try_load().await {
            Ok(records) => (records, true),
            Err(StoreError::NotFound(_)) => (Vec::new(), true),
            Err(err) => {
                warn!(error = %err, "catalog unreadable, refresh result will not be saved");
                (Vec::new(), false)
            }
        };

        let outcome = merge(&existing, &incoming, self.config.dedup_key);
        let saved = if writable {
            match self.store.save(&outcome.merged).await {
                Ok(saved) => Some(saved),
                Err(err) => {
                    warn!(error = %err, "failed to save catalog");
                    None
                }
            }
        } else {
            None
        };

        if saved.is_some() {
            let stats = MergeStats::describe(Utc::now(), existing.len(), &incoming, &outcome, rejected);
            if let Err(err) = write_merge_stats(&self.config.stats_path, &stats).await {
                warn!(error = %err, "failed to write merge stats");
            }
        }
        let cache_entries_cleared = self.cache.clear(None).await;

        let summary = RefreshSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
            existing_count: existing.len(),
            incoming_count: incoming.len(),
            added: outcome.added,
            duplicates: outcome.duplicates,
            rejected,
            total: outcome.merged.len(),
            persisted: saved.is_some(),
            backup_path: saved
                .and_then(|s| s.backup_path)
                .map(|p| p.display().to_string()),
            cache_entries_cleared,
        };
        info!(
            run_id = %summary.run_id,
            added = summary.added,
            duplicates = summary.duplicates,
            total = summary.total,
            persisted = summary.persisted,
            "refresh finished"
        );
        summary
    }

    /// Builds a repeating refresh job when the scheduler is enabled. Ticks that land while a
    /// run is still going are skipped.
    pub async fn maybe_build_scheduler(pipeline: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !pipeline.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let every = pipeline.config.refresh_interval();
        let job = Job::new_repeated_async(every, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.try_run_once().await {
                    Ok(Some(summary)) => {
                        info!(run_id = %summary.run_id, total = summary.total, "scheduled refresh done")
                    }
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .context("creating refresh job")?;
        sched.add(job).await.context("adding refresh job")?;
        info!(every_secs = every.as_secs(), "refresh scheduler ready");
        Ok(Some(sched))
    }
}

pub async fn run_refresh_once_from_env() -> Result<RefreshSummary> {
    let pipeline = RefreshPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agrofund_adapters::AdapterError;
    use agrofund_core::RawRecord;
    use serde_json::json;

    /// Stands in for an unreachable feed.
    struct FailingSource;

    #[async_trait::async_trait]
    impl FetchSource for FailingSource {
        fn source_id(&self) -> &str {
            "broken-feed"
        }

        async fn fetch_batch(&self) -> Result<Vec<RawRecord>, AdapterError> {
            Err(AdapterError::Malformed {
                source_id: "broken-feed".into(),
                reason: "connection reset".into(),
            })
        }
    }

    fn raw(value: serde_json::Value) -> Vec<RawRecord> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn pipeline(root: &Path, sources: Vec<Box<dyn FetchSource>>) -> RefreshPipeline {
        RefreshPipeline::new(SyncConfig::rooted(root)).unwrap().with_sources(sources)
    }

    #[tokio::test]
    async fn failing_source_degrades_to_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = StaticSource::new(
            "seed",
            raw(json!([{"name": "A", "source": "INDAP"}, {"fuente": "sin nombre"}])),
        );
        let pipeline = pipeline(dir.path(), vec![Box::new(FailingSource), Box::new(good)]);

        let summary = pipeline.run_once().await.unwrap();
        assert!(summary.persisted);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.rejected, 1);
        assert!(summary.sources[0].error.is_some());
        assert_eq!(summary.sources[1].accepted, 1);
    }

    #[tokio::test]
    async fn unreadable_catalog_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::rooted(dir.path());
        config.catalog_path = dir.path().join("catalog.json");
        std::fs::write(&config.catalog_path, b"[{\"name\": ").unwrap();

        let good = StaticSource::new("seed", raw(json!([{"name": "A"}])));
        let pipeline = RefreshPipeline::new(config.clone())
            .unwrap()
            .with_sources(vec![Box::new(good)]);
        let summary = pipeline.run_once().await.unwrap();

        assert!(!summary.persisted);
        assert_eq!(std::fs::read(&config.catalog_path).unwrap(), b"[{\"name\": ");
        assert!(!config.stats_path.exists());
    }

    #[tokio::test]
    async fn overlapping_runs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), Vec::new());
        let held = pipeline.run_lock.lock().await;
        assert!(pipeline.try_run_once().await.unwrap().is_none());
        drop(held);
        assert!(pipeline.try_run_once().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn refresh_invalidates_cached_views() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), Vec::new());
        let key = agrofund_storage::cache_key("stats", &[], &[]);
        pipeline.cache().set(&key, &42, Duration::from_secs(60)).await.unwrap();

        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.cache_entries_cleared, 1);
        assert_eq!(pipeline.cache().get::<i32>(&key, Duration::from_secs(60)).await, None);
    }

    #[test]
    fn rooted_config_uses_documented_defaults() {
        let config = SyncConfig::rooted("/srv/agrofund");
        assert_eq!(config.catalog_path, PathBuf::from("/srv/agrofund/data/catalog.csv"));
        assert_eq!(config.dedup_key, DedupKey::NameAndSource);
        assert_eq!(config.refresh_interval(), Duration::from_secs(24 * 3600));
        assert!(!config.scheduler_enabled);
    }

    #[tokio::test]
    async fn scheduler_is_only_built_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let disabled = Arc::new(pipeline(dir.path(), Vec::new()));
        assert!(RefreshPipeline::maybe_build_scheduler(disabled).await.unwrap().is_none());
    }
}
