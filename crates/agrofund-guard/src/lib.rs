//! Request guard: sliding-window rate limiting, attack pattern detection and IP blocking.
//!
//! Per-address request history and suspicious-event counters live in memory and are
//! swept once an address goes quiet. The block list is persisted as JSON and re-read on
//! every check so blocks survive restarts. Access attempts and suspicious events are
//! appended to JSON Lines audit logs.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use agrofund_core::env;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "agrofund-guard";

const BLOCK_FILE: &str = "blocked_ips.json";
const ACCESS_LOG: &str = "access_log.jsonl";
const SUSPICIOUS_LOG: &str = "suspicious_activity.jsonl";

const SQL_MARKERS: &[&str] = &[
    "union select",
    "union all select",
    "select * from",
    "drop table",
    "insert into",
    "delete from",
    "information_schema",
    "' or '1'='1",
    "' or 1=1",
    " or 1=1",
    "';",
    "sleep(",
    "xp_cmdshell",
    "/*",
];
const XSS_MARKERS: &[&str] = &[
    "<script",
    "</script",
    "javascript:",
    "onerror=",
    "onload=",
    "alert(",
    "document.cookie",
    "<iframe",
    "eval(",
];
const TRAVERSAL_MARKERS: &[&str] = &["../", "..\\", "/etc/passwd", "c:\\windows"];
const SCANNER_AGENTS: &[&str] = &[
    "sqlmap", "nikto", "nmap", "masscan", "dirbuster", "gobuster", "wpscan", "acunetix",
    "nessus", "burpsuite", "zgrab", "nuclei",
];

const DEFAULT_BLOCK_HOURS: i64 = 24;
/// Longest block accepted; keeps expiry timestamps well inside the representable range.
pub const MAX_BLOCK_HOURS: i64 = 24 * 365 * 100;
/// Suspicious-event counters are forgotten after this long without a new event.
const STRIKE_MEMORY_HOURS: i64 = 24;
/// Idle in-memory state is swept every this many inspected requests.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub requests_per_minute: usize,
    pub requests_per_hour: usize,
    pub suspicious_threshold: u32,
    pub block_duration_hours: i64,
    pub state_dir: PathBuf,
}

impl SecurityConfig {
    pub fn from_env() -> Self {
        Self {
            requests_per_minute: env::parsed("AGROFUND_RATE_PER_MINUTE", 60),
            requests_per_hour: env::parsed("AGROFUND_RATE_PER_HOUR", 1000),
            suspicious_threshold: env::parsed("AGROFUND_SUSPICIOUS_THRESHOLD", 5),
            block_duration_hours: env::parsed("AGROFUND_BLOCK_HOURS", DEFAULT_BLOCK_HOURS),
            state_dir: env::path("AGROFUND_SECURITY_DIR", "data/security"),
        }
        .validated()
    }

    /// Replaces a negative block duration with the default and caps oversized ones.
    pub fn validated(mut self) -> Self {
        if self.block_duration_hours < 0 {
            warn!(
                configured = self.block_duration_hours,
                "negative block duration, using {DEFAULT_BLOCK_HOURS}h"
            );
            self.block_duration_hours = DEFAULT_BLOCK_HOURS;
        } else if self.block_duration_hours > MAX_BLOCK_HOURS {
            warn!(configured = self.block_duration_hours, "block duration capped at {MAX_BLOCK_HOURS}h");
            self.block_duration_hours = MAX_BLOCK_HOURS;
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("security state i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("security state {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("invalid block duration: {0} hours")]
    InvalidDuration(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    SqlInjection,
    CrossSiteScripting,
    PathTraversal,
    ScannerTool,
}

impl AttackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttackKind::SqlInjection => "sql_injection",
            AttackKind::CrossSiteScripting => "xss",
            AttackKind::PathTraversal => "path_traversal",
            AttackKind::ScannerTool => "scanner_tool",
        }
    }
}

/// Pure marker matching over the (percent-decoded, lowercased) endpoint and user agent.
pub fn detect_attack_patterns(endpoint: &str, user_agent: &str) -> BTreeSet<AttackKind> {
    let target = decode_target(endpoint).to_lowercase();
    let agent = user_agent.to_lowercase();
    let mut kinds = BTreeSet::new();

    let hit = |markers: &[&str]| markers.iter().any(|m| target.contains(m));
    if hit(SQL_MARKERS) {
        kinds.insert(AttackKind::SqlInjection);
    }
    if hit(XSS_MARKERS) {
        kinds.insert(AttackKind::CrossSiteScripting);
    }
    if hit(TRAVERSAL_MARKERS) {
        kinds.insert(AttackKind::PathTraversal);
    }
    if SCANNER_AGENTS.iter().any(|m| agent.contains(m)) {
        kinds.insert(AttackKind::ScannerTool);
    }
    kinds
}

/// Form-style decoding: `+` is a space, then percent escapes. Invalid escapes stay literal.
fn decode_target(input: &str) -> String {
    let spaced = input.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedIp {
    pub ip: String,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl BlockedIp {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessAttempt {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousActivity {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub activity: String,
    pub details: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub ip: &'a str,
    pub user_agent: &'a str,
    pub endpoint: &'a str,
    pub method: &'a str,
}

/// Why a request was turned away. Surfaced to callers, never swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("address is blocked until {expires_at}: {reason}")]
    Blocked {
        reason: String,
        expires_at: DateTime<Utc>,
    },
    #[error("request matched attack patterns: {0:?}")]
    AttackDetected(BTreeSet<AttackKind>),
    #[error("rate limit exceeded")]
    RateLimited,
}

impl Rejection {
    pub fn status_code(&self) -> u16 {
        match self {
            Rejection::Blocked { .. } => 403,
            Rejection::AttackDetected(_) => 400,
            Rejection::RateLimited => 429,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Recorded { count: u32 },
    Blocked { count: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Strikes {
    count: u32,
    last_seen: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SecurityGuard {
    config: SecurityConfig,
    history: DashMap<String, VecDeque<DateTime<Utc>>>,
    suspicious: DashMap<String, Strikes>,
    inspected: AtomicU64,
    block_file: Mutex<()>,
    audit_file: Mutex<()>,
}

impl SecurityGuard {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            config: config.validated(),
            history: DashMap::new(),
            suspicious: DashMap::new(),
            inspected: AtomicU64::new(0),
            block_file: Mutex::new(()),
            audit_file: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Runs every check in order: block list, attack patterns, rate limit.
    pub async fn inspect(&self, request: RequestMeta<'_>) -> Result<(), Rejection> {
        self.inspect_at(request, Utc::now()).await
    }

    pub async fn inspect_at(&self, request: RequestMeta<'_>, now: DateTime<Utc>) -> Result<(), Rejection> {
        if self.inspected.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_idle_at(now);
        }

        if let Some(block) = self.active_block_at(request.ip, now).await {
            return Err(Rejection::Blocked {
                reason: block.reason,
                expires_at: block.expires_at,
            });
        }

        let kinds = detect_attack_patterns(request.endpoint, request.user_agent);
        if !kinds.is_empty() {
            let labels: Vec<_> = kinds.iter().map(|k| k.as_str()).collect();
            self.log_suspicious_activity_at(
                request.ip,
                &labels.join(","),
                &format!("{} {} ua={:?}", request.method, request.endpoint, request.user_agent),
                now,
            )
            .await;
            return Err(Rejection::AttackDetected(kinds));
        }

        if !self.check_rate_limit_at(request.ip, now) {
            self.log_suspicious_activity_at(request.ip, "rate_limit_exceeded", request.endpoint, now)
                .await;
            return Err(Rejection::RateLimited);
        }
        Ok(())
    }

    pub fn check_rate_limit(&self, ip: &str) -> bool {
        self.check_rate_limit_at(ip, Utc::now())
    }

    /// Sliding-window check. A rejected attempt is not recorded.
    pub fn check_rate_limit_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let mut history = self.history.entry(ip.to_string()).or_default();

        let hour_ago = now - TimeDelta::hours(1);
        while history.front().is_some_and(|t| *t <= hour_ago) {
            history.pop_front();
        }

        let minute_ago = now - TimeDelta::seconds(60);
        let last_minute = history.iter().rev().take_while(|t| **t > minute_ago).count();
        if last_minute >= self.config.requests_per_minute {
            debug!(ip, last_minute, "per-minute limit reached");
            return false;
        }
        if history.len() >= self.config.requests_per_hour {
            debug!(ip, last_hour = history.len(), "per-hour limit reached");
            return false;
        }

        history.push_back(now);
        true
    }

    /// Drops request history with nothing inside the hour window and strike counters
    /// that have been quiet for a day. Returns how many entries were evicted.
    pub fn sweep_idle_at(&self, now: DateTime<Utc>) -> usize {
        let hour_ago = now - TimeDelta::hours(1);
        let strikes_cutoff = now - TimeDelta::hours(STRIKE_MEMORY_HOURS);
        let before = self.history.len() + self.suspicious.len();
        self.history
            .retain(|_, seen| seen.back().is_some_and(|t| *t > hour_ago));
        self.suspicious.retain(|_, strikes| strikes.last_seen > strikes_cutoff);
        let evicted = before.saturating_sub(self.history.len() + self.suspicious.len());
        if evicted > 0 {
            debug!(evicted, "swept idle guard state");
        }
        evicted
    }

    fn block_path(&self) -> PathBuf {
        self.config.state_dir.join(BLOCK_FILE)
    }

    async fn read_blocks(&self) -> Result<BTreeMap<String, BlockedIp>, GuardError> {
        let path = self.block_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(GuardError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|e| GuardError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    async fn write_blocks(&self, blocks: &BTreeMap<String, BlockedIp>) -> Result<(), GuardError> {
        let path = self.block_path();
        let io = |source| GuardError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.config.state_dir).await.map_err(io)?;
        let bytes = serde_json::to_vec_pretty(blocks).map_err(|e| GuardError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, bytes).await.map_err(io)?;
        fs::rename(&temp, &path).await.map_err(io)
    }

    pub async fn block_ip(&self, ip: &str, reason: &str, duration_hours: i64) -> Result<BlockedIp, GuardError> {
        self.block_ip_at(ip, reason, duration_hours, Utc::now()).await
    }

    /// Inserts or replaces the block record for `ip`. Durations above
    /// [`MAX_BLOCK_HOURS`] are capped; negative ones are refused.
    pub async fn block_ip_at(
        &self,
        ip: &str,
        reason: &str,
        duration_hours: i64,
        now: DateTime<Utc>,
    ) -> Result<BlockedIp, GuardError> {
        if duration_hours < 0 {
            return Err(GuardError::InvalidDuration(duration_hours));
        }
        let expires_at = TimeDelta::try_hours(duration_hours.min(MAX_BLOCK_HOURS))
            .and_then(|d| now.checked_add_signed(d))
            .ok_or(GuardError::InvalidDuration(duration_hours))?;

        let _lock = self.block_file.lock().await;
        let mut blocks = self.read_blocks().await.unwrap_or_else(|err| {
            warn!(error = %err, "block list unreadable, rebuilding it");
            BTreeMap::new()
        });
        let record = BlockedIp {
            ip: ip.to_string(),
            reason: reason.to_string(),
            blocked_at: now,
            expires_at,
        };
        blocks.insert(ip.to_string(), record.clone());
        self.write_blocks(&blocks).await?;
        info!(ip, reason, expires_at = %record.expires_at, "address blocked");
        Ok(record)
    }

    pub async fn unblock_ip(&self, ip: &str) -> Result<bool, GuardError> {
        let _lock = self.block_file.lock().await;
        let mut blocks = self.read_blocks().await?;
        let removed = blocks.remove(ip).is_some();
        if removed {
            self.write_blocks(&blocks).await?;
            self.suspicious.remove(ip);
            info!(ip, "address unblocked");
        }
        Ok(removed)
    }

    pub async fn is_blocked(&self, ip: &str) -> bool {
        self.is_blocked_at(ip, Utc::now()).await
    }

    pub async fn is_blocked_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.active_block_at(ip, now).await.is_some()
    }

    /// Reads the persisted block list. An unreadable list fails open with a warning.
    pub async fn active_block_at(&self, ip: &str, now: DateTime<Utc>) -> Option<BlockedIp> {
        match self.read_blocks().await {
            Ok(mut blocks) => blocks.remove(ip).filter(|b| b.is_active_at(now)),
            Err(err) => {
                warn!(error = %err, "cannot read block list");
                None
            }
        }
    }

    pub async fn active_blocks(&self) -> Result<Vec<BlockedIp>, GuardError> {
        let now = Utc::now();
        Ok(self
            .read_blocks()
            .await?
            .into_values()
            .filter(|b| b.is_active_at(now))
            .collect())
    }

    pub async fn cleanup_expired_blocks(&self) -> Result<usize, GuardError> {
        let _lock = self.block_file.lock().await;
        let now = Utc::now();
        let mut blocks = self.read_blocks().await?;
        let before = blocks.len();
        blocks.retain(|_, b| b.is_active_at(now));
        let removed = before - blocks.len();
        if removed > 0 {
            self.write_blocks(&blocks).await?;
        }
        Ok(removed)
    }

    pub async fn log_suspicious_activity(&self, ip: &str, activity: &str, details: &str) -> Escalation {
        self.log_suspicious_activity_at(ip, activity, details, Utc::now()).await
    }

    /// Counts the event for `ip`; reaching the threshold blocks the address.
    pub async fn log_suspicious_activity_at(
        &self,
        ip: &str,
        activity: &str,
        details: &str,
        now: DateTime<Utc>,
    ) -> Escalation {
        let count = {
            let mut strikes = self.suspicious.entry(ip.to_string()).or_insert(Strikes {
                count: 0,
                last_seen: now,
            });
            strikes.count += 1;
            strikes.last_seen = now;
            strikes.count
        };
        warn!(ip, activity, count, "suspicious activity");
        self.append_log(
            SUSPICIOUS_LOG,
            &SuspiciousActivity {
                timestamp: now,
                ip: ip.to_string(),
                activity: activity.to_string(),
                details: details.to_string(),
                count,
            },
        )
        .await;

        if count < self.config.suspicious_threshold {
            return Escalation::Recorded { count };
        }
        let reason = format!("automatic block after {count} suspicious events (last: {activity})");
        match self
            .block_ip_at(ip, &reason, self.config.block_duration_hours, now)
            .await
        {
            Ok(_) => {
                self.suspicious.remove(ip);
                Escalation::Blocked { count }
            }
            Err(err) => {
                warn!(ip, error = %err, "failed to persist automatic block");
                Escalation::Recorded { count }
            }
        }
    }

    pub async fn log_access(&self, attempt: &AccessAttempt) {
        self.append_log(ACCESS_LOG, attempt).await;
    }

    async fn append_log<T: Serialize>(&self, file_name: &str, entry: &T) {
        let path = self.config.state_dir.join(file_name);
        let _lock = self.audit_file.lock().await;
        if let Err(err) = append_json_line(&self.config.state_dir, &path, entry).await {
            warn!(path = %path.display(), error = %err, "failed to append audit log");
        }
    }
}

async fn append_json_line<T: Serialize>(dir: &Path, path: &Path, entry: &T) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let mut line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
