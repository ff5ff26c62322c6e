//! Configuration module for tandem.

use crate::error::{Result, TandemError};
use crate::scheduling::CronExpr;
use crate::types::DatabaseId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Identifier of the synchronization strategy that assumes backends are already in sync.
pub const PASSIVE_STRATEGY: &str = "passive";

/// Main configuration for a database cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster identifier. Also keys the persisted membership record and
    /// names the cluster-wide lock.
    pub id: String,
    /// Registered backends, in declaration order.
    pub databases: Vec<DatabaseDescriptor>,
    /// Read-routing policy.
    pub balancer: BalancerKind,
    /// Strategy used when activating without an explicit strategy id.
    pub default_sync_strategy: String,
    /// Cron schedule for the failure-detection sweep.
    pub failure_detection_schedule: Option<String>,
    /// Cron schedule for the auto-activation sweep.
    pub auto_activation_schedule: Option<String>,
    /// Dispatch worker pool sizing.
    pub pool: PoolConfig,
    /// Lock decree timeouts.
    pub lock: LockConfig,
    /// Logging configuration.
    pub observability: ObservabilityConfig,
    /// Where persisted membership is kept. `None` keeps it in memory.
    pub state_file: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "cluster".to_string(),
            databases: Vec::new(),
            balancer: BalancerKind::default(),
            default_sync_strategy: PASSIVE_STRATEGY.to_string(),
            failure_detection_schedule: None,
            auto_activation_schedule: None,
            pool: PoolConfig::default(),
            lock: LockConfig::default(),
            observability: ObservabilityConfig::default(),
            state_file: None,
        }
    }
}

impl ClusterConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TandemError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            TandemError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(TandemError::InvalidConfig {
                field: "id".to_string(),
                reason: "Cluster ID must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for descriptor in &self.databases {
            descriptor.validate()?;
            if !seen.insert(&descriptor.id) {
                return Err(TandemError::DuplicateDatabase(descriptor.id.clone()));
            }
        }

        if self.default_sync_strategy.trim().is_empty() {
            return Err(TandemError::InvalidConfig {
                field: "default_sync_strategy".to_string(),
                reason: "Strategy ID must not be empty".to_string(),
            });
        }

        for schedule in [
            &self.failure_detection_schedule,
            &self.auto_activation_schedule,
        ]
        .into_iter()
        .flatten()
        {
            CronExpr::parse(schedule)?;
        }

        self.pool.validate()?;
        self.lock.validate()?;
        Ok(())
    }

    /// Create a minimal development configuration with two local backends.
    pub fn development() -> Self {
        Self {
            id: "dev-cluster".to_string(),
            databases: vec![
                DatabaseDescriptor::new("db1", "mem://db1"),
                DatabaseDescriptor::new("db2", "mem://db2"),
            ],
            failure_detection_schedule: Some("*/30 * * * * *".to_string()),
            auto_activation_schedule: Some("0 * * * * *".to_string()),
            ..Self::default()
        }
    }

    /// Parsed failure-detection schedule, if configured.
    pub fn failure_detection_cron(&self) -> Result<Option<CronExpr>> {
        parse_schedule(self.failure_detection_schedule.as_deref())
    }

    /// Parsed auto-activation schedule, if configured.
    pub fn auto_activation_cron(&self) -> Result<Option<CronExpr>> {
        parse_schedule(self.auto_activation_schedule.as_deref())
    }
}

fn parse_schedule(schedule: Option<&str>) -> Result<Option<CronExpr>> {
    Ok(schedule.map(CronExpr::parse).transpose()?)
}

/// Static description of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDescriptor {
    /// Unique database identifier.
    pub id: DatabaseId,
    /// Driver-specific connection URL.
    pub url: String,
    /// Relative read weight. Zero means "only when nothing else is available".
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Extra driver properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

fn default_weight() -> u32 {
    1
}

impl DatabaseDescriptor {
    pub fn new(id: impl Into<DatabaseId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight: default_weight(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check the id can be persisted in a membership record.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(TandemError::InvalidConfig {
                field: "databases.id".to_string(),
                reason: "Database ID must not be empty".to_string(),
            });
        }
        if self.id.as_str().contains(',') {
            return Err(TandemError::InvalidConfig {
                field: format!("databases.{}", self.id),
                reason: "Database ID must not contain ','".to_string(),
            });
        }
        Ok(())
    }
}

/// Read-routing policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerKind {
    /// Always the highest-weighted backend.
    Simple,
    /// Rotate through backends in proportion to weight.
    #[default]
    RoundRobin,
    /// Weighted random choice.
    Random,
    /// Least in-flight work relative to weight.
    Load,
}

impl std::str::FromStr for BalancerKind {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(BalancerKind::Simple),
            "round-robin" => Ok(BalancerKind::RoundRobin),
            "random" => Ok(BalancerKind::Random),
            "load" => Ok(BalancerKind::Load),
            other => Err(TandemError::InvalidConfig {
                field: "balancer".to_string(),
                reason: format!("Unknown balancer '{}'", other),
            }),
        }
    }
}

/// Dispatch worker pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Minimum number of workers kept around.
    pub min_threads: usize,
    /// Maximum number of backend tasks running at once.
    pub max_threads: usize,
    /// Seconds an idle worker above the minimum is retained.
    pub max_idle: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: 100,
            max_idle: 60,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(TandemError::InvalidConfig {
                field: "pool.max_threads".to_string(),
                reason: "Maximum threads must be non-zero".to_string(),
            });
        }
        if self.min_threads > self.max_threads {
            return Err(TandemError::InvalidConfig {
                field: "pool.min_threads".to_string(),
                reason: format!(
                    "Minimum threads ({}) exceeds maximum threads ({})",
                    self.min_threads, self.max_threads
                ),
            });
        }
        Ok(())
    }
}

/// Lock decree protocol timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long the initiator waits for prepare votes.
    #[serde(with = "humantime_serde")]
    pub decree_timeout: Duration,
    /// How long a prepared recipient waits for commit or abort.
    #[serde(with = "humantime_serde")]
    pub commit_timeout: Duration,
    /// Total time `acquire` keeps retrying before giving up.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            decree_timeout: Duration::from_millis(500),
            commit_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("lock.decree_timeout", self.decree_timeout),
            ("lock.commit_timeout", self.commit_timeout),
            ("lock.acquire_timeout", self.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(TandemError::InvalidConfig {
                    field: field.to_string(),
                    reason: "Timeout must be non-zero".to_string(),
                });
            }
        }
        // A recipient must not give up on a prepared decree before the
        // initiator has finished collecting votes.
        if self.commit_timeout <= self.decree_timeout {
            return Err(TandemError::InvalidConfig {
                field: "lock.commit_timeout".to_string(),
                reason: format!(
                    "Commit timeout ({:?}) must exceed decree timeout ({:?})",
                    self.commit_timeout, self.decree_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
