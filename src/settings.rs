use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Top-level application configuration, loaded from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Tuning for the acquisition engine and its cycle driver.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of agents executing concurrently on this instance.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Only agent ids matching this pattern are eligible. Absent means all.
    #[serde(default)]
    pub enabled_pattern: Option<String>,
    /// Agent ids matching this pattern are never acquired.
    #[serde(default)]
    pub disabled_pattern: Option<String>,
    /// Whether to use the batch acquisition path. Falls back to the
    /// per-agent path on batch failure either way.
    #[serde(default = "default_true")]
    pub batch_enabled: bool,
    /// Scan window size per batch store call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Multiplier on the base number of scan attempts per cycle. Extra
    /// attempts compensate for waiting entries rejected by local filters.
    #[serde(default = "default_chunk_attempt_multiplier")]
    pub chunk_attempt_multiplier: f64,
    /// Driver tick period.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,
    /// How often repopulation reconciles the registry with the store.
    #[serde(default = "default_repopulate_interval_ms")]
    pub repopulate_interval_ms: i64,
    /// Window for the initial-registration jitter. Zero disables jitter and
    /// makes newly added agents immediately eligible.
    #[serde(default)]
    pub jitter_window_ms: i64,
    /// Grace past the execution deadline before the dead-man timer fires.
    #[serde(default = "default_zombie_threshold_ms")]
    pub zombie_threshold_ms: i64,
    /// Agent ids matching this pattern get the longer zombie threshold.
    /// A pattern that fails to compile is ignored with a warning.
    #[serde(default)]
    pub exceptional_agents_pattern: Option<String>,
    #[serde(default = "default_exceptional_zombie_threshold_ms")]
    pub exceptional_zombie_threshold_ms: i64,
    /// Deferred store writes are retried this many times, then dropped.
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Minimum spacing between stall diagnostic log lines.
    #[serde(default = "default_stall_log_period_ms")]
    pub stall_log_period_ms: i64,
    /// Number of waiting-set heads sampled by the stall diagnostic and the
    /// consistency self-check.
    #[serde(default = "default_stall_sample")]
    pub stall_sample: usize,
    /// How long a store clock offset reading stays cached.
    #[serde(default = "default_time_cache_ms")]
    pub time_cache_ms: i64,
}

/// Reschedule backoff applied to failed executions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    /// Reschedule offset for unclassified failures, unless the agent's
    /// interval policy supplies its own error period.
    #[serde(default = "default_error_interval_ms")]
    pub error_interval_ms: i64,
    /// Base offset for throttled failures, doubled per consecutive failure.
    #[serde(default = "default_throttle_base_ms")]
    pub throttle_base_ms: i64,
    #[serde(default = "default_throttle_multiplier")]
    pub throttle_multiplier: f64,
    #[serde(default = "default_throttle_max_ms")]
    pub throttle_max_ms: i64,
    /// Transient failures retry immediately this many consecutive times
    /// before the error interval applies.
    #[serde(default = "default_max_immediate_retries")]
    pub max_immediate_retries: u32,
    /// Symmetric jitter applied to non-zero failure offsets.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

/// Shared circuit breaker tuning. The store-connectivity breaker derives
/// stricter parameters from these values.
#[derive(Debug, Deserialize, Clone)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// How long a half-open probe may stay outstanding before another
    /// probe is allowed.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Names of the sorted sets in the shared store.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_waiting_set")]
    pub waiting_set: String,
    #[serde(default = "default_working_set")]
    pub working_set: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub addr: String, // e.g. 127.0.0.1:9598
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_max_concurrent() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_chunk_attempt_multiplier() -> f64 {
    3.0
}

fn default_cycle_interval_ms() -> u64 {
    1000
}

fn default_repopulate_interval_ms() -> i64 {
    30_000
}

fn default_zombie_threshold_ms() -> i64 {
    600_000
}

fn default_exceptional_zombie_threshold_ms() -> i64 {
    3_600_000
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_stall_log_period_ms() -> i64 {
    60_000
}

fn default_stall_sample() -> usize {
    10
}

fn default_time_cache_ms() -> i64 {
    30_000
}

fn default_error_interval_ms() -> i64 {
    60_000
}

fn default_throttle_base_ms() -> i64 {
    30_000
}

fn default_throttle_multiplier() -> f64 {
    2.0
}

fn default_throttle_max_ms() -> i64 {
    900_000
}

fn default_max_immediate_retries() -> u32 {
    2
}

fn default_jitter_ratio() -> f64 {
    0.1
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_ms() -> u64 {
    10_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_waiting_set() -> String {
    "waiting".to_string()
}

fn default_working_set() -> String {
    "working".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9598".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            enabled_pattern: None,
            disabled_pattern: None,
            batch_enabled: true,
            batch_size: default_batch_size(),
            chunk_attempt_multiplier: default_chunk_attempt_multiplier(),
            cycle_interval_ms: default_cycle_interval_ms(),
            repopulate_interval_ms: default_repopulate_interval_ms(),
            jitter_window_ms: 0,
            zombie_threshold_ms: default_zombie_threshold_ms(),
            exceptional_agents_pattern: None,
            exceptional_zombie_threshold_ms: default_exceptional_zombie_threshold_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            stall_log_period_ms: default_stall_log_period_ms(),
            stall_sample: default_stall_sample(),
            time_cache_ms: default_time_cache_ms(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            error_interval_ms: default_error_interval_ms(),
            throttle_base_ms: default_throttle_base_ms(),
            throttle_multiplier: default_throttle_multiplier(),
            throttle_max_ms: default_throttle_max_ms(),
            max_immediate_retries: default_max_immediate_retries(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            waiting_set: default_waiting_set(),
            working_set: default_working_set(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

/// The engine-facing slice of the application config.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub backoff: BackoffConfig,
    pub breaker: BreakerConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            scheduler: self.scheduler.clone(),
            backoff: self.backoff.clone(),
            breaker: self.breaker.clone(),
        }
    }
}
