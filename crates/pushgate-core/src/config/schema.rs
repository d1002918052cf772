//! Configuration schema definitions.

use crate::types::{Application, ChannelBinding, FailureRule, ProviderAccount, ProviderSignature};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main pushgate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Where tasks, logs and the work queue are kept.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Work queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Delayed task scanner settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Channel selector settings.
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Callback timeout scanner settings.
    #[serde(default)]
    pub callback_timeout: CallbackTimeoutConfig,

    /// Provider delivery report polling.
    #[serde(default)]
    pub status_pull: StatusPullConfig,

    /// Outward status notification settings.
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Deadline for a single provider call, in seconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Client applications.
    #[serde(default)]
    pub applications: Vec<Application>,

    /// Provider accounts.
    #[serde(default)]
    pub providers: Vec<ProviderAccount>,

    /// Channel to provider bindings.
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,

    /// Signature mappings.
    #[serde(default)]
    pub signatures: Vec<ProviderSignature>,

    /// Failure rules.
    #[serde(default)]
    pub rules: Vec<FailureRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            selector: SelectorConfig::default(),
            callback_timeout: CallbackTimeoutConfig::default(),
            status_pull: StatusPullConfig::default(),
            notify: NotifyConfig::default(),
            send_timeout_secs: default_send_timeout(),
            logging: LoggingConfig::default(),
            applications: Vec::new(),
            providers: Vec::new(),
            channels: Vec::new(),
            signatures: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

fn default_send_timeout() -> u64 {
    30
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Everything lives in process memory and is lost on restart.
    #[default]
    Memory,
    /// Tasks, logs and the queue live in a SQLite database file.
    Sqlite,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Database file for the sqlite backend.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("pushgate.db")
}

/// Work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Main stream name.
    #[serde(default = "default_stream")]
    pub stream: String,

    /// Consumer group name.
    #[serde(default = "default_group")]
    pub group: String,

    /// Dead-letter stream name.
    #[serde(default = "default_dead_letter")]
    pub dead_letter_stream: String,

    /// Delayed index name.
    #[serde(default = "default_delayed_key")]
    pub delayed_key: String,

    /// How long a read waits for new entries, in seconds.
    #[serde(default = "default_block")]
    pub block_secs: u64,

    /// Entries claimed per read.
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Idle time after which an unacknowledged entry is reported, in seconds.
    #[serde(default = "default_pending_idle")]
    pub pending_idle_secs: u64,
}

impl QueueConfig {
    pub fn block(&self) -> Duration {
        Duration::from_secs(self.block_secs)
    }

    pub fn pending_idle(&self) -> Duration {
        Duration::from_secs(self.pending_idle_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            group: default_group(),
            dead_letter_stream: default_dead_letter(),
            delayed_key: default_delayed_key(),
            block_secs: default_block(),
            read_count: default_read_count(),
            pending_idle_secs: default_pending_idle(),
        }
    }
}

fn default_stream() -> String {
    "push:stream:messages".to_string()
}

fn default_group() -> String {
    "push-workers".to_string()
}

fn default_dead_letter() -> String {
    "push:stream:dead_letter".to_string()
}

fn default_delayed_key() -> String {
    "push:delayed:tasks".to_string()
}

fn default_block() -> u64 {
    5
}

fn default_read_count() -> usize {
    10
}

fn default_pending_idle() -> u64 {
    300
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// How long shutdown waits for workers, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_worker_count() -> usize {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Delayed task scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scan interval, in seconds.
    #[serde(default = "default_scan_interval")]
    pub interval_secs: u64,

    /// Maximum entries moved per scan.
    #[serde(default = "default_scan_batch")]
    pub batch_size: usize,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scan_interval(),
            batch_size: default_scan_batch(),
        }
    }
}

fn default_scan_interval() -> u64 {
    10
}

fn default_scan_batch() -> usize {
    100
}

/// Channel selector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Gate provider accounts out of selection while their circuit is open.
    #[serde(default = "default_true")]
    pub circuit_gating: bool,

    /// Circuit breaker thresholds.
    #[serde(default)]
    pub circuit: CircuitConfig,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            circuit_gating: true,
            circuit: CircuitConfig::default(),
        }
    }
}

/// Sliding window circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive half-open successes needed to close, also the half-open trial limit.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Statistics window while closed, in seconds.
    #[serde(default = "default_circuit_interval")]
    pub interval_secs: u64,

    /// Time spent open before probing, in seconds.
    #[serde(default = "default_circuit_timeout")]
    pub timeout_secs: u64,

    /// Failure rate (0.0 to 1.0) that opens the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Requests needed in the window before the rate is considered.
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
}

impl CircuitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            interval_secs: default_circuit_interval(),
            timeout_secs: default_circuit_timeout(),
            failure_threshold: default_failure_threshold(),
            min_requests: default_min_requests(),
        }
    }
}

fn default_max_requests() -> u32 {
    3
}

fn default_circuit_interval() -> u64 {
    60
}

fn default_circuit_timeout() -> u64 {
    60
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_min_requests() -> u32 {
    10
}

/// Status pull scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPullConfig {
    /// Enable polling of providers that support pulled delivery reports.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Poll interval, in seconds.
    #[serde(default = "default_pull_interval")]
    pub interval_secs: u64,
}

impl StatusPullConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for StatusPullConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_pull_interval(),
        }
    }
}

fn default_pull_interval() -> u64 {
    60
}

/// Callback timeout scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackTimeoutConfig {
    /// Enable the scanner.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Scan interval, in seconds.
    #[serde(default = "default_timeout_interval")]
    pub interval_secs: u64,

    /// How long a sent task may wait for its callback, in seconds.
    #[serde(default = "default_callback_timeout")]
    pub timeout_secs: u64,

    /// Maximum tasks marked per scan.
    #[serde(default = "default_scan_batch")]
    pub batch_size: usize,
}

impl CallbackTimeoutConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CallbackTimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_timeout_interval(),
            timeout_secs: default_callback_timeout(),
            batch_size: default_scan_batch(),
        }
    }
}

fn default_timeout_interval() -> u64 {
    300
}

fn default_callback_timeout() -> u64 {
    86_400
}

/// Outward notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Attempts after the first one.
    #[serde(default = "default_notify_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, in milliseconds. Attempt n waits n times this.
    #[serde(default = "default_notify_delay")]
    pub retry_delay_ms: u64,

    /// Per-request timeout, in seconds.
    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

impl NotifyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            max_retries: default_notify_retries(),
            retry_delay_ms: default_notify_delay(),
            timeout_secs: default_notify_timeout(),
        }
    }
}

fn default_notify_retries() -> u32 {
    3
}

fn default_notify_delay() -> u64 {
    1000
}

fn default_notify_timeout() -> u64 {
    10
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_true() -> bool {
    true
}
