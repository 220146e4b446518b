use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stages: StageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            backends: BackendsConfig::default(),
            retry: RetryConfig::default(),
            stages: StageConfig::default(),
            queue: QueueConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_allowed_headers")]
    pub allowed_headers: Vec<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_allowed_headers() -> Vec<String> {
    [
        "authorization",
        "x-client-info",
        "apikey",
        "content-type",
        "x-user-id",
        "x-user-roles",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_origins: default_allowed_origins(),
            allowed_headers: default_allowed_headers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Directory that holds stored page images.
    #[serde(default = "default_storage_root")]
    pub root: String,
    /// Base URL under which `root` is publicly served.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_storage_root() -> String {
    "./data/objects".to_string()
}

fn default_public_base_url() -> String {
    "http://127.0.0.1:8787/objects".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Reference to a credential. See [`crate::secrets::resolve_secret`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecretRef {
    #[serde(rename = "apiKey", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(rename = "apiKeyFile", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "apiKeyEnvVar", default, skip_serializing_if = "Option::is_none")]
    pub env_var: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(flatten)]
    pub credentials: SecretRef,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_backend_timeout() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            credentials: SecretRef {
                env_var: Some("OPENAI_API_KEY".to_string()),
                ..Default::default()
            },
            timeout_secs: default_backend_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendsConfig {
    #[serde(default)]
    pub ocr: BackendConfig,
    #[serde(default)]
    pub translation: BackendConfig,
    #[serde(default)]
    pub extraction: BackendConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Image reachability check policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_backoff_ms")]
    pub probe_backoff_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
}

fn default_probe_attempts() -> u32 {
    3
}

fn default_probe_backoff_ms() -> u64 {
    1000
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Fixed
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            probe_attempts: default_probe_attempts(),
            probe_backoff_ms: default_probe_backoff_ms(),
            probe_timeout_secs: default_probe_timeout(),
            backoff: default_backoff_kind(),
        }
    }
}

/// Stage thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    /// Content shorter than this skips the translation backend.
    #[serde(default = "default_min_chars")]
    pub min_translation_chars: usize,
    /// Extracted text longer than this emits a chunk-ready event.
    #[serde(default = "default_min_chars")]
    pub chunk_ready_chars: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_target_language")]
    pub target_language: String,
}

fn default_min_chars() -> usize {
    50
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_max_candidates() -> usize {
    3
}

fn default_target_language() -> String {
    "en".to_string()
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            min_translation_chars: default_min_chars(),
            chunk_ready_chars: default_min_chars(),
            min_confidence: default_min_confidence(),
            max_candidates: default_max_candidates(),
            target_language: default_target_language(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Upper bound on `pageCount` when creating a batch.
    #[serde(default = "default_max_batch_pages")]
    pub max_batch_pages: i64,
}

fn default_max_batch_pages() -> i64 {
    2000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_batch_pages: default_max_batch_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    num_cpus::get()
}

fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Human
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
