use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfiguration {
    /// Identifies this engine node in trigger claims and descriptor run-locks
    pub node_id: String,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub correlation: CorrelationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Mongo,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(StoreBackend::Memory),
            "mongo" | "mongodb" => Ok(StoreBackend::Mongo),
            other => Err(AppError::ConfigurationError(format!(
                "Unknown store backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub mongodb_uri: String,
    pub database_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker tasks polling for due triggers
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// Maximum triggers claimed by one dispatch pass
    pub batch_size: usize,
    /// A firing later than this is treated as a misfire
    pub misfire_threshold_ms: u64,
    /// Claims and run-locks older than this are released by any node
    pub claim_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub wait_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Couples pulled by one run of the correlation job
    pub batch_size: usize,
    /// Unmatched messages older than this are deleted by the retention job
    pub message_retention_secs: u64,
    pub correlation_cron: String,
    pub retention_cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// One of `compact`, `pretty`, `json` or `full`
    pub format: String,
}

impl Default for AppConfiguration {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            store: StoreConfig::default(),
            scheduler: SchedulerConfig::default(),
            retry: RetryConfig::default(),
            correlation: CorrelationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            mongodb_uri: String::new(),
            database_name: "bpm_event_core".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 1000,
            batch_size: 20,
            misfire_threshold_ms: 60_000,
            claim_timeout_ms: 300_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            wait_time_ms: 50,
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            message_retention_secs: 7 * 24 * 3600,
            correlation_cron: "*/5 * * * * *".to_string(),
            retention_cron: "0 0 * * *".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn misfire_threshold(&self) -> chrono::Duration {
        millis_to_duration(self.misfire_threshold_ms)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        millis_to_duration(self.claim_timeout_ms)
    }
}

impl RetryConfig {
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }
}

impl AppConfiguration {
    /// Load configuration from `.env`, an optional YAML file named by
    /// `BPM_CONFIG_FILE`, and environment variables
    pub async fn load() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded .env file");
        }

        let mut config = match std::env::var("BPM_CONFIG_FILE") {
            Ok(path) => Self::load_from_file(&path).await?,
            Err(_) => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        info!(
            node_id = %config.node_id,
            backend = ?config.store.backend,
            workers = config.scheduler.workers,
            "📋 Configuration loaded successfully"
        );
        Ok(config)
    }

    /// Load configuration from a YAML file; missing sections keep their defaults
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::ConfigurationError(format!("Failed to read config file {}: {}", path, e))
        })?;
        let config = Self::from_yaml_str(&content)?;
        debug!(path = path, "📁 Configuration loaded from file");
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| AppError::ConfigurationError(format!("Invalid YAML config: {}", e)))
    }

    /// Overlay individual settings read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup("BPM_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(backend) = lookup("BPM_STORE_BACKEND") {
            self.store.backend = backend.parse()?;
        }
        if let Some(uri) = lookup("MONGODB_URI") {
            self.store.mongodb_uri = uri;
        }
        if let Some(db_name) = lookup("MONGODB_DATABASE") {
            self.store.database_name = db_name;
        }

        override_parsed(&lookup, "BPM_SCHEDULER_WORKERS", &mut self.scheduler.workers)?;
        override_parsed(&lookup, "BPM_SCHEDULER_POLL_INTERVAL_MS", &mut self.scheduler.poll_interval_ms)?;
        override_parsed(&lookup, "BPM_SCHEDULER_BATCH_SIZE", &mut self.scheduler.batch_size)?;
        override_parsed(&lookup, "BPM_MISFIRE_THRESHOLD_MS", &mut self.scheduler.misfire_threshold_ms)?;
        override_parsed(&lookup, "BPM_CLAIM_TIMEOUT_MS", &mut self.scheduler.claim_timeout_ms)?;
        override_parsed(&lookup, "BPM_RETRY_MAX_RETRIES", &mut self.retry.max_retries)?;
        override_parsed(&lookup, "BPM_RETRY_WAIT_TIME_MS", &mut self.retry.wait_time_ms)?;
        override_parsed(&lookup, "BPM_CORRELATION_BATCH_SIZE", &mut self.correlation.batch_size)?;
        override_parsed(&lookup, "BPM_MESSAGE_RETENTION_SECS", &mut self.correlation.message_retention_secs)?;

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }

        debug!("🔧 Configuration overrides applied from environment variables");
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(AppError::ConfigurationError("Node id is required".to_string()));
        }

        if self.store.backend == StoreBackend::Mongo && self.store.mongodb_uri.is_empty() {
            return Err(AppError::ConfigurationError(
                "MongoDB URI is required for the mongo store backend".to_string(),
            ));
        }

        if self.scheduler.workers == 0 {
            return Err(AppError::ConfigurationError(
                "Scheduler needs at least one worker".to_string(),
            ));
        }

        if self.scheduler.claim_timeout_ms == 0 {
            return Err(AppError::ConfigurationError(
                "Claim timeout must be greater than zero".to_string(),
            ));
        }

        if self.scheduler.batch_size == 0 || self.correlation.batch_size == 0 {
            return Err(AppError::ConfigurationError(
                "Batch sizes must be greater than zero".to_string(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(AppError::ConfigurationError("Invalid log level".to_string())),
        }

        debug!("✅ Configuration validation passed");
        Ok(())
    }
}

/// Stable across restarts, so a restarted node finds its own claims again
fn default_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("node-{}", host)
}

fn millis_to_duration(millis: u64) -> chrono::Duration {
    i64::try_from(millis)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or_else(chrono::Duration::max_value)
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigurationError(format!("Invalid {}: {}", key, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.node_id.starts_with("node-"));
        assert_eq!(config.node_id, AppConfiguration::default().node_id);
        assert_eq!(config.scheduler.claim_timeout(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_claim_timeout_override_and_validation() {
        let mut config = AppConfiguration::default();
        config
            .apply_overrides(lookup_from(&[("BPM_CLAIM_TIMEOUT_MS", "0")]))
            .unwrap();
        assert_eq!(config.scheduler.claim_timeout_ms, 0);
        assert!(matches!(config.validate(), Err(AppError::ConfigurationError(_))));

        config.scheduler.claim_timeout_ms = u64::MAX;
        assert!(config.validate().is_ok());
        assert!(config.scheduler.claim_timeout() > chrono::Duration::days(365));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfiguration::default();
        config
            .apply_overrides(lookup_from(&[
                ("BPM_NODE_ID", "engine-a"),
                ("BPM_SCHEDULER_WORKERS", "4"),
                ("BPM_RETRY_MAX_RETRIES", "0"),
                ("BPM_STORE_BACKEND", "mongodb"),
                ("MONGODB_URI", "mongodb://localhost:27017"),
                ("LOG_FORMAT", "json"),
            ]))
            .unwrap();

        assert_eq!(config.node_id, "engine-a");
        assert_eq!(config.scheduler.workers, 4);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.store.backend, StoreBackend::Mongo);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_number_is_a_configuration_error() {
        let mut config = AppConfiguration::default();
        let result = config.apply_overrides(lookup_from(&[("BPM_SCHEDULER_BATCH_SIZE", "lots")]));

        assert!(matches!(result, Err(AppError::ConfigurationError(_))));
    }

    #[test]
    fn test_validate_rejects_mongo_without_uri() {
        let mut config = AppConfiguration::default();
        config.store.backend = StoreBackend::Mongo;
        assert!(config.validate().is_err());

        config.store.mongodb_uri = "mongodb://localhost".to_string();
        config.scheduler.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_keeps_defaults_for_missing_sections() {
        let config = AppConfiguration::from_yaml_str(
            "node_id: yaml-node\nretry:\n  max_retries: 7\n",
        )
        .unwrap();

        assert_eq!(config.node_id, "yaml-node");
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.wait_time_ms, RetryConfig::default().wait_time_ms);
        assert_eq!(config.scheduler.batch_size, 20);
    }
}
