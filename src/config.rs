use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::classify::ApiPattern;
use crate::model::RateLimitRule;
use crate::queue::QueueConfig;
use crate::ratelimit::RateLimitConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_proxy_port() -> u16 {
    8000
}
fn default_admin_port() -> u16 {
    8001
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { proxy_port: default_proxy_port(), admin_port: default_admin_port(), host: default_host() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_downstream_timeout")]
    pub timeout: u64,
}

fn default_downstream_timeout() -> u64 {
    30
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self { base_url: String::new(), timeout: default_downstream_timeout() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "pylon.sqlite3".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_database_path() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    #[serde(default)]
    pub password_hash: String,
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_jwt_expire_hours")]
    pub jwt_expire_hours: i64,
}

fn default_jwt_expire_hours() -> i64 {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSection {
    #[serde(default)]
    pub global: RateLimitRule,
    #[serde(default)]
    pub default_user: RateLimitRule,
    #[serde(default)]
    pub apis: HashMap<String, RateLimitRule>,
    #[serde(default)]
    pub api_patterns: Vec<ApiPatternConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPatternConfig {
    pub pattern: String,
    #[serde(default)]
    pub method: Option<String>,
    pub rule: RateLimitRule,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            global: defaults.global,
            default_user: defaults.default_user,
            apis: HashMap::new(),
            api_patterns: Vec::new(),
        }
    }
}

impl RateLimitSection {
    pub fn into_core_config(self) -> RateLimitConfig {
        RateLimitConfig {
            global: self.global,
            default_user: self.default_user,
            apis: self.apis,
            api_patterns: self
                .api_patterns
                .into_iter()
                .map(|p| ApiPattern::new(&p.pattern, p.method, p.rule))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSection {
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,
    #[serde(default = "default_queue_timeout")]
    pub timeout: u64,
}

fn default_queue_max_size() -> usize {
    100
}
fn default_queue_timeout() -> u64 {
    30
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { max_size: default_queue_max_size(), timeout: default_queue_timeout() }
    }
}

impl QueueSection {
    pub fn into_core_config(self) -> QueueConfig {
        QueueConfig { max_size: self.max_size, timeout: std::time::Duration::from_secs(self.timeout) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SseConfig {
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

fn default_idle_timeout() -> u64 {
    60
}

impl Default for SseConfig {
    fn default() -> Self {
        Self { idle_timeout: default_idle_timeout() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRetentionConfig {
    #[serde(default = "default_retention_days")]
    pub days: i64,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,
}

fn default_retention_days() -> i64 {
    30
}
fn default_cleanup_interval_hours() -> u64 {
    24
}

impl Default for DataRetentionConfig {
    fn default() -> Self {
        Self { days: default_retention_days(), cleanup_interval_hours: default_cleanup_interval_hours() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

/// Top-level configuration. Each section is independently optional in the
/// YAML file: an absent section keeps its compiled-in `Default`, a present
/// one replaces it wholesale (no cross-boundary field merge; only the
/// per-credential rate-limit override merges field-by-field, inside the
/// limiter itself).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub server: ServerConfig,
    pub downstream: DownstreamConfig,
    pub database: DatabaseConfig,
    pub admin: AdminConfig,
    pub rate_limit: RateLimitSection,
    pub queue: QueueSection,
    pub sse: SseConfig,
    pub data_retention: DataRetentionConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("failed to read config file {path}: {err}"))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|err| anyhow::anyhow!("failed to parse config file {path}: {err}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_sections_keep_compiled_in_defaults() {
        let yaml = "server:\n  proxyPort: 9000\ndownstream:\n  baseUrl: https://api.example.com\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.proxy_port, 9000);
        assert_eq!(config.downstream.base_url, "https://api.example.com");
        assert_eq!(config.rate_limit.global.max_concurrent, Some(50));
        assert_eq!(config.rate_limit.default_user.max_requests_per_minute, Some(60));
        assert_eq!(config.queue.max_size, 100);
        assert_eq!(config.sse.idle_timeout, 60);
    }

    #[test]
    fn present_section_replaces_default_wholesale() {
        let yaml = "rateLimit:\n  global:\n    maxConcurrent: 10\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limit.global.max_concurrent, Some(10));
        // Fields not set on the global rule within the present section use
        // RateLimitRule's own per-field defaults (None), not the compiled
        // default triple, since the section itself was explicitly provided.
        assert_eq!(config.rate_limit.global.max_requests_per_minute, None);
    }

    #[test]
    fn empty_file_uses_every_default() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.proxy_port, 8000);
        assert_eq!(config.server.admin_port, 8001);
        assert_eq!(config.data_retention.days, 30);
    }
}
