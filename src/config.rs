use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the control plane
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Filesystem and database locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Container engine connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Gateway publication and health checking
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Response cache tuning
    #[serde(default)]
    pub cache: CacheSettings,

    /// Deployment pipeline behaviour
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Request metrics
    #[serde(default)]
    pub metrics: MetricsSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway (reverse proxy) port (default: 8080)
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Control API and notification socket port (default: 9000)
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Bearer token for the control API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per upstream (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Largest accepted upload archive in MiB (default: 100)
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_gateway_port(),
            api_port: default_api_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            request_timeout_secs: default_request_timeout(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for cloned and unzipped application trees
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,

    /// Directory for the metrics log and other runtime data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database file
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
            data_dir: default_data_dir(),
            database: default_database(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host (e.g. "unix:///var/run/docker.sock"); falls back to DOCKER_HOST
    pub host: Option<String>,

    /// Docker CLI used for image builds
    #[serde(default = "default_docker_cli")]
    pub cli: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            cli: default_docker_cli(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewaySettings {
    /// Domain used for gateways published by deployments
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Seconds between health check rounds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            health_check_interval_secs: default_health_interval(),
            health_check_timeout_secs: default_health_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    /// Entry lifetime in seconds (default: 60)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    /// Seconds between sweeps of expired entries (default: 600)
    #[serde(default = "default_cache_sweep")]
    pub sweep_interval_secs: u64,

    /// Largest body that will be cached (default: 5 MiB)
    #[serde(default = "default_cache_max_entry")]
    pub max_entry_bytes: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            sweep_interval_secs: default_cache_sweep(),
            max_entry_bytes: default_cache_max_entry(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeploySettings {
    /// Ask the interactive client to confirm the exposed port
    #[serde(default)]
    pub interactive: bool,

    /// Seconds to wait for an interactive answer
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_secs: u64,

    /// Attempts to find an attached interactive client
    #[serde(default = "default_client_wait_retries")]
    pub client_wait_retries: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_client_wait_interval")]
    pub client_wait_interval_ms: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            interactive: false,
            prompt_timeout_secs: default_prompt_timeout(),
            client_wait_retries: default_client_wait_retries(),
            client_wait_interval_ms: default_client_wait_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsSettings {
    /// Application id that hourly statistics are stored under
    #[serde(default = "default_metrics_app")]
    pub application_id: String,

    /// Metrics log file name, relative to the data directory
    #[serde(default = "default_metrics_log")]
    pub log_file: String,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            application_id: default_metrics_app(),
            log_file: default_metrics_log(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_api_port() -> u16 {
    9000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_upload_mb() -> usize {
    100
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("./uploads")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_database() -> PathBuf {
    PathBuf::from("./data/neploy.db")
}

fn default_docker_cli() -> String {
    "docker".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_cache_sweep() -> u64 {
    600
}

fn default_cache_max_entry() -> usize {
    5 * 1024 * 1024
}

fn default_prompt_timeout() -> u64 {
    120
}

fn default_client_wait_retries() -> u32 {
    5
}

fn default_client_wait_interval() -> u64 {
    2000
}

fn default_metrics_app() -> String {
    "default".to_string()
}

fn default_metrics_log() -> String {
    "gateway_metrics.log".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == self.server.api_port {
            errors.push(format!(
                "server.port and server.api_port must differ (both {})",
                self.server.port
            ));
        }
        if self.gateway.domain.trim().is_empty() {
            errors.push("gateway.domain must not be empty".to_string());
        }
        if self.gateway.health_check_interval_secs == 0 {
            errors.push("gateway.health_check_interval_secs must be positive".to_string());
        }
        if self.cache.ttl_secs == 0 {
            errors.push("cache.ttl_secs must be positive".to_string());
        }
        if self.cache.sweep_interval_secs == 0 {
            errors.push("cache.sweep_interval_secs must be positive".to_string());
        }
        if self.metrics.application_id.trim().is_empty() {
            errors.push("metrics.application_id must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Full path of the append-only metrics log
    pub fn metrics_log_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.metrics.log_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 80
bind = "127.0.0.1"
api_port = 9100
admin_token = "secret"

[storage]
upload_root = "/srv/neploy/uploads"
data_dir = "/srv/neploy/data"

[gateway]
domain = "apps.example.com"
health_check_interval_secs = 10

[deploy]
interactive = true
prompt_timeout_secs = 30
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.api_port, 9100);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.storage.upload_root, PathBuf::from("/srv/neploy/uploads"));
        assert_eq!(config.gateway.domain, "apps.example.com");
        assert_eq!(config.gateway.health_check_interval_secs, 10);
        assert_eq!(config.gateway.health_check_timeout_secs, 5);
        assert!(config.deploy.interactive);
        assert_eq!(config.deploy.client_wait_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.api_port, 9000);
        assert_eq!(config.cache.ttl_secs, 60);
        assert_eq!(config.cache.sweep_interval_secs, 600);
        assert_eq!(config.cache.max_entry_bytes, 5 * 1024 * 1024);
        assert_eq!(config.metrics.application_id, "default");
        assert_eq!(
            config.metrics_log_path(),
            PathBuf::from("./data/gateway_metrics.log")
        );
        assert!(!config.deploy.interactive);
    }

    #[test]
    fn test_validate_collects_errors() {
        let toml = r#"
[server]
port = 9000
api_port = 9000

[gateway]
domain = ""
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
        assert!(err.contains("gateway.domain"));
    }
}
