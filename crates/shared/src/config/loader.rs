//! Configuration loader
//!
//! Loads configuration from an optional `.env` file and the process
//! environment. Malformed values are reported as errors instead of falling
//! back to defaults; only absent variables take their default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::dto::{
    CdcConfig, DatabaseConfig, DispatcherConfig, GraphConfig, GraphMode, PipelineConfigDto,
};
use super::error::{ConfigError, Result};
use super::validator::{
    validate_database_url, validate_dispatcher_config, validate_graph_config,
    validate_pipeline_config,
};

pub const ENV_POLL_INTERVAL: &str = "OUTBOX_POLL_INTERVAL";
pub const ENV_BATCH_SIZE: &str = "OUTBOX_BATCH_SIZE";
pub const ENV_MAX_RETRY: &str = "OUTBOX_MAX_RETRY";
pub const ENV_BACKOFF_BASE: &str = "OUTBOX_BACKOFF_BASE";
pub const ENV_METRIC_NAMESPACE: &str = "OUTBOX_METRIC_NAMESPACE";

pub const ENV_DATABASE_URL: &str = "CUBE_CASTLE_DATABASE_URL";
pub const ENV_DATABASE_URL_FALLBACK: &str = "DATABASE_URL";
pub const ENV_DB_POOL_SIZE: &str = "CUBE_CASTLE_DB_POOL_SIZE";
pub const ENV_DB_CONNECT_TIMEOUT: &str = "CUBE_CASTLE_DB_CONNECT_TIMEOUT";

pub const ENV_NEO4J_MODE: &str = "NEO4J_MODE";
pub const ENV_NEO4J_URI: &str = "NEO4J_URI";
pub const ENV_NEO4J_USERNAME: &str = "NEO4J_USERNAME";
pub const ENV_NEO4J_PASSWORD: &str = "NEO4J_PASSWORD";
pub const ENV_NEO4J_DATABASE: &str = "NEO4J_DATABASE";
pub const ENV_NEO4J_MAX_CONNECTIONS: &str = "NEO4J_MAX_CONNECTIONS";
pub const ENV_NEO4J_CONNECTION_TIMEOUT: &str = "NEO4J_CONNECTION_TIMEOUT";
pub const ENV_NEO4J_MAX_TRANSACTION_TIME: &str = "NEO4J_MAX_TRANSACTION_TIME";
pub const ENV_NEO4J_MAX_RETRIES: &str = "NEO4J_MAX_RETRIES";
pub const ENV_NEO4J_RETRY_BACKOFF: &str = "NEO4J_RETRY_BACKOFF";

pub const ENV_CDC_MAX_CONCURRENCY: &str = "CDC_MAX_CONCURRENCY";
pub const ENV_CDC_HEALTH_CHECK_INTERVAL: &str = "CDC_HEALTH_CHECK_INTERVAL";
pub const ENV_CDC_ENABLE_METRICS: &str = "CDC_ENABLE_METRICS";

/// Configuration loader
///
/// Handles loading configuration from:
/// 1. .env file (optional)
/// 2. Environment variables
///
/// # Example
///
/// ```ignore
/// use cube_castle_shared::config::ConfigLoader;
/// use std::path::PathBuf;
///
/// let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
/// let config = loader.load_pipeline_config()?;
/// ```
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Optional path to .env file
    env_file_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new ConfigLoader
    ///
    /// # Arguments
    ///
    /// * `env_file_path` - Optional path to .env file. If provided, the file
    ///                     is loaded before reading environment variables.
    pub fn new(env_file_path: Option<PathBuf>) -> Self {
        Self { env_file_path }
    }

    /// Load and validate the complete pipeline configuration
    pub fn load_pipeline_config(&self) -> Result<PipelineConfigDto> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let config = PipelineConfigDto::from_env()?;
        validate_pipeline_config(&config)?;

        Ok(config)
    }

    /// Load only the dispatcher section
    pub fn load_dispatcher_config(&self) -> Result<DispatcherConfig> {
        if let Some(path) = &self.env_file_path {
            self.load_env_file(path)?;
        }

        let config = DispatcherConfig::from_env()?;
        validate_dispatcher_config(&config)?;
        Ok(config)
    }

    fn load_env_file(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(ConfigError::EnvFileLoad {
                path: path.to_path_buf(),
                source: dotenv::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File not found: {}", path.display()),
                )),
            });
        }

        dotenv::from_path(path).map_err(|e| ConfigError::EnvFileLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

impl Default for ConfigLoader {
    /// Equivalent to `ConfigLoader::new(None)`
    fn default() -> Self {
        Self::new(None)
    }
}

fn process_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

// ============================================================================
// Implementation: PipelineConfigDto
// ============================================================================

impl PipelineConfigDto {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database: DatabaseConfig::from_lookup(&lookup)?,
            dispatcher: DispatcherConfig::from_lookup(&lookup)?,
            graph: GraphConfig::from_lookup(&lookup)?,
            cdc: CdcConfig::from_lookup(&lookup)?,
        })
    }
}

// ============================================================================
// Implementation: DatabaseConfig
// ============================================================================

impl DatabaseConfig {
    /// # Required Variables
    ///
    /// - `CUBE_CASTLE_DATABASE_URL` (or `DATABASE_URL`)
    ///
    /// # Optional Variables
    ///
    /// - `CUBE_CASTLE_DB_POOL_SIZE`: Default 10
    /// - `CUBE_CASTLE_DB_CONNECT_TIMEOUT`: Default 30s
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(ENV_DATABASE_URL)
            .or_else(|| lookup(ENV_DATABASE_URL_FALLBACK))
            .ok_or_else(|| ConfigError::MissingRequired {
                var: ENV_DATABASE_URL.to_string(),
            })?;
        validate_database_url(&url)?;

        Ok(Self {
            url,
            pool_size: parse_positive_var(&lookup, ENV_DB_POOL_SIZE, 10)?,
            connect_timeout: parse_duration_var(
                &lookup,
                ENV_DB_CONNECT_TIMEOUT,
                Duration::from_secs(30),
            )?,
        })
    }
}

// ============================================================================
// Implementation: DispatcherConfig
// ============================================================================

impl DispatcherConfig {
    /// # Optional Variables
    ///
    /// - `OUTBOX_POLL_INTERVAL`: Default 5s
    /// - `OUTBOX_BATCH_SIZE`: Default 50
    /// - `OUTBOX_MAX_RETRY`: Default 10
    /// - `OUTBOX_BACKOFF_BASE`: Default 5s
    /// - `OUTBOX_METRIC_NAMESPACE`: Default "outbox_dispatch"
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let metric_namespace = match lookup(ENV_METRIC_NAMESPACE) {
            Some(raw) if raw.trim().is_empty() => {
                return Err(ConfigError::invalid(
                    ENV_METRIC_NAMESPACE,
                    &raw,
                    "namespace cannot be empty",
                ));
            }
            Some(raw) => raw.trim().to_string(),
            None => defaults.metric_namespace,
        };

        Ok(Self {
            poll_interval: parse_duration_var(&lookup, ENV_POLL_INTERVAL, defaults.poll_interval)?,
            batch_size: parse_positive_var(&lookup, ENV_BATCH_SIZE, defaults.batch_size)?,
            max_retry: parse_positive_var(&lookup, ENV_MAX_RETRY, defaults.max_retry)?,
            backoff_base: parse_duration_var(&lookup, ENV_BACKOFF_BASE, defaults.backoff_base)?,
            metric_namespace,
        })
    }
}

// ============================================================================
// Implementation: GraphConfig
// ============================================================================

impl GraphConfig {
    /// # Optional Variables
    ///
    /// - `NEO4J_MODE`: `mock` or `http` (default: mock)
    /// - `NEO4J_URI`: Default `http://localhost:7474`
    /// - `NEO4J_USERNAME` / `NEO4J_PASSWORD` / `NEO4J_DATABASE`
    /// - `NEO4J_MAX_CONNECTIONS`: Default 50
    /// - `NEO4J_CONNECTION_TIMEOUT`: Default 30s
    /// - `NEO4J_MAX_TRANSACTION_TIME`: Default 60s
    /// - `NEO4J_MAX_RETRIES`: Default 3 (0 disables retries)
    /// - `NEO4J_RETRY_BACKOFF`: Default 1s
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mode = match lookup(ENV_NEO4J_MODE) {
            Some(raw) => GraphMode::from_str(&raw)
                .map_err(|reason| ConfigError::invalid(ENV_NEO4J_MODE, &raw, reason))?,
            None => defaults.mode,
        };

        let config = Self {
            mode,
            uri: lookup(ENV_NEO4J_URI).unwrap_or(defaults.uri),
            username: lookup(ENV_NEO4J_USERNAME).unwrap_or(defaults.username),
            password: lookup(ENV_NEO4J_PASSWORD).unwrap_or(defaults.password),
            database: lookup(ENV_NEO4J_DATABASE).unwrap_or(defaults.database),
            max_connections: parse_positive_var(
                &lookup,
                ENV_NEO4J_MAX_CONNECTIONS,
                defaults.max_connections,
            )?,
            connection_timeout: parse_duration_var(
                &lookup,
                ENV_NEO4J_CONNECTION_TIMEOUT,
                defaults.connection_timeout,
            )?,
            max_transaction_time: parse_duration_var(
                &lookup,
                ENV_NEO4J_MAX_TRANSACTION_TIME,
                defaults.max_transaction_time,
            )?,
            max_retries: parse_var(&lookup, ENV_NEO4J_MAX_RETRIES, defaults.max_retries)?,
            retry_backoff: parse_duration_var(
                &lookup,
                ENV_NEO4J_RETRY_BACKOFF,
                defaults.retry_backoff,
            )?,
        };

        validate_graph_config(&config)?;
        Ok(config)
    }
}

// ============================================================================
// Implementation: CdcConfig
// ============================================================================

impl CdcConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            max_concurrency: parse_positive_var(
                &lookup,
                ENV_CDC_MAX_CONCURRENCY,
                defaults.max_concurrency,
            )?,
            health_check_interval: parse_duration_var(
                &lookup,
                ENV_CDC_HEALTH_CHECK_INTERVAL,
                defaults.health_check_interval,
            )?,
            enable_metrics: parse_bool_var(&lookup, ENV_CDC_ENABLE_METRICS, defaults.enable_metrics)?,
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse an optional variable. Absent means default, malformed is an error.
fn parse_var<F, T>(lookup: &F, var: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid(var, &raw, "invalid format")),
    }
}

fn parse_positive_var<F, T>(lookup: &F, var: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    let value: T = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(var, &raw, "expected a positive integer"))?;
    if value <= T::default() {
        return Err(ConfigError::invalid(var, &raw, "must be greater than zero"));
    }
    Ok(value)
}

fn parse_duration_var<F>(lookup: &F, var: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    let value = parse_duration(&raw)
        .ok_or_else(|| ConfigError::invalid(var, &raw, "expected a duration such as 500ms, 5s or 2m"))?;
    if value.is_zero() {
        return Err(ConfigError::invalid(var, &raw, "duration must be greater than zero"));
    }
    Ok(value)
}

fn parse_bool_var<F>(lookup: &F, var: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(var, &raw, "expected a boolean")),
    }
}

/// Parse `250ms`, `5s`, `2m`, `1h` or bare seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let amount: u64 = digits.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs),
        "h" => amount.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_config_loader_new() {
        let loader = ConfigLoader::new(None);
        assert!(loader.env_file_path.is_none());

        let loader = ConfigLoader::new(Some(PathBuf::from(".env")));
        assert!(loader.env_file_path.is_some());
    }

    #[test]
    fn test_missing_env_file_is_an_error() {
        let loader = ConfigLoader::new(Some(PathBuf::from("/definitely/not/here/.env")));
        let err = loader.load_dispatcher_config().unwrap_err();
        assert!(matches!(err, ConfigError::EnvFileLoad { .. }));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration(" 3s "), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("5 parsecs"), None);
        assert_eq!(parse_duration("-5s"), None);
        assert_eq!(parse_duration("1.5s"), None);
    }

    #[test]
    fn test_dispatcher_defaults_when_unset() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, DispatcherConfig::default());
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retry, 10);
        assert_eq!(config.backoff_base, Duration::from_secs(5));
        assert_eq!(config.metric_namespace, "outbox_dispatch");
    }

    #[test]
    fn test_dispatcher_overrides() {
        let config = DispatcherConfig::from_lookup(lookup_from(&[
            (ENV_POLL_INTERVAL, "500ms"),
            (ENV_BATCH_SIZE, "10"),
            (ENV_MAX_RETRY, "3"),
            (ENV_BACKOFF_BASE, "1s"),
            (ENV_METRIC_NAMESPACE, "hr_outbox"),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retry, 3);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.metric_namespace, "hr_outbox");
    }

    #[test]
    fn test_malformed_values_fail_instead_of_falling_back() {
        let cases = [
            (ENV_POLL_INTERVAL, "soon"),
            (ENV_POLL_INTERVAL, "0s"),
            (ENV_BATCH_SIZE, "many"),
            (ENV_BATCH_SIZE, "0"),
            (ENV_BATCH_SIZE, "-4"),
            (ENV_MAX_RETRY, "0"),
            (ENV_BACKOFF_BASE, "0ms"),
            (ENV_METRIC_NAMESPACE, "   "),
        ];

        for (var, value) in cases {
            let result = DispatcherConfig::from_lookup(lookup_from(&[(var, value)]));
            match result {
                Err(ConfigError::InvalidValue { var: reported, .. }) => assert_eq!(reported, var),
                other => panic!("{}={} should fail, got {:?}", var, value, other),
            }
        }
    }

    #[test]
    fn test_graph_config_from_lookup() {
        let config = GraphConfig::from_lookup(lookup_from(&[
            (ENV_NEO4J_MODE, "http"),
            (ENV_NEO4J_URI, "http://graph:7474"),
            (ENV_NEO4J_MAX_RETRIES, "0"),
            (ENV_NEO4J_RETRY_BACKOFF, "200ms"),
        ]))
        .unwrap();

        assert_eq!(config.mode, GraphMode::Http);
        assert_eq!(config.uri, "http://graph:7474");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_backoff, Duration::from_millis(200));
        assert_eq!(config.database, "neo4j");
    }

    #[test]
    fn test_graph_config_rejects_unknown_mode() {
        let err = GraphConfig::from_lookup(lookup_from(&[(ENV_NEO4J_MODE, "bolt+magic")]))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_NEO4J_MODE));
    }

    #[test]
    fn test_database_url_fallback_and_missing() {
        let config =
            DatabaseConfig::from_lookup(lookup_from(&[(ENV_DATABASE_URL_FALLBACK, "postgres://u:p@db:5432/hr")]))
                .unwrap();
        assert_eq!(config.url, "postgres://u:p@db:5432/hr");
        assert_eq!(config.pool_size, 10);

        let err = DatabaseConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn test_cdc_config_bool_parsing() {
        let config =
            CdcConfig::from_lookup(lookup_from(&[(ENV_CDC_ENABLE_METRICS, "false")])).unwrap();
        assert!(!config.enable_metrics);

        let err = CdcConfig::from_lookup(lookup_from(&[(ENV_CDC_ENABLE_METRICS, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_pipeline_config_from_lookup() {
        let config = PipelineConfigDto::from_lookup(lookup_from(&[(
            ENV_DATABASE_URL,
            "postgresql://hr:hr@localhost:5432/hr",
        )]))
        .unwrap();
        assert_eq!(config.dispatcher.batch_size, 50);
        assert_eq!(config.graph.mode, GraphMode::Mock);
        assert_eq!(config.cdc.max_concurrency, 5);
    }
}
