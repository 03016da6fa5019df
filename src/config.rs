use crate::error::{AppError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_ARCHIVE_URL: &str = "https://archive.sensor.community";
pub const DEFAULT_API_URL: &str = "https://data.sensor.community/airrohr/v1/sensor";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    pub download: DownloadConfig,
    pub stations: StationsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Remote archive and metadata API settings
#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_url")]
    pub base_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_head_timeout")]
    pub head_timeout_seconds: u64,
    #[serde(default = "default_get_timeout")]
    pub get_timeout_seconds: u64,
    #[serde(default = "default_head_timeout")]
    pub metadata_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_archive_url() -> String {
    DEFAULT_ARCHIVE_URL.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_head_timeout() -> u64 {
    10
}

fn default_get_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_archive_url(),
            api_url: default_api_url(),
            head_timeout_seconds: default_head_timeout(),
            get_timeout_seconds: default_get_timeout(),
            metadata_timeout_seconds: default_head_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DownloadConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    pub start_date: NaiveDate,
    /// Defaults to today when absent
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub merge: bool,
    #[serde(default)]
    pub merge_by_year: bool,
    #[serde(default = "default_true")]
    pub create_missing: bool,
    #[serde(default)]
    pub list_only: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("sensor_data_by_station")
}

pub fn default_max_workers() -> usize {
    15
}

fn default_true() -> bool {
    true
}

/// Which stations (and optionally which of their sensors) a run covers
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StationsConfig {
    #[serde(default)]
    pub ids: Vec<i32>,
    #[serde(default)]
    pub uids: Vec<Uuid>,
    #[serde(default)]
    pub sensor_ids: Vec<i64>,
}

impl StationsConfig {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.uids.is_empty()
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SchedulerConfig {
    /// Run once and exit when absent
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    #[serde(default)]
    pub initial_delay_seconds: u64,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        let expanded = expand_env_vars(&content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Valid port ranges and pool sizes
    /// - Valid archive and API URLs
    /// - A worker count the archive will tolerate
    /// - A non-empty, correctly ordered date range
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        validate_url("archive base_url", &self.archive.base_url)?;
        validate_url("archive api_url", &self.archive.api_url)?;

        if self.archive.max_retries > 10 {
            return Err(AppError::Config(format!(
                "Archive max_retries {} is too high, maximum is 10",
                self.archive.max_retries
            )));
        }

        if self.archive.retry_backoff_ms == 0 || self.archive.retry_backoff_ms > 60_000 {
            return Err(AppError::Config(format!(
                "Archive retry_backoff_ms {} must be between 1 and 60000",
                self.archive.retry_backoff_ms
            )));
        }

        if self.download.max_workers == 0 {
            return Err(AppError::Config(
                "Download max_workers must be at least 1".to_string(),
            ));
        }

        if self.download.max_workers > 64 {
            return Err(AppError::Config(format!(
                "Download max_workers {} is too high for the public archive, maximum is 64",
                self.download.max_workers
            )));
        }

        if self.download.max_workers > 30 {
            tracing::warn!(
                "{} parallel workers may trigger rate limiting on the archive",
                self.download.max_workers
            );
        }

        if let Some(end) = self.download.end_date {
            if self.download.start_date > end {
                return Err(AppError::Config(format!(
                    "Download start_date {} is after end_date {}",
                    self.download.start_date, end
                )));
            }
        }

        if self.stations.is_empty() {
            return Err(AppError::Config(
                "At least one station id or uid must be configured under `stations`".to_string(),
            ));
        }

        if self.scheduler.interval_minutes == Some(0) {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_url(label: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AppError::Config(format!("Invalid {} '{}': {}", label, value, e)))?;

    if parsed.scheme() != "https" {
        return Err(AppError::Config(format!(
            "{} must use HTTPS, got: {}",
            label,
            parsed.scheme()
        )));
    }

    Ok(())
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid substitution pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
database:
  host: localhost
  name: sensolog
  user: sensolog
  password: secret
download:
  start_date: 2024-01-01
stations:
  ids: [1]
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.database.port, 5432);
        assert_eq!(config.archive.base_url, DEFAULT_ARCHIVE_URL);
        assert_eq!(config.archive.max_retries, 3);
        assert_eq!(config.download.max_workers, 15);
        assert_eq!(
            config.download.output_dir,
            PathBuf::from("sensor_data_by_station")
        );
        assert!(config.download.merge);
        assert!(config.download.create_missing);
        assert!(!config.download.merge_by_year);
        assert!(config.download.end_date.is_none());
        assert!(config.scheduler.interval_minutes.is_none());
    }

    #[test]
    fn test_reversed_date_range_rejected() {
        let yaml = MINIMAL.replace(
            "start_date: 2024-01-01",
            "start_date: 2024-02-01\n  end_date: 2024-01-01",
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("after end_date"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let yaml = MINIMAL.replace(
            "start_date: 2024-01-01",
            "start_date: 2024-01-01\n  max_workers: 0",
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_settings_bounded() {
        let yaml = format!("{}archive:\n  max_retries: 33\n", MINIMAL);
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_retries"));

        let yaml = format!("{}archive:\n  retry_backoff_ms: 0\n", MINIMAL);
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("retry_backoff_ms"));

        let yaml = format!("{}archive:\n  max_retries: 10\n  retry_backoff_ms: 60000\n", MINIMAL);
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_stations_rejected() {
        let yaml = MINIMAL.replace("  ids: [1]", "  sensor_ids: [95522]");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("At least one station"));
    }

    #[test]
    fn test_plain_http_archive_rejected() {
        let yaml = format!("{}archive:\n  base_url: http://archive.sensor.community\n", MINIMAL);
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must use HTTPS"));
    }

    #[test]
    fn test_station_uids_parse() {
        let yaml = MINIMAL.replace(
            "  ids: [1]",
            "  uids: [\"7f1b7c9e-2d4a-4e43-9a55-0c6a1d2f3b11\"]",
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config.stations.uids.len(), 1);
        assert!(!config.stations.is_empty());
    }

    #[test]
    fn test_port_deserialize_from_number() {
        let yaml = r#"
host: localhost
port: 5432
name: test
user: test
password: test
"#;
        let config: DatabaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 5432);
    }

    #[test]
    fn test_port_deserialize_from_string() {
        let yaml = r#"
host: localhost
port: "5433"
name: test
user: test
password: test
"#;
        let config: DatabaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 5433);
    }

    #[test]
    fn test_port_deserialize_invalid_string() {
        let yaml = r#"
host: localhost
port: "not_a_number"
name: test
user: test
password: test
"#;
        let result: std::result::Result<DatabaseConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_expand_env_vars_reports_missing() {
        let err = expand_env_vars("password: ${SENSOLOG_SURELY_UNSET_VAR}")
            .unwrap_err()
            .to_string();
        assert!(err.contains("SENSOLOG_SURELY_UNSET_VAR"));
    }
}
