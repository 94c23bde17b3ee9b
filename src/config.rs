//! Configuration management
//!
//! Loads configuration from environment variables (and a `.env` file when
//! present) with defaults suited to a local install.

use crate::classifier::{ExpiryClassifier, DEFAULT_ANOMALY_YEAR_CUTOFF, DEFAULT_WARNING_DAYS};
use crate::db::SqliteCatalog;
use crate::store::{CatalogRepository, JsonCatalogFile};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

/// Where the catalog snapshot lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Json,
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(StorageBackend::Json),
            "sqlite" | "sql" => Ok(StorageBackend::Sqlite),
            other => anyhow::bail!("Unknown STORAGE_BACKEND: {}", other),
        }
    }
}

/// Outbound webhook settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub timeout: Duration,
    /// Alerts below this count are not sent
    pub min_alerts: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            enabled: false,
            webhook_url: String::new(),
            timeout: Duration::from_secs(10),
            min_alerts: 1,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub env: Environment,
    pub app_version: String,
    pub git_sha: String,
    pub build_time: String,

    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub storage: StorageBackend,

    /// Expiry schedule used for the dashboard
    pub scadenzario_path: PathBuf,

    /// Preferred expiry column name
    pub date_column: Option<String>,

    /// Warning levels in days; the largest one is the threshold
    pub warning_levels: Vec<i64>,
    pub anomaly_year_cutoff: i32,

    /// Requests allowed per client within `rate_window`
    pub rate_burst: usize,
    pub rate_window: Duration,

    /// Explicit CORS origins (prod only)
    pub cors_origins: Vec<String>,

    pub max_upload_bytes: usize,
    pub notify: NotifyConfig,

    /// When set, every non-health request needs a matching `X-TPI-Token`
    pub staging_token: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, tests, ...)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| -> String {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let env = match get("ENV", "dev").to_lowercase().as_str() {
            "prod" | "production" => Environment::Prod,
            _ => Environment::Dev,
        };

        let data_dir = PathBuf::from(get("DATA_DIR", "data"));
        let scadenzario_path = lookup("SCADENZARIO_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("dpi.csv"));

        let warning_levels = get("DAYS_WARNING", &DEFAULT_WARNING_DAYS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.parse::<i64>().with_context(|| format!("Invalid DAYS_WARNING level: {}", v)))
            .collect::<Result<Vec<_>>>()?;

        let max_upload_mb: usize = get("MAX_UPLOAD_MB", "8")
            .parse()
            .context("Invalid MAX_UPLOAD_MB")?;
        let Some(max_upload_bytes) = max_upload_mb.checked_mul(1024 * 1024) else {
            anyhow::bail!("MAX_UPLOAD_MB is too large: {}", max_upload_mb);
        };

        let config = Config {
            env,
            app_version: get("APP_VERSION", "dev"),
            git_sha: get("GIT_SHA", ""),
            build_time: get("BUILD_TIME", ""),

            api_host: get("API_HOST", "0.0.0.0"),
            api_port: get("API_PORT", "8000").parse().context("Invalid API_PORT")?,

            logs_dir: PathBuf::from(get("LOGS_DIR", "logs")),
            storage: get("STORAGE_BACKEND", "json").parse()?,
            scadenzario_path,
            data_dir,
            date_column: lookup("DATE_COLUMN").filter(|v| !v.trim().is_empty()),

            warning_levels,
            anomaly_year_cutoff: get("ANOMALY_YEAR_CUTOFF", &DEFAULT_ANOMALY_YEAR_CUTOFF.to_string())
                .parse()
                .context("Invalid ANOMALY_YEAR_CUTOFF")?,

            rate_burst: get("RATE_BURST", "5").parse().context("Invalid RATE_BURST")?,
            rate_window: Duration::from_secs(
                get("RATE_WINDOW", "60").parse().context("Invalid RATE_WINDOW")?,
            ),

            cors_origins: get("CORS_ALLOW_ORIGINS", "")
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect(),

            max_upload_bytes,

            notify: NotifyConfig {
                enabled: matches!(
                    get("NOTIFY_ENABLED", "false").to_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                ),
                webhook_url: get("NOTIFY_WEBHOOK_URL", ""),
                timeout: Duration::from_secs(
                    get("NOTIFY_TIMEOUT_SEC", "10")
                        .parse()
                        .context("Invalid NOTIFY_TIMEOUT_SEC")?,
                ),
                min_alerts: get("NOTIFY_MIN_ALERTS", "1")
                    .parse()
                    .context("Invalid NOTIFY_MIN_ALERTS")?,
            },

            staging_token: lookup("TPI_STAGING_TOKEN")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Defaults rooted in a given data directory (handy for tests and tools)
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Config {
            env: Environment::Dev,
            app_version: "dev".to_string(),
            git_sha: String::new(),
            build_time: String::new(),
            api_host: "127.0.0.1".to_string(),
            api_port: 8000,
            logs_dir: data_dir.join("logs"),
            storage: StorageBackend::Json,
            scadenzario_path: data_dir.join("dpi.csv"),
            date_column: None,
            warning_levels: vec![DEFAULT_WARNING_DAYS],
            anomaly_year_cutoff: DEFAULT_ANOMALY_YEAR_CUTOFF,
            rate_burst: 5,
            rate_window: Duration::from_secs(60),
            cors_origins: Vec::new(),
            max_upload_bytes: 8 * 1024 * 1024,
            notify: NotifyConfig::default(),
            staging_token: None,
            data_dir,
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }
        if self.warning_levels.iter().any(|&days| days < 0) {
            anyhow::bail!("DAYS_WARNING levels must not be negative");
        }
        if self.rate_burst == 0 {
            anyhow::bail!("RATE_BURST must be greater than 0");
        }
        if self.rate_window.is_zero() {
            anyhow::bail!("RATE_WINDOW must be greater than 0");
        }
        if self.env == Environment::Prod && self.cors_origins.is_empty() {
            tracing::warn!("ENV=prod without CORS_ALLOW_ORIGINS: cross-origin requests will be refused");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn is_prod(&self) -> bool {
        self.env == Environment::Prod
    }

    pub fn classifier(&self) -> ExpiryClassifier {
        ExpiryClassifier::from_levels(&self.warning_levels, self.anomaly_year_cutoff)
    }

    pub fn items_json_path(&self) -> PathBuf {
        self.data_dir.join("dpi_items.json")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("tpi.db")
    }

    /// Raw copies of uploaded catalogs
    pub fn imports_dir(&self) -> PathBuf {
        self.data_dir.join("cataloghi").join("imports")
    }

    /// Rows rejected by validation, one CSV per import
    pub fn rejects_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts").join("rejects")
    }

    pub fn dashboard_json_path(&self) -> PathBuf {
        self.logs_dir.join("agente0_dashboard.json")
    }

    /// Ensure data and log directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.data_dir.clone(), self.imports_dir(), self.logs_dir.clone()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }

        Ok(())
    }

    /// Open the configured catalog repository
    pub fn open_repository(&self) -> Result<Box<dyn CatalogRepository>> {
        let repo: Box<dyn CatalogRepository> = match self.storage {
            StorageBackend::Json => Box::new(
                JsonCatalogFile::open(self.items_json_path())
                    .context("Failed to open JSON catalog")?,
            ),
            StorageBackend::Sqlite => Box::new(
                SqliteCatalog::open(&self.sqlite_path()).context("Failed to open SQLite catalog")?,
            ),
        };

        Ok(repo)
    }
}
