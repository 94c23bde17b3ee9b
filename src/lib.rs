// TPI Evoluto - Core Library
// DPI inventory: expiry classification, catalog merge, dashboards.
// Exposes all modules for use in CLI, API server, and tests

pub mod catalog;
pub mod classifier;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod parser;
pub mod rate_limit;
pub mod store;

#[cfg(feature = "server")]
pub mod notifier;
#[cfg(feature = "server")]
pub mod server;

// Re-export commonly used types
pub use catalog::{
    csv_template, export_csv, sanitize_cell, CatalogStore, ClassifiedItem, EquipmentRecord,
    MergeOutcome, RawRow,
};
pub use classifier::{
    parse_expiry_date, Classification, ClassificationReport, ClassificationSummary,
    ExpiryClassifier, ExpiryStatus,
};
pub use config::{Config, Environment, NotifyConfig, StorageBackend};
pub use dashboard::{AlertFeed, Counts, Dashboard, DashboardRun, NotifyDecision};
pub use db::SqliteCatalog;
pub use parser::{
    parse_catalog_csv, validate_row, write_reject_log, CatalogImport, ClassifiedTable, ColumnError,
    ExpiryTable, ImportError, RejectedRow,
};
pub use rate_limit::RateLimiter;
pub use store::{apply_import, CatalogRepository, ImportReceipt, ImportRecord, JsonCatalogFile, StoreError};

#[cfg(feature = "server")]
pub use server::{create_router, AppState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install the fmt subscriber. `RUST_LOG` wins, then `LOG_LEVEL`, then
/// `default_level`.
pub fn init_tracing(default_level: &str) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| default_level.to_string());
        EnvFilter::try_new(level)
    })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
