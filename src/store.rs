// 💾 Catalog persistence
// Snapshot repositories (JSON file or SQLite) behind one trait

use crate::catalog::{CatalogStore, EquipmentRecord, MergeOutcome, RawRow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

// ============================================================================
// IMPORT AUDIT RECORD
// ============================================================================

/// One catalog import, kept for auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    pub import_id: String,
    pub imported_at: DateTime<Utc>,
    pub source_name: String,
    pub sha256: String,
    pub rows_parsed: usize,
    pub updated: usize,
    pub inserted: usize,
    pub skipped: usize,
}

impl ImportRecord {
    pub fn new(source_name: &str, raw: &[u8], outcome: &MergeOutcome) -> Self {
        ImportRecord {
            import_id: uuid::Uuid::new_v4().to_string(),
            imported_at: Utc::now(),
            source_name: source_name.to_string(),
            sha256: content_hash(raw),
            rows_parsed: outcome.parsed_count,
            updated: outcome.updated_count,
            inserted: outcome.inserted_count,
            skipped: outcome.skipped_count,
        }
    }
}

/// Hex SHA-256 of the raw upload
pub fn content_hash(raw: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// REPOSITORY TRAIT
// ============================================================================

/// Load-then-store persistence for the catalog.
///
/// Every save writes the full snapshot. Callers serialize access; a
/// repository assumes a single writer.
pub trait CatalogRepository: Send {
    fn load(&self) -> Result<CatalogStore, StoreError>;

    fn save(&mut self, store: &CatalogStore) -> Result<(), StoreError>;

    fn record_import(&mut self, record: &ImportRecord) -> Result<(), StoreError>;

    /// Persist a merged snapshot together with its audit entry.
    ///
    /// Backends with transactions override this to make both writes atomic.
    fn commit_import(
        &mut self,
        store: &CatalogStore,
        record: &ImportRecord,
    ) -> Result<(), StoreError> {
        self.save(store)?;
        self.record_import(record)
    }

    /// Import log, most recent first
    fn imports(&self) -> Result<Vec<ImportRecord>, StoreError>;

    /// Short backend name for logs
    fn backend(&self) -> &'static str;
}

/// Result of one load-merge-store cycle
#[derive(Debug, Clone, Serialize)]
pub struct ImportReceipt {
    pub outcome: MergeOutcome,
    pub total_items: usize,
    pub record: ImportRecord,
}

/// Load the catalog, merge `rows`, persist the snapshot and log the import
pub fn apply_import(
    repo: &mut dyn CatalogRepository,
    rows: &[RawRow],
    source_name: &str,
    raw: &[u8],
) -> Result<ImportReceipt, StoreError> {
    let mut store = repo.load()?;
    let outcome = store.merge(rows);

    let record = ImportRecord::new(source_name, raw, &outcome);
    repo.commit_import(&store, &record)?;

    tracing::info!(
        backend = repo.backend(),
        source = source_name,
        "Catalog import applied ({}), {} items total",
        outcome.summary(),
        store.len()
    );

    Ok(ImportReceipt {
        outcome,
        total_items: store.len(),
        record,
    })
}

// ============================================================================
// JSON FILE BACKEND
// ============================================================================

/// Catalog kept as a pretty-printed JSON array, import log as JSON lines
#[derive(Debug, Clone)]
pub struct JsonCatalogFile {
    items_path: PathBuf,
    imports_path: PathBuf,
}

impl JsonCatalogFile {
    /// Open (and create as `[]` if missing) the snapshot file
    pub fn open(items_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let items_path = items_path.into();
        let imports_path = items_path.with_file_name("imports.jsonl");

        if let Some(parent) = items_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        if !items_path.exists() {
            fs::write(&items_path, "[]").map_err(|e| StoreError::io(&items_path, e))?;
        }

        Ok(JsonCatalogFile {
            items_path,
            imports_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.items_path
    }
}

impl CatalogRepository for JsonCatalogFile {
    fn load(&self) -> Result<CatalogStore, StoreError> {
        let content = match fs::read_to_string(&self.items_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CatalogStore::new()),
            Err(e) => return Err(StoreError::io(&self.items_path, e)),
        };

        if content.trim().is_empty() {
            return Ok(CatalogStore::new());
        }

        let items: Vec<EquipmentRecord> =
            serde_json::from_str(&content).map_err(|e| StoreError::json(&self.items_path, e))?;
        Ok(CatalogStore::from_items(items))
    }

    fn save(&mut self, store: &CatalogStore) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(store.items())
            .map_err(|e| StoreError::json(&self.items_path, e))?;

        // Write next to the target, then rename over it
        let tmp_path = self.items_path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| StoreError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.items_path).map_err(|e| StoreError::io(&self.items_path, e))?;

        tracing::debug!("Saved {} items to {}", store.len(), self.items_path.display());
        Ok(())
    }

    fn record_import(&mut self, record: &ImportRecord) -> Result<(), StoreError> {
        let line = serde_json::to_string(record).map_err(|e| StoreError::json(&self.imports_path, e))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.imports_path)
            .map_err(|e| StoreError::io(&self.imports_path, e))?;
        writeln!(file, "{}", line).map_err(|e| StoreError::io(&self.imports_path, e))?;

        Ok(())
    }

    /// The snapshot is written first. The audit line is best effort: once
    /// the merge is on disk a failed append is logged, not returned.
    fn commit_import(
        &mut self,
        store: &CatalogStore,
        record: &ImportRecord,
    ) -> Result<(), StoreError> {
        self.save(store)?;

        if let Err(e) = self.record_import(record) {
            tracing::error!(import_id = %record.import_id, "Import saved but not logged: {}", e);
        }

        Ok(())
    }

    fn imports(&self) -> Result<Vec<ImportRecord>, StoreError> {
        let content = match fs::read_to_string(&self.imports_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.imports_path, e)),
        };

        let mut records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| StoreError::json(&self.imports_path, e)))
            .collect::<Result<Vec<ImportRecord>, _>>()?;

        records.reverse();
        Ok(records)
    }

    fn backend(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(code: &str, description: &str) -> RawRow {
        [
            ("codice".to_string(), code.to_string()),
            ("descrizione".to_string(), description.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_json_file_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("dpi_items.json");

        let repo = JsonCatalogFile::open(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
        assert!(repo.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonCatalogFile::open(dir.path().join("dpi_items.json")).unwrap();

        let store = CatalogStore::from_items(vec![
            EquipmentRecord::new("Z9").with_description("Casco"),
            EquipmentRecord::new("A1").with_expiry("2030-01-01"),
        ]);
        repo.save(&store).unwrap();

        assert_eq!(repo.load().unwrap(), store);
    }

    #[test]
    fn test_json_invalid_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dpi_items.json");
        fs::write(&path, "{not json").unwrap();

        let repo = JsonCatalogFile::open(&path).unwrap();

        assert!(matches!(repo.load(), Err(StoreError::Json { .. })));
    }

    #[test]
    fn test_apply_import_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonCatalogFile::open(dir.path().join("dpi_items.json")).unwrap();
        let rows = vec![row("A1", "Imbracatura"), row("", "vuota"), row("B2", "Cordino")];

        let first = apply_import(&mut repo, &rows, "catalogo.csv", b"raw").unwrap();
        let second = apply_import(&mut repo, &rows, "catalogo.csv", b"raw").unwrap();

        assert_eq!(first.outcome.inserted_count, 2);
        assert_eq!(first.outcome.parsed_count, 3);
        assert_eq!(second.outcome.updated_count, 0);
        assert_eq!(second.outcome.inserted_count, 0);
        assert_eq!(second.total_items, 2);

        let imports = repo.imports().unwrap();
        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].import_id, second.record.import_id);
        assert_eq!(imports[0].sha256, content_hash(b"raw"));
    }

    #[test]
    fn test_unwritable_import_log_keeps_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = JsonCatalogFile::open(dir.path().join("dpi_items.json")).unwrap();

        // A directory where the log file should be makes the append fail
        fs::create_dir(dir.path().join("imports.jsonl")).unwrap();

        let receipt = apply_import(&mut repo, &[row("DPI-001", "Casco")], "a.csv", b"a").unwrap();

        assert_eq!(receipt.total_items, 1);
        assert!(repo.load().unwrap().contains("DPI-001"));
    }

    #[test]
    fn test_content_hash() {
        let hash = content_hash(b"codice,descrizione\n");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, content_hash(b"codice,descrizione\n"));
        assert_ne!(hash, content_hash(b"codice\n"));
    }
}
