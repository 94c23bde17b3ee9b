use crate::catalog::{CatalogStore, EquipmentRecord};
use crate::store::{CatalogRepository, ImportRecord, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

pub fn setup_database(conn: &Connection) -> Result<(), StoreError> {
    // In-memory databases report "memory" instead of "wal"
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

    // ==========================================================================
    // Catalog snapshot (position keeps insertion order)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS catalog_items (
            codice TEXT PRIMARY KEY NOT NULL,
            position INTEGER NOT NULL,
            descrizione TEXT NOT NULL DEFAULT '',
            prezzo TEXT NOT NULL DEFAULT '',
            gruppo TEXT NOT NULL DEFAULT '',
            marca TEXT NOT NULL DEFAULT '',
            modello TEXT NOT NULL DEFAULT '',
            nota TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            scadenza TEXT,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;
    add_missing_columns(conn)?;

    // ==========================================================================
    // Import audit log
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS imports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            import_id TEXT UNIQUE NOT NULL,
            imported_at TEXT NOT NULL,
            source_name TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            rows_parsed INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            inserted INTEGER NOT NULL,
            skipped INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_catalog_position ON catalog_items(position)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_catalog_gruppo ON catalog_items(gruppo)",
        [],
    )?;

    Ok(())
}

/// Databases created before the brand/model/note/url columns get them added
fn add_missing_columns(conn: &Connection) -> Result<(), StoreError> {
    let existing = conn
        .prepare("SELECT name FROM pragma_table_info('catalog_items')")?
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for column in ["marca", "modello", "nota", "url"] {
        if !existing.iter().any(|name| name == column) {
            conn.execute(
                &format!("ALTER TABLE catalog_items ADD COLUMN {} TEXT NOT NULL DEFAULT ''", column),
                [],
            )?;
        }
    }

    Ok(())
}

/// Delete and rewrite every row; the caller owns the transaction
fn write_items(conn: &Connection, items: &[EquipmentRecord]) -> Result<(), StoreError> {
    let now = Utc::now().to_rfc3339();

    conn.execute("DELETE FROM catalog_items", [])?;
    let mut stmt = conn.prepare(
        "INSERT INTO catalog_items (
            codice, position, descrizione, prezzo, gruppo, marca, modello, nota, url,
            scadenza, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;

    for (position, item) in items.iter().enumerate() {
        stmt.execute(params![
            item.code,
            position as i64,
            item.description,
            item.price,
            item.group,
            item.brand,
            item.model,
            item.note,
            item.url,
            item.expiry_date,
            now,
        ])?;
    }

    Ok(())
}

/// Replace the whole snapshot inside one transaction
pub fn save_items(conn: &mut Connection, items: &[EquipmentRecord]) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    write_items(&tx, items)?;
    tx.commit()?;

    Ok(items.len())
}

/// Replace the snapshot and log the import atomically
pub fn save_import(
    conn: &mut Connection,
    items: &[EquipmentRecord],
    record: &ImportRecord,
) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    write_items(&tx, items)?;
    insert_import(&tx, record)?;
    tx.commit()?;

    Ok(())
}

pub fn get_all_items(conn: &Connection) -> Result<Vec<EquipmentRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT codice, descrizione, prezzo, gruppo, marca, modello, nota, url, scadenza
         FROM catalog_items
         ORDER BY position ASC",
    )?;

    let items = stmt
        .query_map([], |row| {
            Ok(EquipmentRecord {
                code: row.get(0)?,
                description: row.get(1)?,
                price: row.get(2)?,
                group: row.get(3)?,
                brand: row.get(4)?,
                model: row.get(5)?,
                note: row.get(6)?,
                url: row.get(7)?,
                expiry_date: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(items)
}

pub fn verify_count(conn: &Connection) -> Result<i64, StoreError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM catalog_items", [], |row| row.get(0))?;

    Ok(count)
}

/// Insert an entry into the import audit log
pub fn insert_import(conn: &Connection, record: &ImportRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO imports (
            import_id, imported_at, source_name, sha256, rows_parsed, updated, inserted, skipped
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.import_id,
            record.imported_at.to_rfc3339(),
            record.source_name,
            record.sha256,
            record.rows_parsed as i64,
            record.updated as i64,
            record.inserted as i64,
            record.skipped as i64,
        ],
    )?;

    Ok(())
}

/// Import log, most recent first
pub fn get_imports(conn: &Connection) -> Result<Vec<ImportRecord>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT import_id, imported_at, source_name, sha256, rows_parsed, updated, inserted, skipped
         FROM imports
         ORDER BY id DESC",
    )?;

    let records = stmt
        .query_map([], |row| {
            let imported_at_str: String = row.get(1)?;
            let imported_at = DateTime::parse_from_rfc3339(&imported_at_str)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                })?
                .with_timezone(&Utc);

            Ok(ImportRecord {
                import_id: row.get(0)?,
                imported_at,
                source_name: row.get(2)?,
                sha256: row.get(3)?,
                rows_parsed: row.get::<_, i64>(4)? as usize,
                updated: row.get::<_, i64>(5)? as usize,
                inserted: row.get::<_, i64>(6)? as usize,
                skipped: row.get::<_, i64>(7)? as usize,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// SQLite-backed catalog
pub struct SqliteCatalog {
    conn: Connection,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        SqliteCatalog::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        SqliteCatalog::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        setup_database(&conn)?;
        Ok(SqliteCatalog { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl CatalogRepository for SqliteCatalog {
    fn load(&self) -> Result<CatalogStore, StoreError> {
        Ok(CatalogStore::from_items(get_all_items(&self.conn)?))
    }

    fn save(&mut self, store: &CatalogStore) -> Result<(), StoreError> {
        let written = save_items(&mut self.conn, store.items())?;
        tracing::debug!("Saved {} items to SQLite", written);
        Ok(())
    }

    fn record_import(&mut self, record: &ImportRecord) -> Result<(), StoreError> {
        insert_import(&self.conn, record)
    }

    fn commit_import(
        &mut self,
        store: &CatalogStore,
        record: &ImportRecord,
    ) -> Result<(), StoreError> {
        save_import(&mut self.conn, store.items(), record)
    }

    fn imports(&self) -> Result<Vec<ImportRecord>, StoreError> {
        get_imports(&self.conn)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{MergeOutcome, RawRow};
    use crate::store::apply_import;

    fn row(code: &str, description: &str, group: &str) -> RawRow {
        [
            ("codice".to_string(), code.to_string()),
            ("descrizione".to_string(), description.to_string()),
            ("gruppo".to_string(), group.to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let mut repo = SqliteCatalog::open_in_memory().unwrap();

        let store = CatalogStore::from_items(vec![
            EquipmentRecord::new("Z9").with_description("Casco").with_group("testa"),
            EquipmentRecord::new("A1").with_expiry("2030-05-01"),
            EquipmentRecord::new("M5").with_price("9.90"),
        ]);
        repo.save(&store).unwrap();

        assert_eq!(repo.load().unwrap(), store);
        assert_eq!(verify_count(repo.connection()).unwrap(), 3);
    }

    #[test]
    fn test_save_replaces_snapshot() {
        let mut repo = SqliteCatalog::open_in_memory().unwrap();

        repo.save(&CatalogStore::from_items(vec![EquipmentRecord::new("A1")]))
            .unwrap();
        repo.save(&CatalogStore::from_items(vec![EquipmentRecord::new("B2")]))
            .unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains("B2"));
    }

    #[test]
    fn test_idempotency_import_twice() {
        let mut repo = SqliteCatalog::open_in_memory().unwrap();
        let rows = vec![
            row("A1", "Imbracatura", "anticaduta"),
            row("B2", "Cordino", "funi"),
            row("C3", "Casco", "testa"),
        ];

        let first = apply_import(&mut repo, &rows, "catalogo.csv", b"v1").unwrap();
        let count1 = verify_count(repo.connection()).unwrap();

        let second = apply_import(&mut repo, &rows, "catalogo.csv", b"v1").unwrap();
        let count2 = verify_count(repo.connection()).unwrap();

        assert_eq!(first.outcome.inserted_count, 3, "First import should insert 3 items");
        assert_eq!(count1, 3);
        assert_eq!(
            second.outcome,
            MergeOutcome {
                updated_count: 0,
                parsed_count: 3,
                inserted_count: 0,
                skipped_count: 0,
            },
            "Second import should change nothing"
        );
        assert_eq!(count2, 3);
    }

    #[test]
    fn test_import_log() {
        let mut repo = SqliteCatalog::open_in_memory().unwrap();

        let first = apply_import(&mut repo, &[row("A1", "x", "")], "a.csv", b"a").unwrap();
        let second = apply_import(&mut repo, &[row("A1", "y", "")], "b.csv", b"b").unwrap();

        let imports = repo.imports().unwrap();

        assert_eq!(imports.len(), 2);
        assert_eq!(imports[0].import_id, second.record.import_id);
        assert_eq!(imports[0].source_name, "b.csv");
        assert_eq!(imports[1].import_id, first.record.import_id);
        assert_eq!(imports[0].updated, 1);
    }

    #[test]
    fn test_failed_import_log_rolls_back_snapshot() {
        let mut repo = SqliteCatalog::open_in_memory().unwrap();
        let first = apply_import(&mut repo, &[row("DPI-001", "Casco", "testa")], "a.csv", b"a").unwrap();

        // Reusing an import id violates the UNIQUE constraint
        let changed = CatalogStore::from_items(vec![EquipmentRecord::new("DPI-002")]);
        let result = repo.commit_import(&changed, &first.record);

        assert!(matches!(result, Err(StoreError::Sql(_))));
        let loaded = repo.load().unwrap();
        assert!(loaded.contains("DPI-001"));
        assert!(!loaded.contains("DPI-002"));
        assert_eq!(repo.imports().unwrap().len(), 1);
    }

    #[test]
    fn test_extra_columns_round_trip() {
        let mut repo = SqliteCatalog::open_in_memory().unwrap();
        let mut record = EquipmentRecord::new("DPI-001").with_description("Casco");
        record.brand = "Petzl".to_string();
        record.model = "Vertex".to_string();
        record.note = "revisionato".to_string();
        record.url = "https://example.com/vertex".to_string();

        let store = CatalogStore::from_items(vec![record]);
        repo.save(&store).unwrap();

        assert_eq!(repo.load().unwrap(), store);
    }

    #[test]
    fn test_old_schema_gets_new_columns() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE catalog_items (
                codice TEXT PRIMARY KEY NOT NULL,
                position INTEGER NOT NULL,
                descrizione TEXT NOT NULL DEFAULT '',
                prezzo TEXT NOT NULL DEFAULT '',
                gruppo TEXT NOT NULL DEFAULT '',
                scadenza TEXT,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO catalog_items (codice, position, updated_at) VALUES ('OLD-1', 0, 'x')",
            [],
        )
        .unwrap();

        let repo = SqliteCatalog::from_connection(conn).unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded.items()[0].code, "OLD-1");
        assert_eq!(loaded.items()[0].brand, "");
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tpi.db");

        {
            let mut repo = SqliteCatalog::open(&path).unwrap();
            repo.save(&CatalogStore::from_items(vec![EquipmentRecord::new("A1")]))
                .unwrap();
        }

        let reopened = SqliteCatalog::open(&path).unwrap();
        assert!(reopened.load().unwrap().contains("A1"));
    }
}
