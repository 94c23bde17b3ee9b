// 🏗️ CSV Import
// Byte decoding, catalog CSV parsing with header checks, and header sniffing
// for expiry schedules exported from spreadsheets

use crate::catalog::{sanitize_cell, RawRow};
use crate::classifier::{ClassificationReport, ExpiryClassifier};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Columns a catalog CSV must provide
pub const REQUIRED_HEADERS: [&str; 2] = ["codice", "descrizione"];

/// Columns accepted without a warning
pub const OPTIONAL_HEADERS: [&str; 7] =
    ["prezzo", "gruppo", "scadenza", "nota", "marca", "modello", "url"];

/// Accepted catalog codes
pub const CODE_PATTERN: &str = r"^[A-Z0-9_-]{3,32}$";

/// Marker used to locate the header row of an expiry schedule
pub const EXPIRY_MARKER: &str = "scadenza";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("CSV has no header row")]
    MissingHeader,

    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("malformed CSV at line {line}: {source}")]
    Csv {
        line: u64,
        #[source]
        source: csv::Error,
    },
}

impl ImportError {
    fn csv(source: csv::Error) -> Self {
        let line = source.position().map(|p| p.line()).unwrap_or(0);
        ImportError::Csv { line, source }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no expiry column found; available columns: {available:?}")]
pub struct ColumnError {
    pub available: Vec<String>,
}

// ============================================================================
// DECODING / NORMALIZATION
// ============================================================================

/// Decode uploaded bytes: UTF-8 (BOM stripped), else Latin-1.
///
/// Latin-1 maps every byte to a char, so decoding never fails.
pub fn decode_bytes(raw: &[u8]) -> String {
    let without_bom = raw.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(raw);
    match std::str::from_utf8(without_bom) {
        Ok(text) => text.to_string(),
        Err(_) => without_bom.iter().map(|&b| b as char).collect(),
    }
}

/// "  Data Scadenza " → "data_scadenza"
pub fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Map English column names onto the catalog's own
fn canonical_header(header: &str) -> String {
    let normalized = normalize_header(header);
    match normalized.as_str() {
        "code" => "codice".to_string(),
        "description" => "descrizione".to_string(),
        "price" => "prezzo".to_string(),
        "group" => "gruppo".to_string(),
        "expiry" | "expiry_date" => "scadenza".to_string(),
        _ => normalized,
    }
}

// ============================================================================
// CATALOG CSV
// ============================================================================

/// Parsed catalog upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogImport {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
    pub missing_required_headers: Vec<String>,
    pub unknown_headers: Vec<String>,
}

impl CatalogImport {
    pub fn has_warnings(&self) -> bool {
        !self.missing_required_headers.is_empty() || !self.unknown_headers.is_empty()
    }

    /// Remove rows that fail [`validate_row`] and return them.
    ///
    /// Rows without a code stay: the merge skips and counts them.
    pub fn take_invalid(&mut self) -> Vec<RejectedRow> {
        let mut rejected = Vec::new();
        let mut kept = Vec::with_capacity(self.rows.len());

        for (idx, row) in std::mem::take(&mut self.rows).into_iter().enumerate() {
            match validate_row(&row) {
                Ok(()) => kept.push(row),
                Err(reason) => rejected.push(RejectedRow {
                    record: idx + 1,
                    reason,
                    row,
                }),
            }
        }

        self.rows = kept;
        rejected
    }
}

// ============================================================================
// ROW VALIDATION
// ============================================================================

/// A catalog row refused by validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRow {
    /// 1-based data record number (header excluded)
    pub record: usize,
    pub reason: String,
    pub row: RawRow,
}

fn code_regex() -> Result<&'static Regex, String> {
    static CODE_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    CODE_RE
        .get_or_init(|| Regex::new(CODE_PATTERN))
        .as_ref()
        .map_err(|e| format!("invalid code pattern: {}", e))
}

/// Check code, price and URL of one row. Empty cells are not checked.
pub fn validate_row(row: &RawRow) -> Result<(), String> {
    let cell = |key: &str| row.get(key).map(|v| v.trim()).unwrap_or("");

    let code = cell("codice");
    if !code.is_empty() && !code_regex()?.is_match(code) {
        return Err(format!("codice non valido [A-Z0-9-_]{{3,32}}: {}", code));
    }

    let price = cell("prezzo");
    if !price.is_empty() {
        match price.parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => {}
            _ => return Err(format!("prezzo non valido (numero >= 0): {}", price)),
        }
    }

    let url = cell("url");
    if !url.is_empty() {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or("");
        if rest.is_empty() || rest.starts_with('/') || rest.contains(char::is_whitespace) {
            return Err(format!("url non valido (http/https): {}", url));
        }
    }

    Ok(())
}

/// Write rejected rows to `<dir>/reject_<id>.csv` as `motivo,riga,<columns>`
pub fn write_reject_log(
    dir: &Path,
    id: &str,
    rejected: &[RejectedRow],
) -> Result<PathBuf, ImportError> {
    std::fs::create_dir_all(dir).map_err(|source| ImportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("reject_{}.csv", id));
    let write_err = |source: csv::Error| ImportError::Write {
        path: path.clone(),
        source,
    };

    let columns: BTreeSet<&str> = rejected
        .iter()
        .flat_map(|r| r.row.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(&path).map_err(write_err)?;
    writer
        .write_record(["motivo", "riga"].into_iter().chain(columns.iter().copied()))
        .map_err(write_err)?;

    for rejected_row in rejected {
        let record = rejected_row.record.to_string();
        let cells = columns
            .iter()
            .map(|c| sanitize_cell(rejected_row.row.get(*c).map(String::as_str).unwrap_or("")));

        let mut line = vec![sanitize_cell(&rejected_row.reason), record.as_str().into()];
        line.extend(cells);
        writer
            .write_record(line.iter().map(|cell| cell.as_bytes()))
            .map_err(write_err)?;
    }
    writer
        .flush()
        .map_err(|e| write_err(csv::Error::from(e)))?;

    tracing::warn!("{} catalog rows rejected, see {}", rejected.len(), path.display());
    Ok(path)
}

/// Parse a catalog CSV upload into raw rows.
///
/// Header problems are reported as warnings; only a missing header row or
/// malformed CSV is an error. `default_group` fills empty `gruppo` cells.
pub fn parse_catalog_csv(raw: &[u8], default_group: Option<&str>) -> Result<CatalogImport, ImportError> {
    let text = decode_bytes(raw);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(ImportError::csv)?
        .iter()
        .map(canonical_header)
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ImportError::MissingHeader);
    }

    let present: BTreeSet<&str> = headers.iter().map(String::as_str).collect();
    let missing_required_headers = REQUIRED_HEADERS
        .iter()
        .filter(|h| !present.contains(*h))
        .map(|h| h.to_string())
        .collect();
    let unknown_headers = present
        .iter()
        .copied()
        .filter(|h| !h.is_empty() && !REQUIRED_HEADERS.contains(h) && !OPTIONAL_HEADERS.contains(h))
        .map(|h| h.to_string())
        .collect();

    let default_group = default_group.map(str::trim).filter(|g| !g.is_empty());

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(ImportError::csv)?;

        let mut row: RawRow = headers
            .iter()
            .zip(record.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.clone(), value.trim().to_string()))
            .collect();

        if let Some(code) = row.get_mut("codice") {
            let safe = sanitize_cell(code).into_owned();
            *code = safe;
        }

        if let Some(group) = default_group {
            let entry = row.entry("gruppo".to_string()).or_default();
            if entry.is_empty() {
                *entry = group.to_string();
            }
        }

        rows.push(row);
    }

    Ok(CatalogImport {
        headers,
        rows,
        missing_required_headers,
        unknown_headers,
    })
}

// ============================================================================
// EXPIRY SCHEDULE (SCADENZARIO)
// ============================================================================

/// A sheet of equipment rows with an expiry column somewhere in it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Classified view of an ExpiryTable
#[derive(Debug, Clone)]
pub struct ClassifiedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub date_column: String,
    pub report: ClassificationReport,
}

impl ExpiryTable {
    /// Build from a grid of cells.
    ///
    /// The header is the first row with a cell mentioning "scadenza"
    /// (spreadsheet reports often put titles above it); without one the first
    /// row is used. Fully blank rows are dropped.
    pub fn from_grid(grid: Vec<Vec<String>>) -> Self {
        let header_idx = grid
            .iter()
            .position(|row| row.iter().any(|cell| cell.to_lowercase().contains(EXPIRY_MARKER)))
            .unwrap_or(0);

        let mut rows = grid.into_iter().skip(header_idx);
        let Some(raw_headers) = rows.next() else {
            return ExpiryTable::default();
        };

        let headers = raw_headers
            .iter()
            .enumerate()
            .map(|(i, h)| {
                let name = normalize_header(h);
                if name.is_empty() {
                    format!("col_{}", i)
                } else {
                    name
                }
            })
            .collect();

        let rows = rows
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .collect();

        ExpiryTable { headers, rows }
    }

    /// Load a CSV export of the schedule without assuming where the header is
    pub fn from_csv_bytes(raw: &[u8]) -> Result<Self, ImportError> {
        let text = decode_bytes(raw);
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut grid = Vec::new();
        for result in reader.records() {
            let record = result.map_err(ImportError::csv)?;
            grid.push(record.iter().map(|c| c.trim().to_string()).collect());
        }

        Ok(ExpiryTable::from_grid(grid))
    }

    pub fn from_path(path: &Path) -> Result<Self, ImportError> {
        let raw = std::fs::read(path).map_err(|source| ImportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded schedule from {} ({} bytes)", path.display(), raw.len());
        ExpiryTable::from_csv_bytes(&raw)
    }

    /// Pick the expiry column: the configured name if present, else the
    /// first column whose name contains "scadenza"
    pub fn resolve_date_column(&self, configured: Option<&str>) -> Result<usize, ColumnError> {
        if let Some(name) = configured.map(normalize_header).filter(|n| !n.is_empty()) {
            if let Some(idx) = self.headers.iter().position(|h| *h == name) {
                return Ok(idx);
            }
        }

        self.headers
            .iter()
            .position(|h| h.contains(EXPIRY_MARKER))
            .ok_or_else(|| ColumnError {
                available: self.headers.clone(),
            })
    }

    /// Classify every row on the resolved expiry column
    pub fn classify(
        self,
        classifier: &ExpiryClassifier,
        configured_column: Option<&str>,
        today: NaiveDate,
    ) -> Result<ClassifiedTable, ColumnError> {
        let column = self.resolve_date_column(configured_column)?;
        let report = classifier.classify_all(
            self.rows.iter().map(|row| row.get(column).map(String::as_str)),
            today,
        );

        Ok(ClassifiedTable {
            date_column: self.headers[column].clone(),
            headers: self.headers,
            rows: self.rows,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ExpiryStatus;

    fn grid(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_decode_utf8_with_bom() {
        let raw = b"\xEF\xBB\xBFcodice,descrizione\n";
        assert_eq!(decode_bytes(raw), "codice,descrizione\n");
    }

    #[test]
    fn test_decode_latin1_fallback() {
        // "Perù" in Latin-1
        let raw = b"Per\xF9";
        assert_eq!(decode_bytes(raw), "Perù");
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("  Data   Scadenza "), "data_scadenza");
        assert_eq!(normalize_header("CODICE"), "codice");
        assert_eq!(canonical_header("Description"), "descrizione");
    }

    #[test]
    fn test_parse_catalog_csv_reports_headers() {
        let raw = b"Codice,Descrizione,Colore\nA1, Casco ,rosso\n,vuoto,\n";
        let import = parse_catalog_csv(raw, None).unwrap();

        assert_eq!(import.rows.len(), 2);
        assert_eq!(import.rows[0]["codice"], "A1");
        assert_eq!(import.rows[0]["descrizione"], "Casco");
        assert_eq!(import.unknown_headers, vec!["colore".to_string()]);
        assert!(import.missing_required_headers.is_empty());
        assert!(import.has_warnings());
    }

    #[test]
    fn test_parse_catalog_csv_missing_required() {
        let raw = b"codice,prezzo\nA1,10\n";
        let import = parse_catalog_csv(raw, None).unwrap();

        assert_eq!(import.missing_required_headers, vec!["descrizione".to_string()]);
    }

    #[test]
    fn test_parse_catalog_csv_default_group() {
        let raw = b"codice,descrizione,gruppo\nA1,Casco,\nB2,Guanti,mani\n";
        let import = parse_catalog_csv(raw, Some("testa")).unwrap();

        assert_eq!(import.rows[0]["gruppo"], "testa");
        assert_eq!(import.rows[1]["gruppo"], "mani");
    }

    #[test]
    fn test_parse_catalog_csv_empty_input() {
        let result = parse_catalog_csv(b"", None);
        assert!(matches!(result, Err(ImportError::MissingHeader)));
    }

    #[test]
    fn test_extra_known_columns_are_kept() {
        let raw = b"codice,descrizione,marca,modello,nota,url\nDPI-001,Casco,Petzl,Vertex,revisionato,https://petzl.com\n";
        let import = parse_catalog_csv(raw, None).unwrap();

        assert!(!import.has_warnings());
        assert_eq!(import.rows[0]["marca"], "Petzl");
        assert_eq!(import.rows[0]["nota"], "revisionato");
    }

    #[test]
    fn test_formula_codes_are_neutralized() {
        let raw = b"codice,descrizione\n=CMD(),Casco\n@A1,Guanti\nDPI-001,Cordino\n";
        let import = parse_catalog_csv(raw, None).unwrap();

        assert_eq!(import.rows[0]["codice"], "'=CMD()");
        assert_eq!(import.rows[1]["codice"], "'@A1");
        assert_eq!(import.rows[2]["codice"], "DPI-001");
    }

    #[test]
    fn test_validate_row() {
        let row = |pairs: &[(&str, &str)]| -> RawRow {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };

        assert!(validate_row(&row(&[("codice", "DPI-001"), ("prezzo", "12.50")])).is_ok());
        assert!(validate_row(&row(&[("codice", "ANC_2024_X"), ("url", "http://a.example/x")])).is_ok());
        assert!(validate_row(&row(&[("codice", ""), ("descrizione", "senza codice")])).is_ok());

        let too_long = "X".repeat(33);
        for bad in [
            row(&[("codice", "A1")]),
            row(&[("codice", "dpi-001")]),
            row(&[("codice", "DPI 001")]),
            row(&[("codice", "'=CMD()")]),
            row(&[("codice", too_long.as_str())]),
            row(&[("codice", "DPI-001"), ("prezzo", "-1")]),
            row(&[("codice", "DPI-001"), ("prezzo", "dieci")]),
            row(&[("codice", "DPI-001"), ("prezzo", "NaN")]),
            row(&[("codice", "DPI-001"), ("url", "ftp://a.example")]),
            row(&[("codice", "DPI-001"), ("url", "https://")]),
        ] {
            assert!(validate_row(&bad).is_err(), "row {:?}", bad);
        }
    }

    #[test]
    fn test_take_invalid_and_reject_log() {
        let raw = b"codice,descrizione,prezzo\nDPI-001,Casco,10\nx,Guanti,\n,senza codice,\nDPI-003,Cordino,-4\n";
        let mut import = parse_catalog_csv(raw, None).unwrap();

        let rejected = import.take_invalid();

        assert_eq!(import.rows.len(), 2);
        assert_eq!(import.rows[0]["codice"], "DPI-001");
        assert_eq!(import.rows[1]["codice"], "");
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].record, 2);
        assert_eq!(rejected[1].record, 4);
        assert!(rejected[1].reason.contains("prezzo"));

        let dir = tempfile::tempdir().unwrap();
        let path = write_reject_log(dir.path(), "abc", &rejected).unwrap();

        assert_eq!(path, dir.path().join("reject_abc.csv"));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "motivo,riga,codice,descrizione,prezzo");
        assert!(lines[1].ends_with(",2,x,Guanti,"));
        assert!(lines[2].ends_with(",4,DPI-003,Cordino,'-4"));
    }

    #[test]
    fn test_header_sniffing_skips_title_rows() {
        let table = ExpiryTable::from_grid(grid(&[
            &["REPORT DPI CANTIERE", "", ""],
            &["", "", ""],
            &["Matricola", "Descrizione", "Data Scadenza"],
            &["M-01", "Imbracatura", "2030-01-01"],
            &["", "", ""],
            &["M-02", "Cordino", "2020-01-01"],
        ]));

        assert_eq!(table.headers, vec!["matricola", "descrizione", "data_scadenza"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.resolve_date_column(None).unwrap(), 2);
    }

    #[test]
    fn test_header_fallback_to_first_row() {
        let table = ExpiryTable::from_grid(grid(&[&["codice", ""], &["A1", "x"]]));
        assert_eq!(table.headers, vec!["codice", "col_1"]);
        assert!(table.resolve_date_column(None).is_err());
    }

    #[test]
    fn test_configured_column_wins() {
        let table = ExpiryTable::from_grid(grid(&[
            &["scadenza_collaudo", "revisione"],
            &["2030-01-01", "2020-01-01"],
        ]));

        assert_eq!(table.resolve_date_column(Some("Revisione")).unwrap(), 1);
        assert_eq!(table.resolve_date_column(Some("assente")).unwrap(), 0);
    }

    #[test]
    fn test_classify_table_from_csv() {
        let raw = b"Elenco DPI,,\ncodice,descrizione,scadenza\nA1,Casco,2024-06-15\nB2,Guanti,\nC3,Cordino,01/01/1900\n";
        let table = ExpiryTable::from_csv_bytes(raw).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        let classified = table
            .classify(&ExpiryClassifier::default(), None, today)
            .unwrap();

        assert_eq!(classified.date_column, "scadenza");
        let statuses: Vec<_> = classified.report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ExpiryStatus::Warning, ExpiryStatus::DateError, ExpiryStatus::Anomalous]
        );
    }
}
