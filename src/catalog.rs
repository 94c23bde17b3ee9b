// 📦 Catalog Merge Store
// Keyed collection of DPI records with idempotent upserts from imported rows

use crate::classifier::{Classification, ClassificationSummary, ExpiryClassifier};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

/// Columns of the catalog CSV template / export
pub const CATALOG_FIELDS: [&str; 4] = ["codice", "descrizione", "prezzo", "gruppo"];

/// One imported row: normalized header name → cell text
pub type RawRow = BTreeMap<String, String>;

// ============================================================================
// EQUIPMENT RECORD
// ============================================================================

/// One DPI inventory row. Empty strings mean "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentRecord {
    #[serde(rename = "codice")]
    pub code: String,

    #[serde(rename = "descrizione", default)]
    pub description: String,

    #[serde(rename = "prezzo", default)]
    pub price: String,

    #[serde(rename = "gruppo", default)]
    pub group: String,

    #[serde(rename = "marca", default, skip_serializing_if = "String::is_empty")]
    pub brand: String,

    #[serde(rename = "modello", default, skip_serializing_if = "String::is_empty")]
    pub model: String,

    #[serde(rename = "nota", default, skip_serializing_if = "String::is_empty")]
    pub note: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(rename = "scadenza", default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
}

impl EquipmentRecord {
    pub fn new(code: impl Into<String>) -> Self {
        EquipmentRecord {
            code: code.into(),
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_price(mut self, price: impl Into<String>) -> Self {
        self.price = price.into();
        self
    }

    pub fn with_expiry(mut self, expiry: impl Into<String>) -> Self {
        self.expiry_date = Some(expiry.into());
        self
    }

    /// Build a record from a raw row: trim everything, missing → empty
    pub fn from_raw(row: &RawRow) -> Self {
        let field = |key: &str| row.get(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let expiry = field("scadenza");

        EquipmentRecord {
            code: field("codice"),
            description: field("descrizione"),
            price: field("prezzo"),
            group: field("gruppo"),
            brand: field("marca"),
            model: field("modello"),
            note: field("nota"),
            url: field("url"),
            expiry_date: if expiry.is_empty() { None } else { Some(expiry) },
        }
    }

    /// Overwrite fields that are non-empty in `incoming`.
    /// Returns true if any field actually changed.
    fn absorb(&mut self, incoming: &EquipmentRecord) -> bool {
        let mut changed = false;

        for (target, value) in [
            (&mut self.description, &incoming.description),
            (&mut self.price, &incoming.price),
            (&mut self.group, &incoming.group),
            (&mut self.brand, &incoming.brand),
            (&mut self.model, &incoming.model),
            (&mut self.note, &incoming.note),
            (&mut self.url, &incoming.url),
        ] {
            if !value.is_empty() && target.as_str() != value.as_str() {
                *target = value.clone();
                changed = true;
            }
        }

        if let Some(expiry) = &incoming.expiry_date {
            if self.expiry_date.as_ref() != Some(expiry) {
                self.expiry_date = Some(expiry.clone());
                changed = true;
            }
        }

        changed
    }
}

// ============================================================================
// MERGE OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Rows that changed at least one field of an existing record
    pub updated_count: usize,

    /// Every incoming row, including skipped ones
    pub parsed_count: usize,

    /// Rows appended as new records
    pub inserted_count: usize,

    /// Rows dropped because their code was empty
    pub skipped_count: usize,
}

impl MergeOutcome {
    pub fn summary(&self) -> String {
        format!(
            "parsed: {}, updated: {}, inserted: {}, skipped: {}",
            self.parsed_count, self.updated_count, self.inserted_count, self.skipped_count
        )
    }
}

// ============================================================================
// CATALOG STORE
// ============================================================================

/// Ordered, code-keyed collection of records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStore {
    items: Vec<EquipmentRecord>,
}

impl CatalogStore {
    pub fn new() -> Self {
        CatalogStore { items: Vec::new() }
    }

    /// Rebuild from a persisted snapshot. Empty codes are dropped and later
    /// duplicates merge into the first occurrence.
    pub fn from_items(items: Vec<EquipmentRecord>) -> Self {
        let mut store = CatalogStore::new();
        for item in items {
            store.upsert(item);
        }
        store
    }

    pub fn items(&self) -> &[EquipmentRecord] {
        &self.items
    }

    pub fn into_items(self) -> Vec<EquipmentRecord> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First record with exactly this code
    pub fn get(&self, code: &str) -> Option<&EquipmentRecord> {
        self.items.iter().find(|item| item.code == code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.get(code).is_some()
    }

    /// Insert or merge a single record. Returns None when skipped.
    fn upsert(&mut self, record: EquipmentRecord) -> Option<bool> {
        if record.code.is_empty() {
            return None;
        }

        match self.items.iter_mut().find(|item| item.code == record.code) {
            Some(existing) => Some(existing.absorb(&record)),
            None => {
                self.items.push(record);
                Some(true)
            }
        }
    }

    /// Merge freshly imported rows into the store.
    ///
    /// Codes are matched case-sensitively against the first existing record.
    /// Only non-empty incoming fields overwrite, so re-applying the same
    /// batch leaves the store unchanged and reports zero updates.
    pub fn merge(&mut self, incoming: &[RawRow]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        let mut index: HashMap<String, usize> = HashMap::new();
        for (pos, item) in self.items.iter().enumerate() {
            index.entry(item.code.clone()).or_insert(pos);
        }

        for row in incoming {
            outcome.parsed_count += 1;

            let record = EquipmentRecord::from_raw(row);
            if record.code.is_empty() {
                outcome.skipped_count += 1;
                continue;
            }

            match index.get(&record.code) {
                Some(&pos) => {
                    if self.items[pos].absorb(&record) {
                        outcome.updated_count += 1;
                    }
                }
                None => {
                    index.insert(record.code.clone(), self.items.len());
                    self.items.push(record);
                    outcome.inserted_count += 1;
                }
            }
        }

        outcome
    }

    /// Items whose group matches exactly (after trimming)
    pub fn filter_by_group(&self, group: &str) -> Vec<&EquipmentRecord> {
        let group = group.trim();
        self.items
            .iter()
            .filter(|item| item.group.trim() == group)
            .collect()
    }

    /// Classify each item's expiry date against `today`
    pub fn classify(
        &self,
        classifier: &ExpiryClassifier,
        today: NaiveDate,
    ) -> (Vec<ClassifiedItem<'_>>, ClassificationSummary) {
        let report = classifier.classify_all(
            self.items.iter().map(|item| item.expiry_date.as_deref()),
            today,
        );

        let classified = self
            .items
            .iter()
            .zip(report.results)
            .map(|(record, classification)| ClassifiedItem {
                record,
                classification,
            })
            .collect();

        (classified, report.summary)
    }
}

/// A record paired with its classification
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedItem<'a> {
    #[serde(flatten)]
    pub record: &'a EquipmentRecord,

    #[serde(flatten)]
    pub classification: Classification,
}

// ============================================================================
// CSV TEMPLATE / EXPORT
// ============================================================================

/// Neutralize spreadsheet formulas: cells starting with `= + - @` get a
/// leading `'` so they open as text
pub fn sanitize_cell(value: &str) -> Cow<'_, str> {
    if value.starts_with(['=', '+', '-', '@']) {
        Cow::Owned(format!("'{}", value))
    } else {
        Cow::Borrowed(value)
    }
}

/// Header-only CSV for users to fill in
pub fn csv_template() -> String {
    format!("{}\n", CATALOG_FIELDS.join(","))
}

/// Write records as CSV with the template columns, formulas neutralized
pub fn export_csv<'a, I>(items: I) -> Result<String>
where
    I: IntoIterator<Item = &'a EquipmentRecord>,
{
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CATALOG_FIELDS)?;

    for item in items {
        let cells =
            [&item.code, &item.description, &item.price, &item.group].map(|c| sanitize_cell(c));
        writer.write_record(cells.iter().map(|cell| cell.as_bytes()))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV writer: {}", e))?;
    String::from_utf8(bytes).context("CSV export produced invalid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_merge_scenario_non_empty_overwrite() {
        let mut store =
            CatalogStore::from_items(vec![EquipmentRecord::new("A1").with_description("old")]);

        let incoming = vec![
            row(&[("codice", "A1"), ("descrizione", "")]),
            row(&[("codice", "B2"), ("descrizione", "new")]),
        ];

        let outcome = store.merge(&incoming);

        assert_eq!(outcome.updated_count, 0);
        assert_eq!(outcome.parsed_count, 2);
        assert_eq!(outcome.inserted_count, 1);
        assert_eq!(
            store.items(),
            &[
                EquipmentRecord::new("A1").with_description("old"),
                EquipmentRecord::new("B2").with_description("new"),
            ]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut store = CatalogStore::from_items(vec![
            EquipmentRecord::new("A1").with_description("Imbracatura"),
            EquipmentRecord::new("Z9").with_description("Casco"),
        ]);

        let incoming = vec![
            row(&[("codice", "A1"), ("descrizione", "Imbracatura anticaduta"), ("prezzo", "120")]),
            row(&[("codice", "C3"), ("descrizione", "Cordino"), ("gruppo", "funi")]),
        ];

        let first = store.merge(&incoming);
        let after_first = store.clone();
        let second = store.merge(&incoming);

        assert_eq!(first.updated_count, 1);
        assert_eq!(first.inserted_count, 1);
        assert_eq!(second.updated_count, 0);
        assert_eq!(second.inserted_count, 0);
        assert_eq!(second.parsed_count, 2);
        assert_eq!(store, after_first);

        // Pre-existing codes untouched by the batch survive
        assert_eq!(store.get("Z9").unwrap().description, "Casco");
    }

    #[test]
    fn test_merge_skips_empty_codes_but_counts_them() {
        let mut store = CatalogStore::new();
        let incoming = vec![
            row(&[("codice", "   "), ("descrizione", "senza codice")]),
            row(&[("descrizione", "manca colonna")]),
            row(&[("codice", " K1 "), ("descrizione", " Guanti ")]),
        ];

        let outcome = store.merge(&incoming);

        assert_eq!(outcome.parsed_count, 3);
        assert_eq!(outcome.skipped_count, 2);
        assert_eq!(outcome.updated_count, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.items()[0].code, "K1");
        assert_eq!(store.items()[0].description, "Guanti");
    }

    #[test]
    fn test_merge_codes_are_case_sensitive() {
        let mut store = CatalogStore::from_items(vec![EquipmentRecord::new("ab1")]);
        let outcome = store.merge(&[row(&[("codice", "AB1")])]);

        assert_eq!(outcome.inserted_count, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_duplicate_codes_within_batch_merge() {
        let mut store = CatalogStore::new();
        let outcome = store.merge(&[
            row(&[("codice", "D4"), ("descrizione", "Moschettone")]),
            row(&[("codice", "D4"), ("prezzo", "12.50")]),
        ]);

        assert_eq!(outcome.inserted_count, 1);
        assert_eq!(outcome.updated_count, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.items()[0].description, "Moschettone");
        assert_eq!(store.items()[0].price, "12.50");
    }

    #[test]
    fn test_from_items_drops_empty_codes() {
        let store = CatalogStore::from_items(vec![
            EquipmentRecord::new(""),
            EquipmentRecord::new("X1"),
        ]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_classify_items() {
        let store = CatalogStore::from_items(vec![
            EquipmentRecord::new("A1").with_expiry("2024-06-15"),
            EquipmentRecord::new("B2"),
        ]);
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        let (items, summary) = store.classify(&ExpiryClassifier::default(), today);

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].classification.days_remaining, Some(14));
        assert_eq!(summary.warning, 1);
        assert_eq!(summary.date_error, 1);
    }

    #[test]
    fn test_export_and_filter() {
        let store = CatalogStore::from_items(vec![
            EquipmentRecord::new("A1").with_description("Casco, bianco").with_group("testa"),
            EquipmentRecord::new("B2").with_description("Guanti").with_group("mani"),
        ]);

        let csv_text = export_csv(store.filter_by_group(" testa ")).unwrap();

        assert_eq!(
            csv_text,
            "codice,descrizione,prezzo,gruppo\nA1,\"Casco, bianco\",,testa\n"
        );
        assert_eq!(csv_template(), "codice,descrizione,prezzo,gruppo\n");
    }

    #[test]
    fn test_export_neutralizes_formulas() {
        let store = CatalogStore::from_items(vec![
            EquipmentRecord::new("DPI-001").with_description("=HYPERLINK(\"http://x\",\"y\")"),
            EquipmentRecord::new("DPI-002").with_description("@SUM(A1)").with_group("+mani"),
            EquipmentRecord::new("DPI-003").with_description("Guanti - taglia L"),
        ]);

        let csv_text = export_csv(store.items()).unwrap();
        let lines: Vec<&str> = csv_text.lines().collect();

        assert_eq!(lines[1], "DPI-001,\"'=HYPERLINK(\"\"http://x\"\",\"\"y\"\")\",,");
        assert_eq!(lines[2], "DPI-002,'@SUM(A1),,'+mani");
        assert_eq!(lines[3], "DPI-003,Guanti - taglia L,,");
        assert_eq!(sanitize_cell("-5"), "'-5");
        assert_eq!(sanitize_cell(""), "");
    }

    #[test]
    fn test_extra_columns_survive_merge() {
        let mut store = CatalogStore::new();
        store.merge(&[row(&[
            ("codice", "DPI-001"),
            ("descrizione", "Casco"),
            ("marca", "Petzl"),
            ("modello", "Vertex"),
            ("nota", "revisionato"),
        ])]);

        let outcome = store.merge(&[row(&[
            ("codice", "DPI-001"),
            ("nota", "da sostituire"),
            ("marca", ""),
        ])]);

        let item = store.get("DPI-001").unwrap();
        assert_eq!(outcome.updated_count, 1);
        assert_eq!(item.brand, "Petzl");
        assert_eq!(item.model, "Vertex");
        assert_eq!(item.note, "da sostituire");

        let json = serde_json::to_value(item).unwrap();
        assert_eq!(json["marca"], "Petzl");
        assert_eq!(json["modello"], "Vertex");
        assert!(json.get("url").is_none());
    }

    #[test]
    fn test_record_json_uses_catalog_keys() {
        let record = EquipmentRecord::new("A1").with_description("Casco");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["codice"], "A1");
        assert_eq!(json["descrizione"], "Casco");
        assert!(json.get("scadenza").is_none());
    }
}
