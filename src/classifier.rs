// ⏳ Expiry Classifier
// Maps raw expiry values to a status + signed day count, and aggregates counts

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Default number of days before expiry that turns a row into WARNING
pub const DEFAULT_WARNING_DAYS: i64 = 30;

/// Default anomaly cutoff: parsed years below this are implausible
pub const DEFAULT_ANOMALY_YEAR_CUTOFF: i32 = 1910;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];

/// Day-first with a two-digit year (`15/06/24`); 00-69 → 20xx, 70-99 → 19xx
const SHORT_YEAR_FORMATS: &[&str] = &["%d/%m/%y", "%d-%m-%y", "%d.%m.%y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
];

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpiryStatus {
    Ok,
    Warning,
    Expired,
    Anomalous,
    DateError,
}

impl ExpiryStatus {
    /// Label used in dashboards and exported rows
    pub fn label(&self) -> &'static str {
        match self {
            ExpiryStatus::Ok => "OK",
            ExpiryStatus::Warning => "WARNING",
            ExpiryStatus::Expired => "SCADUTO",
            ExpiryStatus::Anomalous => "ANOMALO",
            ExpiryStatus::DateError => "ERRORE_DATA",
        }
    }

    /// True for rows that should raise a notification
    pub fn is_alert(&self) -> bool {
        matches!(self, ExpiryStatus::Warning | ExpiryStatus::Expired)
    }

    pub const ALL: [ExpiryStatus; 5] = [
        ExpiryStatus::Ok,
        ExpiryStatus::Warning,
        ExpiryStatus::Expired,
        ExpiryStatus::Anomalous,
        ExpiryStatus::DateError,
    ];
}

/// Result of classifying a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub days_remaining: Option<i64>,
    pub status: ExpiryStatus,
}

impl Classification {
    fn without_days(status: ExpiryStatus) -> Self {
        Classification {
            days_remaining: None,
            status,
        }
    }
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub ok: usize,
    pub warning: usize,
    pub expired: usize,
    pub anomalous: usize,
    pub date_error: usize,
    pub total: usize,
}

impl ClassificationSummary {
    pub fn record(&mut self, status: ExpiryStatus) {
        match status {
            ExpiryStatus::Ok => self.ok += 1,
            ExpiryStatus::Warning => self.warning += 1,
            ExpiryStatus::Expired => self.expired += 1,
            ExpiryStatus::Anomalous => self.anomalous += 1,
            ExpiryStatus::DateError => self.date_error += 1,
        }
        self.total += 1;
    }

    pub fn count(&self, status: ExpiryStatus) -> usize {
        match status {
            ExpiryStatus::Ok => self.ok,
            ExpiryStatus::Warning => self.warning,
            ExpiryStatus::Expired => self.expired,
            ExpiryStatus::Anomalous => self.anomalous,
            ExpiryStatus::DateError => self.date_error,
        }
    }

    /// Rows needing attention (WARNING + EXPIRED)
    pub fn alerts(&self) -> usize {
        self.warning + self.expired
    }

    /// Rows whose date could not be used (ANOMALOUS + DATE_ERROR)
    pub fn bad_dates(&self) -> usize {
        self.anomalous + self.date_error
    }

    pub fn summary(&self) -> String {
        format!(
            "TOT:{} OK:{} WARN:{} SCAD:{} ERR:{} ANOMALI:{}",
            self.total, self.ok, self.warning, self.expired, self.date_error, self.anomalous
        )
    }
}

/// Batch output: one classification per input (input order) plus counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub results: Vec<Classification>,
    pub summary: ClassificationSummary,
}

// ============================================================================
// CLASSIFIER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryClassifier {
    /// Rows with 0..=warning_days left are WARNING
    pub warning_days: i64,

    /// Years strictly below this are ANOMALOUS
    pub anomaly_year_cutoff: i32,
}

impl Default for ExpiryClassifier {
    fn default() -> Self {
        ExpiryClassifier {
            warning_days: DEFAULT_WARNING_DAYS,
            anomaly_year_cutoff: DEFAULT_ANOMALY_YEAR_CUTOFF,
        }
    }
}

impl ExpiryClassifier {
    pub fn new(warning_days: i64, anomaly_year_cutoff: i32) -> Self {
        ExpiryClassifier {
            warning_days,
            anomaly_year_cutoff,
        }
    }

    /// Build from escalation levels (e.g. 60/30/15): the widest level wins
    pub fn from_levels(levels: &[i64], anomaly_year_cutoff: i32) -> Self {
        let warning_days = levels.iter().copied().max().unwrap_or(DEFAULT_WARNING_DAYS);
        ExpiryClassifier::new(warning_days, anomaly_year_cutoff)
    }

    /// Classify one raw value against `today`
    pub fn classify(&self, raw: Option<&str>, today: NaiveDate) -> Classification {
        let Some(raw) = raw else {
            return Classification::without_days(ExpiryStatus::DateError);
        };

        let Some(date) = parse_expiry_date(raw) else {
            return Classification::without_days(ExpiryStatus::DateError);
        };

        self.classify_date(date, today)
    }

    /// Classify an already parsed date
    pub fn classify_date(&self, date: NaiveDate, today: NaiveDate) -> Classification {
        if date.year() < self.anomaly_year_cutoff {
            return Classification::without_days(ExpiryStatus::Anomalous);
        }

        let days = (date - today).num_days();
        let status = if days < 0 {
            ExpiryStatus::Expired
        } else if days <= self.warning_days {
            ExpiryStatus::Warning
        } else {
            ExpiryStatus::Ok
        };

        Classification {
            days_remaining: Some(days),
            status,
        }
    }

    /// Classify every value, keeping input order
    pub fn classify_all<'a, I>(&self, values: I, today: NaiveDate) -> ClassificationReport
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let mut summary = ClassificationSummary::default();
        let results = values
            .into_iter()
            .map(|value| {
                let result = self.classify(value, today);
                summary.record(result.status);
                result
            })
            .collect();

        ClassificationReport { results, summary }
    }
}

/// Parse the date syntaxes found in DPI spreadsheets.
///
/// Day-first for slash/dash/dot forms, ISO year-first otherwise. Year-first
/// forms need a four-digit year; two-digit years are always day-first. Blank
/// input yields `None`.
pub fn parse_expiry_date(raw: &str) -> Option<NaiveDate> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }

    for format in DATE_FORMATS {
        if !has_full_year(value, format) {
            continue;
        }
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }

    for format in SHORT_YEAR_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }

    for format in DATETIME_FORMATS {
        if !has_full_year(value, format) {
            continue;
        }
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.date());
        }
    }

    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.date_naive())
}

/// chrono's `%Y` also takes one or two digits, which would read `15/06/24`
/// as year 15. Require the numeric field under `%Y` to have four digits.
fn has_full_year(value: &str, format: &str) -> bool {
    let Some(year_field) = format
        .split('%')
        .skip(1)
        .filter_map(|directive| directive.chars().next())
        .filter(|c| c.is_ascii_alphabetic())
        .position(|c| c == 'Y')
    else {
        return true;
    };

    value
        .split(|c: char| !c.is_ascii_digit())
        .filter(|field| !field.is_empty())
        .nth(year_field)
        .is_some_and(|field| field.len() == 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_reference_scenario() {
        let classifier = ExpiryClassifier::default();
        let today = date(2024, 6, 1);

        let warning = classifier.classify(Some("2024-06-15"), today);
        assert_eq!(warning.days_remaining, Some(14));
        assert_eq!(warning.status, ExpiryStatus::Warning);

        let expired = classifier.classify(Some("2024-05-01"), today);
        assert_eq!(expired.days_remaining, Some(-31));
        assert_eq!(expired.status, ExpiryStatus::Expired);

        let ok = classifier.classify(Some("2024-12-01"), today);
        assert_eq!(ok.days_remaining, Some(183));
        assert_eq!(ok.status, ExpiryStatus::Ok);

        let missing = classifier.classify(None, today);
        assert_eq!(missing.days_remaining, None);
        assert_eq!(missing.status, ExpiryStatus::DateError);

        let anomalous = classifier.classify(Some("1899-01-01"), today);
        assert_eq!(anomalous.days_remaining, None);
        assert_eq!(anomalous.status, ExpiryStatus::Anomalous);
    }

    #[test]
    fn test_threshold_boundaries() {
        let classifier = ExpiryClassifier::default();
        let today = date(2024, 6, 1);

        // Today itself is still WARNING, not EXPIRED
        assert_eq!(
            classifier.classify_date(today, today).status,
            ExpiryStatus::Warning
        );
        assert_eq!(
            classifier.classify_date(date(2024, 7, 1), today).status,
            ExpiryStatus::Warning
        );
        assert_eq!(
            classifier.classify_date(date(2024, 7, 2), today).status,
            ExpiryStatus::Ok
        );
        assert_eq!(
            classifier.classify_date(date(2024, 5, 31), today).status,
            ExpiryStatus::Expired
        );
    }

    #[test]
    fn test_unparseable_and_blank() {
        let classifier = ExpiryClassifier::default();
        let today = date(2024, 6, 1);

        for raw in ["", "   ", "n/d", "2024-13-45", "31/02/2024"] {
            let result = classifier.classify(Some(raw), today);
            assert_eq!(result.status, ExpiryStatus::DateError, "input {:?}", raw);
            assert_eq!(result.days_remaining, None);
        }
    }

    #[test]
    fn test_anomaly_cutoff_is_configurable() {
        let strict = ExpiryClassifier::new(30, 2000);
        let today = date(2024, 6, 1);

        assert_eq!(
            strict.classify(Some("1999-12-31"), today).status,
            ExpiryStatus::Anomalous
        );
        assert_eq!(
            ExpiryClassifier::default()
                .classify(Some("1999-12-31"), today)
                .status,
            ExpiryStatus::Expired
        );
    }

    #[test]
    fn test_from_levels_uses_widest() {
        let classifier = ExpiryClassifier::from_levels(&[15, 60, 30], 1910);
        assert_eq!(classifier.warning_days, 60);

        let fallback = ExpiryClassifier::from_levels(&[], 1910);
        assert_eq!(fallback.warning_days, DEFAULT_WARNING_DAYS);
    }

    #[test]
    fn test_parse_supported_formats() {
        let expected = date(2025, 3, 9);
        for raw in [
            "2025-03-09",
            "2025/03/09",
            "09/03/2025",
            "09-03-2025",
            "09.03.2025",
            "2025-03-09 00:00:00",
            "2025-03-09T08:30:00",
            "2025-03-09T08:30:00+01:00",
            "  2025-03-09  ",
        ] {
            assert_eq!(parse_expiry_date(raw), Some(expected), "input {:?}", raw);
        }
    }

    #[test]
    fn test_short_years_are_day_first() {
        assert_eq!(parse_expiry_date("15/06/24"), Some(date(2024, 6, 15)));
        assert_eq!(parse_expiry_date("15-06-24"), Some(date(2024, 6, 15)));
        assert_eq!(parse_expiry_date("15.06.24"), Some(date(2024, 6, 15)));
        assert_eq!(parse_expiry_date("01/02/03"), Some(date(2003, 2, 1)));
        assert_eq!(parse_expiry_date("31/12/99"), Some(date(1999, 12, 31)));

        // Never read as year 15 (which would count as ANOMALO)
        let result = ExpiryClassifier::default().classify(Some("15/06/24"), date(2024, 6, 1));
        assert_eq!(result.status, ExpiryStatus::Warning);
        assert_eq!(result.days_remaining, Some(14));
    }

    #[test]
    fn test_year_first_needs_four_digits() {
        assert_eq!(parse_expiry_date("24-06-15"), Some(date(2015, 6, 24)));
        assert_eq!(parse_expiry_date("0024-06-15"), Some(date(24, 6, 15)));
        assert_eq!(parse_expiry_date("24/06/15 10:00:00"), None);
    }

    #[test]
    fn test_batch_keeps_order_and_counts() {
        let classifier = ExpiryClassifier::default();
        let today = date(2024, 6, 1);
        let values = vec![
            Some("2024-12-01"),
            None,
            Some("2024-06-10"),
            Some("garbage"),
            Some("2023-01-01"),
            Some("1900-01-01"),
        ];

        let report = classifier.classify_all(values, today);

        let statuses: Vec<_> = report.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                ExpiryStatus::Ok,
                ExpiryStatus::DateError,
                ExpiryStatus::Warning,
                ExpiryStatus::DateError,
                ExpiryStatus::Expired,
                ExpiryStatus::Anomalous,
            ]
        );
        assert_eq!(report.summary.total, 6);
        assert_eq!(report.summary.ok, 1);
        assert_eq!(report.summary.warning, 1);
        assert_eq!(report.summary.expired, 1);
        assert_eq!(report.summary.anomalous, 1);
        assert_eq!(report.summary.date_error, 2);
        assert_eq!(report.summary.alerts(), 2);
        assert_eq!(report.summary.bad_dates(), 3);
    }

    #[test]
    fn test_status_labels_serialize() {
        let json = serde_json::to_string(&ExpiryStatus::DateError).unwrap();
        assert_eq!(json, "\"DATE_ERROR\"");
        assert_eq!(ExpiryStatus::Expired.label(), "SCADUTO");
        assert!(ExpiryStatus::Warning.is_alert());
        assert!(!ExpiryStatus::Anomalous.is_alert());
    }
}
