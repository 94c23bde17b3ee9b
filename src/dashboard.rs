// 📊 Dashboard ("cruscotto")
// Aggregates classified rows into JSON/HTML snapshots, a run log and an alert feed

use crate::catalog::ClassifiedItem;
use crate::classifier::{Classification, ClassificationSummary, ExpiryStatus};
use crate::config::{Config, NotifyConfig};
use crate::parser::{ClassifiedTable, ExpiryTable};
use anyhow::Context;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Rows kept in the dashboard snapshot
pub const DASHBOARD_ROW_LIMIT: usize = 100;

pub const DAYS_COLUMN: &str = "giorni_rimanenti";
pub const STATUS_COLUMN: &str = "stato_scadenza";

/// Webhook URLs containing this are template leftovers
const PLACEHOLDER_HOST: &str = "TUO-N8N-HOST";

/// One classified row as column → text
pub type DashboardRow = BTreeMap<String, String>;

fn timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}

// ============================================================================
// COUNTS
// ============================================================================

/// Dashboard counters ("conteggio")
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub totale_dpi: usize,
    pub ok: usize,
    pub warning: usize,
    pub scaduti: usize,
    pub anomali: usize,
    pub errore_data: usize,
    pub righe_errore_data: usize,
}

impl From<&ClassificationSummary> for Counts {
    fn from(summary: &ClassificationSummary) -> Self {
        Counts {
            totale_dpi: summary.total,
            ok: summary.ok,
            warning: summary.warning,
            scaduti: summary.expired,
            anomali: summary.anomalous,
            errore_data: summary.date_error,
            righe_errore_data: summary.bad_dates(),
        }
    }
}

impl Counts {
    pub fn alerts(&self) -> usize {
        self.warning + self.scaduti
    }
}

// ============================================================================
// ROWS
// ============================================================================

fn with_classification(mut row: DashboardRow, classification: &Classification) -> DashboardRow {
    row.insert(
        DAYS_COLUMN.to_string(),
        classification
            .days_remaining
            .map(|d| d.to_string())
            .unwrap_or_default(),
    );
    row.insert(STATUS_COLUMN.to_string(), classification.status.label().to_string());
    row
}

/// Flatten a classified schedule into dashboard rows (input order)
pub fn rows_from_table(table: &ClassifiedTable) -> Vec<DashboardRow> {
    table
        .rows
        .iter()
        .zip(&table.report.results)
        .map(|(cells, classification)| {
            let row = table
                .headers
                .iter()
                .enumerate()
                .map(|(i, header)| (header.clone(), cells.get(i).cloned().unwrap_or_default()))
                .collect();
            with_classification(row, classification)
        })
        .collect()
}

/// Flatten classified catalog items into dashboard rows
pub fn rows_from_items(items: &[ClassifiedItem<'_>]) -> Vec<DashboardRow> {
    items
        .iter()
        .map(|item| {
            let record = item.record;
            let row: DashboardRow = [
                ("codice", record.code.clone()),
                ("descrizione", record.description.clone()),
                ("prezzo", record.price.clone()),
                ("gruppo", record.group.clone()),
                ("scadenza", record.expiry_date.clone().unwrap_or_default()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
            with_classification(row, &item.classification)
        })
        .collect()
}

fn row_status(row: &DashboardRow) -> Option<&str> {
    row.get(STATUS_COLUMN).map(String::as_str)
}

// ============================================================================
// DASHBOARD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    pub conteggio: Counts,
    pub rows: Vec<DashboardRow>,
    pub updated_at: String,
}

impl Dashboard {
    /// Counts over every row; only the first rows are kept
    pub fn new(summary: &ClassificationSummary, rows: &[DashboardRow]) -> Self {
        Dashboard {
            conteggio: Counts::from(summary),
            rows: rows.iter().take(DASHBOARD_ROW_LIMIT).cloned().collect(),
            updated_at: timestamp(),
        }
    }

    /// One-line run log entry
    pub fn log_line(&self) -> String {
        let c = &self.conteggio;
        format!(
            "{} | TOT:{} OK:{} WARN:{} SCAD:{} ERR:{} ANOMALI:{} RIGHE_ERR:{}",
            self.updated_at,
            c.totale_dpi,
            c.ok,
            c.warning,
            c.scaduti,
            c.errore_data,
            c.anomali,
            c.righe_errore_data
        )
    }

    /// Standalone HTML page with the counters and the alert rows
    pub fn render_html(&self) -> String {
        let c = &self.conteggio;
        let mut html = String::new();

        html.push_str("<!DOCTYPE html>\n<html>\n<head><meta charset=\"UTF-8\"><title>Cruscotto DPI</title></head>\n<body>\n");
        html.push_str("<h1>Cruscotto DPI</h1>\n<ul>\n");
        html.push_str(&format!("  <li>Totale DPI: {}</li>\n", c.totale_dpi));
        html.push_str(&format!("  <li>OK: {}</li>\n", c.ok));
        html.push_str(&format!("  <li>Warning: {}</li>\n", c.warning));
        html.push_str(&format!("  <li>Scaduti: {}</li>\n", c.scaduti));
        html.push_str(&format!("  <li>Anomalie: {}</li>\n", c.anomali));
        html.push_str(&format!("  <li>Errori data: {}</li>\n", c.errore_data));
        html.push_str("</ul>\n");

        let alerts: Vec<&DashboardRow> = self
            .rows
            .iter()
            .filter(|row| {
                matches!(
                    row_status(row),
                    Some(s) if s == ExpiryStatus::Warning.label() || s == ExpiryStatus::Expired.label()
                )
            })
            .collect();

        if !alerts.is_empty() {
            let columns: Vec<&String> = alerts[0].keys().collect();
            html.push_str("<table border=\"1\">\n<tr>");
            for column in &columns {
                html.push_str(&format!("<th>{}</th>", escape_html(column)));
            }
            html.push_str("</tr>\n");
            for row in alerts {
                html.push_str("<tr>");
                for column in &columns {
                    let value = row.get(*column).map(String::as_str).unwrap_or("");
                    html.push_str(&format!("<td>{}</td>", escape_html(value)));
                }
                html.push_str("</tr>\n");
            }
            html.push_str("</table>\n");
        }

        html.push_str(&format!("<p>Aggiornato: {}</p>\n", escape_html(&self.updated_at)));
        html.push_str("</body>\n</html>\n");
        html
    }
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

// ============================================================================
// ALERT FEED
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMeta {
    pub fonte: String,
    pub note: String,
}

/// WARNING/EXPIRED rows extracted for notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertFeed {
    pub conteggio: Counts,
    pub totale_dpi_allarme: usize,
    pub dpi_warning: Vec<DashboardRow>,
    pub dpi_scaduti: Vec<DashboardRow>,
    pub generated_at: String,
    pub meta: FeedMeta,
}

impl AlertFeed {
    pub fn new(conteggio: Counts, rows: &[DashboardRow]) -> Self {
        let pick = |status: ExpiryStatus| -> Vec<DashboardRow> {
            rows.iter()
                .filter(|row| row_status(row) == Some(status.label()))
                .cloned()
                .collect()
        };

        let dpi_warning = pick(ExpiryStatus::Warning);
        let dpi_scaduti = pick(ExpiryStatus::Expired);

        AlertFeed {
            conteggio,
            totale_dpi_allarme: dpi_warning.len() + dpi_scaduti.len(),
            dpi_warning,
            dpi_scaduti,
            generated_at: timestamp(),
            meta: FeedMeta {
                fonte: "agente0_dashboard.json".to_string(),
                note: "Solo WARNING/SCADUTO estratti per notifiche".to_string(),
            },
        }
    }
}

// ============================================================================
// NOTIFICATION DECISION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum NotifyDecision {
    Send,
    Skip(String),
}

/// Decide whether the feed should go out to the webhook
pub fn decide(config: &NotifyConfig, feed: &AlertFeed) -> NotifyDecision {
    if !config.enabled {
        return NotifyDecision::Skip("notifications disabled".to_string());
    }

    let url = config.webhook_url.trim();
    if url.is_empty() || url.contains(PLACEHOLDER_HOST) {
        return NotifyDecision::Skip("webhook URL not configured".to_string());
    }

    if feed.totale_dpi_allarme < config.min_alerts {
        return NotifyDecision::Skip(format!(
            "{} alerts below threshold {}",
            feed.totale_dpi_allarme, config.min_alerts
        ));
    }

    NotifyDecision::Send
}

// ============================================================================
// WRITER
// ============================================================================

/// Files produced by one dashboard run
#[derive(Debug, Clone, Serialize)]
pub struct DashboardFiles {
    pub dashboard_json: PathBuf,
    pub cruscotto_json: PathBuf,
    pub cruscotto_html: PathBuf,
    pub feed_json: PathBuf,
    pub run_log: PathBuf,
}

impl DashboardFiles {
    pub fn in_dir(logs_dir: &Path) -> Self {
        DashboardFiles {
            dashboard_json: logs_dir.join("agente0_dashboard.json"),
            cruscotto_json: logs_dir.join("agente0_cruscotto.json"),
            cruscotto_html: logs_dir.join("agente0_cruscotto.html"),
            feed_json: logs_dir.join("agente0_feed_notifiche.json"),
            run_log: logs_dir.join("agente0.log"),
        }
    }
}

#[derive(Serialize)]
struct CruscottoSnapshot<'a> {
    conteggio: &'a Counts,
    updated_at: &'a str,
}

/// Write every dashboard artifact into `logs_dir`
pub fn write_dashboard(
    logs_dir: &Path,
    dashboard: &Dashboard,
    feed: &AlertFeed,
) -> anyhow::Result<DashboardFiles> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;
    let files = DashboardFiles::in_dir(logs_dir);

    write_json(&files.dashboard_json, dashboard)?;
    write_json(
        &files.cruscotto_json,
        &CruscottoSnapshot {
            conteggio: &dashboard.conteggio,
            updated_at: &dashboard.updated_at,
        },
    )?;
    fs::write(&files.cruscotto_html, dashboard.render_html())
        .with_context(|| format!("Failed to write {}", files.cruscotto_html.display()))?;
    write_json(&files.feed_json, feed)?;

    let mut log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&files.run_log)
        .with_context(|| format!("Failed to open {}", files.run_log.display()))?;
    writeln!(log, "{}", dashboard.log_line())?;

    tracing::info!(
        "Dashboard written to {} ({} alerts)",
        logs_dir.display(),
        feed.totale_dpi_allarme
    );

    Ok(files)
}

/// Read back the last dashboard snapshot, if any
pub fn load_dashboard(path: &Path) -> anyhow::Result<Option<Dashboard>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let dashboard = serde_json::from_str(&content)
                .with_context(|| format!("Invalid dashboard JSON: {}", path.display()))?;
            Ok(Some(dashboard))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

// ============================================================================
// REFRESH
// ============================================================================

/// Outcome of one dashboard refresh
#[derive(Debug, Clone, Serialize)]
pub struct DashboardRun {
    pub date_column: String,
    pub conteggio: Counts,
    pub totale_dpi_allarme: usize,
    pub files: DashboardFiles,
    #[serde(skip)]
    pub feed: AlertFeed,
}

/// Load the configured schedule, classify it against `today` and write
/// every dashboard artifact. Notification is left to the caller.
pub fn refresh(config: &Config, today: NaiveDate) -> anyhow::Result<DashboardRun> {
    let table = ExpiryTable::from_path(&config.scadenzario_path)
        .with_context(|| format!("Failed to load {}", config.scadenzario_path.display()))?;

    let classified = table.classify(&config.classifier(), config.date_column.as_deref(), today)?;
    tracing::info!(
        "Classified {} rows on column '{}': {}",
        classified.rows.len(),
        classified.date_column,
        classified.report.summary.summary()
    );

    let rows = rows_from_table(&classified);
    let dashboard = Dashboard::new(&classified.report.summary, &rows);
    let feed = AlertFeed::new(dashboard.conteggio, &rows);
    let files = write_dashboard(&config.logs_dir, &dashboard, &feed)?;

    Ok(DashboardRun {
        date_column: classified.date_column,
        conteggio: dashboard.conteggio,
        totale_dpi_allarme: feed.totale_dpi_allarme,
        files,
        feed,
    })
}
