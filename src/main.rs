// Only compile UI module when TUI feature is enabled
#[cfg(feature = "tui")]
mod ui;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tpi_evoluto::{
    apply_import, dashboard, parse_catalog_csv, write_reject_log, Config, DashboardRun,
    ExpiryStatus, ExpiryTable,
};

#[derive(Debug, Parser)]
#[command(name = "tpi-evoluto", version, about = "DPI inventory: catalog import and expiry dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Merge a catalog CSV into the configured store
    Import {
        csv: PathBuf,

        /// Group applied to rows without one
        #[arg(long)]
        group: Option<String>,
    },

    /// Regenerate the dashboard files from the schedule and notify
    Dashboard {
        /// Write the files but do not call the webhook
        #[arg(long)]
        no_notify: bool,
    },

    /// Print the expiry classification of a schedule CSV
    Classify {
        csv: PathBuf,

        /// Expiry column (defaults to DATE_COLUMN, then the first "scadenza" column)
        #[arg(long)]
        column: Option<String>,

        /// Reference date, YYYY-MM-DD (defaults to today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Terminal dashboard of a schedule CSV, or of the catalog when omitted
    Ui { csv: Option<PathBuf> },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tpi_evoluto::init_tracing("warn")?;

    let config = Config::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Import { csv, group } => run_import(&config, &csv, group.as_deref()),
        Command::Dashboard { no_notify } => run_dashboard(&config, no_notify),
        Command::Classify { csv, column, date } => {
            run_classify(&config, &csv, column.as_deref(), date)
        }
        Command::Ui { csv } => run_ui_mode(&config, csv),
    }
}

fn run_import(config: &Config, csv: &std::path::Path, group: Option<&str>) -> Result<()> {
    println!("🗄️  Catalog import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let raw = std::fs::read(csv).with_context(|| format!("Failed to read {}", csv.display()))?;
    let mut import = parse_catalog_csv(&raw, group)?;
    println!("✓ Parsed {} rows from {}", import.rows.len(), csv.display());
    let rejected = import.take_invalid();

    if !import.missing_required_headers.is_empty() {
        println!("⚠️  Missing columns: {}", import.missing_required_headers.join(", "));
    }
    if !import.unknown_headers.is_empty() {
        println!("⚠️  Unknown columns: {}", import.unknown_headers.join(", "));
    }

    config.ensure_directories()?;
    let mut repo = config.open_repository()?;
    let source_name = csv
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let receipt = apply_import(&mut *repo, &import.rows, &source_name, &raw)?;

    println!("\n💾 Saved to {} store", repo.backend());
    println!("✓ Inserted: {}", receipt.outcome.inserted_count);
    println!("✓ Updated:  {}", receipt.outcome.updated_count);
    println!("✓ Skipped:  {}", receipt.outcome.skipped_count);
    println!("✓ Catalog now holds {} items", receipt.total_items);

    if !rejected.is_empty() {
        let path = write_reject_log(&config.rejects_dir(), &receipt.record.import_id, &rejected)?;
        println!("\n⚠️  {} invalid rows rejected, see {}", rejected.len(), path.display());
    }

    Ok(())
}

fn run_dashboard(config: &Config, no_notify: bool) -> Result<()> {
    println!("📊 Dashboard refresh");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    config.ensure_directories()?;
    let run = dashboard::refresh(config, Local::now().date_naive())?;

    let c = &run.conteggio;
    println!("✓ Column: {}", run.date_column);
    println!(
        "✓ TOT: {}  OK: {}  WARNING: {}  SCADUTI: {}  ANOMALI: {}  ERRORI: {}",
        c.totale_dpi, c.ok, c.warning, c.scaduti, c.anomali, c.errore_data
    );
    println!("✓ Files written to {}", config.logs_dir.display());

    if no_notify {
        println!("\n🔕 Notification skipped (--no-notify)");
    } else {
        send_notification(config, &run);
    }

    Ok(())
}

#[cfg(feature = "server")]
fn send_notification(config: &Config, run: &DashboardRun) {
    use tpi_evoluto::notifier::{notify, NotifyOutcome};

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("❌ Could not start async runtime: {}", e);
            return;
        }
    };

    match runtime.block_on(notify(&config.notify, &run.feed)) {
        Ok(NotifyOutcome::Sent { status }) => {
            println!("\n🔔 Sent {} alerts (HTTP {})", run.totale_dpi_allarme, status)
        }
        Ok(NotifyOutcome::Skipped { reason }) => println!("\n🔕 Notification skipped: {}", reason),
        Err(e) => eprintln!("\n❌ Notification failed: {}", e),
    }
}

#[cfg(not(feature = "server"))]
fn send_notification(_config: &Config, run: &DashboardRun) {
    println!(
        "\n🔕 {} alerts written to the feed; webhook delivery needs the server feature",
        run.totale_dpi_allarme
    );
}

fn run_classify(
    config: &Config,
    csv: &std::path::Path,
    column: Option<&str>,
    date: Option<NaiveDate>,
) -> Result<()> {
    let today = date.unwrap_or_else(|| Local::now().date_naive());
    let column = column.or(config.date_column.as_deref());

    let table = ExpiryTable::from_path(csv)?;
    let classified = table.classify(&config.classifier(), column, today)?;
    let summary = &classified.report.summary;

    println!("📅 {} (as of {})", csv.display(), today);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Column: {}", classified.date_column);
    for status in ExpiryStatus::ALL {
        println!("  {:<12} {}", status.label(), summary.count(status));
    }
    println!("  {:<12} {}", "TOTALE", summary.total);

    let alerts: Vec<_> = dashboard::rows_from_table(&classified)
        .into_iter()
        .filter(|row| {
            row.get(dashboard::STATUS_COLUMN).is_some_and(|s| {
                s == ExpiryStatus::Warning.label() || s == ExpiryStatus::Expired.label()
            })
        })
        .collect();

    if !alerts.is_empty() {
        println!("\n⚠️  Alerts");
        let first_column = classified.headers.first().cloned().unwrap_or_default();
        for row in alerts {
            println!(
                "  {:<16} {:<12} {:>6}  {}",
                row.get(&first_column).map(String::as_str).unwrap_or(""),
                row.get(&classified.date_column).map(String::as_str).unwrap_or(""),
                row.get(dashboard::DAYS_COLUMN).map(String::as_str).unwrap_or(""),
                row.get(dashboard::STATUS_COLUMN).map(String::as_str).unwrap_or(""),
            );
        }
    }

    Ok(())
}

#[cfg(feature = "tui")]
fn run_ui_mode(config: &Config, csv: Option<PathBuf>) -> Result<()> {
    let today = Local::now().date_naive();
    let classifier = config.classifier();

    let mut app = match csv {
        Some(path) => {
            let table = ExpiryTable::from_path(&path)?;
            let classified = table.classify(&classifier, config.date_column.as_deref(), today)?;
            let summary = classified.report.summary;
            ui::App::new(path.display().to_string(), ui::ExpiryRow::from_table(&classified), summary)
        }
        None => {
            let repo = config.open_repository()?;
            let store = repo.load()?;
            let (items, summary) = store.classify(&classifier, today);
            ui::App::new(
                format!("catalogo ({})", repo.backend()),
                ui::ExpiryRow::from_items(&items),
                summary,
            )
        }
    };

    ui::run_ui(&mut app)?;

    println!("\n✅ UI closed successfully");

    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_ui_mode(_config: &Config, _csv: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("TUI mode not available; rebuild with: cargo build --features tui")
}
