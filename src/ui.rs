use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io;
use tpi_evoluto::{
    Classification, ClassificationSummary, ClassifiedItem, ClassifiedTable, ExpiryStatus,
};

const PAGE_SIZE: usize = 20;

/// One row shown in the terminal dashboard
#[derive(Debug, Clone)]
pub struct ExpiryRow {
    pub label: String,
    pub description: String,
    pub expiry: String,
    /// Every source column, in order, for the detail panel
    pub fields: Vec<(String, String)>,
    pub classification: Classification,
}

impl ExpiryRow {
    pub fn from_table(table: &ClassifiedTable) -> Vec<ExpiryRow> {
        let date_idx = table
            .headers
            .iter()
            .position(|h| *h == table.date_column)
            .unwrap_or(0);

        table
            .rows
            .iter()
            .zip(&table.report.results)
            .map(|(cells, classification)| {
                let cell = |i: usize| cells.get(i).cloned().unwrap_or_default();
                ExpiryRow {
                    label: cell(0),
                    description: if date_idx == 1 { String::new() } else { cell(1) },
                    expiry: cell(date_idx),
                    fields: table
                        .headers
                        .iter()
                        .enumerate()
                        .map(|(i, h)| (h.clone(), cell(i)))
                        .collect(),
                    classification: *classification,
                }
            })
            .collect()
    }

    pub fn from_items(items: &[ClassifiedItem<'_>]) -> Vec<ExpiryRow> {
        items
            .iter()
            .map(|item| {
                let r = item.record;
                let expiry = r.expiry_date.clone().unwrap_or_default();
                let mut fields = vec![
                    ("codice".to_string(), r.code.clone()),
                    ("descrizione".to_string(), r.description.clone()),
                    ("prezzo".to_string(), r.price.clone()),
                    ("gruppo".to_string(), r.group.clone()),
                    ("scadenza".to_string(), expiry.clone()),
                ];
                // Optional columns only when filled in
                for (name, value) in [
                    ("marca", &r.brand),
                    ("modello", &r.model),
                    ("nota", &r.note),
                    ("url", &r.url),
                ] {
                    if !value.is_empty() {
                        fields.push((name.to_string(), value.clone()));
                    }
                }

                ExpiryRow {
                    label: r.code.clone(),
                    description: r.description.clone(),
                    fields,
                    expiry,
                    classification: item.classification,
                }
            })
            .collect()
    }
}

pub struct App {
    pub source: String,
    pub rows: Vec<ExpiryRow>,
    pub filtered_rows: Vec<ExpiryRow>,
    pub summary: ClassificationSummary,
    pub state: TableState,
    pub show_detail: bool,
    pub status_filter: Option<ExpiryStatus>,
}

impl App {
    pub fn new(source: impl Into<String>, rows: Vec<ExpiryRow>, summary: ClassificationSummary) -> Self {
        let mut state = TableState::default();
        if !rows.is_empty() {
            state.select(Some(0));
        }

        Self {
            source: source.into(),
            filtered_rows: rows.clone(),
            rows,
            summary,
            state,
            show_detail: false,
            status_filter: None,
        }
    }

    pub fn toggle_detail(&mut self) {
        self.show_detail = !self.show_detail;
    }

    pub fn selected_row(&self) -> Option<&ExpiryRow> {
        self.state.selected().and_then(|i| self.filtered_rows.get(i))
    }

    pub fn apply_filter(&mut self, filter: Option<ExpiryStatus>) {
        self.status_filter = filter;

        self.filtered_rows = match filter {
            None => self.rows.clone(),
            Some(status) => self
                .rows
                .iter()
                .filter(|row| row.classification.status == status)
                .cloned()
                .collect(),
        };

        // Reset selection to first item
        if self.filtered_rows.is_empty() {
            self.state.select(None);
        } else {
            self.state.select(Some(0));
        }
    }

    pub fn clear_filter(&mut self) {
        self.apply_filter(None);
    }

    pub fn next(&mut self) {
        let len = self.filtered_rows.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let len = self.filtered_rows.len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        self.state.select(Some(i));
    }

    pub fn page_down(&mut self) {
        let len = self.filtered_rows.len();
        if len == 0 {
            return;
        }
        let i = self
            .state
            .selected()
            .map_or(0, |i| (i + PAGE_SIZE).min(len - 1));
        self.state.select(Some(i));
    }

    pub fn page_up(&mut self) {
        if self.filtered_rows.is_empty() {
            return;
        }
        let i = self.state.selected().map_or(0, |i| i.saturating_sub(PAGE_SIZE));
        self.state.select(Some(i));
    }

    pub fn select_last(&mut self) {
        if !self.filtered_rows.is_empty() {
            self.state.select(Some(self.filtered_rows.len() - 1));
        }
    }
}

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    res.map_err(Into::into)
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if let Event::Key(key) = event::read()? {
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                KeyCode::Enter => app.toggle_detail(),
                KeyCode::Char('c') => app.clear_filter(),
                KeyCode::Char(ch @ '1'..='5') => {
                    let idx = ch as usize - '1' as usize;
                    app.apply_filter(Some(ExpiryStatus::ALL[idx]));
                }
                KeyCode::Down | KeyCode::Char('j') => app.next(),
                KeyCode::Up | KeyCode::Char('k') => app.previous(),
                KeyCode::PageDown => app.page_down(),
                KeyCode::PageUp => app.page_up(),
                KeyCode::Home => app.state.select(Some(0)),
                KeyCode::End => app.select_last(),
                _ => {}
            }
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Counts
            Constraint::Min(0),    // Rows
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    if app.show_detail {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(chunks[1]);

        render_table(f, content_chunks[0], app);
        render_detail_panel(f, content_chunks[1], app);
    } else {
        render_table(f, chunks[1], app);
    }

    render_status_bar(f, chunks[2], app);
}

fn status_color(status: ExpiryStatus) -> Color {
    match status {
        ExpiryStatus::Ok => Color::Green,
        ExpiryStatus::Warning => Color::Yellow,
        ExpiryStatus::Expired => Color::Red,
        ExpiryStatus::Anomalous => Color::Magenta,
        ExpiryStatus::DateError => Color::DarkGray,
    }
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let mut spans = vec![
        Span::styled(
            " Scadenze DPI ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("│ TOT: {} ", app.summary.total)),
    ];

    for status in ExpiryStatus::ALL {
        spans.push(Span::raw("│ "));
        spans.push(Span::styled(
            format!("{}: {} ", status.label(), app.summary.count(status)),
            Style::default().fg(status_color(status)),
        ));
    }

    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(header, area);
}

fn render_table(f: &mut Frame, area: Rect, app: &mut App) {
    let header = Row::new(["Codice", "Descrizione", "Scadenza", "Giorni", "Stato"].map(|h| {
        Cell::from(h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    }))
    .style(Style::default().bg(Color::DarkGray))
    .height(1);

    let rows = app.filtered_rows.iter().map(|row| {
        let status = row.classification.status;
        let color = status_color(status);
        let days = row
            .classification
            .days_remaining
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());

        Row::new(vec![
            Cell::from(truncate(&row.label, 14)),
            Cell::from(truncate(&row.description, 34)),
            Cell::from(truncate(&row.expiry, 12)),
            Cell::from(days).style(Style::default().fg(color)),
            Cell::from(status.label()).style(Style::default().fg(color)),
        ])
    });

    let title = match app.status_filter {
        Some(status) => format!(
            " {} - {} ({}/{}) ",
            app.source,
            status.label(),
            app.filtered_rows.len(),
            app.rows.len()
        ),
        None => format!(" {} ({}) ", app.source, app.rows.len()),
    };

    let table = Table::new(
        rows,
        [
            Constraint::Length(14),
            Constraint::Min(20),
            Constraint::Length(12),
            Constraint::Length(8),
            Constraint::Length(12),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White))
            .title(title),
    )
    .highlight_style(Style::default().bg(Color::Blue).add_modifier(Modifier::BOLD))
    .highlight_symbol("▶ ");

    f.render_stateful_widget(table, area, &mut app.state);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();

    if let Some(status) = app.status_filter {
        spans.push(Span::styled(
            format!("Filter: {} ", status.label()),
            Style::default().fg(status_color(status)),
        ));
        spans.push(Span::styled("c", Style::default().fg(Color::Yellow)));
        spans.push(Span::raw(" clear │ "));
    }

    spans.push(Span::styled("1-5", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" filter │ "));
    spans.push(Span::styled("Enter", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" detail │ "));
    spans.push(Span::styled("↑/↓", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" move │ "));
    spans.push(Span::styled("PgUp/PgDn", Style::default().fg(Color::Yellow)));
    spans.push(Span::raw(" page │ "));
    spans.push(Span::styled("q", Style::default().fg(Color::Red)));
    spans.push(Span::raw(" quit"));

    let bar = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );
    f.render_widget(bar, area);
}

fn render_detail_panel(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Dettaglio DPI ");

    let Some(row) = app.selected_row() else {
        f.render_widget(Paragraph::new("Nessuna riga selezionata").block(block), area);
        return;
    };

    let label_style = Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD);
    let status = row.classification.status;

    let mut content = vec![
        Line::from(""),
        Line::from(vec![
            Span::styled("  Stato: ", label_style),
            Span::styled(
                status.label(),
                Style::default().fg(status_color(status)).add_modifier(Modifier::BOLD),
            ),
        ]),
        Line::from(vec![
            Span::styled("  Giorni rimanenti: ", label_style),
            Span::raw(
                row.classification
                    .days_remaining
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]),
        Line::from(""),
        Line::from("  ─────────────────────────────────────"),
        Line::from(""),
    ];

    for (name, value) in &row.fields {
        content.push(Line::from(vec![
            Span::styled(format!("  {}: ", name), label_style),
            Span::raw(value.as_str()),
        ]));
    }

    content.push(Line::from(""));
    content.push(Line::from(Span::styled(
        "  Press Enter to close",
        Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
    )));

    f.render_widget(Paragraph::new(content).block(block), area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
