use std::{
    io::{self, Stdout},
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use crossterm::{
    event::{
        self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{debug, info, warn};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{
        Block, Borders, Cell, Clear, List, ListItem, ListState, Paragraph, Row, Table, TableState,
        Wrap,
    },
    Frame, Terminal,
};

use crate::{
    api::{AddOptions, Gateway, GatewayResult, QbitClient},
    columns::{DECLARATIONS, SEPARATOR_WIDTH},
    config::AppConfig,
    filter::{tracker_domain, FilterCriteria},
    model::{
        format_bytes, format_eta, format_progress, format_ratio, format_speed, format_timestamp,
        state_label, CanonicalState, RecordDetail,
    },
    sync::{self, SyncError, SyncUpdate},
    table::TorrentTable,
};

type Backend = ratatui::backend::CrosstermBackend<Stdout>;

/// Highlight symbol plus table borders.
const TABLE_CHROME_WIDTH: u16 = 4;

const STATE_GROUPS: &[(&str, &[&str])] = &[
    (
        "Downloading",
        &["downloading", "forcedDL", "metaDL", "forcedMetaDL", "stalledDL", "queuedDL"],
    ),
    (
        "Seeding",
        &["uploading", "forcedUP", "stalledUP", "queuedUP"],
    ),
    (
        "Paused",
        &["pausedDL", "pausedUP", "stoppedDL", "stoppedUP"],
    ),
    ("Checking", &["checkingDL", "checkingUP", "checkingResumeData"]),
    ("Errored", &["error", "missingFiles"]),
];

pub fn run(config: AppConfig) -> Result<()> {
    let client = QbitClient::new(config.api.clone())
        .context("failed to construct qBittorrent API client")?;
    let mut terminal = setup_terminal()?;
    let (event_tx, event_rx) = unbounded();
    let (gateway_tx, gateway_rx) = unbounded();

    let input_handle = spawn_input_thread(event_tx.clone());
    let worker_handle = spawn_gateway_worker(client, gateway_rx, event_tx.clone());

    let mut app = App::new(&config);
    app.set_status(StatusUpdate::info("Connecting to qBittorrent…"));
    app.request_sync(&gateway_tx);

    let loop_result = run_loop(&mut terminal, &mut app, event_rx, gateway_tx.clone());

    drop(gateway_tx);
    drop(event_tx);

    restore_terminal(&mut terminal)?;
    input_handle.join().ok();
    worker_handle.join().ok();

    loop_result
}

fn run_loop(
    terminal: &mut Terminal<Backend>,
    app: &mut App,
    events: Receiver<AppEvent>,
    gateway_tx: Sender<GatewayCommand>,
) -> Result<()> {
    terminal.draw(|f| app.render(f))?;
    loop {
        let event = match events.recv() {
            Ok(event) => event,
            Err(_) => break,
        };
        if app.process_event(event, &gateway_tx)? {
            break;
        }
        terminal.draw(|f| app.render(f))?;
        if app.should_quit {
            break;
        }
    }
    Ok(())
}

fn setup_terminal() -> Result<Terminal<Backend>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)?;
    let backend = ratatui::backend::CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Terminal<Backend>) -> Result<()> {
    disable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, DisableBracketedPaste, LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

fn spawn_input_thread(tx: Sender<AppEvent>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let tick_rate = Duration::from_millis(250);
        loop {
            match event::poll(tick_rate) {
                Ok(true) => match event::read() {
                    Ok(evt) => {
                        if tx.send(AppEvent::Input(evt)).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(AppEvent::Status(StatusUpdate::error(format!(
                            "Input error: {err}"
                        ))));
                    }
                },
                Ok(false) | Err(_) => {
                    if tx.send(AppEvent::Tick).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn spawn_gateway_worker<G>(
    gateway: G,
    rx: Receiver<GatewayCommand>,
    tx: Sender<AppEvent>,
) -> thread::JoinHandle<()>
where
    G: Gateway + Send + 'static,
{
    thread::spawn(move || {
        while let Ok(cmd) = rx.recv() {
            handle_command(&gateway, cmd, &tx);
        }
    })
}

fn handle_command<G: Gateway>(gateway: &G, cmd: GatewayCommand, tx: &Sender<AppEvent>) {
    match cmd {
        GatewayCommand::Sync { cursor } => {
            let result = if cursor == 0 {
                gateway.fetch_snapshot().map(SyncUpdate::Full)
            } else {
                gateway.fetch_delta(cursor)
            };
            let _ = tx.send(AppEvent::Synced(result));
        }
        GatewayCommand::Detail { hash, generation } => {
            let result = gateway.fetch_record_detail(&hash);
            let _ = tx.send(AppEvent::Detail { generation, result });
        }
        GatewayCommand::Pause { hashes, name } => {
            report_action(gateway.pause(&hashes), format!("Paused {name}"), "Pause", tx)
        }
        GatewayCommand::Resume { hashes, name } => {
            report_action(gateway.resume(&hashes), format!("Resumed {name}"), "Resume", tx)
        }
        GatewayCommand::Remove {
            hashes,
            name,
            delete_files,
        } => report_action(
            gateway.remove(&hashes, delete_files),
            format!("Removed {name}"),
            "Remove",
            tx,
        ),
        GatewayCommand::Relocate {
            hashes,
            name,
            location,
        } => report_action(
            gateway.relocate(&hashes, &location),
            format!("Moving {name} to {location}"),
            "Move",
            tx,
        ),
        GatewayCommand::AddUrl { url, options } => {
            let trimmed = url.trim();
            if trimmed.is_empty() {
                let _ = tx.send(AppEvent::Status(StatusUpdate::info(
                    "Ignoring empty URL input",
                )));
                return;
            }
            report_action(
                gateway.add_urls(&[trimmed.to_string()], &options),
                "Torrent queued".to_string(),
                "Add",
                tx,
            );
        }
        GatewayCommand::AddFile { path, options } => {
            let label = path.display().to_string();
            report_action(
                gateway.add_file(&path, &options),
                format!("Added {label}"),
                "Add",
                tx,
            );
        }
    }
}

fn report_action(result: GatewayResult<()>, success: String, action: &str, tx: &Sender<AppEvent>) {
    match result {
        Ok(()) => {
            info!("{success}");
            let _ = tx.send(AppEvent::Status(StatusUpdate::success(success)));
            let _ = tx.send(AppEvent::RefreshRequested);
        }
        Err(err) => {
            warn!("{action} failed: {err}");
            let _ = tx.send(AppEvent::Status(StatusUpdate::error(format!(
                "{action} failed: {err}"
            ))));
        }
    }
}

enum AppEvent {
    Input(Event),
    Tick,
    Synced(GatewayResult<SyncUpdate>),
    Detail {
        generation: u64,
        result: GatewayResult<RecordDetail>,
    },
    Status(StatusUpdate),
    RefreshRequested,
}

enum GatewayCommand {
    Sync {
        cursor: u64,
    },
    Detail {
        hash: String,
        generation: u64,
    },
    Pause {
        hashes: Vec<String>,
        name: String,
    },
    Resume {
        hashes: Vec<String>,
        name: String,
    },
    Remove {
        hashes: Vec<String>,
        name: String,
        delete_files: bool,
    },
    Relocate {
        hashes: Vec<String>,
        name: String,
        location: String,
    },
    AddUrl {
        url: String,
        options: AddOptions,
    },
    AddFile {
        path: PathBuf,
        options: AddOptions,
    },
}

#[derive(Clone)]
struct StatusUpdate {
    text: String,
    level: StatusLevel,
}

impl StatusUpdate {
    fn info(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Info,
        }
    }

    fn success(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Success,
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Warning,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            text: message.into(),
            level: StatusLevel::Error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StatusLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Clone)]
struct StatusMessage {
    text: String,
    level: StatusLevel,
    expires_at: Option<Instant>,
}

impl StatusMessage {
    fn from_update(update: StatusUpdate) -> Self {
        let duration = match update.level {
            StatusLevel::Info => Duration::from_secs(4),
            StatusLevel::Success => Duration::from_secs(5),
            StatusLevel::Warning => Duration::from_secs(6),
            StatusLevel::Error => Duration::from_secs(8),
        };
        Self {
            text: update.text,
            level: update.level,
            expires_at: Some(Instant::now() + duration),
        }
    }
}

/// Bookkeeping for the main-data stream: at most one request in flight and
/// at most one queued behind it.
#[derive(Debug, Default)]
struct SyncStream {
    in_flight: bool,
    queued: bool,
    needs_full: bool,
    /// A manual refresh waiting for the next dispatch.
    manual_requested: bool,
    /// The outstanding request was dispatched for a manual refresh.
    manual_in_flight: bool,
    last_completed: Option<Instant>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetailTab {
    General,
    Trackers,
    Peers,
    Files,
}

impl DetailTab {
    const ALL: [DetailTab; 4] = [
        DetailTab::General,
        DetailTab::Trackers,
        DetailTab::Peers,
        DetailTab::Files,
    ];

    fn title(self) -> &'static str {
        match self {
            DetailTab::General => "General",
            DetailTab::Trackers => "Trackers",
            DetailTab::Peers => "Peers",
            DetailTab::Files => "Files",
        }
    }

    fn next(self) -> Self {
        let index = Self::ALL.iter().position(|tab| *tab == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }
}

struct DetailPane {
    hash: String,
    tab: DetailTab,
    data: Option<RecordDetail>,
    in_flight: bool,
    last_completed: Option<Instant>,
}

struct App {
    connection_label: String,
    state: CanonicalState,
    table: TorrentTable,
    poll_interval: Duration,
    sync: SyncStream,
    detail: Option<DetailPane>,
    detail_generation: u64,
    state_group: Option<usize>,
    status: Option<StatusMessage>,
    toast: Option<StatusMessage>,
    mode: InputMode,
    should_quit: bool,
    add_paused: bool,
    delete_armed: bool,
    delete_armed_until: Option<Instant>,
}

impl App {
    fn new(config: &AppConfig) -> Self {
        Self {
            connection_label: config.api.base_url(),
            state: CanonicalState::default(),
            table: TorrentTable::new(config.table.columns.clone(), config.table.sort),
            poll_interval: config.poll_interval,
            sync: SyncStream::default(),
            detail: None,
            detail_generation: 0,
            state_group: None,
            status: None,
            toast: None,
            mode: InputMode::Normal,
            should_quit: false,
            add_paused: config.add_paused,
            delete_armed: false,
            delete_armed_until: None,
        }
    }

    fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(5),
                Constraint::Min(0),
                Constraint::Length(1),
            ])
            .split(frame.size());
        self.render_header(frame, chunks[0]);
        self.render_body(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);
        self.render_toast(frame);
        match &self.mode {
            InputMode::Prompt(prompt) => {
                let area = centered_rect(60, 30, frame.size());
                let block = Block::default()
                    .title(Span::raw(format!(" {} ", prompt.title)))
                    .borders(Borders::ALL);
                let text = vec![
                    Line::from(prompt.hint),
                    Line::from(format!("> {}", prompt.buffer)),
                ];
                let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: true });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Confirm(confirm) => {
                let area = centered_rect(50, 30, frame.size());
                let block = Block::default().title(confirm.title).borders(Borders::ALL);
                let text = vec![
                    Line::from(confirm.message.clone()),
                    Line::from(Span::styled(
                        "Press y to confirm, n or Esc to cancel",
                        Style::default().fg(Color::Yellow),
                    )),
                ];
                let paragraph = Paragraph::new(text).block(block).wrap(Wrap { trim: true });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Help => {
                let area = centered_rect(70, 80, frame.size());
                let block = Block::default().title("Key Bindings").borders(Borders::ALL);
                let paragraph = Paragraph::new(help_lines())
                    .block(block)
                    .wrap(Wrap { trim: false });
                frame.render_widget(Clear, area);
                frame.render_widget(paragraph, area);
            }
            InputMode::Columns { cursor } => {
                let area = centered_rect(40, 80, frame.size());
                let visible = self.table.visible();
                let items: Vec<ListItem> = DECLARATIONS
                    .iter()
                    .map(|decl| {
                        let mark = if visible.contains(&decl.key) { "[x]" } else { "[ ]" };
                        ListItem::new(Line::from(format!("{mark} {}", decl.title)))
                    })
                    .collect();
                let list = List::new(items)
                    .block(
                        Block::default()
                            .title(" Columns (1-9 or space toggles, Esc closes) ")
                            .borders(Borders::ALL),
                    )
                    .highlight_style(Style::default().fg(Color::Yellow))
                    .highlight_symbol("> ");
                let mut state = ListState::default().with_selected(Some(*cursor));
                frame.render_widget(Clear, area);
                frame.render_stateful_widget(list, area, &mut state);
            }
            InputMode::Normal | InputMode::Filter { .. } => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let mut lines = Vec::new();
        lines.push(Line::from(vec![
            Span::styled("qBittorrent", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("  |  "),
            Span::raw(&self.connection_label),
        ]));
        let server = &self.state.server;
        if self.sync.last_completed.is_some() {
            lines.push(Line::from(format!(
                "DL {}  UL {}  | Free {}  | Torrents {}/{}  | {}",
                format_speed(server.dl_info_speed),
                format_speed(server.up_info_speed),
                format_bytes(server.free_space_on_disk),
                self.table.rows().len(),
                self.table.total_records(),
                if server.connection_status.is_empty() {
                    "unknown"
                } else {
                    server.connection_status.as_str()
                },
            )));
        } else {
            lines.push(Line::from("Waiting for server state…"));
        }
        if let Some(err) = &self.sync.last_error {
            lines.push(Line::from(Span::styled(
                format!("Last refresh failed: {err}"),
                Style::default().fg(Color::Red),
            )));
        }
        if let Some(status) = &self.status {
            lines.push(Line::from(Span::styled(
                status.text.clone(),
                status_style(status.level),
            )));
        }
        let paragraph = Paragraph::new(lines).block(
            Block::default()
                .borders(Borders::ALL)
                .title(Span::raw(" Session ")),
        );
        frame.render_widget(paragraph, area);
    }

    fn render_body(&mut self, frame: &mut Frame, area: Rect) {
        if self.detail.is_none() {
            self.render_table(frame, area);
            return;
        }
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
            .split(area);
        self.render_table(frame, chunks[0]);
        self.render_detail(frame, chunks[1]);
    }

    fn render_table(&mut self, frame: &mut Frame, area: Rect) {
        self.table
            .set_page_size(usize::from(area.height.saturating_sub(3)));
        let view = self
            .table
            .view(area.width.saturating_sub(TABLE_CHROME_WIDTH));
        let block = Block::default()
            .borders(Borders::ALL)
            .title(Span::raw(" Torrents "));
        if view.rows.is_empty() {
            let message = if self.table.total_records() == 0 {
                "No torrents loaded"
            } else {
                "No torrents match the current filter"
            };
            frame.render_widget(Paragraph::new(message).block(block), area);
            return;
        }
        let header = Row::new(view.header.into_iter().map(Cell::from))
            .style(Style::default().add_modifier(Modifier::BOLD));
        let rows = view
            .rows
            .into_iter()
            .map(|cells| Row::new(cells.into_iter().map(Cell::from)));
        let widths: Vec<Constraint> = view
            .columns
            .iter()
            .map(|column| Constraint::Length(column.width))
            .collect();
        let table = Table::new(rows, widths)
            .header(header)
            .block(block)
            .column_spacing(SEPARATOR_WIDTH)
            .highlight_style(Style::default().fg(Color::Yellow))
            .highlight_symbol("> ");
        let mut state = TableState::default().with_selected(view.selected);
        frame.render_stateful_widget(table, area, &mut state);
    }

    fn render_detail(&self, frame: &mut Frame, area: Rect) {
        let Some(detail) = &self.detail else {
            return;
        };
        let tabs: Vec<Span> = DetailTab::ALL
            .iter()
            .flat_map(|tab| {
                let style = if *tab == detail.tab {
                    Style::default()
                        .fg(Color::Yellow)
                        .add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                [Span::styled(tab.title(), style), Span::raw("  ")]
            })
            .collect();
        let mut lines = vec![Line::from(tabs), Line::from("")];
        match &detail.data {
            None => lines.push(Line::from("Loading…")),
            Some(data) => lines.extend(detail_lines(detail.tab, data, &self.state, &detail.hash)),
        }
        let paragraph = Paragraph::new(lines)
            .block(
                Block::default()
                    .borders(Borders::ALL)
                    .title(Span::raw(" Details ")),
            )
            .wrap(Wrap { trim: false });
        frame.render_widget(paragraph, area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let mode_label = match &self.mode {
            InputMode::Normal => "NORMAL",
            InputMode::Filter { .. } => "FILTER",
            InputMode::Prompt(_) => "PROMPT",
            InputMode::Confirm(_) => "CONFIRM",
            InputMode::Help => "HELP",
            InputMode::Columns { .. } => "COLUMNS",
        };
        let filter_display = match &self.mode {
            InputMode::Filter { buffer } => format!("/{}", buffer),
            _ => self.describe_filter(),
        };
        let sort = self.table.sort_config();
        let summary = Line::from(format!(
            "Mode {mode_label} | Filter {filter_display} | Sort {} {}",
            sort.primary,
            sort.direction.indicator()
        ));
        let sections = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Min(0), Constraint::Length(14)])
            .split(area);
        let left = Paragraph::new(summary).wrap(Wrap { trim: true });
        frame.render_widget(left, sections[0]);
        let help_label =
            Paragraph::new(Line::from(Span::raw("Help [?]"))).alignment(Alignment::Right);
        frame.render_widget(help_label, sections[1]);
    }

    fn render_toast(&self, frame: &mut Frame) {
        if !matches!(self.mode, InputMode::Normal | InputMode::Filter { .. }) {
            return;
        }
        let Some(toast) = &self.toast else {
            return;
        };
        let frame_area = frame.size();
        if frame_area.width < 20 || frame_area.height < 5 {
            return;
        }
        let padding = 2;
        let max_width = frame_area.width.saturating_sub(padding * 2);
        let width = max_width.clamp(20, 60);
        let height = 3;
        let x = frame_area
            .x
            .saturating_add(frame_area.width.saturating_sub(width + padding));
        let y = frame_area
            .y
            .saturating_add(frame_area.height.saturating_sub(height + padding));
        let area = Rect::new(x, y, width, height);
        let text = Line::from(Span::styled(toast.text.clone(), status_style(toast.level)));
        let paragraph = Paragraph::new(text).alignment(Alignment::Center).block(
            Block::default()
                .borders(Borders::ALL)
                .title(Span::raw(" Notice ")),
        );
        frame.render_widget(Clear, area);
        frame.render_widget(paragraph, area);
    }

    fn describe_filter(&self) -> String {
        let criteria = self.table.criteria();
        if criteria.is_empty() {
            return "(none)".to_string();
        }
        let mut parts = Vec::new();
        if !criteria.search_text.is_empty() {
            parts.push(format!("/{}", criteria.search_text));
        }
        if let Some((label, _)) = self.state_group.and_then(|i| STATE_GROUPS.get(i)) {
            parts.push(format!("state:{label}"));
        }
        if !criteria.category.is_empty() {
            parts.push(format!("cat:{}", criteria.category));
        }
        if let Some(tag) = criteria.tags.first() {
            parts.push(format!("tag:{tag}"));
        }
        if let Some(domain) = criteria.tracker_domains.first() {
            parts.push(format!("tracker:{domain}"));
        }
        parts.join(" ")
    }

    fn process_event(
        &mut self,
        event: AppEvent,
        gateway_tx: &Sender<GatewayCommand>,
    ) -> Result<bool> {
        match event {
            AppEvent::Input(event) => self.handle_input(event, gateway_tx),
            AppEvent::Tick => {
                self.expire_status();
                self.on_refresh_tick(gateway_tx);
                Ok(false)
            }
            AppEvent::Synced(result) => {
                self.on_synced(result, gateway_tx);
                Ok(false)
            }
            AppEvent::Detail { generation, result } => {
                self.on_detail(generation, result);
                Ok(false)
            }
            AppEvent::Status(update) => {
                self.set_status(update);
                Ok(false)
            }
            AppEvent::RefreshRequested => {
                self.request_sync(gateway_tx);
                Ok(false)
            }
        }
    }

    fn on_refresh_tick(&mut self, gateway_tx: &Sender<GatewayCommand>) {
        if self.poll_interval.is_zero() {
            return;
        }
        let interval = self.poll_interval;
        let due = |last: Option<Instant>| last.map_or(true, |at| at.elapsed() >= interval);
        if !self.sync.in_flight && due(self.sync.last_completed) {
            self.request_sync(gateway_tx);
        }
        let detail_due = self
            .detail
            .as_ref()
            .is_some_and(|detail| !detail.in_flight && due(detail.last_completed));
        if detail_due {
            self.request_detail(gateway_tx);
        }
    }

    /// Dispatches a sync unless one is outstanding, in which case it is
    /// queued behind it.
    fn request_sync(&mut self, gateway_tx: &Sender<GatewayCommand>) {
        if self.sync.in_flight {
            self.sync.queued = true;
            return;
        }
        let cursor = if self.sync.needs_full {
            0
        } else {
            self.state.cursor
        };
        debug!("requesting sync from cursor {cursor}");
        if gateway_tx.send(GatewayCommand::Sync { cursor }).is_err() {
            self.set_status(StatusUpdate::error("Gateway worker not available"));
            return;
        }
        self.sync.in_flight = true;
        self.sync.queued = false;
        self.sync.manual_in_flight = std::mem::take(&mut self.sync.manual_requested);
    }

    fn on_synced(
        &mut self,
        result: GatewayResult<SyncUpdate>,
        gateway_tx: &Sender<GatewayCommand>,
    ) {
        self.sync.in_flight = false;
        self.sync.last_completed = Some(Instant::now());
        let manual = std::mem::take(&mut self.sync.manual_in_flight);
        match result {
            Ok(update) => match sync::merge(&self.state, update) {
                Ok(outcome) => {
                    for anomaly in &outcome.anomalies {
                        warn!("skipped delta entry: {anomaly}");
                    }
                    self.state = outcome.state;
                    self.sync.needs_full = false;
                    self.sync.last_error = None;
                    self.refresh_table();
                    if manual {
                        let count = self.state.records.len();
                        self.set_status(StatusUpdate::success(format!(
                            "Refreshed {count} torrents"
                        )));
                    }
                }
                Err(err @ SyncError::StaleCursor { .. }) => {
                    debug!("{err}; requesting full snapshot");
                    self.sync.needs_full = true;
                    self.sync.queued = true;
                    self.sync.manual_requested |= manual;
                }
            },
            Err(err) if err.is_auth() => {
                warn!("sync failed: {err}");
                self.sync.last_error = Some(err.to_string());
                self.set_status(StatusUpdate::error(
                    "Authentication failed; check username and password",
                ));
            }
            Err(err) => {
                warn!("sync failed: {err}");
                self.sync.last_error = Some(err.to_string());
                self.set_status(StatusUpdate::error(format!("Refresh failed: {err}")));
            }
        }
        if self.sync.queued {
            self.request_sync(gateway_tx);
        }
    }

    fn refresh_table(&mut self) {
        self.table.set_records(self.state.records.values().cloned());
        self.follow_selection_with_detail();
    }

    fn on_detail(&mut self, generation: u64, result: GatewayResult<RecordDetail>) {
        if generation != self.detail_generation {
            debug!("discarding detail response from generation {generation}");
            return;
        }
        let Some(detail) = self.detail.as_mut() else {
            return;
        };
        detail.in_flight = false;
        detail.last_completed = Some(Instant::now());
        match result {
            Ok(data) => detail.data = Some(data),
            Err(err) => {
                warn!("detail fetch failed: {err}");
                self.set_status(StatusUpdate::error(format!("Detail refresh failed: {err}")));
            }
        }
    }

    fn open_detail(&mut self, hash: String) {
        self.detail_generation += 1;
        let tab = self
            .detail
            .as_ref()
            .map_or(DetailTab::General, |detail| detail.tab);
        self.detail = Some(DetailPane {
            hash,
            tab,
            data: None,
            in_flight: false,
            last_completed: None,
        });
    }

    /// Closing bumps the generation so late responses are dropped.
    fn close_detail(&mut self) {
        self.detail_generation += 1;
        self.detail = None;
    }

    fn request_detail(&mut self, gateway_tx: &Sender<GatewayCommand>) {
        let generation = self.detail_generation;
        let Some(detail) = self.detail.as_mut() else {
            return;
        };
        if detail.in_flight {
            return;
        }
        let cmd = GatewayCommand::Detail {
            hash: detail.hash.clone(),
            generation,
        };
        if gateway_tx.send(cmd).is_ok() {
            detail.in_flight = true;
        }
    }

    /// Keeps the detail pane on the selected torrent.
    fn follow_selection_with_detail(&mut self) {
        let Some(detail) = &self.detail else {
            return;
        };
        match self.table.selected_record().map(|r| r.hash.clone()) {
            Some(hash) if hash == detail.hash => {}
            Some(hash) => self.open_detail(hash),
            None => self.close_detail(),
        }
    }

    fn handle_input(&mut self, event: Event, gateway_tx: &Sender<GatewayCommand>) -> Result<bool> {
        match event {
            Event::Key(key) if key.kind == KeyEventKind::Press => {
                if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
                    self.should_quit = true;
                    return Ok(true);
                }
                if matches!(self.mode, InputMode::Normal) {
                    let quit = self.handle_normal_key(key, gateway_tx)?;
                    self.follow_selection_with_detail();
                    if self.detail.as_ref().is_some_and(|d| d.last_completed.is_none()) {
                        self.request_detail(gateway_tx);
                    }
                    return Ok(quit);
                }
                match &mut self.mode {
                    InputMode::Normal => Ok(false),
                    InputMode::Filter { buffer } => {
                        let mut action = FilterAction::None;
                        match key.code {
                            KeyCode::Enter => action = FilterAction::Apply(buffer.trim().to_string()),
                            KeyCode::Esc => action = FilterAction::Cancel,
                            KeyCode::Backspace => {
                                buffer.pop();
                            }
                            KeyCode::Char(c) => buffer.push(c),
                            _ => {}
                        }
                        match action {
                            FilterAction::Apply(value) => {
                                self.mode = InputMode::Normal;
                                self.update_criteria(|criteria| criteria.search_text = value);
                            }
                            FilterAction::Cancel => self.mode = InputMode::Normal,
                            FilterAction::None => {}
                        }
                        Ok(false)
                    }
                    InputMode::Prompt(prompt) => {
                        let mut action = PromptAction::None;
                        match key.code {
                            KeyCode::Enter => {
                                let value = prompt.buffer.trim().to_string();
                                action = if value.is_empty() {
                                    PromptAction::Cancel
                                } else {
                                    PromptAction::Submit(value)
                                };
                            }
                            KeyCode::Esc => action = PromptAction::Cancel,
                            KeyCode::Backspace => {
                                prompt.buffer.pop();
                            }
                            KeyCode::Char(c) => prompt.buffer.push(c),
                            _ => {}
                        }
                        match action {
                            PromptAction::Submit(value) => {
                                let InputMode::Prompt(prompt) =
                                    std::mem::replace(&mut self.mode, InputMode::Normal)
                                else {
                                    return Ok(false);
                                };
                                self.submit_prompt(prompt.kind, value, gateway_tx);
                            }
                            PromptAction::Cancel => self.mode = InputMode::Normal,
                            PromptAction::None => {}
                        }
                        Ok(false)
                    }
                    InputMode::Confirm(confirm) => {
                        match key.code {
                            KeyCode::Char('y') | KeyCode::Enter => {
                                let cmd = GatewayCommand::Remove {
                                    hashes: confirm.hashes.clone(),
                                    name: confirm.target_name.clone(),
                                    delete_files: confirm.delete_files,
                                };
                                let info = format!("Removing {}…", confirm.target_name);
                                self.mode = InputMode::Normal;
                                self.set_status(StatusUpdate::info(info));
                                if gateway_tx.send(cmd).is_err() {
                                    self.set_status(StatusUpdate::error(
                                        "Failed to queue deletion",
                                    ));
                                }
                            }
                            KeyCode::Char('n') | KeyCode::Esc => {
                                self.mode = InputMode::Normal;
                                self.set_status(StatusUpdate::info("Deletion cancelled"));
                            }
                            _ => {}
                        }
                        Ok(false)
                    }
                    InputMode::Help => {
                        if matches!(
                            key.code,
                            KeyCode::Char('?') | KeyCode::Esc | KeyCode::Enter | KeyCode::Char('q')
                        ) {
                            self.mode = InputMode::Normal;
                        }
                        Ok(false)
                    }
                    InputMode::Columns { cursor } => {
                        let last = DECLARATIONS.len() - 1;
                        let digit = match key.code {
                            KeyCode::Char(c) => c.to_digit(10).filter(|n| *n > 0),
                            _ => None,
                        };
                        if let Some(n) = digit {
                            *cursor = (n as usize - 1).min(last);
                        }
                        match key.code {
                            KeyCode::Char(c) if c.is_ascii_digit() => {
                                let toggled = digit.is_some()
                                    && !self.table.toggle_column(DECLARATIONS[*cursor].key);
                                if toggled {
                                    self.set_status(StatusUpdate::warning(
                                        "The name column cannot be hidden",
                                    ));
                                }
                            }
                            KeyCode::Down | KeyCode::Char('j') => *cursor = (*cursor + 1).min(last),
                            KeyCode::Up | KeyCode::Char('k') => *cursor = cursor.saturating_sub(1),
                            KeyCode::Char(' ') | KeyCode::Enter => {
                                let key = DECLARATIONS[*cursor].key;
                                if !self.table.toggle_column(key) {
                                    self.set_status(StatusUpdate::warning(
                                        "The name column cannot be hidden",
                                    ));
                                }
                            }
                            KeyCode::Esc | KeyCode::Char('C') | KeyCode::Char('q') => {
                                self.mode = InputMode::Normal;
                            }
                            _ => {}
                        }
                        Ok(false)
                    }
                }
            }
            Event::Paste(data) => {
                match &mut self.mode {
                    InputMode::Filter { buffer } => buffer.push_str(&data),
                    InputMode::Prompt(prompt) => prompt.buffer.push_str(&data),
                    _ => {
                        let mut prompt = PromptState::add_url();
                        prompt.buffer.push_str(&data);
                        self.mode = InputMode::Prompt(prompt);
                    }
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    fn handle_normal_key(
        &mut self,
        key: KeyEvent,
        gateway_tx: &Sender<GatewayCommand>,
    ) -> Result<bool> {
        let plain_d = matches!(key.code, KeyCode::Char('d')) && key.modifiers.is_empty();
        if !plain_d {
            self.disarm_delete();
        }
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                return Ok(true);
            }
            KeyCode::Char('R') => self.queue_refresh(gateway_tx),
            KeyCode::Char('r') => self.send_for_selected(gateway_tx, "resume", |hashes, name| {
                GatewayCommand::Resume { hashes, name }
            }),
            KeyCode::Char('p') => self.send_for_selected(gateway_tx, "pause", |hashes, name| {
                GatewayCommand::Pause { hashes, name }
            }),
            KeyCode::Char('a') => self.mode = InputMode::Prompt(PromptState::add_url()),
            KeyCode::Char('A') => self.mode = InputMode::Prompt(PromptState::add_file()),
            KeyCode::Char('m') => self.prompt_relocate(),
            KeyCode::Char('/') => {
                self.mode = InputMode::Filter {
                    buffer: self.table.criteria().search_text.clone(),
                };
            }
            KeyCode::Char('s') => self.cycle_state_filter(),
            KeyCode::Char('c') => self.cycle_category_filter(),
            KeyCode::Char('t') => self.cycle_tag_filter(),
            KeyCode::Char('T') => self.cycle_tracker_filter(),
            KeyCode::Char('C') => self.mode = InputMode::Columns { cursor: 0 },
            KeyCode::Char('?') => self.mode = InputMode::Help,
            KeyCode::Char('d') if plain_d => {
                if self.delete_armed {
                    self.disarm_delete();
                    self.prompt_delete_current(false);
                } else {
                    self.arm_delete();
                }
            }
            KeyCode::Char('D') => self.prompt_delete_current(true),
            KeyCode::Enter => self.toggle_detail(),
            KeyCode::Tab => {
                if let Some(detail) = self.detail.as_mut() {
                    detail.tab = detail.tab.next();
                }
            }
            KeyCode::Esc => {
                if self.detail.is_some() {
                    self.close_detail();
                } else {
                    self.clear_filters();
                }
            }
            _ => {
                self.table.on_key(key);
            }
        }
        Ok(false)
    }

    fn toggle_detail(&mut self) {
        if self.detail.is_some() {
            self.close_detail();
            return;
        }
        match self.table.selected_record().map(|r| r.hash.clone()) {
            Some(hash) => self.open_detail(hash),
            None => self.set_status(StatusUpdate::warning("No torrent selected")),
        }
    }

    fn update_criteria(&mut self, change: impl FnOnce(&mut FilterCriteria)) {
        let mut criteria = self.table.criteria().clone();
        change(&mut criteria);
        self.table.set_criteria(criteria);
        self.follow_selection_with_detail();
    }

    fn clear_filters(&mut self) {
        if self.table.criteria().is_empty() {
            return;
        }
        self.state_group = None;
        self.update_criteria(|criteria| *criteria = FilterCriteria::default());
    }

    fn cycle_state_filter(&mut self) {
        self.state_group = match self.state_group {
            None => Some(0),
            Some(i) if i + 1 < STATE_GROUPS.len() => Some(i + 1),
            Some(_) => None,
        };
        let states: Vec<String> = self
            .state_group
            .and_then(|i| STATE_GROUPS.get(i))
            .map(|(_, states)| states.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        self.update_criteria(|criteria| criteria.states = states);
    }

    fn cycle_category_filter(&mut self) {
        let options = self.state.sorted_categories();
        let current = self.table.criteria().category.clone();
        let next = cycle(Some(&current).filter(|c| !c.is_empty()), &options);
        self.update_criteria(|criteria| criteria.category = next.unwrap_or_default());
    }

    fn cycle_tag_filter(&mut self) {
        let options: Vec<String> = self.state.tags.iter().cloned().collect();
        let current = self.table.criteria().tags.first().cloned();
        let next = cycle(current.as_ref(), &options);
        self.update_criteria(|criteria| criteria.tags = next.into_iter().collect());
    }

    fn cycle_tracker_filter(&mut self) {
        let mut options: Vec<String> = self
            .state
            .records
            .values()
            .map(|record| tracker_domain(&record.tracker))
            .filter(|domain| !domain.is_empty())
            .collect();
        options.sort();
        options.dedup();
        let current = self.table.criteria().tracker_domains.first().cloned();
        let next = cycle(current.as_ref(), &options);
        self.update_criteria(|criteria| criteria.tracker_domains = next.into_iter().collect());
    }

    fn expire_status(&mut self) {
        let now = Instant::now();
        if self
            .status
            .as_ref()
            .and_then(|s| s.expires_at)
            .is_some_and(|expiry| now >= expiry)
        {
            self.status = None;
        }
        if self
            .toast
            .as_ref()
            .and_then(|t| t.expires_at)
            .is_some_and(|expiry| now >= expiry)
        {
            self.toast = None;
        }
        if self.delete_armed && self.delete_armed_until.is_some_and(|deadline| now >= deadline) {
            self.disarm_delete();
        }
    }

    fn set_status(&mut self, update: StatusUpdate) {
        let message = StatusMessage::from_update(update.clone());
        if matches!(update.level, StatusLevel::Warning | StatusLevel::Error) {
            self.toast = Some(message.clone());
        }
        self.status = Some(message);
    }

    fn disarm_delete(&mut self) {
        self.delete_armed = false;
        self.delete_armed_until = None;
    }

    fn queue_refresh(&mut self, gateway_tx: &Sender<GatewayCommand>) {
        self.sync.manual_requested = true;
        self.set_status(StatusUpdate::info("Refreshing…"));
        self.request_sync(gateway_tx);
    }

    fn arm_delete(&mut self) {
        self.delete_armed = true;
        self.delete_armed_until = Some(Instant::now() + Duration::from_secs(2));
        self.set_status(StatusUpdate::info(
            "Press d again to remove the selected torrent",
        ));
    }

    fn prompt_delete_current(&mut self, delete_files: bool) {
        if let Some(torrent) = self.table.selected_record() {
            self.mode = InputMode::Confirm(ConfirmState::remove_torrent(
                torrent.name.clone(),
                torrent.hash.clone(),
                delete_files,
            ));
        } else {
            self.set_status(StatusUpdate::error("No torrent selected to remove"));
        }
    }

    fn prompt_relocate(&mut self) {
        let Some(torrent) = self.table.selected_record() else {
            self.set_status(StatusUpdate::warning("No torrent selected; cannot move"));
            return;
        };
        let mut prompt = PromptState::new(
            "Move torrent",
            "Enter the new save path and press Enter (Esc to cancel)",
            PromptKind::Relocate {
                hashes: vec![torrent.hash.clone()],
                name: torrent.name.clone(),
            },
        );
        prompt.buffer = torrent.save_path.clone();
        self.mode = InputMode::Prompt(prompt);
    }

    fn submit_prompt(
        &mut self,
        kind: PromptKind,
        value: String,
        gateway_tx: &Sender<GatewayCommand>,
    ) {
        let (info, cmd) = match kind {
            PromptKind::AddUrl => (
                "Submitting torrent URL…".to_string(),
                GatewayCommand::AddUrl {
                    url: value,
                    options: self.add_options(),
                },
            ),
            PromptKind::AddFile => (
                "Uploading torrent file…".to_string(),
                GatewayCommand::AddFile {
                    path: PathBuf::from(value),
                    options: self.add_options(),
                },
            ),
            PromptKind::Relocate { hashes, name } => (
                format!("Moving {name}…"),
                GatewayCommand::Relocate {
                    hashes,
                    name,
                    location: value,
                },
            ),
        };
        self.set_status(StatusUpdate::info(info));
        if gateway_tx.send(cmd).is_err() {
            self.set_status(StatusUpdate::error("Failed to queue request"));
        }
    }

    /// New torrents land in the filtered category, if any.
    fn add_options(&self) -> AddOptions {
        let category = &self.table.criteria().category;
        AddOptions {
            category: (!category.is_empty()).then(|| category.clone()),
            paused: self.add_paused,
        }
    }

    fn send_for_selected<F>(&mut self, gateway_tx: &Sender<GatewayCommand>, verb: &str, build: F)
    where
        F: FnOnce(Vec<String>, String) -> GatewayCommand,
    {
        let Some(torrent) = self.table.selected_record() else {
            self.set_status(StatusUpdate::warning(format!(
                "No torrent selected; cannot {verb}"
            )));
            return;
        };
        let name = torrent.name.clone();
        let cmd = build(vec![torrent.hash.clone()], name.clone());
        self.set_status(StatusUpdate::info(format!("Requesting {verb} for {name}…")));
        if gateway_tx.send(cmd).is_err() {
            self.set_status(StatusUpdate::error(format!("Failed to queue {verb}")));
        }
    }
}

/// Advances through `options`: none → first → … → last → none.
fn cycle<T: Clone + PartialEq>(current: Option<&T>, options: &[T]) -> Option<T> {
    let next = match current.and_then(|c| options.iter().position(|o| o == c)) {
        None if current.is_some() => return None,
        None => 0,
        Some(index) => index + 1,
    };
    options.get(next).cloned()
}

fn detail_lines(
    tab: DetailTab,
    data: &RecordDetail,
    state: &CanonicalState,
    hash: &str,
) -> Vec<Line<'static>> {
    match tab {
        DetailTab::General => {
            let props = &data.properties;
            let mut lines = Vec::new();
            if let Some(record) = state.records.get(hash) {
                lines.push(Line::from(Span::styled(
                    record.name.clone(),
                    Style::default().add_modifier(Modifier::BOLD),
                )));
                lines.push(Line::from(format!(
                    "Status: {}  Progress: {}  ETA {}",
                    state_label(&record.state),
                    format_progress(record.progress),
                    format_eta(record.eta)
                )));
                lines.push(Line::from(format!(
                    "Size: {} (remaining {})",
                    format_bytes(record.size),
                    format_bytes(record.amount_left)
                )));
            }
            lines.push(Line::from(format!("Save path: {}", props.save_path)));
            lines.push(Line::from(format!(
                "Added: {}  Completed: {}  Created: {}",
                format_timestamp(props.addition_date),
                format_timestamp(props.completion_date),
                format_timestamp(props.creation_date)
            )));
            lines.push(Line::from(format!(
                "Pieces: {} x {}  Wasted: {}  Ratio: {}",
                props.pieces_num,
                format_bytes(props.piece_size),
                format_bytes(props.total_wasted),
                format_ratio(props.share_ratio)
            )));
            if !props.comment.is_empty() {
                lines.push(Line::from(format!("Comment: {}", props.comment)));
            }
            lines
        }
        DetailTab::Trackers => data
            .trackers
            .iter()
            .map(|tracker| {
                Line::from(format!(
                    "[{}] {}  {}  peers {}  {}",
                    tracker.tier,
                    tracker.url,
                    tracker.status_label(),
                    tracker.num_peers,
                    tracker.msg
                ))
            })
            .collect(),
        DetailTab::Peers => data
            .peers
            .iter()
            .map(|peer| {
                Line::from(format!(
                    "{:<24} {:<20} {:>6}  DL {:>10}  UL {:>10}  {}",
                    peer.address,
                    peer.client,
                    format_progress(peer.progress),
                    format_speed(peer.dl_speed),
                    format_speed(peer.up_speed),
                    peer.country
                ))
            })
            .collect(),
        DetailTab::Files => data
            .files
            .iter()
            .map(|file| {
                Line::from(format!(
                    "{:>6}  {:>10}  p{}  {}",
                    format_progress(file.progress),
                    format_bytes(file.size),
                    file.priority,
                    file.name
                ))
            })
            .collect(),
    }
}

#[derive(Clone)]
enum PromptKind {
    AddUrl,
    AddFile,
    Relocate { hashes: Vec<String>, name: String },
}

#[derive(Clone)]
struct PromptState {
    title: &'static str,
    hint: &'static str,
    kind: PromptKind,
    buffer: String,
}

impl PromptState {
    fn new(title: &'static str, hint: &'static str, kind: PromptKind) -> Self {
        Self {
            title,
            hint,
            kind,
            buffer: String::new(),
        }
    }

    fn add_url() -> Self {
        Self::new(
            "Add torrent",
            "Enter a magnet or torrent URL and press Enter (Esc to cancel)",
            PromptKind::AddUrl,
        )
    }

    fn add_file() -> Self {
        Self::new(
            "Add torrent file",
            "Enter the path of a .torrent file and press Enter (Esc to cancel)",
            PromptKind::AddFile,
        )
    }
}

#[derive(Clone)]
struct ConfirmState {
    title: &'static str,
    message: String,
    hashes: Vec<String>,
    target_name: String,
    delete_files: bool,
}

impl ConfirmState {
    fn remove_torrent(name: String, hash: String, delete_files: bool) -> Self {
        let message = if delete_files {
            format!("Remove '{name}' and delete its files?")
        } else {
            format!("Remove '{name}' from qBittorrent?")
        };
        Self {
            title: "Remove torrent",
            message,
            hashes: vec![hash],
            target_name: name,
            delete_files,
        }
    }
}

enum InputMode {
    Normal,
    Filter { buffer: String },
    Prompt(PromptState),
    Confirm(ConfirmState),
    Help,
    Columns { cursor: usize },
}

enum FilterAction {
    None,
    Apply(String),
    Cancel,
}

enum PromptAction {
    None,
    Submit(String),
    Cancel,
}

fn status_style(level: StatusLevel) -> Style {
    match level {
        StatusLevel::Info => Style::default().fg(Color::Blue),
        StatusLevel::Success => Style::default().fg(Color::Green),
        StatusLevel::Warning => Style::default().fg(Color::Yellow),
        StatusLevel::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    }
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    let vertical = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1]);
    vertical[1]
}

fn help_lines() -> Vec<Line<'static>> {
    let heading = |text: &'static str| {
        Line::from(Span::styled(
            text,
            Style::default().add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        ))
    };
    vec![
        heading("Navigation"),
        Line::from("  j / k, arrows: move selection"),
        Line::from("  g / G: jump to first / last"),
        Line::from("  Ctrl+d / Ctrl+u: half-page down/up"),
        Line::from("  Enter: toggle details, Tab: next detail tab"),
        Line::from(""),
        heading("Sorting & columns"),
        Line::from("  1-9: sort by Nth column (again to flip)"),
        Line::from("  Alt+1-9: sort by Nth column, descending"),
        Line::from("  C: choose visible columns (1-9 toggles the Nth entry)"),
        Line::from(""),
        heading("Filters"),
        Line::from("  /: search names"),
        Line::from("  s / c / t / T: cycle state / category / tag / tracker"),
        Line::from("  Esc: close details, then clear filters"),
        Line::from(""),
        heading("Actions"),
        Line::from("  r: resume selected torrent"),
        Line::from("  p: pause selected torrent"),
        Line::from("  R: refresh now"),
        Line::from("  a / A: add by URL / by file"),
        Line::from("  m: move selected torrent"),
        Line::from("  dd: remove highlighted torrent, D: remove with files"),
        Line::from("  ?: toggle this help"),
        Line::from("  q or Ctrl+c: quit"),
    ]
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, path::Path};

    use log::LevelFilter;

    use super::*;
    use crate::{
        api::GatewayError,
        config::{ApiConfig, TableConfig},
        model::PartialRecord,
        sync::{Delta, FullSnapshot},
    };

    fn test_config() -> AppConfig {
        AppConfig {
            api: ApiConfig {
                scheme: "http".into(),
                host: "localhost".into(),
                port: 8080,
                username: None,
                password: None,
                timeout: Duration::from_secs(1),
                verify_ssl: true,
                user_agent: "test".into(),
                url: None,
            },
            poll_interval: Duration::from_secs(2),
            log_level: LevelFilter::Off,
            log_file: None,
            table: TableConfig::default(),
            add_paused: false,
            warnings: Vec::new(),
        }
    }

    fn snapshot(cursor: u64, names: &[(&str, &str)]) -> FullSnapshot {
        FullSnapshot {
            cursor,
            records: names
                .iter()
                .map(|(hash, name)| {
                    (
                        hash.to_string(),
                        PartialRecord {
                            name: Some(name.to_string()),
                            ..PartialRecord::default()
                        },
                    )
                })
                .collect(),
            ..FullSnapshot::default()
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        calls: RefCell<Vec<String>>,
        fail_auth: bool,
    }

    impl FakeGateway {
        fn record(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl Gateway for FakeGateway {
        fn fetch_snapshot(&self) -> GatewayResult<FullSnapshot> {
            self.record("snapshot".into());
            if self.fail_auth {
                return Err(GatewayError::Authentication);
            }
            Ok(snapshot(1, &[("a", "Alpha")]))
        }

        fn fetch_delta(&self, cursor: u64) -> GatewayResult<SyncUpdate> {
            self.record(format!("delta {cursor}"));
            Ok(SyncUpdate::Delta(Delta {
                cursor: cursor + 1,
                ..Delta::default()
            }))
        }

        fn fetch_record_detail(&self, hash: &str) -> GatewayResult<RecordDetail> {
            self.record(format!("detail {hash}"));
            Ok(RecordDetail {
                hash: hash.to_string(),
                ..RecordDetail::default()
            })
        }

        fn pause(&self, hashes: &[String]) -> GatewayResult<()> {
            self.record(format!("pause {}", hashes.join(",")));
            Ok(())
        }

        fn resume(&self, hashes: &[String]) -> GatewayResult<()> {
            self.record(format!("resume {}", hashes.join(",")));
            Ok(())
        }

        fn remove(&self, hashes: &[String], delete_files: bool) -> GatewayResult<()> {
            self.record(format!("remove {} {delete_files}", hashes.join(",")));
            Ok(())
        }

        fn relocate(&self, hashes: &[String], location: &str) -> GatewayResult<()> {
            self.record(format!("relocate {} {location}", hashes.join(",")));
            Ok(())
        }

        fn add_urls(&self, urls: &[String], options: &AddOptions) -> GatewayResult<()> {
            self.record(format!("add {} {options:?}", urls.join(",")));
            Err(GatewayError::Rejected("duplicate".into()))
        }

        fn add_file(&self, path: &Path, _options: &AddOptions) -> GatewayResult<()> {
            self.record(format!("add-file {}", path.display()));
            Ok(())
        }
    }

    fn sync_cursors(rx: &Receiver<GatewayCommand>) -> Vec<u64> {
        rx.try_iter()
            .filter_map(|cmd| match cmd {
                GatewayCommand::Sync { cursor } => Some(cursor),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn worker_uses_snapshot_for_cursor_zero_and_delta_otherwise() {
        let gateway = FakeGateway::default();
        let (tx, rx) = unbounded();
        handle_command(&gateway, GatewayCommand::Sync { cursor: 0 }, &tx);
        handle_command(&gateway, GatewayCommand::Sync { cursor: 4 }, &tx);
        assert_eq!(*gateway.calls.borrow(), vec!["snapshot", "delta 4"]);

        let events: Vec<AppEvent> = rx.try_iter().collect();
        assert!(matches!(
            events[0],
            AppEvent::Synced(Ok(SyncUpdate::Full(FullSnapshot { cursor: 1, .. })))
        ));
        assert!(matches!(
            events[1],
            AppEvent::Synced(Ok(SyncUpdate::Delta(Delta { cursor: 5, .. })))
        ));
    }

    #[test]
    fn successful_action_requests_refresh_and_failure_reports() {
        let gateway = FakeGateway::default();
        let (tx, rx) = unbounded();
        handle_command(
            &gateway,
            GatewayCommand::Pause {
                hashes: vec!["a".into()],
                name: "Alpha".into(),
            },
            &tx,
        );
        let add = |url: &str| GatewayCommand::AddUrl {
            url: url.to_string(),
            options: AddOptions::default(),
        };
        handle_command(&gateway, add("  magnet:?xt=1 "), &tx);
        handle_command(&gateway, add("   "), &tx);
        assert_eq!(
            *gateway.calls.borrow(),
            vec![
                "pause a".to_string(),
                format!("add magnet:?xt=1 {:?}", AddOptions::default()),
            ]
        );

        let events: Vec<AppEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], AppEvent::Status(s) if s.level == StatusLevel::Success));
        assert!(matches!(events[1], AppEvent::RefreshRequested));
        assert!(matches!(&events[2], AppEvent::Status(s) if s.level == StatusLevel::Error));
        assert!(matches!(&events[3], AppEvent::Status(s) if s.level == StatusLevel::Info));
    }

    #[test]
    fn second_sync_request_is_queued_behind_the_first() {
        let mut app = App::new(&test_config());
        let (tx, rx) = unbounded();
        app.request_sync(&tx);
        app.request_sync(&tx);
        assert_eq!(sync_cursors(&rx), vec![0]);
        assert!(app.sync.queued);

        app.on_synced(Ok(SyncUpdate::Full(snapshot(3, &[("a", "Alpha")]))), &tx);
        assert_eq!(sync_cursors(&rx), vec![3]);
        assert!(app.sync.in_flight);
        assert!(!app.sync.queued);
        assert_eq!(app.table.rows().len(), 1);
    }

    #[test]
    fn manual_refresh_reports_on_its_own_response() {
        let mut app = App::new(&test_config());
        let (tx, rx) = unbounded();
        app.request_sync(&tx);
        app.queue_refresh(&tx);
        assert_eq!(sync_cursors(&rx), vec![0]);

        app.on_synced(Ok(SyncUpdate::Full(snapshot(3, &[("a", "Alpha")]))), &tx);
        assert_eq!(sync_cursors(&rx), vec![3]);
        assert!(app
            .status
            .as_ref()
            .is_some_and(|s| s.level == StatusLevel::Info));

        app.on_synced(
            Ok(SyncUpdate::Delta(Delta {
                cursor: 4,
                ..Delta::default()
            })),
            &tx,
        );
        assert!(app
            .status
            .as_ref()
            .is_some_and(|s| s.text == "Refreshed 1 torrents"));
    }

    #[test]
    fn add_prompt_uses_filtered_category_and_paused_setting() {
        let mut config = test_config();
        config.add_paused = true;
        let mut app = App::new(&config);
        let (tx, rx) = unbounded();
        app.update_criteria(|criteria| criteria.category = "linux".into());
        app.submit_prompt(PromptKind::AddUrl, "magnet:?xt=1".into(), &tx);
        let sent = rx.try_iter().find_map(|cmd| match cmd {
            GatewayCommand::AddUrl { url, options } => Some((url, options)),
            _ => None,
        });
        assert_eq!(
            sent,
            Some((
                "magnet:?xt=1".to_string(),
                AddOptions {
                    category: Some("linux".into()),
                    paused: true,
                }
            ))
        );
    }

    #[test]
    fn stale_cursor_triggers_full_snapshot() {
        let mut app = App::new(&test_config());
        let (tx, rx) = unbounded();
        app.request_sync(&tx);
        app.on_synced(Ok(SyncUpdate::Full(snapshot(5, &[("a", "Alpha")]))), &tx);
        let _ = sync_cursors(&rx);

        app.request_sync(&tx);
        app.on_synced(
            Ok(SyncUpdate::Delta(Delta {
                cursor: 5,
                removed: vec!["a".into()],
                ..Delta::default()
            })),
            &tx,
        );
        assert_eq!(sync_cursors(&rx), vec![5, 0]);
        assert_eq!(app.state.records.len(), 1);
        assert!(app.sync.last_error.is_none());
    }

    #[test]
    fn failed_sync_keeps_last_good_state() {
        let mut app = App::new(&test_config());
        let (tx, _rx) = unbounded();
        app.request_sync(&tx);
        app.on_synced(Ok(SyncUpdate::Full(snapshot(1, &[("a", "Alpha")]))), &tx);
        app.request_sync(&tx);
        app.on_synced(Err(GatewayError::Authentication), &tx);
        assert_eq!(app.state.records.len(), 1);
        assert_eq!(app.sync.last_error.as_deref(), Some("authentication failed"));
        assert!(app
            .status
            .as_ref()
            .is_some_and(|s| s.text.contains("Authentication")));
    }

    #[test]
    fn detail_responses_from_closed_views_are_discarded() {
        let mut app = App::new(&test_config());
        let (tx, rx) = unbounded();
        app.request_sync(&tx);
        app.on_synced(
            Ok(SyncUpdate::Full(snapshot(1, &[("a", "Alpha"), ("b", "Beta")]))),
            &tx,
        );
        app.toggle_detail();
        app.request_detail(&tx);
        let stale_generation = app.detail_generation;
        let requested: Vec<String> = rx
            .try_iter()
            .filter_map(|cmd| match cmd {
                GatewayCommand::Detail { hash, .. } => Some(hash),
                _ => None,
            })
            .collect();
        assert_eq!(requested, vec!["a".to_string()]);

        app.close_detail();
        app.toggle_detail();
        app.on_detail(
            stale_generation,
            Ok(RecordDetail {
                hash: "a".into(),
                ..RecordDetail::default()
            }),
        );
        assert!(app.detail.as_ref().is_some_and(|d| d.data.is_none()));

        app.on_detail(app.detail_generation, Ok(RecordDetail::default()));
        assert!(app.detail.as_ref().is_some_and(|d| d.data.is_some()));
    }

    #[test]
    fn detail_follows_selection() {
        let mut app = App::new(&test_config());
        let (tx, _rx) = unbounded();
        app.request_sync(&tx);
        app.on_synced(
            Ok(SyncUpdate::Full(snapshot(1, &[("a", "Alpha"), ("b", "Beta")]))),
            &tx,
        );
        app.toggle_detail();
        let generation = app.detail_generation;
        let key = KeyEvent::new(KeyCode::Char('j'), KeyModifiers::NONE);
        app.handle_input(Event::Key(key), &tx).unwrap();
        assert_eq!(app.detail.as_ref().map(|d| d.hash.as_str()), Some("b"));
        assert!(app.detail_generation > generation);
    }

    #[test]
    fn column_picker_digits_toggle_declared_columns() {
        let mut app = App::new(&test_config());
        let (tx, _rx) = unbounded();
        let press = |app: &mut App, c: char| {
            let key = KeyEvent::new(KeyCode::Char(c), KeyModifiers::NONE);
            app.handle_input(Event::Key(key), &tx).unwrap();
        };
        press(&mut app, 'C');
        assert!(matches!(app.mode, InputMode::Columns { cursor: 0 }));

        let second = DECLARATIONS[1].key;
        let was_visible = app.table.visible().contains(&second);
        press(&mut app, '2');
        assert_eq!(app.table.visible().contains(&second), !was_visible);

        press(&mut app, '1');
        assert!(app.table.visible().contains(&DECLARATIONS[0].key));
        assert!(app.status.as_ref().is_some_and(|s| s.level == StatusLevel::Warning));

        press(&mut app, 'C');
        assert!(matches!(app.mode, InputMode::Normal));
    }

    #[test]
    fn filters_cycle_through_options() {
        let options = vec!["linux".to_string(), "movies".to_string()];
        assert_eq!(cycle(None, &options), Some("linux".to_string()));
        assert_eq!(cycle(Some(&options[0]), &options), Some("movies".to_string()));
        assert_eq!(cycle(Some(&options[1]), &options), None);
        assert_eq!(cycle(Some(&"gone".to_string()), &options), None);
        assert_eq!(cycle::<String>(None, &[]), None);

        let mut app = App::new(&test_config());
        let (tx, _rx) = unbounded();
        app.request_sync(&tx);
        let mut full = snapshot(1, &[("a", "Alpha")]);
        full.categories = HashMap::from([("linux".to_string(), Default::default())]);
        app.on_synced(Ok(SyncUpdate::Full(full)), &tx);
        app.cycle_category_filter();
        assert_eq!(app.table.criteria().category, "linux");
        assert!(app.table.rows().is_empty());
        app.cycle_state_filter();
        assert_eq!(app.describe_filter(), "state:Downloading cat:linux");
        app.clear_filters();
        assert_eq!(app.table.rows().len(), 1);
        assert_eq!(app.describe_filter(), "(none)");
    }
}
