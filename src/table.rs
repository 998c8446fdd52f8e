//! View-model for the torrent table: filter, sort, selection, and layout
//! glued together over a snapshot of the canonical records.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::{
    columns::{self, fit_cell, CellAlign, Column, ColumnKey, DECLARATIONS},
    filter::{self, FilterCriteria},
    model::{
        format_bytes, format_eta, format_progress, format_ratio, format_speed, format_timestamp,
        state_label, Record,
    },
    selection::SelectionState,
    sort::{self, SortConfig},
};

const MAX_DIGIT_KEYS: usize = 9;

/// Everything the renderer needs for one frame of the table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableView {
    pub columns: Vec<Column>,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub selected: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct TorrentTable {
    source: Vec<Record>,
    rows: Vec<Record>,
    criteria: FilterCriteria,
    sort: SortConfig,
    visible: Vec<ColumnKey>,
    key_map: Vec<ColumnKey>,
    selection: SelectionState,
    page_size: usize,
}

impl Default for TorrentTable {
    fn default() -> Self {
        Self::new(columns::DEFAULT_VISIBLE.to_vec(), SortConfig::default())
    }
}

impl TorrentTable {
    pub fn new(visible: Vec<ColumnKey>, sort: SortConfig) -> Self {
        let mut table = Self {
            source: Vec::new(),
            rows: Vec::new(),
            criteria: FilterCriteria::default(),
            sort,
            visible: Vec::new(),
            key_map: Vec::new(),
            selection: SelectionState::default(),
            page_size: 10,
        };
        table.set_visible(visible);
        table
    }

    /// Replaces the record set and re-derives rows and selection.
    pub fn set_records<I>(&mut self, records: I)
    where
        I: IntoIterator<Item = Record>,
    {
        self.source = records.into_iter().collect();
        self.rebuild();
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    pub fn set_criteria(&mut self, criteria: FilterCriteria) {
        self.criteria = criteria;
        self.rebuild();
    }

    pub fn sort_config(&self) -> &SortConfig {
        &self.sort
    }

    pub fn select_sort(&mut self, column: ColumnKey, reverse: bool) {
        self.sort.select(column, reverse);
        self.rebuild();
    }

    pub fn visible(&self) -> &[ColumnKey] {
        &self.visible
    }

    /// Sets the visible columns. The name column is always kept.
    pub fn set_visible(&mut self, visible: Vec<ColumnKey>) {
        let mut deduped: Vec<ColumnKey> = Vec::with_capacity(visible.len());
        for key in visible {
            if !deduped.contains(&key) {
                deduped.push(key);
            }
        }
        if !deduped.contains(&ColumnKey::Name) {
            deduped.insert(0, ColumnKey::Name);
        }
        self.visible = deduped;
        self.rebuild_key_map();
    }

    /// Shows or hides `key`. Returns false when the change is not allowed.
    pub fn toggle_column(&mut self, key: ColumnKey) -> bool {
        if key == ColumnKey::Name {
            return false;
        }
        if let Some(pos) = self.visible.iter().position(|k| *k == key) {
            self.visible.remove(pos);
        } else {
            self.visible.push(key);
        }
        self.rebuild_key_map();
        true
    }

    /// Column bound to digit `n` (1-based).
    pub fn column_for_digit(&self, n: u32) -> Option<ColumnKey> {
        let index = (n as usize).checked_sub(1)?;
        self.key_map.get(index).copied()
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn total_records(&self) -> usize {
        self.source.len()
    }

    pub fn selected_record(&self) -> Option<&Record> {
        let index = self.selection.selected()?;
        self.rows.get(index)
    }

    pub fn set_page_size(&mut self, rows: usize) {
        self.page_size = rows.max(1);
    }

    /// Handles table keys: movement, digit sort, Alt+digit reverse sort.
    /// Returns true when the key was consumed.
    pub fn on_key(&mut self, key: KeyEvent) -> bool {
        let page = self.page_size as isize;
        match key.code {
            KeyCode::Char(c) if c.is_ascii_digit() => {
                let Some(column) = c.to_digit(10).and_then(|n| self.column_for_digit(n)) else {
                    return false;
                };
                let reverse = key.modifiers.contains(KeyModifiers::ALT);
                self.select_sort(column, reverse);
                true
            }
            KeyCode::Char('d') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.move_selection(page / 2);
                true
            }
            KeyCode::Char('u') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.move_selection(-(page / 2));
                true
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.move_selection(1);
                true
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.move_selection(-1);
                true
            }
            KeyCode::PageDown => {
                self.move_selection(page);
                true
            }
            KeyCode::PageUp => {
                self.move_selection(-page);
                true
            }
            KeyCode::Home | KeyCode::Char('g') => {
                let order = row_refs(&self.rows);
                self.selection.select_index(0, &order);
                true
            }
            KeyCode::End | KeyCode::Char('G') => {
                let order = row_refs(&self.rows);
                self.selection.select_last(&order);
                true
            }
            _ => false,
        }
    }

    pub fn view(&self, width: u16) -> TableView {
        let layout = columns::layout(&DECLARATIONS, &self.visible, width);
        let header = layout
            .iter()
            .map(|column| {
                let title = if column.declaration.key == self.sort.primary {
                    format!(
                        "{} {}",
                        column.declaration.title,
                        self.sort.direction.indicator()
                    )
                } else {
                    column.declaration.title.to_string()
                };
                fit_cell(&title, column.width, CellAlign::Left)
            })
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|record| {
                layout
                    .iter()
                    .map(|column| {
                        let key = column.declaration.key;
                        fit_cell(&cell_text(key, record), column.width, key.align())
                    })
                    .collect()
            })
            .collect();
        TableView {
            columns: layout,
            header,
            rows,
            selected: self.selection.selected(),
        }
    }

    fn move_selection(&mut self, delta: isize) {
        let order = row_refs(&self.rows);
        self.selection.move_by(delta, &order);
    }

    fn rebuild(&mut self) {
        let filtered = filter::apply(&self.source, &self.criteria);
        self.rows = sort::sort(filtered, &self.sort)
            .into_iter()
            .cloned()
            .collect();
        let order = row_refs(&self.rows);
        self.selection.reanchor(&order);
    }

    fn rebuild_key_map(&mut self) {
        self.key_map = self.visible.iter().copied().take(MAX_DIGIT_KEYS).collect();
    }
}

fn row_refs(rows: &[Record]) -> Vec<&Record> {
    rows.iter().collect()
}

pub fn cell_text(key: ColumnKey, record: &Record) -> String {
    match key {
        ColumnKey::Name => record.name.clone(),
        ColumnKey::Size => format_bytes(record.size),
        ColumnKey::TotalSize => format_bytes(record.total_size),
        ColumnKey::Progress => format_progress(record.progress),
        ColumnKey::Status => state_label(&record.state).to_string(),
        ColumnKey::Seeds => format!("{} ({})", record.num_seeds, record.num_complete),
        ColumnKey::Peers => format!("{} ({})", record.num_leechs, record.num_incomplete),
        ColumnKey::DlSpeed => format_speed(record.dlspeed),
        ColumnKey::UpSpeed => format_speed(record.upspeed),
        ColumnKey::Eta => format_eta(record.eta),
        ColumnKey::Ratio => format_ratio(record.ratio),
        ColumnKey::Category => record.category.clone(),
        ColumnKey::Tags => filter::split_tags(&record.tags)
            .collect::<Vec<_>>()
            .join(", "),
        ColumnKey::AddedOn => format_timestamp(record.added_on),
        ColumnKey::CompletedOn => format_timestamp(record.completion_on),
        ColumnKey::LastActivity => format_timestamp(record.last_activity),
        ColumnKey::SavePath => record.save_path.clone(),
        ColumnKey::Tracker => filter::tracker_domain(&record.tracker),
        ColumnKey::Downloaded => format_bytes(record.downloaded),
        ColumnKey::Uploaded => format_bytes(record.uploaded),
        ColumnKey::Remaining => format_bytes(record.amount_left),
        ColumnKey::Availability => format!("{:.2}", record.availability),
        ColumnKey::Priority if record.priority <= 0 => "*".to_string(),
        ColumnKey::Priority => record.priority.to_string(),
    }
}
