//! Responsive column layout for the torrent table.
//!
//! Columns are admitted in priority order until the sum of their minimum
//! widths (plus one separator between neighbours) no longer fits. Leftover
//! width is handed out by `flex_grow`, clamped to `max_width`, and whatever
//! clamping gives back goes to the first unbounded column.

use std::{fmt, str::FromStr};

use thiserror::Error;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

pub const SEPARATOR_WIDTH: u16 = 1;
pub const ELLIPSIS: &str = "…";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKey {
    Name,
    Size,
    TotalSize,
    Progress,
    Status,
    Seeds,
    Peers,
    DlSpeed,
    UpSpeed,
    Eta,
    Ratio,
    Category,
    Tags,
    AddedOn,
    CompletedOn,
    LastActivity,
    SavePath,
    Tracker,
    Downloaded,
    Uploaded,
    Remaining,
    Availability,
    Priority,
}

/// How cells of a column compare when sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Text,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellAlign {
    Left,
    Right,
}

impl ColumnKey {
    pub const ALL: [ColumnKey; 23] = [
        ColumnKey::Name,
        ColumnKey::Size,
        ColumnKey::TotalSize,
        ColumnKey::Progress,
        ColumnKey::Status,
        ColumnKey::Seeds,
        ColumnKey::Peers,
        ColumnKey::DlSpeed,
        ColumnKey::UpSpeed,
        ColumnKey::Eta,
        ColumnKey::Ratio,
        ColumnKey::Category,
        ColumnKey::Tags,
        ColumnKey::AddedOn,
        ColumnKey::CompletedOn,
        ColumnKey::LastActivity,
        ColumnKey::SavePath,
        ColumnKey::Tracker,
        ColumnKey::Downloaded,
        ColumnKey::Uploaded,
        ColumnKey::Remaining,
        ColumnKey::Availability,
        ColumnKey::Priority,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKey::Name => "name",
            ColumnKey::Size => "size",
            ColumnKey::TotalSize => "total_size",
            ColumnKey::Progress => "progress",
            ColumnKey::Status => "status",
            ColumnKey::Seeds => "seeds",
            ColumnKey::Peers => "peers",
            ColumnKey::DlSpeed => "dlspeed",
            ColumnKey::UpSpeed => "upspeed",
            ColumnKey::Eta => "eta",
            ColumnKey::Ratio => "ratio",
            ColumnKey::Category => "category",
            ColumnKey::Tags => "tags",
            ColumnKey::AddedOn => "added_on",
            ColumnKey::CompletedOn => "completion_on",
            ColumnKey::LastActivity => "last_activity",
            ColumnKey::SavePath => "save_path",
            ColumnKey::Tracker => "tracker",
            ColumnKey::Downloaded => "downloaded",
            ColumnKey::Uploaded => "uploaded",
            ColumnKey::Remaining => "amount_left",
            ColumnKey::Availability => "availability",
            ColumnKey::Priority => "priority",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            ColumnKey::Name
            | ColumnKey::Category
            | ColumnKey::Tags
            | ColumnKey::SavePath
            | ColumnKey::Tracker => ColumnKind::Text,
            ColumnKey::Status => ColumnKind::Status,
            _ => ColumnKind::Numeric,
        }
    }

    pub fn align(self) -> CellAlign {
        match self.kind() {
            ColumnKind::Numeric => CellAlign::Right,
            ColumnKind::Text | ColumnKind::Status => CellAlign::Left,
        }
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown column {0:?}")]
pub struct UnknownColumn(pub String);

impl FromStr for ColumnKey {
    type Err = UnknownColumn;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        ColumnKey::ALL
            .into_iter()
            .find(|key| key.as_str() == wanted)
            .ok_or_else(|| UnknownColumn(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnDeclaration {
    pub key: ColumnKey,
    pub title: &'static str,
    pub min_width: u16,
    /// 0 means unbounded.
    pub max_width: u16,
    pub flex_grow: f32,
    /// 1 is kept longest when space runs out.
    pub priority: u8,
}

const fn decl(
    key: ColumnKey,
    title: &'static str,
    min_width: u16,
    max_width: u16,
    flex_grow: f32,
    priority: u8,
) -> ColumnDeclaration {
    ColumnDeclaration {
        key,
        title,
        min_width,
        max_width,
        flex_grow,
        priority,
    }
}

pub static DECLARATIONS: [ColumnDeclaration; 23] = [
    decl(ColumnKey::Name, "Name", 12, 0, 1.0, 1),
    decl(ColumnKey::Size, "Size", 10, 12, 0.0, 4),
    decl(ColumnKey::TotalSize, "Total Size", 10, 12, 0.0, 9),
    decl(ColumnKey::Progress, "Done", 6, 8, 0.0, 2),
    decl(ColumnKey::Status, "Status", 10, 16, 0.2, 3),
    decl(ColumnKey::Seeds, "Seeds", 5, 9, 0.0, 7),
    decl(ColumnKey::Peers, "Peers", 5, 9, 0.0, 7),
    decl(ColumnKey::DlSpeed, "Down", 10, 12, 0.0, 5),
    decl(ColumnKey::UpSpeed, "Up", 10, 12, 0.0, 5),
    decl(ColumnKey::Eta, "ETA", 6, 8, 0.0, 6),
    decl(ColumnKey::Ratio, "Ratio", 5, 7, 0.0, 8),
    decl(ColumnKey::Category, "Category", 8, 20, 0.3, 8),
    decl(ColumnKey::Tags, "Tags", 8, 24, 0.3, 9),
    decl(ColumnKey::AddedOn, "Added", 16, 16, 0.0, 10),
    decl(ColumnKey::CompletedOn, "Completed", 16, 16, 0.0, 10),
    decl(ColumnKey::LastActivity, "Last Active", 16, 16, 0.0, 11),
    decl(ColumnKey::SavePath, "Save Path", 12, 40, 0.4, 10),
    decl(ColumnKey::Tracker, "Tracker", 12, 30, 0.3, 9),
    decl(ColumnKey::Downloaded, "Downloaded", 10, 12, 0.0, 10),
    decl(ColumnKey::Uploaded, "Uploaded", 10, 12, 0.0, 10),
    decl(ColumnKey::Remaining, "Remaining", 10, 12, 0.0, 10),
    decl(ColumnKey::Availability, "Avail", 5, 7, 0.0, 11),
    decl(ColumnKey::Priority, "#", 3, 5, 0.0, 11),
];

pub const DEFAULT_VISIBLE: [ColumnKey; 9] = [
    ColumnKey::Name,
    ColumnKey::Size,
    ColumnKey::Progress,
    ColumnKey::Status,
    ColumnKey::Seeds,
    ColumnKey::Peers,
    ColumnKey::DlSpeed,
    ColumnKey::UpSpeed,
    ColumnKey::Eta,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Column {
    pub declaration: ColumnDeclaration,
    pub width: u16,
}

/// Assigns a width to each visible column that fits in `available_width`.
///
/// The result keeps the order of `visible`; columns that do not fit are left
/// out. If not even the most important column fits, it is returned alone at
/// its minimum width.
pub fn layout(
    declarations: &[ColumnDeclaration],
    visible: &[ColumnKey],
    available_width: u16,
) -> Vec<Column> {
    let mut resolved: Vec<(usize, ColumnDeclaration)> = Vec::new();
    for key in visible {
        if resolved.iter().any(|(_, decl)| decl.key == *key) {
            continue;
        }
        if let Some(decl) = declarations.iter().find(|decl| decl.key == *key) {
            resolved.push((resolved.len(), *decl));
        }
    }
    if resolved.is_empty() {
        return Vec::new();
    }

    let mut by_priority = resolved.clone();
    by_priority.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(&b.0)));

    let available = u32::from(available_width);
    let mut admitted: Vec<(usize, ColumnDeclaration)> = Vec::new();
    let mut used: u32 = 0;
    for &(position, decl) in &by_priority {
        let separator = if admitted.is_empty() {
            0
        } else {
            u32::from(SEPARATOR_WIDTH)
        };
        let projected = used + separator + u32::from(decl.min_width);
        if projected > available {
            break;
        }
        admitted.push((position, decl));
        used = projected;
    }

    if admitted.is_empty() {
        let (_, first) = by_priority[0];
        return vec![Column {
            declaration: first,
            width: first.min_width,
        }];
    }

    admitted.sort_by_key(|(position, _)| *position);
    let widths = distribute(&admitted, available - used);
    admitted
        .into_iter()
        .zip(widths)
        .map(|((_, declaration), width)| Column { declaration, width })
        .collect()
}

fn distribute(admitted: &[(usize, ColumnDeclaration)], remaining: u32) -> Vec<u16> {
    let total_flex: f64 = admitted
        .iter()
        .map(|(_, decl)| f64::from(decl.flex_grow.clamp(0.0, 1.0)))
        .sum();

    let mut widths: Vec<u32> = Vec::with_capacity(admitted.len());
    let mut handed_out: u32 = 0;
    for (_, decl) in admitted {
        let min = u32::from(decl.min_width);
        let flex = f64::from(decl.flex_grow.clamp(0.0, 1.0));
        let grow = if total_flex > 0.0 {
            (f64::from(remaining) * flex / total_flex).floor() as u32
        } else {
            0
        };
        let mut width = min + grow;
        if decl.max_width != 0 {
            width = width.min(u32::from(decl.max_width).max(min));
        }
        handed_out += width - min;
        widths.push(width);
    }

    let leftover = remaining.saturating_sub(handed_out);
    if let Some(slot) = admitted.iter().position(|(_, decl)| decl.max_width == 0) {
        widths[slot] += leftover;
    }

    widths
        .into_iter()
        .map(|width| width.min(u32::from(u16::MAX)) as u16)
        .collect()
}

/// Truncates `text` to at most `width` display cells, ending in `…` when cut.
pub fn truncate(text: &str, width: u16) -> String {
    let width = usize::from(width);
    if UnicodeWidthStr::width(text) <= width {
        return text.to_string();
    }
    if width == 0 {
        return String::new();
    }
    let budget = width - UnicodeWidthStr::width(ELLIPSIS);
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let ch_width = UnicodeWidthChar::width(ch).unwrap_or(0);
        if used + ch_width > budget {
            break;
        }
        used += ch_width;
        out.push(ch);
    }
    out.push_str(ELLIPSIS);
    out
}

/// Truncates and pads `text` to exactly `width` display cells.
pub fn fit_cell(text: &str, width: u16, align: CellAlign) -> String {
    let cut = truncate(text, width);
    let pad = usize::from(width).saturating_sub(UnicodeWidthStr::width(cut.as_str()));
    match align {
        CellAlign::Left => format!("{cut}{}", " ".repeat(pad)),
        CellAlign::Right => format!("{}{cut}", " ".repeat(pad)),
    }
}
