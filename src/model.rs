use std::{
    collections::{BTreeSet, HashMap},
    time::Duration,
};

use serde::Deserialize;
use time::OffsetDateTime;

/// A torrent as mirrored from the server, keyed by its info hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub hash: String,
    pub name: String,
    pub size: i64,
    pub total_size: i64,
    pub progress: f64,
    pub dlspeed: i64,
    pub upspeed: i64,
    pub downloaded: i64,
    pub uploaded: i64,
    pub amount_left: i64,
    pub ratio: f64,
    pub eta: i64,
    pub num_seeds: i64,
    pub num_complete: i64,
    pub num_leechs: i64,
    pub num_incomplete: i64,
    pub state: String,
    pub category: String,
    pub tags: String,
    pub added_on: i64,
    pub completion_on: i64,
    pub last_activity: i64,
    pub save_path: String,
    pub tracker: String,
    pub priority: i64,
    pub availability: f64,
}

/// The changed attributes of a record. `None` means "unchanged since the last
/// observation", never "zero".
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PartialRecord {
    pub name: Option<String>,
    pub size: Option<i64>,
    pub total_size: Option<i64>,
    pub progress: Option<f64>,
    pub dlspeed: Option<i64>,
    pub upspeed: Option<i64>,
    pub downloaded: Option<i64>,
    pub uploaded: Option<i64>,
    pub amount_left: Option<i64>,
    pub ratio: Option<f64>,
    pub eta: Option<i64>,
    pub num_seeds: Option<i64>,
    pub num_complete: Option<i64>,
    pub num_leechs: Option<i64>,
    pub num_incomplete: Option<i64>,
    pub state: Option<String>,
    pub category: Option<String>,
    pub tags: Option<String>,
    pub added_on: Option<i64>,
    pub completion_on: Option<i64>,
    pub last_activity: Option<i64>,
    pub save_path: Option<String>,
    pub tracker: Option<String>,
    pub priority: Option<i64>,
    pub availability: Option<f64>,
}

macro_rules! overwrite_present {
    ($target:expr, $patch:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )+
    };
}

impl PartialRecord {
    /// Overwrites every present field of `record`, leaving absent ones untouched.
    pub fn apply_to(self, record: &mut Record) {
        overwrite_present!(
            record,
            self,
            name,
            size,
            total_size,
            progress,
            dlspeed,
            upspeed,
            downloaded,
            uploaded,
            amount_left,
            ratio,
            eta,
            num_seeds,
            num_complete,
            num_leechs,
            num_incomplete,
            state,
            category,
            tags,
            added_on,
            completion_on,
            last_activity,
            save_path,
            tracker,
            priority,
            availability,
        );
    }

    /// Promotes a first-seen partial into a full record, zero-filling absent fields.
    pub fn into_record(self, hash: impl Into<String>) -> Record {
        let mut record = Record {
            hash: hash.into(),
            ..Record::default()
        };
        self.apply_to(&mut record);
        record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Category {
    pub save_path: String,
    pub download_path: String,
}

/// The changed attributes of a category; `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialCategory {
    pub save_path: Option<String>,
    pub download_path: Option<String>,
}

impl PartialCategory {
    pub fn apply_to(self, category: &mut Category) {
        overwrite_present!(category, self, save_path, download_path);
    }

    pub fn into_category(self) -> Category {
        let mut category = Category::default();
        self.apply_to(&mut category);
        category
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerState {
    pub connection_status: String,
    pub dl_info_speed: i64,
    pub up_info_speed: i64,
    pub free_space_on_disk: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PartialServerState {
    pub connection_status: Option<String>,
    pub dl_info_speed: Option<i64>,
    pub up_info_speed: Option<i64>,
    pub free_space_on_disk: Option<i64>,
}

impl PartialServerState {
    pub fn apply_to(self, state: &mut ServerState) {
        overwrite_present!(
            state,
            self,
            connection_status,
            dl_info_speed,
            up_info_speed,
            free_space_on_disk,
        );
    }
}

/// The client's mirror of the server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalState {
    pub cursor: u64,
    pub records: HashMap<String, Record>,
    pub categories: HashMap<String, Category>,
    pub tags: BTreeSet<String>,
    pub server: ServerState,
}

impl CanonicalState {
    pub fn sorted_categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.categories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerEntry {
    pub url: String,
    pub status: i64,
    pub tier: i64,
    pub num_peers: i64,
    pub msg: String,
}

impl TrackerEntry {
    pub fn status_label(&self) -> &'static str {
        match self.status {
            0 => "disabled",
            1 => "not contacted",
            2 => "working",
            3 => "updating",
            4 => "not working",
            _ => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeerEntry {
    pub address: String,
    pub client: String,
    pub progress: f64,
    pub dl_speed: i64,
    pub up_speed: i64,
    pub country: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub size: i64,
    pub progress: f64,
    pub priority: i64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub save_path: String,
    pub creation_date: i64,
    pub comment: String,
    pub total_wasted: i64,
    pub pieces_num: i64,
    pub piece_size: i64,
    pub seeding_time: i64,
    pub share_ratio: f64,
    pub addition_date: i64,
    pub completion_date: i64,
}

/// Per-torrent sub-resources shown in the detail pane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDetail {
    pub hash: String,
    pub properties: Properties,
    pub trackers: Vec<TrackerEntry>,
    pub peers: Vec<PeerEntry>,
    pub files: Vec<FileEntry>,
}

pub fn state_label(state: &str) -> &str {
    match state {
        "downloading" => "Downloading",
        "forcedDL" => "[F] Downloading",
        "metaDL" | "forcedMetaDL" => "Metadata",
        "stalledDL" => "Stalled",
        "queuedDL" | "queuedUP" => "Queued",
        "pausedDL" | "stoppedDL" => "Paused",
        "pausedUP" | "stoppedUP" => "Completed",
        "uploading" => "Seeding",
        "forcedUP" => "[F] Seeding",
        "stalledUP" => "Seeding",
        "checkingDL" | "checkingUP" | "checkingResumeData" => "Checking",
        "moving" => "Moving",
        "allocating" => "Allocating",
        "error" => "Errored",
        "missingFiles" => "Missing files",
        other => other,
    }
}

pub fn format_speed(value: i64) -> String {
    format!("{}/s", format_bytes(value))
}

pub fn format_progress(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

/// qBittorrent reports "unknown" ETA as 8640000 (100 days).
const ETA_INFINITY: i64 = 8_640_000;

pub fn format_eta(seconds: i64) -> String {
    if !(0..ETA_INFINITY).contains(&seconds) {
        return "∞".to_string();
    }
    let duration = Duration::from_secs(seconds as u64);
    let days = duration.as_secs() / 86_400;
    let hours = (duration.as_secs() % 86_400) / 3_600;
    let minutes = (duration.as_secs() % 3_600) / 60;
    let seconds = duration.as_secs() % 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}

pub fn format_bytes(value: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut magnitude = value.max(0) as f64;
    let mut unit = 0;
    while magnitude >= 1024.0 && unit < UNITS.len() - 1 {
        magnitude /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", magnitude, UNITS[unit])
}

pub fn format_ratio(value: f64) -> String {
    if value < 0.0 {
        return "∞".to_string();
    }
    format!("{:.2}", value)
}

/// Renders a unix timestamp as `YYYY-MM-DD HH:MM` (UTC); non-positive values are blank.
pub fn format_timestamp(unix: i64) -> String {
    if unix <= 0 {
        return String::new();
    }
    match OffsetDateTime::from_unix_timestamp(unix) {
        Ok(dt) => format!(
            "{:04}-{:02}-{:02} {:02}:{:02}",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute()
        ),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_with_only_dlspeed_changes_only_dlspeed() {
        let mut record = Record {
            hash: "abc".into(),
            name: "ubuntu.iso".into(),
            size: 4096,
            progress: 0.5,
            dlspeed: 100,
            upspeed: 7,
            state: "downloading".into(),
            tags: "os".into(),
            ..Record::default()
        };
        let before = record.clone();
        PartialRecord {
            dlspeed: Some(2048),
            ..PartialRecord::default()
        }
        .apply_to(&mut record);

        assert_eq!(record.dlspeed, 2048);
        assert_eq!(
            Record {
                dlspeed: before.dlspeed,
                ..record
            },
            before
        );
    }

    #[test]
    fn missing_json_keys_decode_as_absent() {
        let partial: PartialRecord = serde_json::from_str(r#"{"upspeed": 0}"#).unwrap();
        assert_eq!(partial.upspeed, Some(0));
        assert_eq!(partial.dlspeed, None);
        assert_eq!(partial.name, None);
    }

    #[test]
    fn promoted_partial_zero_fills() {
        let record = PartialRecord {
            name: Some("debian".into()),
            size: Some(-1),
            ..PartialRecord::default()
        }
        .into_record("h1");
        assert_eq!(record.hash, "h1");
        assert_eq!(record.size, -1);
        assert_eq!(record.progress, 0.0);
        assert!(record.state.is_empty());
    }

    #[test]
    fn formats_eta_and_timestamps() {
        assert_eq!(format_eta(ETA_INFINITY), "∞");
        assert_eq!(format_eta(-5), "∞");
        assert_eq!(format_eta(3_700), "1h1m");
        assert_eq!(format_timestamp(0), "");
        assert_eq!(format_timestamp(86_400), "1970-01-02 00:00");
    }

    #[test]
    fn negative_sizes_render_as_zero() {
        assert_eq!(format_bytes(-10), "0.0 B");
        assert_eq!(format_speed(1536), "1.5 KiB/s");
    }
}
