use std::cmp::Ordering;

use crate::{
    columns::{ColumnKey, ColumnKind},
    model::Record,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn flipped(self) -> Self {
        match self {
            SortDirection::Ascending => SortDirection::Descending,
            SortDirection::Descending => SortDirection::Ascending,
        }
    }

    pub fn indicator(self) -> &'static str {
        match self {
            SortDirection::Ascending => "▲",
            SortDirection::Descending => "▼",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortConfig {
    pub primary: ColumnKey,
    pub direction: SortDirection,
    pub secondary: Option<ColumnKey>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            primary: ColumnKey::Name,
            direction: SortDirection::Ascending,
            secondary: None,
        }
    }
}

impl SortConfig {
    /// Re-selecting the active column flips direction; a new column starts
    /// ascending. `reverse` requests descending explicitly.
    pub fn select(&mut self, column: ColumnKey, reverse: bool) {
        if reverse {
            self.primary = column;
            self.direction = SortDirection::Descending;
        } else if self.primary == column {
            self.direction = self.direction.flipped();
        } else {
            self.primary = column;
            self.direction = SortDirection::Ascending;
        }
    }

    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let mut ordering = compare_column(self.primary, a, b);
        if ordering == Ordering::Equal {
            if let Some(secondary) = self.secondary.filter(|key| *key != self.primary) {
                ordering = compare_column(secondary, a, b);
            }
        }
        let ordering = ordering
            .then_with(|| compare_text(&a.name, &b.name))
            .then_with(|| a.hash.cmp(&b.hash));
        match self.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        }
    }
}

/// Stable sort of `records` under `config`.
pub fn sort<'a>(mut records: Vec<&'a Record>, config: &SortConfig) -> Vec<&'a Record> {
    records.sort_by(|a, b| config.compare(a, b));
    records
}

pub fn compare_column(key: ColumnKey, a: &Record, b: &Record) -> Ordering {
    match key.kind() {
        ColumnKind::Text => compare_text(text_value(key, a), text_value(key, b)),
        ColumnKind::Status => a.state.cmp(&b.state),
        ColumnKind::Numeric => numeric_value(key, a).total_cmp(&numeric_value(key, b)),
    }
}

fn compare_text(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

fn text_value(key: ColumnKey, record: &Record) -> &str {
    match key {
        ColumnKey::Category => &record.category,
        ColumnKey::Tags => &record.tags,
        ColumnKey::SavePath => &record.save_path,
        ColumnKey::Tracker => &record.tracker,
        _ => &record.name,
    }
}

fn numeric_value(key: ColumnKey, record: &Record) -> f64 {
    match key {
        ColumnKey::Size => record.size as f64,
        ColumnKey::TotalSize => record.total_size as f64,
        ColumnKey::Progress => record.progress,
        ColumnKey::Seeds => record.num_seeds as f64,
        ColumnKey::Peers => record.num_leechs as f64,
        ColumnKey::DlSpeed => record.dlspeed as f64,
        ColumnKey::UpSpeed => record.upspeed as f64,
        ColumnKey::Eta => record.eta as f64,
        ColumnKey::Ratio => record.ratio,
        ColumnKey::AddedOn => record.added_on as f64,
        ColumnKey::CompletedOn => record.completion_on as f64,
        ColumnKey::LastActivity => record.last_activity as f64,
        ColumnKey::Downloaded => record.downloaded as f64,
        ColumnKey::Uploaded => record.uploaded as f64,
        ColumnKey::Remaining => record.amount_left as f64,
        ColumnKey::Availability => record.availability,
        ColumnKey::Priority => record.priority as f64,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, name: &str, size: i64, state: &str) -> Record {
        Record {
            hash: hash.to_string(),
            name: name.to_string(),
            size,
            state: state.to_string(),
            ..Record::default()
        }
    }

    fn order(records: &[Record], config: &SortConfig) -> Vec<String> {
        sort(records.iter().collect(), config)
            .into_iter()
            .map(|r| r.hash.clone())
            .collect()
    }

    #[test]
    fn numeric_primary_then_name_tiebreak() {
        let records = vec![
            record("1", "beta", 10, ""),
            record("2", "Alpha", 10, ""),
            record("3", "gamma", 5, ""),
        ];
        let config = SortConfig {
            primary: ColumnKey::Size,
            ..SortConfig::default()
        };
        assert_eq!(order(&records, &config), vec!["3", "2", "1"]);
    }

    #[test]
    fn descending_reverses_the_composed_order() {
        let records = vec![
            record("1", "beta", 10, ""),
            record("2", "Alpha", 10, ""),
            record("3", "gamma", 5, ""),
        ];
        let config = SortConfig {
            primary: ColumnKey::Size,
            direction: SortDirection::Descending,
            secondary: None,
        };
        // Tiebreak is reversed too.
        assert_eq!(order(&records, &config), vec!["1", "2", "3"]);
    }

    #[test]
    fn secondary_column_breaks_primary_ties() {
        let mut a = record("a", "same", 1, "");
        a.dlspeed = 50;
        let mut b = record("b", "same", 1, "");
        b.dlspeed = 20;
        let config = SortConfig {
            primary: ColumnKey::Size,
            direction: SortDirection::Ascending,
            secondary: Some(ColumnKey::DlSpeed),
        };
        assert_eq!(order(&[a, b], &config), vec!["b", "a"]);
    }

    #[test]
    fn status_sorts_by_raw_state_tag() {
        let records = vec![
            record("1", "x", 0, "uploading"),
            record("2", "y", 0, "pausedUP"),
            record("3", "z", 0, "downloading"),
        ];
        let config = SortConfig {
            primary: ColumnKey::Status,
            ..SortConfig::default()
        };
        assert_eq!(order(&records, &config), vec!["3", "2", "1"]);
    }

    #[test]
    fn text_columns_ignore_case() {
        let mut a = record("a", "n", 0, "");
        a.category = "Movies".into();
        let mut b = record("b", "n", 0, "");
        b.category = "linux".into();
        let config = SortConfig {
            primary: ColumnKey::Category,
            ..SortConfig::default()
        };
        assert_eq!(order(&[a, b], &config), vec!["b", "a"]);
    }

    #[test]
    fn comparisons_are_total_for_distinct_records() {
        let mut records = vec![
            record("a", "Same", 0, "seeding"),
            record("b", "same", 0, "seeding"),
            record("c", "other", -1, "error"),
        ];
        records[0].progress = f64::NAN;
        records[1].progress = 0.5;
        for primary in ColumnKey::ALL {
            for direction in [SortDirection::Ascending, SortDirection::Descending] {
                let config = SortConfig {
                    primary,
                    direction,
                    secondary: Some(ColumnKey::Ratio),
                };
                for x in &records {
                    for y in &records {
                        let forward = config.compare(x, y);
                        let backward = config.compare(y, x);
                        if x.hash == y.hash {
                            assert_eq!(forward, Ordering::Equal);
                        } else {
                            assert_ne!(forward, Ordering::Equal, "{primary} {x:?} {y:?}");
                            assert_eq!(forward, backward.reverse());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn toggle_rule() {
        let mut config = SortConfig::default();
        config.select(ColumnKey::Name, false);
        assert_eq!(config.direction, SortDirection::Descending);
        config.select(ColumnKey::Size, false);
        assert_eq!(config.primary, ColumnKey::Size);
        assert_eq!(config.direction, SortDirection::Ascending);
        config.select(ColumnKey::Size, false);
        assert_eq!(config.direction, SortDirection::Descending);
        config.select(ColumnKey::Eta, true);
        assert_eq!(config.primary, ColumnKey::Eta);
        assert_eq!(config.direction, SortDirection::Descending);
    }
}
