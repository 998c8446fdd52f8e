//! Folds full snapshots and incremental deltas from the server into the
//! client's `CanonicalState`.
//!
//! `merge` is a pure function of the previous state and one server response.
//! Per-entry inconsistencies do not abort a merge; they are returned as
//! `SyncAnomaly` values for the caller to log.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::model::{
    CanonicalState, Category, PartialCategory, PartialRecord, PartialServerState, ServerState,
};

/// A complete replacement of the mirrored state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullSnapshot {
    pub cursor: u64,
    pub records: HashMap<String, PartialRecord>,
    pub categories: HashMap<String, Category>,
    pub tags: BTreeSet<String>,
    pub server: PartialServerState,
}

/// Changes since the cursor the request was made with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub cursor: u64,
    pub upserted: HashMap<String, PartialRecord>,
    pub removed: Vec<String>,
    pub categories_upserted: HashMap<String, PartialCategory>,
    pub categories_removed: Vec<String>,
    pub tags_added: Vec<String>,
    pub tags_removed: Vec<String>,
    pub server: PartialServerState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncUpdate {
    Full(FullSnapshot),
    Delta(Delta),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("stale cursor: state is at {current}, response carries {received}")]
    StaleCursor { current: u64, received: u64 },
}

/// A delta entry that could not be applied and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncAnomaly {
    #[error("delta removes unknown torrent {0}")]
    UnknownTorrent(String),
    #[error("delta removes unknown category {0:?}")]
    UnknownCategory(String),
    #[error("delta removes unknown tag {0:?}")]
    UnknownTag(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub state: CanonicalState,
    pub anomalies: Vec<SyncAnomaly>,
}

pub fn merge(current: &CanonicalState, update: SyncUpdate) -> Result<MergeOutcome, SyncError> {
    match update {
        SyncUpdate::Full(full) => Ok(MergeOutcome {
            state: apply_full(full),
            anomalies: Vec::new(),
        }),
        SyncUpdate::Delta(delta) => {
            if delta.cursor <= current.cursor {
                return Err(SyncError::StaleCursor {
                    current: current.cursor,
                    received: delta.cursor,
                });
            }
            let mut state = current.clone();
            let anomalies = apply_delta(&mut state, delta);
            Ok(MergeOutcome { state, anomalies })
        }
    }
}

fn apply_full(full: FullSnapshot) -> CanonicalState {
    let records = full
        .records
        .into_iter()
        .map(|(hash, partial)| {
            let record = partial.into_record(hash.clone());
            (hash, record)
        })
        .collect();
    let mut server = ServerState::default();
    full.server.apply_to(&mut server);
    CanonicalState {
        cursor: full.cursor,
        records,
        categories: full.categories,
        tags: full.tags,
        server,
    }
}

fn apply_delta(state: &mut CanonicalState, delta: Delta) -> Vec<SyncAnomaly> {
    let mut anomalies = Vec::new();

    for (hash, partial) in delta.upserted {
        match state.records.get_mut(&hash) {
            Some(record) => partial.apply_to(record),
            None => {
                let record = partial.into_record(hash.clone());
                state.records.insert(hash, record);
            }
        }
    }
    for hash in delta.removed {
        if state.records.remove(&hash).is_none() {
            anomalies.push(SyncAnomaly::UnknownTorrent(hash));
        }
    }

    for (name, partial) in delta.categories_upserted {
        match state.categories.get_mut(&name) {
            Some(category) => partial.apply_to(category),
            None => {
                state.categories.insert(name, partial.into_category());
            }
        }
    }
    for name in delta.categories_removed {
        if state.categories.remove(&name).is_none() {
            anomalies.push(SyncAnomaly::UnknownCategory(name));
        }
    }

    state.tags.extend(delta.tags_added);
    for tag in delta.tags_removed {
        if !state.tags.remove(&tag) {
            anomalies.push(SyncAnomaly::UnknownTag(tag));
        }
    }

    delta.server.apply_to(&mut state.server);
    state.cursor = delta.cursor;
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    fn partial(name: &str, state: &str, dlspeed: i64) -> PartialRecord {
        PartialRecord {
            name: Some(name.to_string()),
            state: Some(state.to_string()),
            dlspeed: Some(dlspeed),
            size: Some(1_000),
            progress: Some(0.25),
            tags: Some("os".to_string()),
            ..PartialRecord::default()
        }
    }

    fn initial() -> CanonicalState {
        let full = FullSnapshot {
            cursor: 1,
            records: HashMap::from([
                ("a".to_string(), partial("Alpha", "downloading", 10)),
                ("b".to_string(), partial("Beta", "seeding", 0)),
            ]),
            categories: HashMap::from([(
                "linux".to_string(),
                Category {
                    save_path: "/data/linux".into(),
                    download_path: String::new(),
                },
            )]),
            tags: BTreeSet::from(["os".to_string()]),
            server: PartialServerState {
                connection_status: Some("connected".into()),
                dl_info_speed: Some(10),
                ..PartialServerState::default()
            },
        };
        merge(&CanonicalState::default(), SyncUpdate::Full(full))
            .unwrap()
            .state
    }

    #[test]
    fn full_snapshot_replaces_everything() {
        let state = initial();
        assert_eq!(state.cursor, 1);
        assert_eq!(state.records.len(), 2);
        assert_eq!(state.records["a"].name, "Alpha");
        assert_eq!(state.records["a"].hash, "a");
        assert_eq!(state.server.connection_status, "connected");

        let replacement = FullSnapshot {
            cursor: 1,
            records: HashMap::from([("c".to_string(), partial("Gamma", "pausedDL", 0))]),
            ..FullSnapshot::default()
        };
        let replaced = merge(&state, SyncUpdate::Full(replacement)).unwrap().state;
        assert_eq!(replaced.records.len(), 1);
        assert!(replaced.categories.is_empty());
        assert!(replaced.tags.is_empty());
    }

    #[test]
    fn delta_overwrites_only_present_fields() {
        let state = initial();
        let delta = Delta {
            cursor: 2,
            upserted: HashMap::from([(
                "a".to_string(),
                PartialRecord {
                    dlspeed: Some(99),
                    ..PartialRecord::default()
                },
            )]),
            ..Delta::default()
        };
        let merged = merge(&state, SyncUpdate::Delta(delta)).unwrap();
        assert!(merged.anomalies.is_empty());
        let expected = Record {
            dlspeed: 99,
            ..state.records["a"].clone()
        };
        assert_eq!(merged.state.records["a"], expected);
        assert_eq!(merged.state.records["b"], state.records["b"]);
        assert_eq!(merged.state.cursor, 2);
    }

    #[test]
    fn delta_converges_with_fresh_snapshot() {
        let state = initial();
        let delta = Delta {
            cursor: 5,
            upserted: HashMap::from([
                (
                    "a".to_string(),
                    PartialRecord {
                        progress: Some(1.0),
                        state: Some("seeding".into()),
                        dlspeed: Some(0),
                        ..PartialRecord::default()
                    },
                ),
                ("c".to_string(), partial("Gamma", "queuedDL", 0)),
            ]),
            removed: vec!["b".to_string()],
            categories_upserted: HashMap::from([(
                "iso".to_string(),
                PartialCategory {
                    save_path: Some("/data/iso".into()),
                    download_path: Some("/tmp/iso".into()),
                },
            )]),
            categories_removed: vec!["linux".to_string()],
            tags_added: vec!["important".to_string()],
            tags_removed: vec!["os".to_string()],
            server: PartialServerState {
                dl_info_speed: Some(0),
                ..PartialServerState::default()
            },
        };
        let merged = merge(&state, SyncUpdate::Delta(delta)).unwrap().state;

        let mut alpha_now = partial("Alpha", "seeding", 0);
        alpha_now.progress = Some(1.0);
        let fresh = FullSnapshot {
            cursor: 5,
            records: HashMap::from([
                ("a".to_string(), alpha_now),
                ("c".to_string(), partial("Gamma", "queuedDL", 0)),
            ]),
            categories: HashMap::from([(
                "iso".to_string(),
                Category {
                    save_path: "/data/iso".into(),
                    download_path: "/tmp/iso".into(),
                },
            )]),
            tags: BTreeSet::from(["important".to_string()]),
            server: PartialServerState {
                connection_status: Some("connected".into()),
                dl_info_speed: Some(0),
                ..PartialServerState::default()
            },
        };
        let expected = merge(&CanonicalState::default(), SyncUpdate::Full(fresh))
            .unwrap()
            .state;
        assert_eq!(merged, expected);
    }

    #[test]
    fn category_delta_keeps_unsent_fields() {
        let mut state = initial();
        state
            .categories
            .get_mut("linux")
            .unwrap()
            .download_path = "/tmp/linux".into();
        let delta = Delta {
            cursor: 2,
            categories_upserted: HashMap::from([(
                "linux".to_string(),
                PartialCategory {
                    save_path: Some("/srv/linux".into()),
                    download_path: None,
                },
            )]),
            ..Delta::default()
        };
        let merged = merge(&state, SyncUpdate::Delta(delta)).unwrap().state;
        assert_eq!(
            merged.categories["linux"],
            Category {
                save_path: "/srv/linux".into(),
                download_path: "/tmp/linux".into(),
            }
        );
    }

    #[test]
    fn replaying_a_delta_is_rejected_as_stale() {
        let state = initial();
        let delta = Delta {
            cursor: 2,
            removed: vec!["a".to_string()],
            ..Delta::default()
        };
        let once = merge(&state, SyncUpdate::Delta(delta.clone())).unwrap().state;
        let err = merge(&once, SyncUpdate::Delta(delta)).unwrap_err();
        assert_eq!(
            err,
            SyncError::StaleCursor {
                current: 2,
                received: 2
            }
        );
        assert_eq!(once.records.len(), 1);
    }

    #[test]
    fn older_delta_is_rejected() {
        let state = initial();
        let newer = merge(
            &state,
            SyncUpdate::Delta(Delta {
                cursor: 9,
                ..Delta::default()
            }),
        )
        .unwrap()
        .state;
        let result = merge(
            &newer,
            SyncUpdate::Delta(Delta {
                cursor: 4,
                ..Delta::default()
            }),
        );
        assert!(matches!(result, Err(SyncError::StaleCursor { .. })));
    }

    #[test]
    fn unknown_removals_are_reported_and_skipped() {
        let state = initial();
        let delta = Delta {
            cursor: 3,
            removed: vec!["zzz".to_string(), "b".to_string()],
            categories_removed: vec!["nope".to_string()],
            tags_removed: vec!["ghost".to_string()],
            ..Delta::default()
        };
        let merged = merge(&state, SyncUpdate::Delta(delta)).unwrap();
        assert_eq!(
            merged.anomalies,
            vec![
                SyncAnomaly::UnknownTorrent("zzz".into()),
                SyncAnomaly::UnknownCategory("nope".into()),
                SyncAnomaly::UnknownTag("ghost".into()),
            ]
        );
        assert!(!merged.state.records.contains_key("b"));
        assert!(merged.state.records.contains_key("a"));
        assert_eq!(merged.state.cursor, 3);
    }

    #[test]
    fn new_hash_in_delta_is_promoted() {
        let state = initial();
        let delta = Delta {
            cursor: 2,
            upserted: HashMap::from([(
                "new".to_string(),
                PartialRecord {
                    name: Some("Fresh".into()),
                    ..PartialRecord::default()
                },
            )]),
            ..Delta::default()
        };
        let merged = merge(&state, SyncUpdate::Delta(delta)).unwrap().state;
        let record = &merged.records["new"];
        assert_eq!(record.name, "Fresh");
        assert_eq!(record.hash, "new");
        assert_eq!(record.size, 0);
    }
}
