use std::{
    collections::{BTreeSet, HashMap},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use log::debug;
use reqwest::{
    blocking::{multipart::Form, Client, RequestBuilder, Response},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use serde_with::{serde_as, DefaultOnError, DefaultOnNull};
use thiserror::Error;

use crate::{
    config::ApiConfig,
    model::{
        Category, FileEntry, PartialCategory, PartialRecord, PartialServerState, PeerEntry,
        Properties, RecordDetail, TrackerEntry,
    },
    sync::{Delta, FullSnapshot, SyncUpdate},
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("authentication failed")]
    Authentication,
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("response parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn is_auth(&self) -> bool {
        matches!(self, GatewayError::Authentication)
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Form fields sent with every add request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOptions {
    pub category: Option<String>,
    pub paused: bool,
}

impl AddOptions {
    fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::new();
        if let Some(category) = self.category.as_ref().filter(|c| !c.is_empty()) {
            fields.push(("category", category.clone()));
        }
        if self.paused {
            fields.push(("paused", "true".to_string()));
            fields.push(("stopped", "true".to_string()));
        }
        fields
    }
}

/// Everything the client needs from the server.
pub trait Gateway {
    fn fetch_snapshot(&self) -> GatewayResult<FullSnapshot>;
    /// The server may answer with a full update instead of a delta.
    fn fetch_delta(&self, cursor: u64) -> GatewayResult<SyncUpdate>;
    fn fetch_record_detail(&self, hash: &str) -> GatewayResult<RecordDetail>;
    fn pause(&self, hashes: &[String]) -> GatewayResult<()>;
    fn resume(&self, hashes: &[String]) -> GatewayResult<()>;
    fn remove(&self, hashes: &[String], delete_files: bool) -> GatewayResult<()>;
    fn relocate(&self, hashes: &[String], location: &str) -> GatewayResult<()>;
    fn add_urls(&self, urls: &[String], options: &AddOptions) -> GatewayResult<()>;
    fn add_file(&self, path: &Path, options: &AddOptions) -> GatewayResult<()>;
}

/// qBittorrent WebUI API v2 client.
pub struct QbitClient {
    http: Client,
    base_url: String,
    credentials: Option<(String, String)>,
    logged_in: AtomicBool,
}

impl QbitClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let base_url = config.base_url();
        let ApiConfig {
            username,
            password,
            timeout,
            verify_ssl,
            user_agent,
            ..
        } = config;
        let mut builder = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .cookie_store(true);
        if !verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        let credentials = username.map(|user| (user, password.unwrap_or_default()));
        Ok(Self {
            http,
            base_url,
            credentials,
            logged_in: AtomicBool::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{}", self.base_url, path)
    }

    fn login(&self) -> GatewayResult<()> {
        let Some((username, password)) = &self.credentials else {
            return Ok(());
        };
        debug!("logging in to {} as {username}", self.base_url);
        let response = self
            .http
            .post(self.url("auth/login"))
            .header("Referer", &self.base_url)
            .form(&[("username", username), ("password", password)])
            .send()?;
        if !response.status().is_success() {
            return Err(GatewayError::Authentication);
        }
        let body = response.text()?;
        if body.trim() != "Ok." {
            return Err(GatewayError::Authentication);
        }
        self.logged_in.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Sends a request, logging in first when needed and once more on 403.
    fn send<F>(&self, build: F) -> GatewayResult<Response>
    where
        F: Fn() -> GatewayResult<RequestBuilder>,
    {
        if self.credentials.is_some() && !self.logged_in.load(Ordering::Relaxed) {
            self.login()?;
        }
        let mut retried = false;
        loop {
            let response = build()?.header("Referer", &self.base_url).send()?;
            match response.status() {
                StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                    self.logged_in.store(false, Ordering::Relaxed);
                    if retried || self.credentials.is_none() {
                        return Err(GatewayError::Authentication);
                    }
                    retried = true;
                    self.login()?;
                }
                status if !status.is_success() => {
                    return Err(GatewayError::HttpStatus(status));
                }
                _ => return Ok(response),
            }
        }
    }

    fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> GatewayResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send(|| Ok(self.http.get(self.url(path)).query(query)))?;
        let body = response.text()?;
        serde_json::from_str(&body).map_err(GatewayError::from)
    }

    fn post_form(&self, path: &str, form: &[(&str, String)]) -> GatewayResult<String> {
        let response = self.send(|| Ok(self.http.post(self.url(path)).form(form)))?;
        Ok(response.text()?)
    }

    /// Tries the current endpoint name first and falls back to the pre-5.0 one.
    fn post_form_compat(
        &self,
        path: &str,
        legacy_path: &str,
        form: &[(&str, String)],
    ) -> GatewayResult<()> {
        match self.post_form(path, form) {
            Err(GatewayError::HttpStatus(StatusCode::NOT_FOUND)) => {
                debug!("{path} not found, retrying as {legacy_path}");
                self.post_form(legacy_path, form).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    fn main_data(&self, cursor: u64) -> GatewayResult<MainData> {
        self.get_json("sync/maindata", &[("rid", cursor.to_string())])
    }
}

fn join_hashes(hashes: &[String]) -> String {
    hashes.join("|")
}

impl Gateway for QbitClient {
    fn fetch_snapshot(&self) -> GatewayResult<FullSnapshot> {
        Ok(self.main_data(0)?.into_full())
    }

    fn fetch_delta(&self, cursor: u64) -> GatewayResult<SyncUpdate> {
        Ok(self.main_data(cursor)?.into_update())
    }

    fn fetch_record_detail(&self, hash: &str) -> GatewayResult<RecordDetail> {
        let query = [("hash", hash.to_string())];
        let properties: WireProperties = self.get_json("torrents/properties", &query)?;
        let trackers: Vec<WireTracker> = self.get_json("torrents/trackers", &query)?;
        let files: Vec<WireFile> = self.get_json("torrents/files", &query)?;
        let peers: WirePeers = self.get_json(
            "sync/torrentPeers",
            &[("hash", hash.to_string()), ("rid", "0".to_string())],
        )?;
        Ok(RecordDetail {
            hash: hash.to_string(),
            properties: properties.into(),
            trackers: trackers.into_iter().map(TrackerEntry::from).collect(),
            peers: peers.into_entries(),
            files: files.into_iter().map(FileEntry::from).collect(),
        })
    }

    fn pause(&self, hashes: &[String]) -> GatewayResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let form = [("hashes", join_hashes(hashes))];
        self.post_form_compat("torrents/stop", "torrents/pause", &form)
    }

    fn resume(&self, hashes: &[String]) -> GatewayResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let form = [("hashes", join_hashes(hashes))];
        self.post_form_compat("torrents/start", "torrents/resume", &form)
    }

    fn remove(&self, hashes: &[String], delete_files: bool) -> GatewayResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let form = [
            ("hashes", join_hashes(hashes)),
            ("deleteFiles", delete_files.to_string()),
        ];
        self.post_form("torrents/delete", &form).map(|_| ())
    }

    fn relocate(&self, hashes: &[String], location: &str) -> GatewayResult<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        let form = [
            ("hashes", join_hashes(hashes)),
            ("location", location.to_string()),
        ];
        self.post_form("torrents/setLocation", &form).map(|_| ())
    }

    fn add_urls(&self, urls: &[String], options: &AddOptions) -> GatewayResult<()> {
        if urls.is_empty() {
            return Ok(());
        }
        let mut form = vec![("urls", urls.join("\n"))];
        form.extend(options.form_fields());
        let body = self.post_form("torrents/add", &form)?;
        check_add_response(&body)
    }

    fn add_file(&self, path: &Path, options: &AddOptions) -> GatewayResult<()> {
        let response = self.send(|| {
            let mut form = Form::new().file("torrents", path)?;
            for (name, value) in options.form_fields() {
                form = form.text(name, value);
            }
            Ok(self.http.post(self.url("torrents/add")).multipart(form))
        })?;
        check_add_response(&response.text()?)
    }
}

fn check_add_response(body: &str) -> GatewayResult<()> {
    if body.trim() == "Fails." {
        return Err(GatewayError::Rejected(
            "torrent could not be added".to_string(),
        ));
    }
    Ok(())
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct MainData {
    #[serde(default)]
    rid: u64,
    #[serde(default)]
    full_update: bool,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    torrents: HashMap<String, PartialRecord>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    torrents_removed: Vec<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    categories: HashMap<String, WireCategory>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    categories_removed: Vec<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    tags: Vec<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    tags_removed: Vec<String>,
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    server_state: PartialServerState,
}

impl MainData {
    fn into_update(self) -> SyncUpdate {
        if self.full_update {
            SyncUpdate::Full(self.into_full())
        } else {
            SyncUpdate::Delta(self.into_delta())
        }
    }

    fn into_full(self) -> FullSnapshot {
        FullSnapshot {
            cursor: self.rid,
            records: self.torrents,
            categories: self
                .categories
                .into_iter()
                .map(|(name, wire)| (name, wire.into_partial().into_category()))
                .collect::<HashMap<String, Category>>(),
            tags: self.tags.into_iter().collect::<BTreeSet<_>>(),
            server: self.server_state,
        }
    }

    fn into_delta(self) -> Delta {
        Delta {
            cursor: self.rid,
            upserted: self.torrents,
            removed: self.torrents_removed,
            categories_upserted: self
                .categories
                .into_iter()
                .map(|(name, wire)| (name, wire.into_partial()))
                .collect(),
            categories_removed: self.categories_removed,
            tags_added: self.tags,
            tags_removed: self.tags_removed,
            server: self.server_state,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCategory {
    #[serde(default, alias = "savePath")]
    save_path: Option<String>,
    // A string, or `false` when the category has no download path.
    #[serde(default)]
    download_path: Option<Value>,
}

impl WireCategory {
    fn into_partial(self) -> PartialCategory {
        let download_path = self.download_path.and_then(|value| match value {
            Value::String(path) => Some(path),
            Value::Bool(false) => Some(String::new()),
            _ => None,
        });
        PartialCategory {
            save_path: self.save_path,
            download_path,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireProperties {
    #[serde(default)]
    save_path: String,
    #[serde(default)]
    creation_date: i64,
    #[serde(default)]
    comment: String,
    #[serde(default)]
    total_wasted: i64,
    #[serde(default)]
    pieces_num: i64,
    #[serde(default)]
    piece_size: i64,
    #[serde(default)]
    seeding_time: i64,
    #[serde(default)]
    share_ratio: f64,
    #[serde(default)]
    addition_date: i64,
    #[serde(default)]
    completion_date: i64,
}

impl From<WireProperties> for Properties {
    fn from(wire: WireProperties) -> Self {
        Properties {
            save_path: wire.save_path,
            creation_date: wire.creation_date,
            comment: wire.comment,
            total_wasted: wire.total_wasted,
            pieces_num: wire.pieces_num,
            piece_size: wire.piece_size,
            seeding_time: wire.seeding_time,
            share_ratio: wire.share_ratio,
            addition_date: wire.addition_date,
            completion_date: wire.completion_date,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct WireTracker {
    #[serde(default)]
    url: String,
    #[serde(default)]
    status: i64,
    // Pseudo-trackers (DHT, PeX, LSD) report an empty string here.
    #[serde_as(as = "DefaultOnError")]
    #[serde(default)]
    tier: i64,
    #[serde_as(as = "DefaultOnError")]
    #[serde(default)]
    num_peers: i64,
    #[serde(default)]
    msg: String,
}

impl From<WireTracker> for TrackerEntry {
    fn from(wire: WireTracker) -> Self {
        TrackerEntry {
            url: wire.url,
            status: wire.status,
            tier: wire.tier,
            num_peers: wire.num_peers,
            msg: wire.msg,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    priority: i64,
}

impl From<WireFile> for FileEntry {
    fn from(wire: WireFile) -> Self {
        FileEntry {
            name: wire.name,
            size: wire.size,
            progress: wire.progress,
            priority: wire.priority,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct WirePeers {
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    peers: HashMap<String, WirePeer>,
}

#[derive(Debug, Deserialize)]
struct WirePeer {
    #[serde(default)]
    client: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    dl_speed: i64,
    #[serde(default)]
    up_speed: i64,
    #[serde(default)]
    country: String,
}

impl WirePeers {
    fn into_entries(self) -> Vec<PeerEntry> {
        let mut entries: Vec<PeerEntry> = self
            .peers
            .into_iter()
            .map(|(address, peer)| PeerEntry {
                address,
                client: peer.client,
                progress: peer.progress,
                dl_speed: peer.dl_speed,
                up_speed: peer.up_speed,
                country: peer.country,
            })
            .collect();
        entries.sort_by(|a, b| b.dl_speed.cmp(&a.dl_speed).then(a.address.cmp(&b.address)));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_full_update() {
        let body = r#"{
            "rid": 1,
            "full_update": true,
            "torrents": {
                "abc": {"name": "ubuntu.iso", "size": 100, "state": "downloading", "tags": "os"}
            },
            "categories": {
                "linux": {"name": "linux", "savePath": "/data/linux", "download_path": false}
            },
            "tags": ["os"],
            "server_state": {"connection_status": "connected", "dl_info_speed": 12}
        }"#;
        let data: MainData = serde_json::from_str(body).unwrap();
        let SyncUpdate::Full(full) = data.into_update() else {
            panic!("expected a full update");
        };
        assert_eq!(full.cursor, 1);
        assert_eq!(full.records["abc"].name.as_deref(), Some("ubuntu.iso"));
        assert_eq!(full.records["abc"].dlspeed, None);
        assert_eq!(full.categories["linux"].save_path, "/data/linux");
        assert_eq!(full.categories["linux"].download_path, "");
        assert!(full.tags.contains("os"));
        assert_eq!(full.server.dl_info_speed, Some(12));
    }

    #[test]
    fn decodes_delta_with_removals_and_nulls() {
        let body = r#"{
            "rid": 7,
            "torrents": {"abc": {"dlspeed": 2048}},
            "torrents_removed": ["def"],
            "categories_removed": null,
            "tags_removed": ["old"]
        }"#;
        let data: MainData = serde_json::from_str(body).unwrap();
        let SyncUpdate::Delta(delta) = data.into_update() else {
            panic!("expected a delta");
        };
        assert_eq!(delta.cursor, 7);
        assert_eq!(
            delta.upserted["abc"],
            PartialRecord {
                dlspeed: Some(2048),
                ..PartialRecord::default()
            }
        );
        assert_eq!(delta.removed, vec!["def".to_string()]);
        assert!(delta.categories_removed.is_empty());
        assert_eq!(delta.tags_removed, vec!["old".to_string()]);
        assert_eq!(delta.server, PartialServerState::default());
    }

    #[test]
    fn category_delta_decodes_only_sent_keys() {
        let body = r#"{
            "rid": 2,
            "categories": {
                "linux": {"savePath": "/srv/linux"},
                "iso": {"download_path": false}
            }
        }"#;
        let data: MainData = serde_json::from_str(body).unwrap();
        let SyncUpdate::Delta(delta) = data.into_update() else {
            panic!("expected a delta");
        };
        assert_eq!(
            delta.categories_upserted["linux"],
            PartialCategory {
                save_path: Some("/srv/linux".into()),
                download_path: None,
            }
        );
        assert_eq!(
            delta.categories_upserted["iso"],
            PartialCategory {
                save_path: None,
                download_path: Some(String::new()),
            }
        );
    }

    #[test]
    fn tolerates_blank_tracker_tiers() {
        let body = r#"[
            {"url": "** [DHT] **", "status": 2, "tier": "", "num_peers": 14, "msg": ""},
            {"url": "http://t.example.org/announce", "status": 4, "tier": 0, "num_peers": -1, "msg": "timed out"}
        ]"#;
        let trackers: Vec<WireTracker> = serde_json::from_str(body).unwrap();
        let entries: Vec<TrackerEntry> = trackers.into_iter().map(TrackerEntry::from).collect();
        assert_eq!(entries[0].tier, 0);
        assert_eq!(entries[0].num_peers, 14);
        assert_eq!(entries[1].status_label(), "not working");
    }

    #[test]
    fn peers_are_keyed_by_address() {
        let body = r#"{"peers": {
            "10.0.0.1:6881": {"client": "qBittorrent", "dl_speed": 5},
            "10.0.0.2:6881": {"client": "Transmission", "dl_speed": 50}
        }}"#;
        let peers: WirePeers = serde_json::from_str(body).unwrap();
        let entries = peers.into_entries();
        assert_eq!(entries[0].address, "10.0.0.2:6881");
        assert_eq!(entries[1].client, "qBittorrent");
    }

    #[test]
    fn add_options_skip_blank_fields() {
        let options = AddOptions {
            category: Some(String::new()),
            paused: true,
        };
        assert_eq!(
            options.form_fields(),
            vec![
                ("paused", "true".to_string()),
                ("stopped", "true".to_string())
            ]
        );
        let options = AddOptions {
            category: Some("linux".into()),
            paused: false,
        };
        assert_eq!(
            options.form_fields(),
            vec![("category", "linux".to_string())]
        );
        assert!(check_add_response("Fails.").is_err());
        assert!(check_add_response("Ok.").is_ok());
    }
}
