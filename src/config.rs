use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use dirs::config_dir;
use log::LevelFilter;
use serde::Deserialize;

use crate::{
    columns::{ColumnKey, DEFAULT_VISIBLE},
    sort::{SortConfig, SortDirection},
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub poll_interval: Duration,
    pub log_level: LevelFilter,
    pub log_file: Option<PathBuf>,
    pub table: TableConfig,
    /// Torrents added from the UI start paused.
    pub add_paused: bool,
    /// Problems found while building the config, logged once logging is up.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
    pub verify_ssl: bool,
    pub user_agent: String,
    pub url: Option<String>,
}

impl ApiConfig {
    pub fn base_url(&self) -> String {
        let base = match &self.url {
            Some(url) => url.clone(),
            None => format!("{}://{}:{}", self.scheme, self.host, self.port),
        };
        base.trim_end_matches('/').to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableConfig {
    pub columns: Vec<ColumnKey>,
    pub sort: SortConfig,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            columns: DEFAULT_VISIBLE.to_vec(),
            sort: SortConfig::default(),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "qBittorrent terminal UI", long_about = None)]
pub struct Cli {
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub password: Option<String>,
    #[arg(long)]
    pub timeout: Option<f64>,
    #[arg(long)]
    pub poll_interval: Option<f64>,
    #[arg(long, action = ArgAction::SetTrue)]
    pub tls: bool,
    #[arg(long = "no-tls", action = ArgAction::SetTrue)]
    pub no_tls: bool,
    #[arg(long)]
    pub insecure: bool,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Comma-separated list of visible columns, in display order.
    #[arg(long)]
    pub columns: Option<String>,
    #[arg(long)]
    pub sort: Option<String>,
    #[arg(long)]
    pub sort_descending: bool,
    /// Tiebreak column applied after the primary sort.
    #[arg(long)]
    pub secondary_sort: Option<String>,
    #[arg(long)]
    pub add_paused: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    api: Option<FileApiConfig>,
    table: Option<FileTableConfig>,
    poll_interval: Option<f64>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    add_paused: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct FileApiConfig {
    url: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    timeout: Option<f64>,
    tls: Option<bool>,
    verify_ssl: Option<bool>,
    user_agent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileTableConfig {
    columns: Option<Vec<String>>,
    sort: Option<String>,
    sort_descending: Option<bool>,
    secondary_sort: Option<String>,
}

pub fn build_config(cli: &Cli) -> Result<AppConfig> {
    let file_config = load_file_config(cli.config.as_deref())?;
    let api_file = file_config.as_ref().and_then(|cfg| cfg.api.as_ref());
    let table_file = file_config.as_ref().and_then(|cfg| cfg.table.as_ref());
    let mut warnings = Vec::new();

    let url = cli
        .url
        .clone()
        .or_else(|| env::var("QBT_URL").ok())
        .or_else(|| api_file.and_then(|cfg| cfg.url.clone()));

    let host = cli
        .host
        .clone()
        .or_else(|| env::var("QBT_HOST").ok())
        .or_else(|| api_file.and_then(|cfg| cfg.host.clone()))
        .unwrap_or_else(|| "localhost".to_string());

    let port = cli
        .port
        .or_else(|| env_var_parse("QBT_PORT"))
        .or_else(|| api_file.and_then(|cfg| cfg.port))
        .unwrap_or(8080);

    let username = cli
        .username
        .clone()
        .or_else(|| env::var("QBT_USERNAME").ok())
        .or_else(|| api_file.and_then(|cfg| cfg.username.clone()));

    let password = cli
        .password
        .clone()
        .or_else(|| env::var("QBT_PASSWORD").ok())
        .or_else(|| api_file.and_then(|cfg| cfg.password.clone()));

    let timeout_secs = cli
        .timeout
        .or_else(|| env_float("QBT_TIMEOUT"))
        .or_else(|| api_file.and_then(|cfg| cfg.timeout))
        .unwrap_or(10.0);

    if timeout_secs <= 0.0 {
        anyhow::bail!("timeout must be positive");
    }

    let poll_secs = cli
        .poll_interval
        .or_else(|| env_float("QBT_POLL_INTERVAL"))
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.poll_interval))
        .unwrap_or(2.0);

    if poll_secs < 0.0 {
        anyhow::bail!("poll interval cannot be negative");
    }

    let tls_flag = if cli.tls {
        Some(true)
    } else if cli.no_tls {
        Some(false)
    } else {
        None
    };

    let use_tls = tls_flag
        .or_else(|| env_bool("QBT_TLS"))
        .or_else(|| api_file.and_then(|cfg| cfg.tls))
        .unwrap_or(false);

    let mut verify_ssl = api_file.and_then(|cfg| cfg.verify_ssl).unwrap_or(true);
    if let Some(value) = env_bool("QBT_VERIFY_SSL") {
        verify_ssl = value;
    }
    if cli.insecure {
        verify_ssl = false;
    }

    let scheme = api_file
        .and_then(|cfg| cfg.scheme.clone())
        .unwrap_or_else(|| if use_tls { "https" } else { "http" }.to_string());

    let user_agent = env::var("QBT_USER_AGENT")
        .ok()
        .or_else(|| api_file.and_then(|cfg| cfg.user_agent.clone()))
        .unwrap_or_else(|| concat!("qbt-tui/", env!("CARGO_PKG_VERSION")).to_string());

    let log_level_str = cli
        .log_level
        .clone()
        .or_else(|| env::var("QBT_LOG_LEVEL").ok())
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let log_level = LevelFilter::from_str(&log_level_str).unwrap_or(LevelFilter::Info);

    let log_file = cli
        .log_file
        .clone()
        .or_else(|| env::var("QBT_LOG_FILE").ok().map(PathBuf::from))
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.log_file.clone()));

    let add_paused = cli.add_paused
        || env_bool("QBT_ADD_PAUSED")
            .or_else(|| file_config.as_ref().and_then(|cfg| cfg.add_paused))
            .unwrap_or(false);

    let table = build_table_config(cli, table_file, &mut warnings);

    Ok(AppConfig {
        api: ApiConfig {
            scheme,
            host,
            port,
            username,
            password,
            timeout: Duration::from_secs_f64(timeout_secs),
            verify_ssl,
            user_agent,
            url,
        },
        poll_interval: Duration::from_secs_f64(poll_secs.max(0.0)),
        log_level,
        log_file,
        table,
        add_paused,
        warnings,
    })
}

fn build_table_config(
    cli: &Cli,
    file: Option<&FileTableConfig>,
    warnings: &mut Vec<String>,
) -> TableConfig {
    let mut table = TableConfig::default();

    let columns: Option<Vec<String>> = cli
        .columns
        .clone()
        .or_else(|| env::var("QBT_COLUMNS").ok())
        .map(|list| list.split(',').map(str::to_string).collect())
        .or_else(|| file.and_then(|cfg| cfg.columns.clone()));
    if let Some(names) = columns {
        let parsed = parse_columns(&names, warnings);
        if !parsed.is_empty() {
            table.columns = parsed;
        }
    }

    let sort = cli
        .sort
        .clone()
        .or_else(|| env::var("QBT_SORT").ok())
        .or_else(|| file.and_then(|cfg| cfg.sort.clone()));
    if let Some(key) = sort.and_then(|name| parse_column(&name, warnings)) {
        table.sort.primary = key;
    }

    let descending = cli.sort_descending
        || env_bool("QBT_SORT_DESCENDING")
            .or_else(|| file.and_then(|cfg| cfg.sort_descending))
            .unwrap_or(false);
    if descending {
        table.sort.direction = SortDirection::Descending;
    }

    table.sort.secondary = cli
        .secondary_sort
        .clone()
        .or_else(|| env::var("QBT_SECONDARY_SORT").ok())
        .or_else(|| file.and_then(|cfg| cfg.secondary_sort.clone()))
        .and_then(|name| parse_column(&name, warnings));

    table
}

fn parse_columns(names: &[String], warnings: &mut Vec<String>) -> Vec<ColumnKey> {
    names
        .iter()
        .filter(|name| !name.trim().is_empty())
        .filter_map(|name| parse_column(name, warnings))
        .collect()
}

fn parse_column(name: &str, warnings: &mut Vec<String>) -> Option<ColumnKey> {
    match name.parse() {
        Ok(key) => Some(key),
        Err(err) => {
            warnings.push(format!("ignoring {err}"));
            None
        }
    }
}

fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = path {
        return read_file_config(path);
    }

    if let Ok(env_path) = env::var("QBT_TUI_CONFIG") {
        return read_file_config(Path::new(&env_path));
    }

    if let Some(dir) = config_dir() {
        let path = dir.join("qbt-tui").join("config.toml");
        return read_file_config(&path);
    }

    Ok(None)
}

fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(parsed))
}

fn env_var_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
{
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_float(name: &str) -> Option<f64> {
    env_var_parse(name)
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|value| parse_bool(&value))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
