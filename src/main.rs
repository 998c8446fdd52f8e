mod api;
mod columns;
mod config;
mod filter;
mod model;
mod selection;
mod sort;
mod sync;
mod table;
mod tui;

use std::{fs::OpenOptions, path::Path, process};

use anyhow::{Context, Result};
use clap::Parser;
use config::{build_config, Cli};
use env_logger::{Env, Target};
use log::{warn, LevelFilter};

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    init_logging(config.log_level, config.log_file.as_deref())?;
    for warning in &config.warnings {
        warn!("{warning}");
    }
    tui::run(config)
}

/// Logs go to `log_file` when set; otherwise only errors reach stderr.
fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let (level, target) = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            (level, Target::Pipe(Box::new(file)))
        }
        None => (level.min(LevelFilter::Error), Target::Stderr),
    };
    let env = Env::default().default_filter_or(level.to_string());
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .target(target)
        .try_init();
    Ok(())
}
