use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    enabled: bool,
    filter: Option<String>,
    json_path: Option<PathBuf>,
}

impl Settings {
    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("PAPERPUPPY_OBSERVABILITY")
            .map(|value| parse_bool_env(&value).unwrap_or(true))
            .unwrap_or(true);
        let filter = lookup("PAPERPUPPY_LOG_LEVEL")
            .filter(|value| EnvFilter::try_new(value).is_ok())
            .or_else(|| lookup("RUST_LOG"));
        let json_path = lookup("PAPERPUPPY_JSON_LOG_PATH")
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        Self {
            enabled,
            filter,
            json_path,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.filter
            .as_deref()
            .and_then(|filter| EnvFilter::try_new(filter).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Splits a log path into the directory and file name the appender expects.
fn appender_target(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("paperpuppy.logs.jsonl")
        .to_string();
    (dir, file_name)
}

/// Initialize tracing once per process.
///
/// Environment variables:
/// - `PAPERPUPPY_OBSERVABILITY`: optional enable/disable flag (default enabled).
/// - `PAPERPUPPY_LOG_LEVEL`: optional level/filter (`info`, `paperpuppy_stream=debug`, ...).
/// - `RUST_LOG`: used when `PAPERPUPPY_LOG_LEVEL` is unset or invalid.
/// - `PAPERPUPPY_JSON_LOG_PATH`: when set, logs are JSON lines in that file.
///   Otherwise a compact format goes to stderr, leaving stdout to the answer.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = Settings::resolve(|key| std::env::var(key).ok());
        if !settings.enabled {
            return;
        }

        let env_filter = settings.env_filter();
        if let Some(path) = settings.json_path.as_deref() {
            let (dir, file_name) = appender_target(path);
            let _ = std::fs::create_dir_all(&dir);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}
