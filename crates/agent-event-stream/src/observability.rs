use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const ENABLED_VAR: &str = "AGENT_EVENTS_OBSERVABILITY_ENABLED";
const LEVEL_VAR: &str = "AGENT_EVENTS_LOG_LEVEL";
const JSON_PATH_VAR: &str = "AGENT_EVENTS_JSON_LOG_PATH";
const DEFAULT_LOG_FILE: &str = "agent-events.logs.jsonl";

static INIT: OnceCell<bool> = OnceCell::new();

/// Logging settings, usually read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilitySettings {
    pub enabled: bool,
    /// `EnvFilter` directive; falls back to `RUST_LOG`, then `info`.
    pub filter: Option<String>,
    /// JSON lines go to this file; otherwise compact lines go to stdout.
    pub json_log_path: Option<PathBuf>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: None,
            json_log_path: None,
        }
    }
}

impl ObservabilitySettings {
    /// Reads `AGENT_EVENTS_OBSERVABILITY_ENABLED`, `AGENT_EVENTS_LOG_LEVEL` and
    /// `AGENT_EVENTS_JSON_LOG_PATH`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup(ENABLED_VAR)
            .map(|v| parse_flag(&v).unwrap_or(true))
            .unwrap_or(true);
        let filter = lookup(LEVEL_VAR).filter(|v| !v.trim().is_empty());
        let json_log_path = lookup(JSON_PATH_VAR)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        Self {
            enabled,
            filter,
            json_log_path,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(directive) = &self.filter
            && let Ok(filter) = EnvFilter::try_new(directive)
        {
            return filter;
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Installs the global tracing subscriber from the environment, once per
/// process. Returns whether a subscriber is installed by this crate.
pub fn init_observability() -> bool {
    init_observability_with(ObservabilitySettings::from_env())
}

/// Like [`init_observability`] with explicit settings. Only the first call
/// in a process has an effect.
pub fn init_observability_with(settings: ObservabilitySettings) -> bool {
    *INIT.get_or_init(|| install(&settings))
}

fn install(settings: &ObservabilitySettings) -> bool {
    if !settings.enabled {
        return false;
    }
    let filter = settings.env_filter();
    match &settings.json_log_path {
        Some(path) => {
            let (dir, file_name) = split_log_path(path);
            let _ = std::fs::create_dir_all(&dir);
            let json = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_target(false)
                .with_writer(tracing_appender::rolling::never(dir, file_name));
            tracing_subscriber::registry()
                .with(filter)
                .with(json)
                .try_init()
                .is_ok()
        }
        None => {
            let console = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()
                .is_ok()
        }
    }
}

fn split_log_path(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> ObservabilitySettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ObservabilitySettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_enabled_console_output() {
        assert_eq!(settings(&[]), ObservabilitySettings::default());
    }

    #[test]
    fn reads_flags_level_and_path() {
        let s = settings(&[
            (ENABLED_VAR, "off"),
            (LEVEL_VAR, "agent_event_stream=debug"),
            (JSON_PATH_VAR, "/var/log/events.jsonl"),
        ]);
        assert!(!s.enabled);
        assert_eq!(s.filter.as_deref(), Some("agent_event_stream=debug"));
        assert_eq!(s.json_log_path, Some(PathBuf::from("/var/log/events.jsonl")));
    }

    #[test]
    fn unrecognized_flag_keeps_logging_on() {
        assert!(settings(&[(ENABLED_VAR, "maybe")]).enabled);
    }

    #[test]
    fn bare_file_name_logs_to_current_dir() {
        let (dir, name) = split_log_path(Path::new("events.jsonl"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "events.jsonl");
    }
}
