use notify::{Config as NotifyConfig, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::DaemonEvent;

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Every key accepted by `ci-monitor config`, in display order.
pub const KEYS: [&str; 6] = [
    "check_interval",
    "speech_enabled",
    "speech_command",
    "notify_success",
    "notify_failure",
    "command_timeout",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config key: {key} (valid keys: {})", KEYS.join(", "))]
    UnknownKey { key: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write config file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Daemon settings. Deserialized from `<state dir>/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between poll cycles. Must be positive.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Master switch for the notifier. When off, announcements are only logged.
    #[serde(default = "default_true")]
    pub speech_enabled: bool,
    /// Overrides speech command auto-detection, e.g. `"espeak -s 150"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_command: Option<String>,
    #[serde(default = "default_true")]
    pub notify_success: bool,
    #[serde(default = "default_true")]
    pub notify_failure: bool,
    /// Upper bound, in seconds, on each `gh` query and each speech invocation.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL_SECS,
            speech_enabled: true,
            speech_command: None,
            notify_success: true,
            notify_failure: true,
            command_timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    /// Timeout applied to external commands. Always shorter than the poll
    /// interval (except for a one-second interval) so a hung query cannot
    /// starve the rest of the cycle.
    pub fn effective_command_timeout(&self) -> Duration {
        let ceiling = self.check_interval.saturating_sub(1).max(1);
        Duration::from_secs(self.command_timeout.clamp(1, ceiling))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval == 0 {
            return Err(invalid("check_interval", "must be a positive integer"));
        }
        if self.command_timeout == 0 {
            return Err(invalid("command_timeout", "must be a positive integer"));
        }
        if matches!(&self.speech_command, Some(cmd) if cmd.trim().is_empty()) {
            return Err(invalid("speech_command", "must not be empty"));
        }
        Ok(())
    }

    /// Returns the display value of a single key.
    pub fn get(&self, key: &str) -> Result<String, ConfigError> {
        let value = match key {
            "check_interval" => self.check_interval.to_string(),
            "speech_enabled" => self.speech_enabled.to_string(),
            "speech_command" => self
                .speech_command
                .clone()
                .unwrap_or_else(|| "(auto-detect)".to_string()),
            "notify_success" => self.notify_success.to_string(),
            "notify_failure" => self.notify_failure.to_string(),
            "command_timeout" => self.command_timeout.to_string(),
            _ => return Err(ConfigError::UnknownKey { key: key.to_string() }),
        };
        Ok(value)
    }

    /// All keys with their display values, in [`KEYS`] order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        KEYS.iter()
            .filter_map(|key| self.get(key).ok().map(|value| (*key, value)))
            .collect()
    }

    /// Parses `raw` for `key` and applies it. On error `self` is untouched.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<(), ConfigError> {
        let raw = raw.trim();
        match key {
            "check_interval" => self.check_interval = parse_positive(key, raw)?,
            "command_timeout" => self.command_timeout = parse_positive(key, raw)?,
            "speech_enabled" => self.speech_enabled = parse_bool(key, raw)?,
            "notify_success" => self.notify_success = parse_bool(key, raw)?,
            "notify_failure" => self.notify_failure = parse_bool(key, raw)?,
            "speech_command" => {
                if raw.is_empty() {
                    return Err(invalid(key, "must not be empty (use `none` to auto-detect)"));
                }
                self.speech_command = if raw.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(raw.to_string())
                };
            }
            _ => return Err(ConfigError::UnknownKey { key: key.to_string() }),
        }
        Ok(())
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, ConfigError> {
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => Ok(n as u64),
        Ok(_) => Err(invalid(key, "must be a positive integer")),
        Err(_) => Err(invalid(key, "must be an integer")),
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, "expected true/false, yes/no, on/off or 1/0")),
    }
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read, parsed, or validated.
pub fn load_or_default(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Writes `config` to `path` via a temp file + rename so a concurrently
/// reloading daemon never sees a half-written document.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, content).map_err(write_err)?;
    std::fs::rename(&tmp, path).map_err(write_err)
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
/// A file that fails to parse is logged and skipped; the daemon keeps the
/// config it already has.
pub async fn watch_config(path: PathBuf, tx: mpsc::Sender<DaemonEvent>) {
    let (Some(state_dir), Some(file_name)) = (path.parent(), path.file_name()) else {
        tracing::warn!("Config path {} has no parent directory", path.display());
        return;
    };
    let file_name = file_name.to_os_string();

    let (fs_tx, mut fs_rx) = mpsc::channel::<notify::Event>(16);
    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = fs_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!("Failed to create config watcher: {e}");
            return;
        }
    };
    // Directory, not file: `save` replaces config.toml by rename.
    if let Err(e) = watcher.watch(state_dir, RecursiveMode::NonRecursive) {
        tracing::warn!("Failed to watch {}: {e}", state_dir.display());
        return;
    }

    let mut current = load_or_default(&path).ok();
    while let Some(event) = fs_rx.recv().await {
        if !touches_config(&event, &file_name) {
            continue;
        }
        match load_or_default(&path) {
            Ok(config) if current.as_ref() == Some(&config) => {}
            Ok(config) => {
                current = Some(config.clone());
                if tx.send(DaemonEvent::ConfigReloaded(config)).await.is_err() {
                    return;
                }
            }
            Err(e) => tracing::warn!("Ignoring config change: {e}"),
        }
    }
}

/// The state directory also holds the store, history and daemon log, which
/// change every cycle; only writes to the config file itself count.
fn touches_config(event: &notify::Event, file_name: &OsStr) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p.file_name() == Some(file_name))
}

fn default_check_interval() -> u64 {
    DEFAULT_CHECK_INTERVAL_SECS
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    // ── touches_config ────────────────────────────────────────────────────────

    fn fs_event(kind: EventKind, file: &str) -> notify::Event {
        notify::Event::new(kind).add_path(PathBuf::from("/state").join(file))
    }

    #[test]
    fn config_writes_trigger_reload() {
        let name = OsStr::new("config.toml");
        assert!(touches_config(&fs_event(EventKind::Modify(ModifyKind::Any), "config.toml"), name));
        assert!(touches_config(&fs_event(EventKind::Create(CreateKind::File), "config.toml"), name));
    }

    #[test]
    fn other_state_files_are_ignored() {
        let name = OsStr::new("config.toml");
        for file in ["state.db", "state.db-wal", "history.log", "daemon.log", "config.toml.tmp"] {
            assert!(
                !touches_config(&fs_event(EventKind::Modify(ModifyKind::Any), file), name),
                "{file} must not trigger a reload"
            );
        }
        assert!(!touches_config(&fs_event(EventKind::Remove(RemoveKind::File), "config.toml"), name));
    }

    // ── defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn default_values() {
        let c = Config::default();
        assert_eq!(c.check_interval, 60);
        assert!(c.speech_enabled);
        assert!(c.speech_command.is_none());
        assert!(c.notify_success);
        assert!(c.notify_failure);
        assert_eq!(c.command_timeout, DEFAULT_COMMAND_TIMEOUT_SECS);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    // ── get / set ─────────────────────────────────────────────────────────────

    #[test]
    fn set_then_get_check_interval() {
        let mut c = Config::default();
        c.set("check_interval", "30").unwrap();
        assert_eq!(c.get("check_interval").unwrap(), "30");
    }

    #[test]
    fn negative_interval_is_rejected_and_value_unchanged() {
        let mut c = Config::default();
        c.set("check_interval", "30").unwrap();
        let err = c.set("check_interval", "-5").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(c.check_interval, 30);
    }

    #[test]
    fn zero_and_non_numeric_interval_rejected() {
        let mut c = Config::default();
        assert!(c.set("check_interval", "0").is_err());
        assert!(c.set("check_interval", "soon").is_err());
        assert_eq!(c.check_interval, DEFAULT_CHECK_INTERVAL_SECS);
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let mut c = Config::default();
        for (raw, expected) in [("false", false), ("YES", true), ("off", false), ("1", true)] {
            c.set("notify_success", raw).unwrap();
            assert_eq!(c.notify_success, expected, "input {raw}");
        }
    }

    #[test]
    fn garbage_boolean_rejected() {
        let mut c = Config::default();
        assert!(c.set("speech_enabled", "maybe").is_err());
        assert!(c.speech_enabled);
    }

    #[test]
    fn speech_command_none_clears_override() {
        let mut c = Config::default();
        c.set("speech_command", "espeak -s 150").unwrap();
        assert_eq!(c.speech_command.as_deref(), Some("espeak -s 150"));
        c.set("speech_command", "None").unwrap();
        assert!(c.speech_command.is_none());
        assert_eq!(c.get("speech_command").unwrap(), "(auto-detect)");
    }

    #[test]
    fn unknown_key_rejected() {
        let mut c = Config::default();
        assert!(matches!(
            c.set("volume", "11"),
            Err(ConfigError::UnknownKey { .. })
        ));
        assert!(matches!(c.get("volume"), Err(ConfigError::UnknownKey { .. })));
    }

    #[test]
    fn entries_cover_every_key_in_order() {
        let keys: Vec<_> = Config::default().entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, KEYS.to_vec());
    }

    // ── effective_command_timeout ─────────────────────────────────────────────

    #[test]
    fn command_timeout_shorter_than_interval() {
        let mut c = Config::default();
        c.check_interval = 10;
        c.command_timeout = 30;
        assert_eq!(c.effective_command_timeout(), Duration::from_secs(9));
    }

    #[test]
    fn command_timeout_kept_when_already_short() {
        let c = Config::default();
        assert_eq!(c.effective_command_timeout(), Duration::from_secs(30));
    }

    // ── load_or_default / save ────────────────────────────────────────────────

    #[test]
    fn load_or_default_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_or_default(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn load_or_default_partial_toml_uses_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "check_interval = 120\nspeech_enabled = false\n").unwrap();

        let config = load_or_default(&path).unwrap();
        assert_eq!(config.check_interval, 120);
        assert!(!config.speech_enabled);
        assert!(config.notify_failure);
        assert!(config.speech_command.is_none());
    }

    #[test]
    fn load_or_default_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is not valid toml ][[[").unwrap();
        assert!(matches!(load_or_default(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_or_default_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "check_interval = 0\n").unwrap();
        assert!(matches!(
            load_or_default(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.set("check_interval", "120").unwrap();
        config.set("speech_enabled", "false").unwrap();
        config.set("speech_command", "spd-say").unwrap();

        save(&path, &config).unwrap();

        assert_eq!(load_or_default(&path).unwrap(), config);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn saved_file_omits_unset_speech_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        save(&path, &Config::default()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("speech_command"));
        assert!(content.contains("check_interval = 60"));
    }
}
