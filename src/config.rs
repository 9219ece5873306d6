use serde::Deserialize;

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;

const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";
const DEFAULT_CLOB_URL: &str = "https://clob.polymarket.com";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

// ------------------------------------------------------------
// Raw file layout
// ------------------------------------------------------------
//
// This is what `config.json` looks like on disk. Every field is
// optional here so that a missing setting can be reported as
// `ConfigError::Malformed` instead of a generic parse failure.
//
// Both the snake_case keys written by earlier tooling and
// camelCase aliases are accepted.
//
#[derive(Debug, Deserialize)]
struct RawConfig {
    settings: Option<RawSettings>,

    // Absent is malformed, `[]` means "run nothing".
    markets: Option<Vec<RawMarket>>,

    api: Option<RawApi>,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(alias = "pollIntervalSeconds")]
    poll_interval_seconds: Option<u64>,

    #[serde(alias = "configReloadIntervalSeconds")]
    config_reload_interval_seconds: Option<u64>,

    #[serde(alias = "outputDirectory")]
    output_directory: Option<PathBuf>,

    #[serde(default, alias = "restartOnSettingsChange")]
    restart_on_settings_change: bool,
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    slug: Option<String>,
    name: Option<String>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawApi {
    gamma_url: Option<String>,
    clob_url: Option<String>,
    request_timeout_seconds: Option<u64>,
}

// ------------------------------------------------------------
// Validated configuration
// ------------------------------------------------------------

/// One tracked market as read from the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentConfig {
    /// Unique, stable market key (the Polymarket slug)
    pub key: String,

    /// Human-readable name, defaults to the slug
    pub display_name: String,

    pub enabled: bool,
}

/// Process-wide settings.
///
/// Replaced wholesale on every successful reload and shared behind
/// an `Arc`; never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub poll_interval: Duration,
    pub reload_interval: Duration,
    pub output_directory: PathBuf,

    /// Restart running workers when `poll_interval` or
    /// `output_directory` change on reload.
    pub restart_on_settings_change: bool,
}

impl Settings {
    /// True when a worker started with `self` would behave differently
    /// under `other`.
    pub fn worker_affecting_change(&self, other: &Settings) -> bool {
        self.poll_interval != other.poll_interval
            || self.output_directory != other.output_directory
    }
}

/// Quote / resolver endpoints. Read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    pub gamma_url: String,
    pub clob_url: String,
    pub request_timeout: Duration,
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self {
            gamma_url: DEFAULT_GAMMA_URL.to_string(),
            clob_url: DEFAULT_CLOB_URL.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

/// Enabled markets of one config snapshot. Keys are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSet {
    markets: Vec<InstrumentConfig>,
}

impl DesiredSet {
    /// Keeps only enabled entries.
    ///
    /// Callers are expected to have rejected duplicate keys already;
    /// a later duplicate is ignored here.
    pub fn from_markets(markets: impl IntoIterator<Item = InstrumentConfig>) -> Self {
        let mut seen = HashSet::new();
        let markets = markets
            .into_iter()
            .filter(|m| m.enabled)
            .filter(|m| seen.insert(m.key.clone()))
            .collect();

        Self { markets }
    }

    pub fn get(&self, key: &str) -> Option<&InstrumentConfig> {
        self.markets.iter().find(|m| m.key == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.markets.iter().map(|m| m.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstrumentConfig> {
        self.markets.iter()
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

/// Result of one successful load.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub desired: DesiredSet,
    pub settings: Settings,
    pub api: ApiEndpoints,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} not found", .0.display())]
    NotFound(PathBuf),

    #[error("config file {path} could not be parsed: {reason}")]
    Parse { path: String, reason: String },

    #[error("config file {path} is malformed: {reason}")]
    Malformed { path: String, reason: String },
}

/// Opaque change marker of the config source (file mtime).
pub type ConfigMarker = Option<SystemTime>;

// ------------------------------------------------------------
// ConfigStore
// ------------------------------------------------------------
//
// Reads the config file and tracks its modification time.
//
// It has no concurrency of its own: the reconciliation loop is the
// only caller after start-up.
//
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current modification marker, `None` if the file is unreadable.
    pub fn current_marker(&self) -> ConfigMarker {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
    }

    /// True if the file's marker differs from `marker`.
    ///
    /// Any difference counts, so restoring an older copy of the file
    /// is picked up too. A file that disappeared counts as changed.
    pub fn has_changed_since(&self, marker: ConfigMarker) -> bool {
        match (self.current_marker(), marker) {
            (Some(now), Some(seen)) => now != seen,
            (Some(_), None) => true,
            // vanished since last seen: let `load` report NotFound
            (None, Some(_)) => true,
            (None, None) => false,
        }
    }

    /// Reads and validates the whole file.
    pub fn load(&self) -> Result<ConfigSnapshot, ConfigError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(self.path.clone()));
            }
            Err(e) => return Err(self.parse_error(e)),
        };

        parse_config(&data).map_err(|e| match e {
            ParseFailure::Syntax(reason) => self.parse_error(reason),
            ParseFailure::Invalid(reason) => ConfigError::Malformed {
                path: self.path.display().to_string(),
                reason,
            },
        })
    }

    fn parse_error(&self, reason: impl ToString) -> ConfigError {
        ConfigError::Parse {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

enum ParseFailure {
    Syntax(String),
    Invalid(String),
}

fn parse_config(data: &str) -> Result<ConfigSnapshot, ParseFailure> {
    let raw: RawConfig =
        serde_json::from_str(data).map_err(|e| ParseFailure::Syntax(e.to_string()))?;

    let settings = validate_settings(raw.settings)?;
    let markets = validate_markets(raw.markets)?;

    let api = match raw.api {
        Some(api) => {
            let defaults = ApiEndpoints::default();
            ApiEndpoints {
                gamma_url: api.gamma_url.unwrap_or(defaults.gamma_url),
                clob_url: api.clob_url.unwrap_or(defaults.clob_url),
                request_timeout: api
                    .request_timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.request_timeout),
            }
        }
        None => ApiEndpoints::default(),
    };

    Ok(ConfigSnapshot {
        desired: DesiredSet::from_markets(markets),
        settings,
        api,
    })
}

fn validate_settings(raw: Option<RawSettings>) -> Result<Settings, ParseFailure> {
    let raw = raw.ok_or_else(|| ParseFailure::Invalid("missing `settings` section".into()))?;

    let poll = positive_secs(raw.poll_interval_seconds, "poll_interval_seconds")?;
    let reload = positive_secs(
        raw.config_reload_interval_seconds,
        "config_reload_interval_seconds",
    )?;

    let output_directory = raw
        .output_directory
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ParseFailure::Invalid("missing `settings.output_directory`".into()))?;

    Ok(Settings {
        poll_interval: poll,
        reload_interval: reload,
        output_directory,
        restart_on_settings_change: raw.restart_on_settings_change,
    })
}

fn positive_secs(value: Option<u64>, field: &str) -> Result<Duration, ParseFailure> {
    match value {
        Some(0) => Err(ParseFailure::Invalid(format!("`settings.{field}` must be > 0"))),
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Err(ParseFailure::Invalid(format!("missing `settings.{field}`"))),
    }
}

fn validate_markets(raw: Option<Vec<RawMarket>>) -> Result<Vec<InstrumentConfig>, ParseFailure> {
    let raw = raw.ok_or_else(|| ParseFailure::Invalid("missing `markets`".into()))?;

    let mut seen = HashSet::new();
    let mut markets = Vec::with_capacity(raw.len());

    for (idx, m) in raw.into_iter().enumerate() {
        let key = m
            .slug
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ParseFailure::Invalid(format!("markets[{idx}] has no slug")))?;

        if !seen.insert(key.clone()) {
            return Err(ParseFailure::Invalid(format!("duplicate market slug `{key}`")));
        }

        markets.push(InstrumentConfig {
            display_name: m.name.unwrap_or_else(|| key.clone()),
            enabled: m.enabled.unwrap_or(true),
            key,
        });
    }

    Ok(markets)
}
