//! Application configuration for Newsdesk.
//!
//! User config lives at `~/.newsdesk/newsdesk.toml`.
//! Required conductor and delegate settings have no defaults: a config that
//! omits them fails [`ConductorSettings::from_config`] and the conductor
//! never starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NewsdeskError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "newsdesk.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".newsdesk";

/// DB pool size used when `db_pool_limit` is 0.
pub const DEFAULT_DB_POOL_LIMIT: usize = 64;

/// Extractor choker size used when `extractor_limit` is 0.
pub const DEFAULT_EXTRACTOR_LIMIT: usize = 16;

/// Tags weight used when the configured one falls outside `(0, 1)`.
pub const STANDARD_TAGS_WEIGHT: f64 = 0.07132897;

/// Upper bound for the daemon loop interval.
pub const MAX_LOOP_INTERVAL: Duration = Duration::from_millis(1000);

/// Lower bound for the daemon loop interval.
pub const MIN_LOOP_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Config structs (matching newsdesk.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub conductor: ConductorConfig,

    #[serde(default)]
    pub delegate: DelegateConfig,

    /// Registered outlets.
    #[serde(default)]
    pub outlets: Vec<OutletConfig>,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Reconnect attempts before a storage call fails with a timeout.
    #[serde(default = "default_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// How long SQLite waits on a locked database before reporting busy.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_path() -> String {
    "~/.newsdesk/newsdesk.db".into()
}
fn default_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    100
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

impl DatabaseConfig {
    /// The database path with a leading `~/` expanded.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        expand_home(&self.path)
    }
}

/// `[conductor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Seconds between harvests (required).
    #[serde(default)]
    pub harvest_interval_secs: Option<u64>,

    /// Articles older than this many seconds are garbage collected (required).
    #[serde(default)]
    pub gc_interval_secs: Option<u64>,

    /// Concurrent keyword extractions (required, 0 = default).
    #[serde(default)]
    pub extractor_limit: Option<usize>,

    /// Concurrent summarizations (required, 0 = share the extractor's limit).
    #[serde(default)]
    pub summarizer_limit: Option<usize>,

    /// Pooled DB connections (0 = default).
    #[serde(default)]
    pub db_pool_limit: usize,

    /// Weight of tags against keywords in article grading.
    #[serde(default = "default_tags_weight")]
    pub tags_weight: f64,

    /// Enrichment concurrency policy.
    #[serde(default)]
    pub sync_mode: SyncMode,

    /// Maximum articles fetched per outlet and harvest.
    #[serde(default = "default_scrape_limit")]
    pub scrape_limit: usize,

    /// Daemon tick interval.
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    /// A harvest in flight for longer than this is considered stuck.
    #[serde(default = "default_harvest_watchdog_secs")]
    pub harvest_watchdog_secs: u64,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            harvest_interval_secs: None,
            gc_interval_secs: None,
            extractor_limit: None,
            summarizer_limit: None,
            db_pool_limit: 0,
            tags_weight: default_tags_weight(),
            sync_mode: SyncMode::default(),
            scrape_limit: default_scrape_limit(),
            loop_interval_ms: default_loop_interval_ms(),
            harvest_watchdog_secs: default_harvest_watchdog_secs(),
        }
    }
}

fn default_tags_weight() -> f64 {
    STANDARD_TAGS_WEIGHT
}
fn default_scrape_limit() -> usize {
    i32::MAX as usize
}
fn default_loop_interval_ms() -> u64 {
    100
}
fn default_harvest_watchdog_secs() -> u64 {
    3600
}

/// How keyword extraction and summarization run relative to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// All extractions, then all summarizations.
    Sequential,
    /// Extraction and summarization as a concurrent pair per article.
    #[default]
    Dual,
}

/// `[delegate]` section: the remote summarizer/extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    /// Summarization endpoint (required).
    #[serde(default)]
    pub summarizer_url: Option<String>,

    /// Keyword extraction endpoint (required).
    #[serde(default)]
    pub extractor_url: Option<String>,

    /// Scheme placed before the key in the `Authorization` header.
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Per-request timeout.
    #[serde(default = "default_delegate_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            summarizer_url: None,
            extractor_url: None,
            auth_scheme: default_auth_scheme(),
            api_key_env: None,
            timeout_secs: default_delegate_timeout_secs(),
        }
    }
}

fn default_auth_scheme() -> String {
    "Bearer".into()
}
fn default_delegate_timeout_secs() -> u64 {
    100
}

/// `[[outlets]]` entry: a news source scraped through CSS selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutletConfig {
    /// Name used to address the outlet in ad-hoc scrapes.
    pub name: String,
    /// Front page URL. Articles must start with it to belong to the outlet.
    pub base_url: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// URLs never treated as articles.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Regex matched against links to tell articles from section pages.
    #[serde(default)]
    pub article_pattern: Option<String>,
    pub selectors: SelectorConfig,
}

fn default_language() -> String {
    "en_US".into()
}

/// CSS selectors locating article parts on a page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub comment_section: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub comment_user: Option<String>,
    #[serde(default)]
    pub comment_text: Option<String>,
}

// ---------------------------------------------------------------------------
// Conductor settings (runtime, validated from config)
// ---------------------------------------------------------------------------

/// Admission limit of the summarizer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokerLimit {
    /// Share the extractor's permits.
    Shared,
    Bounded(usize),
}

/// Immutable snapshot the conductor runs with.
#[derive(Debug, Clone)]
pub struct ConductorSettings {
    pub harvest_interval: Duration,
    pub gc_interval: Duration,
    pub db_pool_limit: usize,
    pub extractor_limit: usize,
    pub summarizer_limit: ChokerLimit,
    pub tags_weight: f64,
    pub sync_mode: SyncMode,
    pub scrape_limit: usize,
    pub loop_interval: Duration,
    pub harvest_watchdog: Duration,
}

impl ConductorSettings {
    /// Validate the `[conductor]` and `[delegate]` sections and resolve defaults.
    ///
    /// Every missing required key is reported at once.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let c = &config.conductor;
        let mut missing = Vec::new();
        if c.harvest_interval_secs.is_none() {
            missing.push("conductor.harvest_interval_secs");
        }
        if c.gc_interval_secs.is_none() {
            missing.push("conductor.gc_interval_secs");
        }
        if c.extractor_limit.is_none() {
            missing.push("conductor.extractor_limit");
        }
        if c.summarizer_limit.is_none() {
            missing.push("conductor.summarizer_limit");
        }
        if config.delegate.summarizer_url.is_none() {
            missing.push("delegate.summarizer_url");
        }
        if config.delegate.extractor_url.is_none() {
            missing.push("delegate.extractor_url");
        }
        if !missing.is_empty() {
            return Err(NewsdeskError::config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }

        if c.harvest_watchdog_secs == 0 {
            return Err(NewsdeskError::config(
                "conductor.harvest_watchdog_secs must be at least 1",
            ));
        }

        let extractor_limit = match c.extractor_limit.unwrap_or(0) {
            0 => DEFAULT_EXTRACTOR_LIMIT,
            n => n,
        };
        let summarizer_limit = match c.summarizer_limit.unwrap_or(0) {
            0 => ChokerLimit::Shared,
            n => ChokerLimit::Bounded(n),
        };
        let db_pool_limit = match c.db_pool_limit {
            0 => DEFAULT_DB_POOL_LIMIT,
            n => n,
        };
        let tags_weight = if c.tags_weight <= 0.0 || c.tags_weight >= 1.0 {
            STANDARD_TAGS_WEIGHT
        } else {
            c.tags_weight
        };

        Ok(Self {
            harvest_interval: Duration::from_secs(c.harvest_interval_secs.unwrap_or(0)),
            gc_interval: Duration::from_secs(c.gc_interval_secs.unwrap_or(0)),
            db_pool_limit,
            extractor_limit,
            summarizer_limit,
            tags_weight,
            sync_mode: c.sync_mode,
            scrape_limit: c.scrape_limit.max(1),
            loop_interval: Duration::from_millis(c.loop_interval_ms)
                .clamp(MIN_LOOP_INTERVAL, MAX_LOOP_INTERVAL),
            harvest_watchdog: Duration::from_secs(c.harvest_watchdog_secs),
        })
    }
}

/// Check every outlet entry: unique names and parseable base URLs.
pub fn validate_outlets(config: &AppConfig) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for outlet in &config.outlets {
        if !seen.insert(outlet.name.as_str()) {
            return Err(NewsdeskError::config(format!(
                "duplicate outlet name '{}'",
                outlet.name
            )));
        }
        url::Url::parse(&outlet.base_url).map_err(|e| {
            NewsdeskError::config(format!(
                "outlet '{}' has an invalid base_url '{}': {e}",
                outlet.name, outlet.base_url
            ))
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.newsdesk/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| NewsdeskError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.newsdesk/newsdesk.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| NewsdeskError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| NewsdeskError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a starter config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| NewsdeskError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = starter_config();
    let content =
        toml::to_string_pretty(&config).map_err(|e| NewsdeskError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| NewsdeskError::io(&path, e))?;
    tracing::info!(?path, "created starter config file");

    Ok(path)
}

/// A config with every required key filled in with a placeholder value.
fn starter_config() -> AppConfig {
    AppConfig {
        conductor: ConductorConfig {
            harvest_interval_secs: Some(3600),
            gc_interval_secs: Some(14 * 24 * 3600),
            extractor_limit: Some(DEFAULT_EXTRACTOR_LIMIT),
            summarizer_limit: Some(0),
            ..ConductorConfig::default()
        },
        delegate: DelegateConfig {
            summarizer_url: Some("http://localhost:8000/summarize".into()),
            extractor_url: Some("http://localhost:8000/extract".into()),
            ..DelegateConfig::default()
        },
        ..AppConfig::default()
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| NewsdeskError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
