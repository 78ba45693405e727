//! TOML configuration loading, validation, and persistence.
//!
//! The config is read once at startup, changed only through the setters on
//! [`Config`], and written back on demand with [`save_config`].
//!
//! ```toml
//! [auth]
//! token = "eyJ..."
//!
//! [archive]
//! path = "/home/me/Suno_Downloads"
//! embed_metadata = true
//! organize_by_month = false
//!
//! [harvest]
//! start_page = 1
//! max_pages = 0
//!
//! [logging]
//! level = "warn"
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CATALOG_URL: &str = "https://studio-api.prod.suno.com/api/feed/v2";

const LOG_LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiveConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub embed_metadata: bool,
    #[serde(default)]
    pub organize_by_month: bool,
    #[serde(default = "default_true")]
    pub write_lyrics_sidecar: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
    #[serde(default = "default_start_page")]
    pub start_page: u32,
    /// Last page number to fetch; `0` means no limit.
    #[serde(default)]
    pub max_pages: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            catalog_url: default_catalog_url(),
            start_page: default_start_page(),
            max_pages: 0,
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            page_delay_ms: default_page_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
            thumbnail_size: default_thumbnail_size(),
        }
    }
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}
fn default_start_page() -> u32 {
    1
}
fn default_workers() -> usize {
    3
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    2
}
fn default_page_delay_ms() -> u64 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    15
}
fn default_download_timeout_secs() -> u64 {
    60
}
fn default_thumbnail_size() -> u32 {
    40
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LibraryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            labels_path: None,
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    20
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// A config with every default set, archiving into `archive_path`.
    pub fn with_archive(archive_path: impl Into<PathBuf>) -> Self {
        Self {
            auth: AuthConfig::default(),
            archive: ArchiveConfig {
                path: archive_path.into(),
                embed_metadata: true,
                organize_by_month: false,
                write_lyrics_sidecar: true,
            },
            harvest: HarvestConfig::default(),
            library: LibraryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// The bearer token, if one is configured and not blank.
    pub fn token(&self) -> Option<&str> {
        self.auth
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        let token = token.into();
        self.auth.token = if token.trim().is_empty() {
            None
        } else {
            Some(token.trim().to_string())
        };
    }

    pub fn set_archive_path(&mut self, path: impl Into<PathBuf>) {
        self.archive.path = path.into();
    }

    /// Path of the persisted library scan cache.
    pub fn scan_cache_path(&self) -> PathBuf {
        self.library
            .cache_path
            .clone()
            .unwrap_or_else(|| self.archive.path.join(".sunosync").join("library_cache.json"))
    }

    /// Path of the persisted user labels.
    pub fn labels_path(&self) -> PathBuf {
        self.library
            .labels_path
            .clone()
            .unwrap_or_else(|| self.archive.path.join(".sunosync").join("labels.json"))
    }

    /// Set a persisted setting by its dotted key, as used by `sunosync config set`.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "auth.token" | "token" => self.set_token(value),
            "archive.path" | "path" => self.set_archive_path(value),
            "archive.embed_metadata" => self.archive.embed_metadata = parse_bool(key, value)?,
            "archive.organize_by_month" => {
                self.archive.organize_by_month = parse_bool(key, value)?
            }
            "archive.write_lyrics_sidecar" => {
                self.archive.write_lyrics_sidecar = parse_bool(key, value)?
            }
            "harvest.start_page" => self.harvest.start_page = parse_number(key, value)?,
            "harvest.max_pages" => self.harvest.max_pages = parse_number(key, value)?,
            "harvest.workers" => self.harvest.workers = parse_number(key, value)?,
            "harvest.catalog_url" => self.harvest.catalog_url = value.to_string(),
            "logging.level" => self.logging.level = value.to_ascii_lowercase(),
            other => bail!(
                "Unknown setting '{}'. Known: auth.token, archive.path, archive.embed_metadata, \
                 archive.organize_by_month, archive.write_lyrics_sidecar, harvest.start_page, \
                 harvest.max_pages, harvest.workers, harvest.catalog_url, logging.level",
                other
            ),
        }
        self.validate()
    }

    /// Check invariants and normalize the page range.
    pub fn validate(&mut self) -> Result<()> {
        if self.harvest.workers == 0 {
            bail!("harvest.workers must be > 0");
        }
        if self.harvest.max_attempts == 0 {
            bail!("harvest.max_attempts must be > 0");
        }
        if self.harvest.start_page == 0 {
            bail!("harvest.start_page must be >= 1");
        }
        if self.library.batch_size == 0 {
            bail!("library.batch_size must be > 0");
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            bail!(
                "Unknown logging.level: '{}'. Must be one of {}.",
                self.logging.level,
                LOG_LEVELS.join(", ")
            );
        }

        if self.harvest.max_pages > 0 && self.harvest.start_page > self.harvest.max_pages {
            log::info!(
                "Start page adjusted to {} (cannot exceed max pages)",
                self.harvest.max_pages
            );
            self.harvest.start_page = self.harvest.max_pages;
        }

        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => bail!("{} expects true or false, got '{}'", key, value),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("{} expects a number, got '{}'", key, value))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

/// Persist without failing the caller; errors are logged only.
pub fn save_config_best_effort(path: &Path, config: &Config) {
    if let Err(e) = save_config(path, config) {
        log::warn!("Could not save config: {:#}", e);
    }
}

/// TOML rendering for `sunosync config show`, with the token masked.
pub fn render_masked(config: &Config) -> Result<String> {
    let mut shown = config.clone();
    if let Some(token) = shown.auth.token.as_mut() {
        *token = mask_token(token);
    }
    toml::to_string_pretty(&shown).context("Failed to serialize config")
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}
