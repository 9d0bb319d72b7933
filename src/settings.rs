use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use url::Url;

use crate::pdf::{DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_WORKERS, PipelineConfig, default_origin};

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "pagepool";

/// Log verbosity as written in the settings file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Render worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Origin for freshness tokens; the working directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default = "default_background")]
    pub default_background: String,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_background() -> String {
    "white".to_string()
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            workers: default_workers(),
            origin: None,
            default_background: default_background(),
            http_timeout_secs: default_http_timeout_secs(),
            log_level: LogLevel::default(),
        }
    }
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

pub fn load_settings() {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return;
    };

    if path.exists() {
        load_settings_from_path(&path);
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        if let Ok(settings) = SETTINGS.read() {
            save_settings_to_file(&settings, &path);
        }
    }
}

pub fn load_settings_from_path(path: &Path) {
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");

                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    save_settings_to_file(&settings, path);
                }

                if let Ok(mut global) = SETTINGS.write() {
                    *global = settings;
                }
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}

fn save_settings_to_file(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let content = generate_settings_yaml(settings);

    match fs::write(path, content) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push_str("# Render worker threads\n");
    content.push_str(&format!("workers: {}\n", settings.workers));
    content.push_str("# Sources under this URL get the asset-hash freshness token\n");
    match &settings.origin {
        Some(origin) => content.push_str(&format!("origin: \"{origin}\"\n")),
        None => content.push_str("# origin: \"file:///path/to/assets/\"\n"),
    }
    content.push_str(&format!(
        "default_background: \"{}\"\n",
        settings.default_background
    ));
    content.push_str(&format!(
        "http_timeout_secs: {}\n",
        settings.http_timeout_secs
    ));
    content.push_str(&format!("log_level: {}\n", settings.log_level.as_str()));

    content
}

// Public API for accessing settings

pub fn get_workers() -> usize {
    SETTINGS
        .read()
        .map(|s| s.workers)
        .unwrap_or_else(|_| default_workers())
}

pub fn get_default_background() -> String {
    SETTINGS
        .read()
        .map(|s| s.default_background.clone())
        .unwrap_or_else(|_| default_background())
}

pub fn get_http_timeout() -> Duration {
    let secs = SETTINGS
        .read()
        .map(|s| s.http_timeout_secs)
        .unwrap_or_else(|_| default_http_timeout_secs());
    Duration::from_secs(secs)
}

pub fn get_log_level() -> LogLevel {
    SETTINGS.read().map(|s| s.log_level).unwrap_or_default()
}

/// Configured origin, falling back to the working directory
pub fn get_origin() -> Url {
    let configured = SETTINGS.read().ok().and_then(|s| s.origin.clone());
    match configured {
        Some(origin) => match Url::parse(&origin) {
            Ok(url) => url,
            Err(e) => {
                warn!("Ignoring invalid origin {origin:?}: {e}");
                default_origin()
            }
        },
        None => default_origin(),
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        workers: get_workers(),
        origin: get_origin(),
    }
}
