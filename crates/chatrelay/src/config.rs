//! Layered configuration: built-in defaults, then the TOML file, then
//! `CHATRELAY__SECTION__KEY` environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::TimeDelta;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::inference::{InferenceClientConfig, is_valid_model_id};
use crate::relay::{
    DEFAULT_EVENT_BUFFER, DEFAULT_HISTORY_WINDOW, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MODEL,
    DEFAULT_SESSION_TTL_HOURS, DEFAULT_STREAM_IDLE_TIMEOUT_SECS, DEFAULT_SYSTEM_PROMPT,
    RelaySettings,
};

pub const APP_NAME: &str = "chatrelay";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub inference: InferenceConfig,
    pub relay: RelayConfig,
}

impl AppConfig {
    pub fn relay_settings(&self) -> Result<RelaySettings> {
        let hours = self.relay.session_ttl_hours;
        let session_ttl = TimeDelta::try_hours(hours)
            .filter(|ttl| *ttl > TimeDelta::zero())
            .ok_or_else(|| anyhow!("relay.session_ttl_hours out of range: {hours}"))?;
        let model = &self.inference.default_model;
        if !is_valid_model_id(model) {
            return Err(anyhow!("inference.default_model is not a valid model id: {model:?}"));
        }

        Ok(RelaySettings {
            default_model: self.inference.default_model.clone(),
            system_prompt: self.relay.system_prompt.clone(),
            history_window: self.relay.history_window,
            session_ttl,
            event_buffer: self.relay.event_buffer,
            idle_timeout: Duration::from_secs(self.relay.idle_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.relay.stream_idle_timeout_secs),
        })
    }

    pub fn inference_client_config(&self) -> InferenceClientConfig {
        InferenceClientConfig {
            base_url: self.inference.base_url.clone(),
            api_token: self.inference.api_token.clone().filter(|t| !t.is_empty()),
            connect_timeout: Duration::from_secs(self.inference.connect_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// CORS origins. Empty allows local development origins only.
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where `sessions.db` lives. Defaults to the XDG data directory.
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub default_model: String,
    pub connect_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        let client = InferenceClientConfig::default();
        Self {
            base_url: client.base_url,
            api_token: None,
            default_model: DEFAULT_MODEL.to_string(),
            connect_timeout_secs: client.connect_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub system_prompt: String,
    pub history_window: usize,
    pub session_ttl_hours: i64,
    pub event_buffer: usize,
    /// Seconds before a relay with no connections is dropped from memory.
    pub idle_timeout_secs: u64,
    /// Seconds the backend may go silent before a reply is cut off.
    pub stream_idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_window: DEFAULT_HISTORY_WINDOW,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            stream_idle_timeout_secs: DEFAULT_STREAM_IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
    pub data_dir: PathBuf,
}

impl AppPaths {
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    pub fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        Ok(self)
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

/// Load the config, writing a default file first if none exists.
pub fn load_or_init_config(config_file: &Path, dry_run: bool) -> Result<AppConfig> {
    if !config_file.exists() {
        if dry_run {
            log::info!(
                "dry-run: would create default config at {}",
                config_file.display()
            );
        } else {
            write_default_config(config_file)?;
        }
    }

    let env_prefix = env_prefix();
    load_config(
        config_file,
        Environment::with_prefix(env_prefix.as_str()).separator("__"),
    )
}

fn load_config(config_file: &Path, environment: Environment) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(environment)
        .build()
        .with_context(|| format!("reading config from {}", config_file.display()))?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    format!(
        "# Configuration for {}\n# File: {}\n# Environment overrides: {}__<SECTION>__<KEY>\n\n",
        APP_NAME,
        path.display(),
        env_prefix()
    )
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
