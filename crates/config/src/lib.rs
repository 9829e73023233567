use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "studyhall.toml",
    "config/studyhall.toml",
    "crates/config/studyhall.toml",
    "../studyhall.toml",
    "../config/studyhall.toml",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl AppConfig {
    /// Reject settings the realtime core cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.realtime.typing_idle_ms == 0 {
            bail!("realtime.typing_idle_ms must be greater than zero");
        }
        if self.realtime.message_page_size == 0 {
            bail!("realtime.message_page_size must be greater than zero");
        }
        if self.realtime.event_buffer == 0 {
            bail!("realtime.event_buffer must be greater than zero");
        }
        if self.store.max_message_length == 0 {
            bail!("store.max_message_length must be greater than zero");
        }
        Ok(())
    }
}

/// Tuning for subscriptions, typing and paging.
///
/// ```
/// use studyhall_config::RealtimeConfig;
///
/// let realtime = RealtimeConfig::default();
/// assert_eq!(realtime.typing_idle().as_secs(), 3);
/// assert_eq!(realtime.message_page_size, 50);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Idle window after the last keystroke before "stop typing" is sent;
    /// also the age after which a remote typing entry is stale
    #[serde(default = "RealtimeConfig::default_typing_idle_ms")]
    pub typing_idle_ms: u64,
    /// Recent message ids remembered per channel for insert dedupe
    #[serde(default = "RealtimeConfig::default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "RealtimeConfig::default_message_page_size")]
    pub message_page_size: usize,
}

impl RealtimeConfig {
    const fn default_typing_idle_ms() -> u64 {
        3_000
    }

    const fn default_event_buffer() -> usize {
        256
    }

    const fn default_message_page_size() -> usize {
        50
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            typing_idle_ms: Self::default_typing_idle_ms(),
            event_buffer: Self::default_event_buffer(),
            message_page_size: Self::default_message_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_max_message_length")]
    pub max_message_length: usize,
    #[serde(default = "StoreConfig::default_max_attachments")]
    pub max_attachments: usize,
}

impl StoreConfig {
    const fn default_max_message_length() -> usize {
        10_000
    }

    const fn default_max_attachments() -> usize {
        10
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_message_length: Self::default_max_message_length(),
            max_attachments: Self::default_max_attachments(),
        }
    }
}

fn to_i64(value: impl TryInto<i64>) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use studyhall_config::load;
///
/// std::env::remove_var("STUDYHALL_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(config.realtime.typing_idle_ms > 0);
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let builder = config::Config::builder()
        .set_default("realtime.typing_idle_ms", to_i64(defaults.realtime.typing_idle_ms))?
        .set_default("realtime.event_buffer", to_i64(defaults.realtime.event_buffer))?
        .set_default(
            "realtime.message_page_size",
            to_i64(defaults.realtime.message_page_size),
        )?
        .set_default("store.max_message_length", to_i64(defaults.store.max_message_length))?
        .set_default("store.max_attachments", to_i64(defaults.store.max_attachments))?;

    let environment_overrides = config::Environment::with_prefix("STUDYHALL").separator("__");

    let mut builder = builder;
    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("STUDYHALL_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via STUDYHALL_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    debug!(?config, "loaded studyhall configuration");
    Ok(config)
}
