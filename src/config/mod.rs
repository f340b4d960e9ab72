//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_ACTIVITY_WINDOW_MONTHS, DEFAULT_DISPATCH_BATCH_LIMIT, MAX_ACTIVITY_WINDOW_MONTHS,
};

mod cli;

pub use cli::{AuditArgs, CliArgs, Command, GlobalOverrides, StatsArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "canopy";
const ENV_PREFIX: &str = "CANOPY";
const DEFAULT_MIRROR_TTL_MS: u64 = 300_000;
const DEFAULT_MIRROR_MAX_ENTRIES: usize = 500;

/// Fully-resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub mirror: MirrorSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_activity: bool,
    pub enable_file_stats: bool,
    pub async_derived: bool,
    pub activity_window_months: u8,
    pub dispatch_batch_limit: usize,
}

#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub ttl: Duration,
    pub max_entries: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub seed: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings from files, environment and the supplied CLI arguments.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = &cli.config_file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            cache: build_cache_settings(raw.cache)?,
            mirror: build_mirror_settings(raw.mirror)?,
            store: StoreSettings {
                seed: raw.store.seed,
            },
        })
    }
}

fn build_logging_settings(raw: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match raw.level {
        Some(level) => LevelFilter::from_str(&level)
            .map_err(|err| LoadError::invalid("logging.level", err.to_string()))?,
        None => LevelFilter::INFO,
    };

    let format = if raw.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(raw: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let activity_window_months = raw
        .activity_window_months
        .unwrap_or(DEFAULT_ACTIVITY_WINDOW_MONTHS);
    if !(1..=MAX_ACTIVITY_WINDOW_MONTHS).contains(&activity_window_months) {
        return Err(LoadError::invalid(
            "cache.activity_window_months",
            format!("must be between 1 and {MAX_ACTIVITY_WINDOW_MONTHS}"),
        ));
    }

    let dispatch_batch_limit = raw
        .dispatch_batch_limit
        .unwrap_or(DEFAULT_DISPATCH_BATCH_LIMIT);
    if dispatch_batch_limit == 0 {
        return Err(LoadError::invalid(
            "cache.dispatch_batch_limit",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        enable_activity: raw.enable_activity.unwrap_or(true),
        enable_file_stats: raw.enable_file_stats.unwrap_or(true),
        async_derived: raw.async_derived.unwrap_or(true),
        activity_window_months,
        dispatch_batch_limit,
    })
}

fn build_mirror_settings(raw: RawMirrorSettings) -> Result<MirrorSettings, LoadError> {
    let ttl_ms = raw.ttl_ms.unwrap_or(DEFAULT_MIRROR_TTL_MS);
    if ttl_ms == 0 {
        return Err(LoadError::invalid(
            "mirror.ttl_ms",
            "must be greater than zero",
        ));
    }

    let max_entries = NonZeroUsize::new(raw.max_entries.unwrap_or(DEFAULT_MIRROR_MAX_ENTRIES))
        .ok_or_else(|| LoadError::invalid("mirror.max_entries", "must be greater than zero"))?;

    Ok(MirrorSettings {
        ttl: Duration::from_millis(ttl_ms),
        max_entries,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    mirror: RawMirrorSettings,
    store: RawStoreSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(seed) = &overrides.seed {
            self.store.seed = Some(seed.clone());
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if overrides.sync_derived {
            self.cache.async_derived = Some(false);
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_activity: Option<bool>,
    enable_file_stats: Option<bool>,
    async_derived: Option<bool>,
    activity_window_months: Option<u8>,
    dispatch_batch_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMirrorSettings {
    ttl_ms: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    seed: Option<PathBuf>,
}

#[cfg(test)]
mod tests;
