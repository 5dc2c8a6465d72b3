//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheConfig;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fragcache";
const ENV_PREFIX: &str = "FRAGCACHE";
const DEFAULT_SOAK_THREADS: usize = 8;
const DEFAULT_SOAK_KEYS: usize = 16;
const DEFAULT_SOAK_ITERATIONS: usize = 1000;
const DEFAULT_SOAK_COMPUTE_MS: u64 = 1;

/// Command-line arguments for the fragcache binary.
#[derive(Debug, Parser)]
#[command(name = "fragcache", version, about = "Derived-value cache engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "FRAGCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the resolved settings and exit.
    #[command(name = "check-config")]
    CheckConfig(CheckConfigArgs),
    /// Hammer one output cache from many threads and report loader calls.
    Soak(SoakArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the entry time-to-live.
    #[arg(long = "cache-ttl-seconds", value_name = "SECONDS")]
    pub ttl_seconds: Option<u64>,

    /// Override the primary tier capacity.
    #[arg(long = "cache-max-entries", value_name = "COUNT")]
    pub max_entries: Option<usize>,

    /// Override how long readers wait for an in-flight computation (0 waits forever).
    #[arg(long = "cache-lock-timeout-ms", value_name = "MILLIS")]
    pub lock_timeout_ms: Option<u64>,

    /// Toggle the in-process second tier.
    #[arg(
        long = "cache-second-tier",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub enable_second_tier: Option<bool>,

    /// Toggle the in-process stale tier.
    #[arg(
        long = "cache-stale-tier",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub enable_stale_tier: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CheckConfigArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct SoakArgs {
    #[command(flatten)]
    pub overrides: CacheOverrides,

    /// Number of reader threads.
    #[arg(long, default_value_t = DEFAULT_SOAK_THREADS)]
    pub threads: usize,

    /// Number of distinct keys shared by the readers.
    #[arg(long, default_value_t = DEFAULT_SOAK_KEYS)]
    pub keys: usize,

    /// Lookups per thread.
    #[arg(long, default_value_t = DEFAULT_SOAK_ITERATIONS)]
    pub iterations: usize,

    /// Simulated computation time per loader call.
    #[arg(long = "compute-ms", default_value_t = DEFAULT_SOAK_COMPUTE_MS)]
    pub compute_ms: u64,

    /// Invalidate the whole cache every N lookups on thread 0 (0 disables).
    #[arg(long = "invalidate-every", default_value_t = 0)]
    pub invalidate_every: usize,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
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

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_logging_overrides(&cli.logging);
    match cli.command.as_ref() {
        Some(Command::CheckConfig(args)) => raw.apply_cache_overrides(&args.overrides),
        Some(Command::Soak(args)) => raw.apply_cache_overrides(&args.overrides),
        None => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_cache_overrides(&mut self, overrides: &CacheOverrides) {
        if let Some(ttl) = overrides.ttl_seconds {
            self.cache.ttl_seconds = ttl;
        }
        if let Some(max) = overrides.max_entries {
            self.cache.max_entries = max;
        }
        if let Some(timeout) = overrides.lock_timeout_ms {
            self.cache.lock_timeout_ms = timeout;
        }
        if let Some(enabled) = overrides.enable_second_tier {
            self.cache.enable_second_tier = enabled;
        }
        if let Some(enabled) = overrides.enable_stale_tier {
            self.cache.enable_stale_tier = enabled;
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, cache } = raw;

        let logging = build_logging_settings(logging)?;
        let cache = validate_cache_config(cache)?;

        Ok(Self { logging, cache })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn validate_cache_config(cache: CacheConfig) -> Result<CacheConfig, LoadError> {
    require_positive("cache.max_entries", cache.max_entries)?;
    require_positive("cache.uncacheable_key_limit", cache.uncacheable_key_limit)?;
    require_positive("cache.event_queue_limit", cache.event_queue_limit)?;
    require_positive("cache.consume_batch_limit", cache.consume_batch_limit)?;

    if cache.enable_second_tier {
        require_positive("cache.second_tier_max_entries", cache.second_tier_max_entries)?;
    }
    if cache.enable_stale_tier {
        require_positive("cache.stale_tier_max_entries", cache.stale_tier_max_entries)?;
        if cache.stale_ttl_seconds == 0 {
            return Err(LoadError::invalid(
                "cache.stale_ttl_seconds",
                "must be greater than zero when the stale tier is enabled",
            ));
        }
    }

    Ok(cache)
}

fn require_positive(key: &'static str, value: usize) -> Result<(), LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(())
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
