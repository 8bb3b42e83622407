use std::{num::NonZeroUsize, path::Path, time::Duration};

use anyhow::{Result, anyhow};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

const DEFAULT_CACHE_SIZE: usize = 500;
const DEFAULT_FAILED_ENTRY_TTL_SECS: u64 = 300;
const DEFAULT_MAX_FILE_SIZE_MB: u64 = 512;
const DEFAULT_MAX_VALUES_PER_OWNER: usize = 256;
const DEFAULT_IDLE_OWNER_TTL_SECS: u64 = 600;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Go functions whose addresses are recorded when a Go binary is inspected.
pub const DEFAULT_GO_SYMBOLS: &[&str] = &[
    "runtime.main",
    "runtime.newproc1",
    "net/http.serverHandler.ServeHTTP",
    "net/http.(*Transport).roundTrip",
    "google.golang.org/grpc.(*Server).handleStream",
    "database/sql.(*DB).queryDC",
];

/// Executable classification configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TyperSettings {
    pub cache_size: Option<usize>,
    pub max_concurrent_inspections: Option<usize>,
    pub failed_entry_ttl_secs: Option<u64>,
    pub max_file_size_mb: Option<u64>,
    pub go_symbols: Option<Vec<String>>,
}

/// Per-process attribute tracking configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct TrackerSettings {
    pub max_values_per_owner: Option<usize>,
    pub idle_owner_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct DiscoverySettings {
    pub poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default)]
    pub typer: TyperSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

/// Validated classifier configuration.
#[derive(Debug, Clone)]
pub struct TyperConfig {
    pub cache_size: NonZeroUsize,
    pub max_concurrent_inspections: NonZeroUsize,
    /// `None` keeps failed classifications cached until LRU eviction.
    pub failed_entry_ttl: Option<Duration>,
    pub max_file_size: u64,
    pub go_symbols: Vec<String>,
}

/// Validated tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub max_values_per_owner: NonZeroUsize,
    pub idle_owner_ttl: Duration,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Loads settings from an optional YAML file, overridden by environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let s = builder
            .add_source(
                Environment::default()
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("typer.go_symbols")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = s.try_deserialize()?;
        log::debug!("Parsed settings: {:?}", settings);
        Ok(settings)
    }

    pub fn typer_config(&self) -> Result<TyperConfig> {
        let cache_size = non_zero(
            self.typer.cache_size.unwrap_or(DEFAULT_CACHE_SIZE),
            "TYPER__CACHE_SIZE",
        )?;

        let max_concurrent_inspections = match self.typer.max_concurrent_inspections {
            Some(n) => non_zero(n, "TYPER__MAX_CONCURRENT_INSPECTIONS")?,
            None => std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        };

        let failed_entry_ttl = match self
            .typer
            .failed_entry_ttl_secs
            .unwrap_or(DEFAULT_FAILED_ENTRY_TTL_SECS)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        let max_file_size_mb = self.typer.max_file_size_mb.unwrap_or(DEFAULT_MAX_FILE_SIZE_MB);
        if max_file_size_mb == 0 {
            return Err(anyhow!("TYPER__MAX_FILE_SIZE_MB must be positive"));
        }
        let max_file_size = max_file_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("TYPER__MAX_FILE_SIZE_MB is too large"))?;

        let go_symbols = match &self.typer.go_symbols {
            Some(symbols) if !symbols.is_empty() => symbols.clone(),
            _ => DEFAULT_GO_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        };

        Ok(TyperConfig {
            cache_size,
            max_concurrent_inspections,
            failed_entry_ttl,
            max_file_size,
            go_symbols,
        })
    }

    pub fn tracker_config(&self) -> Result<TrackerConfig> {
        let max_values_per_owner = non_zero(
            self.tracker
                .max_values_per_owner
                .unwrap_or(DEFAULT_MAX_VALUES_PER_OWNER),
            "TRACKER__MAX_VALUES_PER_OWNER",
        )?;

        let idle_secs = self
            .tracker
            .idle_owner_ttl_secs
            .unwrap_or(DEFAULT_IDLE_OWNER_TTL_SECS);
        if idle_secs == 0 {
            return Err(anyhow!("TRACKER__IDLE_OWNER_TTL_SECS must be positive"));
        }

        Ok(TrackerConfig {
            max_values_per_owner,
            idle_owner_ttl: Duration::from_secs(idle_secs),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.discovery
                .poll_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        )
    }
}

fn non_zero(value: usize, name: &str) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or_else(|| anyhow!("{} must be positive", name))
}
