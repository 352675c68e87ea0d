//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

pub use cli::{
    CliArgs, Command, ConvertArgs, DownloadArgs, DownloadTarget, GlobalOverrides, PollingOverrides,
    PreviewArgs, ScanArgs, StatusArgs, WatchArgs,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "scan2ebook";
const ENV_PREFIX: &str = "SCAN2EBOOK";
const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:7860";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_POLL_MAX_FAILURES: u32 = 3;
const DEFAULT_POLL_STALL_TICKS: u32 = 150;
const DEFAULT_SCAN_CONCURRENCY: usize = 2;
const DEFAULT_OUTPUT_DIR: &str = ".";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub service: ServiceSettings,
    pub polling: PollingSettings,
    pub scan: ScanSettings,
    pub output: OutputSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub base_url: Url,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingSettings {
    pub interval: Duration,
    pub max_consecutive_failures: u32,
    /// `None` when the stall guard is disabled.
    pub stall_ticks: Option<NonZeroU32>,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub concurrency: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub directory: PathBuf,
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
    load_with_env(cli, Environment::with_prefix(ENV_PREFIX).separator("__"))
}

fn load_with_env(cli: &CliArgs, environment: Environment) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(environment);

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    match &cli.command {
        Command::Convert(args) => raw.apply_polling_overrides(&args.polling),
        Command::Watch(args) => raw.apply_polling_overrides(&args.polling),
        Command::Scan(args) => {
            if let Some(concurrency) = args.concurrency {
                raw.scan.concurrency = Some(concurrency);
            }
        }
        Command::Status(_) | Command::Preview(_) | Command::Download(_) => {}
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    service: RawServiceSettings,
    polling: RawPollingSettings,
    scan: RawScanSettings,
    output: RawOutputSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.service_url.as_ref() {
            self.service.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.service.request_timeout_seconds = Some(seconds);
        }
        if let Some(directory) = overrides.output_directory.as_ref() {
            self.output.directory = Some(directory.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_polling_overrides(&mut self, overrides: &PollingOverrides) {
        if let Some(interval) = overrides.interval_ms {
            self.polling.interval_ms = Some(interval);
        }
        if let Some(max) = overrides.max_consecutive_failures {
            self.polling.max_consecutive_failures = Some(max);
        }
        if let Some(ticks) = overrides.stall_ticks {
            self.polling.stall_ticks = Some(ticks);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            service,
            polling,
            scan,
            output,
            logging,
        } = raw;

        Ok(Self {
            service: build_service_settings(service)?,
            polling: build_polling_settings(polling)?,
            scan: build_scan_settings(scan)?,
            output: build_output_settings(output)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_service_settings(service: RawServiceSettings) -> Result<ServiceSettings, LoadError> {
    let raw_url = service
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string());
    let base_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("service.base_url", format!("`{raw_url}`: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") || base_url.cannot_be_a_base() {
        return Err(LoadError::invalid(
            "service.base_url",
            "must be an absolute http(s) URL",
        ));
    }

    let timeout_secs = service
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "service.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServiceSettings {
        base_url,
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_polling_settings(polling: RawPollingSettings) -> Result<PollingSettings, LoadError> {
    let interval_ms = polling.interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "polling.interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(PollingSettings {
        interval: Duration::from_millis(interval_ms),
        max_consecutive_failures: polling
            .max_consecutive_failures
            .unwrap_or(DEFAULT_POLL_MAX_FAILURES),
        stall_ticks: NonZeroU32::new(polling.stall_ticks.unwrap_or(DEFAULT_POLL_STALL_TICKS)),
    })
}

fn build_scan_settings(scan: RawScanSettings) -> Result<ScanSettings, LoadError> {
    let value = scan.concurrency.unwrap_or(DEFAULT_SCAN_CONCURRENCY);
    let concurrency = NonZeroUsize::new(value)
        .ok_or_else(|| LoadError::invalid("scan.concurrency", "must be greater than zero"))?;
    Ok(ScanSettings { concurrency })
}

fn build_output_settings(output: RawOutputSettings) -> Result<OutputSettings, LoadError> {
    let directory = output
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "output.directory",
            "path must not be empty",
        ));
    }
    Ok(OutputSettings { directory })
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

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServiceSettings {
    base_url: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPollingSettings {
    interval_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
    stall_ticks: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawScanSettings {
    concurrency: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOutputSettings {
    directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
