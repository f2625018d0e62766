// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Daemon and pipe configuration.
//!
//! Settings come from a YAML file, overridden by `FILE_TAILER_`-prefixed
//! environment variables where `__` separates nested keys, for example
//! `FILE_TAILER_PIPES__WEB__SINK__PORT=8080`. Raw values are validated into
//! [`DaemonConfig`] before any pipe is built.
//!
//! ```yaml
//! daemon_dir: /var/run/file-tailer/state_dir
//! pipes:
//!   web:
//!     source:
//!       work_dir: /var/log/nginx
//!       file_name: access.log
//!     sink:
//!       stream_name: nginx-access
//!       host: streams.internal
//!       port: 8080
//!       pack_size: 50
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use regex::Regex;
use serde::Deserialize;

use crate::auth::AuthSettings;
use crate::charset::Charset;
use crate::retry::RetryStrategy;

pub const ENV_PREFIX: &str = "FILE_TAILER_";

pub const DEFAULT_DAEMON_DIR: &str = "/var/run/file-tailer/state_dir";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STATE_FILE: &str = "state";
pub const DEFAULT_STATISTICS_FILE: &str = "stats";
pub const DEFAULT_STATISTICS_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_millis(3000);
pub const DEFAULT_SOURCE_FAILURE_SLEEP: Duration = Duration::from_millis(60_000);
pub const DEFAULT_VERSION: &str = "v2";
pub const DEFAULT_WRITER_POOL_SIZE: usize = 10;
pub const DEFAULT_PACK_SIZE: usize = 1;
pub const DEFAULT_SINK_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_SINK_FAILURE_SLEEP: Duration = Duration::from_millis(1000);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("missing required key `{0}`")]
    Missing(String),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
    #[error("no pipes configured")]
    NoPipes,
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl ToString) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Where records come from and how they are read.
#[derive(Debug, Clone)]
pub struct SourceConfiguration {
    pub work_dir: PathBuf,
    pub file_name: String,
    /// Anchored: a sibling must match it in full.
    pub rotation_pattern: Regex,
    pub charset: Charset,
    pub record_separator: u8,
    pub sleep_interval: Duration,
    /// Consecutive read failures tolerated before the tailer gives up. Zero
    /// retries forever.
    pub failure_retry_limit: u32,
    pub failure_sleep_interval: Duration,
}

impl SourceConfiguration {
    /// Defaults for everything but the file location. Rotated siblings are
    /// any file whose name starts with `file_name`.
    pub fn new(work_dir: impl Into<PathBuf>, file_name: impl Into<String>) -> Result<Self, ConfigError> {
        let file_name = file_name.into();
        let rotation_pattern = anchored(&default_rotation_pattern(&file_name))?;
        Ok(Self {
            work_dir: work_dir.into(),
            file_name,
            rotation_pattern,
            charset: Charset::default(),
            record_separator: b'\n',
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            failure_retry_limit: 0,
            failure_sleep_interval: DEFAULT_SOURCE_FAILURE_SLEEP,
        })
    }

    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.work_dir.join(&self.file_name)
    }
}

/// Where events go.
#[derive(Debug, Clone)]
pub struct SinkConfiguration {
    pub stream_name: String,
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub version: String,
    pub api_key: Option<String>,
    pub auth: AuthSettings,
    pub writer_pool_size: usize,
    pub pack_size: usize,
    pub failure_retry_limit: u32,
    pub failure_sleep_interval: Duration,
    pub request_timeout: Duration,
}

impl SinkConfiguration {
    #[must_use]
    pub fn new(stream_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            stream_name: stream_name.into(),
            host: host.into(),
            port,
            ssl: false,
            version: DEFAULT_VERSION.to_string(),
            api_key: None,
            auth: AuthSettings::Disabled,
            writer_pool_size: DEFAULT_WRITER_POOL_SIZE,
            pack_size: DEFAULT_PACK_SIZE,
            failure_retry_limit: DEFAULT_SINK_RETRY_LIMIT,
            failure_sleep_interval: DEFAULT_SINK_FAILURE_SLEEP,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::from_settings(self.failure_retry_limit, self.failure_sleep_interval)
    }
}

/// Everything one pipe needs. Read-only once the pipe is built.
#[derive(Debug, Clone)]
pub struct PipeConfiguration {
    pub name: String,
    pub state_file: PathBuf,
    pub statistics_file: PathBuf,
    pub statistics_sleep_interval: Duration,
    pub queue_size: usize,
    pub stop_timeout: Duration,
    pub source: SourceConfiguration,
    pub sink: SinkConfiguration,
}

impl PipeConfiguration {
    /// Keeps the checkpoint and statistics files in `state_dir`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        state_dir: impl AsRef<Path>,
        source: SourceConfiguration,
        sink: SinkConfiguration,
    ) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            name: name.into(),
            state_file: state_dir.join(DEFAULT_STATE_FILE),
            statistics_file: state_dir.join(DEFAULT_STATISTICS_FILE),
            statistics_sleep_interval: DEFAULT_STATISTICS_INTERVAL,
            queue_size: DEFAULT_QUEUE_SIZE,
            stop_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            source,
            sink,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = |k: &str| format!("pipes.{}.{k}", self.name);
        if self.queue_size == 0 {
            return Err(ConfigError::invalid(key("queue_size"), "must be positive"));
        }
        if self.sink.pack_size == 0 {
            return Err(ConfigError::invalid(key("sink.pack_size"), "must be positive"));
        }
        if self.sink.writer_pool_size == 0 {
            return Err(ConfigError::invalid(
                key("sink.writer_pool_size"),
                "must be positive",
            ));
        }
        if self.source.file_name.is_empty() {
            return Err(ConfigError::Missing(key("source.file_name")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub daemon_dir: PathBuf,
    pub log_level: String,
    pub shutdown_timeout: Duration,
    pub pipes: Vec<PipeConfiguration>,
}

impl DaemonConfig {
    /// Loads `path` and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(&figment)
    }

    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let raw: RawConfig = figment.extract()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let daemon_dir = raw
            .daemon_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DAEMON_DIR));
        if raw.pipes.is_empty() {
            return Err(ConfigError::NoPipes);
        }
        let pipes = raw
            .pipes
            .into_iter()
            .map(|(key, pipe)| pipe.into_configuration(&key, &daemon_dir))
            .collect::<Result<Vec<_>, _>>()?;
        let shutdown_timeout = raw
            .shutdown_timeout
            .map_or(DEFAULT_SHUTDOWN_TIMEOUT, Duration::from_millis);
        Ok(Self {
            daemon_dir,
            log_level: raw.log_level.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            shutdown_timeout,
            pipes,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    daemon_dir: Option<PathBuf>,
    log_level: Option<String>,
    shutdown_timeout: Option<u64>,
    pipes: BTreeMap<String, RawPipe>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPipe {
    name: Option<String>,
    state_file: Option<PathBuf>,
    statistics_file: Option<PathBuf>,
    statistics_sleep_interval: Option<u64>,
    queue_size: Option<usize>,
    stop_timeout: Option<u64>,
    source: RawSource,
    sink: RawSink,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSource {
    work_dir: Option<PathBuf>,
    file_name: Option<String>,
    rotated_file_name_pattern: Option<String>,
    charset_name: Option<String>,
    record_separator: Option<String>,
    sleep_interval: Option<u64>,
    failure_retry_limit: Option<u32>,
    failure_sleep_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSink {
    stream_name: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    ssl: Option<bool>,
    version: Option<String>,
    api_key: Option<String>,
    auth: Option<AuthSettings>,
    writer_pool_size: Option<usize>,
    pack_size: Option<usize>,
    failure_retry_limit: Option<u32>,
    failure_sleep_interval: Option<u64>,
    request_timeout: Option<u64>,
}

impl RawPipe {
    fn into_configuration(
        self,
        key: &str,
        daemon_dir: &Path,
    ) -> Result<PipeConfiguration, ConfigError> {
        let required = |field: &str| ConfigError::Missing(format!("pipes.{key}.{field}"));
        let state_dir = daemon_dir.join("pipes").join(key);

        let source = self.source;
        let work_dir = source.work_dir.ok_or_else(|| required("source.work_dir"))?;
        let file_name = source
            .file_name
            .filter(|f| !f.is_empty())
            .ok_or_else(|| required("source.file_name"))?;
        let pattern = source
            .rotated_file_name_pattern
            .unwrap_or_else(|| default_rotation_pattern(&file_name));
        let rotation_pattern = anchored(&pattern).map_err(|_| {
            ConfigError::invalid(
                format!("pipes.{key}.source.rotated_file_name_pattern"),
                format!("not a valid regex: {pattern}"),
            )
        })?;
        let charset = match source.charset_name {
            Some(name) => name.parse::<Charset>().map_err(|e| {
                ConfigError::invalid(format!("pipes.{key}.source.charset_name"), e)
            })?,
            None => Charset::default(),
        };
        let record_separator = match source.record_separator {
            Some(separator) => match separator.as_bytes() {
                [byte] => *byte,
                [] => {
                    return Err(ConfigError::invalid(
                        format!("pipes.{key}.source.record_separator"),
                        "empty",
                    ))
                }
                bytes => {
                    return Err(ConfigError::invalid(
                        format!("pipes.{key}.source.record_separator"),
                        format!("must be a single byte, got {} bytes", bytes.len()),
                    ))
                }
            },
            None => b'\n',
        };

        let sink = self.sink;
        let stream_name = sink.stream_name.ok_or_else(|| required("sink.stream_name"))?;
        let host = sink.host.ok_or_else(|| required("sink.host"))?;
        let port = sink.port.ok_or_else(|| required("sink.port"))?;

        let configuration = PipeConfiguration {
            name: self.name.unwrap_or_else(|| key.to_string()),
            state_file: state_dir.join(
                self.state_file
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_FILE)),
            ),
            statistics_file: state_dir.join(
                self.statistics_file
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATISTICS_FILE)),
            ),
            statistics_sleep_interval: millis_or(
                self.statistics_sleep_interval,
                DEFAULT_STATISTICS_INTERVAL,
            ),
            queue_size: self.queue_size.unwrap_or(DEFAULT_QUEUE_SIZE),
            stop_timeout: millis_or(self.stop_timeout, DEFAULT_SHUTDOWN_TIMEOUT),
            source: SourceConfiguration {
                work_dir,
                file_name,
                rotation_pattern,
                charset,
                record_separator,
                sleep_interval: millis_or(source.sleep_interval, DEFAULT_SLEEP_INTERVAL),
                failure_retry_limit: source.failure_retry_limit.unwrap_or(0),
                failure_sleep_interval: millis_or(
                    source.failure_sleep_interval,
                    DEFAULT_SOURCE_FAILURE_SLEEP,
                ),
            },
            sink: SinkConfiguration {
                stream_name,
                host,
                port,
                ssl: sink.ssl.unwrap_or(false),
                version: sink.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
                api_key: sink.api_key.filter(|k| !k.is_empty()),
                auth: sink.auth.unwrap_or_default(),
                writer_pool_size: sink.writer_pool_size.unwrap_or(DEFAULT_WRITER_POOL_SIZE),
                pack_size: sink.pack_size.unwrap_or(DEFAULT_PACK_SIZE),
                failure_retry_limit: sink.failure_retry_limit.unwrap_or(DEFAULT_SINK_RETRY_LIMIT),
                failure_sleep_interval: millis_or(
                    sink.failure_sleep_interval,
                    DEFAULT_SINK_FAILURE_SLEEP,
                ),
                request_timeout: millis_or(sink.request_timeout, DEFAULT_REQUEST_TIMEOUT),
            },
        };
        configuration.validate()?;
        Ok(configuration)
    }
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

fn default_rotation_pattern(file_name: &str) -> String {
    format!("{}(.*)", regex::escape(file_name))
}

fn anchored(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| ConfigError::invalid("rotated_file_name_pattern", e))
}
