use std::path::{Path, PathBuf};

use dimse::{DimseConfig, DimseError};
use serde::Deserialize;
use thiserror::Error;

use crate::config::archive_config::{ArchiveConfig, WebNodeConfig};
use crate::config::logging_config::LoggingConfig;

/// Errors raised while loading or validating configuration.
///
/// They are raised before any query is issued.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("archive base URL is missing")]
    MissingBaseUrl,

    #[error("archive base URL '{0}' is not a valid URL")]
    InvalidBaseUrl(String),

    #[error("invalid HTTP header '{0}', expected 'Name: value'")]
    InvalidHeader(String),

    #[error("{0} queries need an [archive.dimse] node")]
    MissingDimseNode(String),

    #[error("invalid DIMSE configuration: {0}")]
    Dimse(#[from] DimseError),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Which query backend resolves identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryKind {
    #[default]
    Qido,
    Cfind,
}

#[derive(Debug, Deserialize)]
pub struct RetrieveConfig {
    /// `CGET`, `CMOVE` or `WADO`; checked when a retrieve task starts
    #[serde(default = "default_transport")]
    pub transport: String,

    #[serde(default)]
    pub query: QueryKind,

    /// Ask a chooser when several WADO nodes match the archive host
    #[serde(default)]
    pub interactive: bool,
}

#[derive(Debug, Deserialize)]
pub struct DownloadConfig {
    /// Series downloaded at the same time
    #[serde(default = "default_concurrent_series")]
    pub concurrent_series: usize,

    /// Instance requests in flight per series (WADO-RS downloads)
    #[serde(default = "default_concurrent_per_series")]
    pub concurrent_per_series: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Longest wait for the next bytes of a response
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Deadline for a whole request, body included; none when unset
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Submit download jobs as soon as a request is resolved
    #[serde(default = "default_true")]
    pub start_immediately: bool,

    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub dimse: DimseConfig,

    #[serde(default)]
    pub retrieve: RetrieveConfig,

    #[serde(default)]
    pub web_nodes: Vec<WebNodeConfig>,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Read, parse and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Config, ConfigError> {
        let mut config: Config = toml::from_str(raw)?;
        config.archive.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.archive.validate()?;
        for node in &self.web_nodes {
            node.validate()?;
        }
        self.download.validate()?;

        if self.retrieve.query == QueryKind::Cfind && self.archive.dimse.is_none() {
            return Err(ConfigError::MissingDimseNode("C-FIND".into()));
        }
        if let Some(node) = &self.archive.dimse {
            node.validate()?;
            self.dimse.validate()?;
        }
        Ok(())
    }
}

impl DownloadConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrent_series == 0 {
            return Err(ConfigError::InvalidValue {
                field: "download.concurrent_series".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.concurrent_per_series == 0 {
            return Err(ConfigError::InvalidValue {
                field: "download.concurrent_per_series".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.connect_timeout_ms == 0
            || self.read_timeout_ms == 0
            || self.request_timeout_ms == Some(0)
        {
            return Err(ConfigError::InvalidValue {
                field: "download timeouts".into(),
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            query: QueryKind::default(),
            interactive: false,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrent_series: default_concurrent_series(),
            concurrent_per_series: default_concurrent_per_series(),
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            request_timeout_ms: None,
            start_immediately: true,
            temp_dir: default_temp_dir(),
        }
    }
}

fn default_transport() -> String {
    "CGET".to_string()
}

fn default_concurrent_series() -> usize {
    3
}

fn default_concurrent_per_series() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_read_timeout() -> u64 {
    15_000
}

fn default_true() -> bool {
    true
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./tmp/arcfetch")
}
