//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::DEFAULT_DIMSE_PORT;

/// Configuration of the local DIMSE application entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local (calling) Application Entity Title
    pub local_aet: String,

    /// Bind address for the C-STORE listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for the C-STORE listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// TCP connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Timeout for association acceptance (ACSE) in milliseconds
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_ms: u64,

    /// Timeout waiting for DIMSE messages in milliseconds
    #[serde(default = "default_dimse_timeout")]
    pub dimse_timeout_ms: u64,

    /// Storage directory for received and extracted DICOM files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "ARCFETCH_SCU".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            accept_timeout_ms: default_accept_timeout(),
            dimse_timeout_ms: default_dimse_timeout(),
            storage_dir: default_storage_dir(),
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get association acceptance timeout as Duration
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    /// Get DIMSE message timeout as Duration
    pub fn dimse_timeout(&self) -> Duration {
        Duration::from_millis(self.dimse_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet, "Local")?;

        if self.port == 0 {
            return Err(crate::error::DimseError::config("Port must be greater than 0"));
        }

        if self.connect_timeout_ms == 0 || self.accept_timeout_ms == 0 || self.dimse_timeout_ms == 0
        {
            return Err(crate::error::DimseError::config(
                "DIMSE timeouts must be greater than 0",
            ));
        }

        if !self.storage_dir.exists() {
            std::fs::create_dir_all(&self.storage_dir).map_err(|e| {
                crate::error::DimseError::config(format!(
                    "Failed to create storage directory: {}",
                    e
                ))
            })?;
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title, "Remote")?;

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

fn validate_ae_title(aet: &str, which: &str) -> crate::error::Result<()> {
    if aet.trim().is_empty() || aet.len() > 16 {
        return Err(crate::error::DimseError::config(format!(
            "{} AE title must be 1-16 characters",
            which
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_accept_timeout() -> u64 {
    5_000
}

fn default_dimse_timeout() -> u64 {
    30_000
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./tmp/dimse")
}
