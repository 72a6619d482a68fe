mod archive_config;
mod logging_config;
pub mod config;

pub use archive_config::{parse_headers, ArchiveConfig, WebNodeConfig, WebType};
pub use config::{Config, ConfigError, DownloadConfig, QueryKind, RetrieveConfig};
pub use logging_config::LoggingConfig;
