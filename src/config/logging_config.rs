use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub log_to_file: bool,
    #[serde(default)]
    pub log_file_path: String,
    /// Default filter when `RUST_LOG` is not set (e.g. `info`, `arcfetch=debug`)
    #[serde(default)]
    pub level: Option<String>,
}
