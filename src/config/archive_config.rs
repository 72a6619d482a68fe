use dimse::RemoteNode;
use serde::Deserialize;

use crate::config::config::ConfigError;

/// Remote archive queried by the resolver
#[derive(Debug, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_id")]
    pub id: String,

    /// DICOMweb base URL (QIDO-RS and WADO-RS)
    #[serde(default)]
    pub base_url: String,

    /// Appended to every QIDO-RS query string
    #[serde(default)]
    pub query_ext: Option<String>,

    /// Appended to the WADO-RS Accept header
    #[serde(default)]
    pub accept_ext: Option<String>,

    /// Repeat `includefield=` for every tag instead of a comma list
    #[serde(default)]
    pub multi_params: bool,

    /// Resolve whole studies when a series or an instance is requested
    #[serde(default)]
    pub show_whole_study: bool,

    /// `Name: value` headers for QIDO-RS requests
    #[serde(default)]
    pub query_headers: Vec<String>,

    /// `Name: value` headers for WADO-RS requests
    #[serde(default)]
    pub retrieve_headers: Vec<String>,

    #[serde(default)]
    pub web_login: Option<String>,

    /// DIMSE peer of the archive (C-FIND, C-GET, C-MOVE)
    #[serde(default)]
    pub dimse: Option<RemoteNode>,
}

/// Kind of DICOMweb service a web node offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebType {
    Wado,
    Qido,
    Stow,
}

/// Configured DICOMweb endpoint, used to pick a WADO-RS base for manifests
#[derive(Debug, Clone, Deserialize)]
pub struct WebNodeConfig {
    pub name: String,
    pub url: String,
    pub web_type: WebType,
    #[serde(default)]
    pub headers: Vec<String>,
}

impl ArchiveConfig {
    pub(crate) fn normalize(&mut self) {
        let trimmed = self.base_url.trim().trim_end_matches('/').to_string();
        self.base_url = trimmed;
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingBaseUrl);
        }
        url::Url::parse(&self.base_url)
            .map_err(|_| ConfigError::InvalidBaseUrl(self.base_url.clone()))?;
        parse_headers(&self.query_headers)?;
        parse_headers(&self.retrieve_headers)?;
        Ok(())
    }

    /// Parsed QIDO-RS headers
    pub fn query_header_pairs(&self) -> Vec<(String, String)> {
        parse_headers(&self.query_headers).unwrap_or_default()
    }

    /// Parsed WADO-RS headers
    pub fn retrieve_header_pairs(&self) -> Vec<(String, String)> {
        parse_headers(&self.retrieve_headers).unwrap_or_default()
    }

    /// Hostname of the archive's DIMSE peer, or of the base URL
    pub fn host(&self) -> Option<String> {
        if let Some(node) = &self.dimse {
            return Some(node.host.clone());
        }
        url::Url::parse(&self.base_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
    }
}

impl WebNodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidValue {
            field: format!("web_nodes.{}.url", self.name),
            reason: e.to_string(),
        })?;
        parse_headers(&self.headers)?;
        Ok(())
    }

    pub fn header_pairs(&self) -> Vec<(String, String)> {
        parse_headers(&self.headers).unwrap_or_default()
    }

    pub fn hostname(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).to_string()))
    }
}

/// Parse `Name: value` header lines.
///
/// Names are lowercased. An `authorization` value written as a query-style
/// `&access_token=XYZ` becomes `Bearer XYZ`.
pub fn parse_headers(lines: &[String]) -> Result<Vec<(String, String)>, ConfigError> {
    lines
        .iter()
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidHeader(line.clone()))?;
            let name = name.trim().to_lowercase();
            if name.is_empty() {
                return Err(ConfigError::InvalidHeader(line.clone()));
            }
            Ok((name.clone(), rewrite_header_value(&name, value.trim())))
        })
        .collect()
}

fn rewrite_header_value(name: &str, value: &str) -> String {
    const TOKEN_PREFIX: &str = "&access_token=";
    if name == "authorization" && value.len() > TOKEN_PREFIX.len() {
        if let Some(token) = value.strip_prefix(TOKEN_PREFIX) {
            return format!("Bearer {}", token);
        }
    }
    value.to_string()
}

fn default_archive_id() -> String {
    "archive".to_string()
}
