use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::config::DownloadConfig;

const USER_AGENT: &str = concat!("arcfetch/", env!("CARGO_PKG_VERSION"));

/// HTTP client shared by QIDO-RS queries and WADO-RS downloads.
///
/// The read timeout bounds each wait for data, so a long download that keeps
/// receiving bytes is never cut. A whole-request deadline applies only when
/// `download.request_timeout_ms` is set.
pub fn build_http_client(download: &DownloadConfig) -> reqwest::Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_millis(download.connect_timeout_ms))
        .read_timeout(Duration::from_millis(download.read_timeout_ms))
        .user_agent(USER_AGENT)
        .tcp_nodelay(true);
    if let Some(ms) = download.request_timeout_ms {
        builder = builder.timeout(Duration::from_millis(ms));
    }
    builder.build()
}

/// Convert parsed `(name, value)` pairs, skipping the ones reqwest rejects
pub fn header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => {
                map.append(n, v);
            }
            _ => tracing::warn!("skipping invalid HTTP header {}", name),
        }
    }
    map
}
