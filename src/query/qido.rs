use async_trait::async_trait;
use dicom_attrs::{parse_json_array, Attributes};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};

use crate::config::{ArchiveConfig, DownloadConfig};
use crate::error::QueryError;
use crate::http::{build_http_client, header_map};
use crate::query::service::{LevelQuery, QueryService, StudyKey};

/// Patient and study fields requested with every study-level query
const STUDY_FIELDS: &str =
    "00080020,00080030,00080050,00080061,00080090,00081030,00100010,00100020,00100021,00100030,00100040,0020000D,00200010";
const SERIES_FIELDS: &str = "0008103E,00080060,0020000E,00200011,00081190";
const INSTANCE_FIELDS: &str = "00080018,00200013,00081190";
/// Extra fields when querying series without a study
const SERIES_LOOKUP_FIELDS: &str = "0008103E,00080060,00081190,00200011";
/// Extra fields when querying instances without a series
const INSTANCE_LOOKUP_FIELDS: &str = "0008103E,00080060,0020000E,00200011,00200013,00081190";

const DICOM_JSON: &str = "application/dicom+json";

/// QIDO-RS query backend
#[derive(Debug, Clone)]
pub struct QidoClient {
    client: Client,
    base_url: String,
    query_ext: String,
    multi_params: bool,
    headers: Vec<(String, String)>,
}

impl QidoClient {
    pub fn new(archive: &ArchiveConfig, download: &DownloadConfig) -> Result<Self, QueryError> {
        let client = build_http_client(download)?;
        Ok(Self::with_client(client, archive))
    }

    pub fn with_client(client: Client, archive: &ArchiveConfig) -> Self {
        let query_ext = match archive.query_ext.as_deref().map(str::trim) {
            None | Some("") => String::new(),
            Some(ext) if ext.starts_with('&') => ext.to_string(),
            Some(ext) => format!("&{}", ext),
        };
        Self {
            client,
            base_url: archive.base_url.trim_end_matches('/').to_string(),
            query_ext,
            multi_params: archive.multi_params,
            headers: archive.query_header_pairs(),
        }
    }

    /// `includefield` list, either comma separated or one parameter per field
    fn fields(&self, list: &str) -> String {
        if self.multi_params {
            list.replace(',', "&includefield=")
        } else {
            list.to_string()
        }
    }

    /// Request URL for a query
    pub fn url_for(&self, query: &LevelQuery) -> String {
        let base = &self.base_url;
        let mut url = match query {
            LevelQuery::Studies(key) => {
                let matching = match key {
                    StudyKey::Patient { id, issuer } => {
                        let mut m = format!("00100020={}", urlencoding::encode(id));
                        if let Some(issuer) = issuer {
                            m.push_str(&format!("&00100021={}", urlencoding::encode(issuer)));
                        }
                        m
                    }
                    StudyKey::StudyUid(uid) => format!("0020000D={}", urlencoding::encode(uid)),
                    StudyKey::Accession(acc) => format!("00080050={}", urlencoding::encode(acc)),
                };
                format!(
                    "{}/studies?{}&includefield={}",
                    base,
                    matching,
                    self.fields(STUDY_FIELDS)
                )
            }
            LevelQuery::SeriesOfStudy { study_uid } => format!(
                "{}/studies/{}/series?includefield={}",
                base,
                urlencoding::encode(study_uid),
                self.fields(SERIES_FIELDS)
            ),
            LevelQuery::Series { series_uid } => format!(
                "{}/series?0020000E={}&includefield={}",
                base,
                urlencoding::encode(series_uid),
                self.fields(&format!("{},{}", STUDY_FIELDS, SERIES_LOOKUP_FIELDS))
            ),
            LevelQuery::InstancesOfSeries {
                study_uid,
                series_uid,
                retrieve_url,
            } => {
                let series_url = retrieve_url
                    .clone()
                    .unwrap_or_else(|| {
                        format!(
                            "{}/studies/{}/series/{}",
                            base,
                            urlencoding::encode(study_uid),
                            urlencoding::encode(series_uid)
                        )
                    });
                format!(
                    "{}/instances?includefield={}",
                    series_url,
                    self.fields(INSTANCE_FIELDS)
                )
            }
            LevelQuery::Instances { sop_uid } => format!(
                "{}/instances?00080018={}&includefield={}",
                base,
                urlencoding::encode(sop_uid),
                self.fields(&format!("{},{}", STUDY_FIELDS, INSTANCE_LOOKUP_FIELDS))
            ),
        };
        url.push_str(&self.query_ext);
        url
    }
}

#[async_trait]
impl QueryService for QidoClient {
    fn name(&self) -> &'static str {
        "QIDO-RS"
    }

    async fn find(&self, query: &LevelQuery) -> Result<Vec<Attributes>, QueryError> {
        let url = self.url_for(query);
        tracing::debug!("QIDO-RS request: {}", url);

        let response = self
            .client
            .get(&url)
            .headers(header_map(&self.headers))
            .header(ACCEPT, DICOM_JSON)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(QueryError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let mut out = Vec::new();
        for entry in parse_json_array(&body)? {
            match entry {
                Ok(attrs) => out.push(attrs),
                Err(e) => tracing::warn!("skipping undecodable QIDO-RS entry from {}: {}", url, e),
            }
        }
        Ok(out)
    }
}
