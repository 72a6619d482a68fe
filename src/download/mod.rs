//! Direct WADO-RS download of resolved series.

pub mod multipart;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::model::{HierarchyModel, NodeRef, RetrievalField};
use crate::scheduler::{DownloadJob, JobContext, TaskOutcome};
use crate::transport::status::{http_status_to_dimse, status_message};
use multipart::{MultipartError, PartEvent, PartSplitter};

pub const WADO_ACCEPT: &str = "multipart/related; type=\"application/dicom\"";

/// Instance to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSource {
    pub sop_uid: String,
    pub url: String,
}

/// Downloads every instance of one series into a folder
pub struct SeriesDownload {
    client: Client,
    series_uid: String,
    instances: Vec<InstanceSource>,
    headers: HeaderMap,
    output_dir: PathBuf,
    concurrency: usize,
}

impl SeriesDownload {
    pub fn new(
        client: Client,
        series_uid: impl Into<String>,
        instances: Vec<InstanceSource>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(WADO_ACCEPT));
        Self {
            client,
            series_uid: series_uid.into(),
            instances,
            headers,
            output_dir: output_dir.into(),
            concurrency: 4,
        }
    }

    /// Instances of a series node that carry a direct-download URL
    pub fn from_model(
        client: Client,
        model: &HierarchyModel,
        series: &NodeRef,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        let mut instances: Vec<(Option<i64>, InstanceSource)> = model
            .children(series)
            .into_iter()
            .filter_map(|instance| {
                let url = instance.retrieval(RetrievalField::DirectDownloadFile)?;
                let number = instance.attributes().int(dicom_dictionary_std::tags::INSTANCE_NUMBER);
                let sop_uid = instance
                    .attributes()
                    .string(dicom_dictionary_std::tags::SOP_INSTANCE_UID)
                    .unwrap_or(instance.key())
                    .to_string();
                Some((number, InstanceSource { sop_uid, url }))
            })
            .collect();
        instances.sort_by(|a, b| a.0.unwrap_or(0).cmp(&b.0.unwrap_or(0)).then(a.1.sop_uid.cmp(&b.1.sop_uid)));
        Self::new(
            client,
            series.key(),
            instances.into_iter().map(|(_, i)| i).collect(),
            output_dir,
        )
    }

    /// Extra request headers; the Accept header stays the WADO one unless overridden
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name, value.clone());
        }
        self
    }

    /// Appended to the Accept header (e.g. `;transfer-syntax=*`)
    pub fn with_accept_ext(mut self, ext: Option<&str>) -> Self {
        if let Some(ext) = ext.filter(|e| !e.trim().is_empty()) {
            match HeaderValue::from_str(&format!("{}{}", WADO_ACCEPT, ext)) {
                Ok(v) => {
                    self.headers.insert(ACCEPT, v);
                }
                Err(_) => tracing::warn!("ignoring invalid accept extension {}", ext),
            }
        }
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    pub fn instances(&self) -> &[InstanceSource] {
        &self.instances
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

async fn fetch_instance(
    client: &Client,
    headers: &HeaderMap,
    source: &InstanceSource,
    output_dir: &Path,
    cancel: &CancellationToken,
) -> Result<usize, TransportError> {
    if cancel.is_cancelled() {
        return Err(TransportError::Cancelled);
    }
    tracing::debug!("GET {}", source.url);
    let response = tokio::select! {
        r = client.get(&source.url).headers(headers.clone()).send() => r,
        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
    }
    .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let code = http_status_to_dimse(status.as_u16()).code();
        let reason = status_message(code).unwrap_or("request failed");
        return Err(TransportError::DicomFailure(format!(
            "{} answered {} ({})",
            source.url, status, reason
        )));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut files = PartFiles::new(output_dir, &source.sop_uid);
    let result = stream_parts(response, &content_type, &mut files, cancel).await;
    match result {
        Ok(0) => Err(TransportError::DicomFailure(format!(
            "{} returned no DICOM part",
            source.url
        ))),
        Ok(written) => Ok(written),
        Err(e) => {
            files.discard().await;
            Err(e)
        }
    }
}

/// Writes the response body to disk as it arrives: the DICOM parts of a
/// multipart body, or the whole body otherwise. Returns the files written.
async fn stream_parts(
    mut response: reqwest::Response,
    content_type: &str,
    files: &mut PartFiles<'_>,
    cancel: &CancellationToken,
) -> Result<usize, TransportError> {
    let mut splitter = if content_type.to_lowercase().starts_with("multipart/") {
        let boundary = multipart::boundary(content_type).map_err(malformed)?;
        Some(PartSplitter::new(&boundary))
    } else {
        files.open().await.map_err(storage)?;
        None
    };

    loop {
        let next = tokio::select! {
            r = response.chunk() => r,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        let chunk = match next {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => return Err(TransportError::ConnectionError(e.to_string())),
        };
        let Some(splitter) = splitter.as_mut() else {
            files.write(&chunk).await.map_err(storage)?;
            continue;
        };
        for event in splitter.feed(&chunk).map_err(malformed)? {
            match event {
                PartEvent::Start(ct) => {
                    if multipart::is_dicom_part(ct.as_deref()) {
                        files.open().await.map_err(storage)?;
                    }
                }
                PartEvent::Data(data) => files.write(&data).await.map_err(storage)?,
                PartEvent::End => files.close().await.map_err(storage)?,
            }
        }
    }

    match &splitter {
        Some(splitter) => splitter.finish().map_err(malformed)?,
        None => files.close().await.map_err(storage)?,
    }
    Ok(files.written)
}

fn malformed(e: MultipartError) -> TransportError {
    TransportError::DicomFailure(e.to_string())
}

fn storage(e: std::io::Error) -> TransportError {
    TransportError::Storage(e.to_string())
}

/// Output files of one instance: `{sop}.dcm`, then `{sop}_1.dcm`, ...
struct PartFiles<'a> {
    dir: &'a Path,
    sop_uid: &'a str,
    current: Option<(PathBuf, tokio::fs::File)>,
    written: usize,
}

impl<'a> PartFiles<'a> {
    fn new(dir: &'a Path, sop_uid: &'a str) -> Self {
        Self {
            dir,
            sop_uid,
            current: None,
            written: 0,
        }
    }

    async fn open(&mut self) -> std::io::Result<()> {
        self.close().await?;
        let name = match self.written {
            0 => format!("{}.dcm", self.sop_uid),
            n => format!("{}_{}.dcm", self.sop_uid, n),
        };
        let path = self.dir.join(name);
        let file = tokio::fs::File::create(&path).await?;
        self.current = Some((path, file));
        Ok(())
    }

    /// Bytes outside a DICOM part are dropped
    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if let Some((_, file)) = self.current.as_mut() {
            file.write_all(data).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> std::io::Result<()> {
        if let Some((_, mut file)) = self.current.take() {
            file.flush().await?;
            self.written += 1;
        }
        Ok(())
    }

    /// Remove the partly written file of a failed download
    async fn discard(&mut self) {
        if let Some((path, file)) = self.current.take() {
            drop(file);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!("cannot remove partial file {:?}: {}", path, e);
            }
        }
    }
}

#[async_trait]
impl DownloadJob for SeriesDownload {
    fn describe(&self) -> String {
        format!("WADO-RS series {} ({} instances)", self.series_uid, self.instances.len())
    }

    async fn run(self: Box<Self>, ctx: JobContext) -> TaskOutcome {
        let total = self.instances.len() as u32;
        ctx.report(0, 0, total);
        if let Err(e) = tokio::fs::create_dir_all(&self.output_dir).await {
            return TaskOutcome::Failed(TransportError::Storage(e.to_string()));
        }

        let this = Arc::new(*self);
        let cancel = ctx.cancel.clone();
        let mut results = stream::iter(this.instances.clone())
            .map(|source| {
                let this = Arc::clone(&this);
                let cancel = cancel.clone();
                async move {
                    let r = fetch_instance(&this.client, &this.headers, &source, &this.output_dir, &cancel).await;
                    (source, r)
                }
            })
            .buffer_unordered(this.concurrency);

        let (mut completed, mut failed) = (0u32, 0u32);
        let mut last_error = None;
        while let Some((source, result)) = results.next().await {
            match result {
                Ok(_) => completed += 1,
                Err(TransportError::Cancelled) => {}
                Err(e) => {
                    tracing::error!("cannot download {}: {}", source.sop_uid, e);
                    failed += 1;
                    last_error = Some(e);
                }
            }
            ctx.report(completed, failed, total.saturating_sub(completed + failed));
            if ctx.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
        }

        match last_error {
            Some(e) if completed == 0 => TaskOutcome::Failed(e),
            Some(_) => {
                tracing::warn!(
                    "series {}: {} of {} instances failed",
                    this.series_uid,
                    failed,
                    total
                );
                TaskOutcome::Completed
            }
            None => TaskOutcome::Completed,
        }
    }
}
