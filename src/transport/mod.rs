//! Retrieve strategies: DICOM C-GET, DICOM C-MOVE and DICOMweb WADO-RS.
//!
//! Every transport walks the same state machine:
//! `Pending -> Associated -> Transferring -> {Complete | Failed | Cancelled}`.
//! A transport instance serves one retrieve; [`RetrieveTask`](crate::task::RetrieveTask)
//! builds a fresh one per task through [`TransportRegistry`].

mod cget;
mod cmove;
mod dimse_jobs;
pub mod status;
mod wado;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dimse::{RemoteNode, ScuOperations, StoreListener};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, WebNodeConfig};
use crate::error::TransportError;
use crate::model::HierarchyModel;
use crate::query::QueryService;
use crate::scheduler::{DownloadPriority, Progress, RetrievalScheduler};
use crate::storage::StorageBackend;

pub use cget::CGetTransport;
pub use cmove::CMoveTransport;
pub use wado::{
    normalize_host, FirstNodeChooser, PromptNodeChooser, WadoTransport, WebNodeChooser,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    CGet,
    CMove,
    Wado,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::CGet => write!(f, "C-GET"),
            TransportKind::CMove => write!(f, "C-MOVE"),
            TransportKind::Wado => write!(f, "WADO"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "CGET" | "C-GET" => Ok(TransportKind::CGet),
            "CMOVE" | "C-MOVE" => Ok(TransportKind::CMove),
            "WADO" | "WADO-RS" | "WADORS" => Ok(TransportKind::Wado),
            other => Err(TransportError::UnsupportedRetrieveType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Pending,
    Associated,
    Transferring,
    Complete,
    Failed,
    Cancelled,
}

impl TransportState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportState::Complete | TransportState::Failed | TransportState::Cancelled
        )
    }
}

/// Current state of a transport, with logged transitions
#[derive(Debug)]
pub(crate) struct StateCell {
    kind: TransportKind,
    state: Mutex<TransportState>,
}

impl StateCell {
    pub(crate) fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Mutex::new(TransportState::Pending),
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub(crate) fn set(&self, next: TransportState) {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *guard != next {
            tracing::debug!("{} transport: {:?} -> {:?}", self.kind, *guard, next);
            *guard = next;
        }
    }

    /// Terminal state matching a result
    pub(crate) fn finish<T>(&self, result: &Result<T, TransportError>) {
        self.set(match result {
            Ok(_) => TransportState::Complete,
            Err(e) if e.is_cancelled() => TransportState::Cancelled,
            Err(_) => TransportState::Failed,
        });
    }
}

/// What a successful retrieve produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// Instances stored in a local folder
    LocalFiles(PathBuf),
    /// Manifest files for the remote-manifest loader
    Manifest(Vec<PathBuf>),
}

/// One series to retrieve
#[derive(Debug, Clone)]
pub struct SeriesTarget {
    pub study_uid: String,
    pub series_uid: String,
    pub priority: DownloadPriority,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// What to retrieve. Series targets, when present, split the retrieve into
/// one sub-request per series; otherwise the studies go out as one batch.
#[derive(Clone)]
pub struct RetrieveRequest {
    pub study_uids: Vec<String>,
    pub series: Vec<SeriesTarget>,
    pub cancel: CancellationToken,
    pub progress: Option<ProgressCallback>,
}

impl RetrieveRequest {
    pub fn studies(study_uids: Vec<String>) -> Self {
        Self {
            study_uids,
            series: Vec::new(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_series(mut self, series: Vec<SeriesTarget>) -> Self {
        for target in &series {
            if !self.study_uids.contains(&target.study_uid) {
                self.study_uids.push(target.study_uid.clone());
            }
        }
        self.series = series;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn report(&self, progress: Progress) {
        if let Some(cb) = &self.progress {
            cb(progress);
        }
    }
}

impl fmt::Debug for RetrieveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieveRequest")
            .field("study_uids", &self.study_uids)
            .field("series", &self.series.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[async_trait]
pub trait RetrieveTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn state(&self) -> TransportState;

    /// Acquire transport resources before the transfer
    async fn prepare(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn execute(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError>;

    /// Release what `prepare` acquired; runs after every `prepare`, whatever happened
    async fn teardown(&self) {}

    /// Folder handed to local import even when the retrieve failed
    fn local_dir(&self) -> Option<PathBuf> {
        None
    }
}

/// Shared collaborators the transports are built from
#[derive(Clone)]
pub struct TransportDeps {
    pub config: Arc<Config>,
    pub scu: Arc<dyn ScuOperations>,
    pub listener: Option<Arc<dyn StoreListener>>,
    pub scheduler: RetrievalScheduler,
    pub storage: Arc<dyn StorageBackend>,
    pub model: Arc<HierarchyModel>,
    /// Backend used for the WADO manifest lookups
    pub query: Arc<dyn QueryService>,
    pub chooser: Arc<dyn WebNodeChooser>,
}

/// Builds transports from the configured retrieve type
#[derive(Clone)]
pub struct TransportRegistry {
    deps: TransportDeps,
}

impl TransportRegistry {
    pub fn new(deps: TransportDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &TransportDeps {
        &self.deps
    }

    /// Transport named by `retrieve.transport`
    pub fn configured(&self) -> Result<Box<dyn RetrieveTransport>, TransportError> {
        let kind = self.deps.config.retrieve.transport.parse::<TransportKind>()?;
        self.create(kind)
    }

    pub fn create(&self, kind: TransportKind) -> Result<Box<dyn RetrieveTransport>, TransportError> {
        let deps = &self.deps;
        if deps.scu.calling_aet().trim().is_empty() {
            return Err(TransportError::NoCallingNode);
        }
        match kind {
            TransportKind::CGet => {
                let dir = deps.storage.task_dir("cget_")?;
                Ok(Box::new(CGetTransport::new(
                    Arc::clone(&deps.scu),
                    self.remote_node()?,
                    deps.scheduler.clone(),
                    Arc::clone(&deps.storage),
                    dir,
                )))
            }
            TransportKind::CMove => Ok(Box::new(CMoveTransport::new(
                Arc::clone(&deps.scu),
                self.remote_node()?,
                deps.listener.clone(),
                deps.scheduler.clone(),
            ))),
            TransportKind::Wado => {
                let host = deps.config.archive.host().unwrap_or_default();
                Ok(Box::new(WadoTransport::new(
                    host,
                    wado_nodes(&deps.config.web_nodes),
                    Arc::clone(&deps.chooser),
                    Arc::clone(&deps.model),
                    Arc::clone(&deps.query),
                    Arc::clone(&deps.storage),
                )))
            }
        }
    }

    fn remote_node(&self) -> Result<RemoteNode, TransportError> {
        self.deps.config.archive.dimse.clone().ok_or_else(|| {
            TransportError::ConnectionError("no DICOM node configured for the archive".into())
        })
    }
}

fn wado_nodes(nodes: &[WebNodeConfig]) -> Vec<WebNodeConfig> {
    nodes
        .iter()
        .filter(|n| n.web_type == crate::config::WebType::Wado)
        .cloned()
        .collect()
}
