use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dimse::{DimseError, RemoteNode, ScuOperations, StoreListener};

use crate::error::TransportError;
use crate::scheduler::RetrievalScheduler;
use crate::transport::dimse_jobs::{plan_queries, run_jobs, DimseOp, DimseRetrieveJob};
use crate::transport::{
    RetrieveRequest, RetrieveTransport, StateCell, TransportKind, TransportOutcome, TransportState,
};

/// C-MOVE: the archive pushes the instances to our local C-STORE listener,
/// addressed by the calling AE title.
///
/// The listener is started in `prepare` and stopped in `teardown`. A listener
/// that is already running belongs to another retrieve and is left alone.
pub struct CMoveTransport {
    scu: Arc<dyn ScuOperations>,
    node: RemoteNode,
    listener: Option<Arc<dyn StoreListener>>,
    scheduler: RetrievalScheduler,
    started: AtomicBool,
    state: StateCell,
}

impl CMoveTransport {
    pub fn new(
        scu: Arc<dyn ScuOperations>,
        node: RemoteNode,
        listener: Option<Arc<dyn StoreListener>>,
        scheduler: RetrievalScheduler,
    ) -> Self {
        Self {
            scu,
            node,
            listener,
            scheduler,
            started: AtomicBool::new(false),
            state: StateCell::new(TransportKind::CMove),
        }
    }

    async fn start_listener(&self) -> Result<(), TransportError> {
        let Some(listener) = &self.listener else {
            return Err(TransportError::ListenerUnavailable(
                "no DICOM listener is configured".into(),
            ));
        };
        if listener.is_running() {
            return Err(TransportError::ListenerUnavailable("already running".into()));
        }
        match listener.start().await {
            Ok(()) => {}
            // Started by another retrieve since the check above; that one stops it
            Err(DimseError::AlreadyRunning(key)) => {
                tracing::warn!("DICOM listener {} was started by another retrieve", key);
                return Err(TransportError::ListenerUnavailable(format!(
                    "already running ({})",
                    key
                )));
            }
            Err(e) => {
                tracing::error!("Start DICOM listener: {}", e);
                if let Err(stop_err) = listener.stop().await {
                    tracing::warn!("cannot stop DICOM listener after failed start: {}", stop_err);
                }
                return Err(TransportError::ListenerUnavailable(e.to_string()));
            }
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn transfer(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError> {
        let listener = match &self.listener {
            Some(listener) if self.started.load(Ordering::SeqCst) => listener,
            _ => {
                return Err(TransportError::ListenerUnavailable(
                    "listener was not started".into(),
                ))
            }
        };
        if request.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let destination = self.scu.calling_aet().to_string();
        let storage_dir = listener.storage_dir().to_path_buf();
        let jobs: Vec<_> = plan_queries(request)
            .into_iter()
            .map(|(query, priority)| {
                (
                    DimseRetrieveJob {
                        scu: Arc::clone(&self.scu),
                        node: self.node.clone(),
                        query,
                        op: DimseOp::Move {
                            destination: destination.clone(),
                        },
                        output_dir: storage_dir.clone(),
                    },
                    priority,
                )
            })
            .collect();

        tracing::info!(
            "C-MOVE of {} studies from {} to {}",
            request.study_uids.len(),
            self.node,
            destination
        );
        self.state.set(TransportState::Transferring);
        run_jobs(&self.scheduler, jobs, request).await?;
        Ok(TransportOutcome::LocalFiles(storage_dir))
    }
}

#[async_trait]
impl RetrieveTransport for CMoveTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CMove
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn prepare(&self) -> Result<(), TransportError> {
        let result = self.start_listener().await;
        match &result {
            Ok(()) => self.state.set(TransportState::Associated),
            Err(_) => self.state.set(TransportState::Failed),
        }
        result
    }

    async fn execute(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError> {
        let result = self.transfer(request).await;
        self.state.finish(&result);
        result
    }

    async fn teardown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = &self.listener {
            if let Err(e) = listener.stop().await {
                tracing::warn!("cannot stop DICOM listener: {}", e);
            }
        }
    }

    fn local_dir(&self) -> Option<PathBuf> {
        self.listener
            .as_ref()
            .map(|listener| listener.storage_dir().to_path_buf())
    }
}
