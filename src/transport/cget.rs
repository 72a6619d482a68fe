use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dimse::{RemoteNode, ScuOperations};

use crate::error::TransportError;
use crate::scheduler::RetrievalScheduler;
use crate::storage::StorageBackend;
use crate::transport::dimse_jobs::{plan_queries, run_jobs, DimseOp, DimseRetrieveJob};
use crate::transport::{
    RetrieveRequest, RetrieveTransport, StateCell, TransportKind, TransportOutcome, TransportState,
};

/// C-GET: the archive sends the instances back on our own association.
/// Each sub-request stores into its own folder below the task directory.
pub struct CGetTransport {
    scu: Arc<dyn ScuOperations>,
    node: RemoteNode,
    scheduler: RetrievalScheduler,
    storage: Arc<dyn StorageBackend>,
    task_dir: PathBuf,
    state: StateCell,
}

impl CGetTransport {
    pub fn new(
        scu: Arc<dyn ScuOperations>,
        node: RemoteNode,
        scheduler: RetrievalScheduler,
        storage: Arc<dyn StorageBackend>,
        task_dir: PathBuf,
    ) -> Self {
        Self {
            scu,
            node,
            scheduler,
            storage,
            task_dir,
            state: StateCell::new(TransportKind::CGet),
        }
    }

    fn output_dir(&self, series_uids: &[String]) -> Result<PathBuf, TransportError> {
        match series_uids {
            [series] => self
                .storage
                .series_dir(&self.task_dir, series)
                .map_err(TransportError::from),
            _ => Ok(self.task_dir.clone()),
        }
    }
}

#[async_trait]
impl RetrieveTransport for CGetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::CGet
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn execute(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError> {
        let result = self.transfer(request).await;
        self.state.finish(&result);
        result
    }

    fn local_dir(&self) -> Option<PathBuf> {
        Some(self.task_dir.clone())
    }
}

impl CGetTransport {
    async fn transfer(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError> {
        if request.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        self.state.set(TransportState::Associated);

        let mut jobs = Vec::new();
        for (query, priority) in plan_queries(request) {
            let output_dir = self.output_dir(&query.series_uids)?;
            jobs.push((
                DimseRetrieveJob {
                    scu: Arc::clone(&self.scu),
                    node: self.node.clone(),
                    query,
                    op: DimseOp::Get,
                    output_dir,
                },
                priority,
            ));
        }

        tracing::info!(
            "C-GET of {} studies from {} in {} sub-requests",
            request.study_uids.len(),
            self.node,
            jobs.len()
        );
        self.state.set(TransportState::Transferring);
        run_jobs(&self.scheduler, jobs, request).await?;
        Ok(TransportOutcome::LocalFiles(self.task_dir.clone()))
    }
}
