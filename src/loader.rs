//! Invoke Image Display: resolve a request over QIDO-RS, then download the
//! resolved series over WADO-RS.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::collab::LocalImport;
use crate::config::Config;
use crate::download::SeriesDownload;
use crate::error::TransportError;
use crate::http::header_map;
use crate::query::{QueryRequest, QueryResolver, ResolveReport};
use crate::scheduler::{
    DownloadPriority, Progress, RetrievalScheduler, SubmitOptions, TaskHandle, TaskOutcome,
};
use crate::storage::StorageBackend;

/// Download jobs not yet handed to the scheduler
pub struct LoadPlan {
    pub report: ResolveReport,
    pub task_dir: PathBuf,
    pub jobs: Vec<(SeriesDownload, DownloadPriority)>,
}

/// Downloads submitted to the scheduler
pub struct LoadHandle {
    pub report: ResolveReport,
    pub task_dir: PathBuf,
    pub tasks: Vec<TaskHandle>,
    pub cancel: CancellationToken,
}

impl LoadHandle {
    /// Counters summed over the series of this load
    pub fn progress(&self) -> Progress {
        Progress::aggregate(self.tasks.iter().map(TaskHandle::progress))
    }
}

pub enum LoadOutcome {
    Started(LoadHandle),
    /// `download.start_immediately` is off
    Deferred(LoadPlan),
}

pub struct ImageDisplayLoader {
    config: Arc<Config>,
    resolver: QueryResolver,
    scheduler: RetrievalScheduler,
    client: Client,
    storage: Arc<dyn StorageBackend>,
    import: Arc<dyn LocalImport>,
}

impl ImageDisplayLoader {
    pub fn new(
        config: Arc<Config>,
        resolver: QueryResolver,
        scheduler: RetrievalScheduler,
        client: Client,
        storage: Arc<dyn StorageBackend>,
        import: Arc<dyn LocalImport>,
    ) -> Self {
        Self {
            config,
            resolver,
            scheduler,
            client,
            storage,
            import,
        }
    }

    /// Resolve and build one download per series marked for download
    pub async fn plan(&self, request: &QueryRequest) -> Result<LoadPlan, TransportError> {
        let report = self.resolver.resolve(request).await;
        let task_dir = self.storage.task_dir("wado_")?;
        let headers = header_map(&self.config.archive.retrieve_header_pairs());

        let mut jobs = Vec::new();
        for resolved in report.series.iter().filter(|s| s.start_download) {
            let dir = self.storage.series_dir(&task_dir, resolved.series.key())?;
            let job = SeriesDownload::from_model(
                self.client.clone(),
                self.resolver.model(),
                &resolved.series,
                dir,
            )
            .with_headers(headers.clone())
            .with_accept_ext(self.config.archive.accept_ext.as_deref())
            .with_concurrency(self.config.download.concurrent_per_series);
            jobs.push((job, resolved.priority.clone()));
        }
        tracing::info!(
            "{} series to download, {} identifiers failed",
            jobs.len(),
            report.failures.len()
        );
        Ok(LoadPlan {
            report,
            task_dir,
            jobs,
        })
    }

    pub fn submit(&self, plan: LoadPlan) -> LoadHandle {
        let cancel = CancellationToken::new();
        let tasks = plan
            .jobs
            .into_iter()
            .map(|(job, priority)| {
                self.scheduler.submit_with(
                    Box::new(job),
                    priority,
                    SubmitOptions {
                        parent_cancel: Some(cancel.clone()),
                        observer: None,
                    },
                )
            })
            .collect();
        LoadHandle {
            report: plan.report,
            task_dir: plan.task_dir,
            tasks,
            cancel,
        }
    }

    pub async fn load(&self, request: &QueryRequest) -> Result<LoadOutcome, TransportError> {
        let plan = self.plan(request).await?;
        if self.config.download.start_immediately {
            Ok(LoadOutcome::Started(self.submit(plan)))
        } else {
            Ok(LoadOutcome::Deferred(plan))
        }
    }

    /// Wait for every download, then hand the folder to local import
    pub async fn complete(&self, handle: LoadHandle) -> Vec<TaskOutcome> {
        let outcomes = join_all(handle.tasks.iter().map(|t| t.wait())).await;
        let completed = outcomes.iter().filter(|o| **o == TaskOutcome::Completed).count();
        tracing::info!("{} of {} series downloaded", completed, outcomes.len());
        self.import.import(vec![handle.task_dir]).await;
        outcomes
    }
}
