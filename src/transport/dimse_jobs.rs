use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dimse::{ProgressFn, RemoteNode, RetrieveQuery, ScuOperations, SubOperations, TransferContext};
use futures_util::future::join_all;

use crate::error::TransportError;
use crate::scheduler::{
    DownloadJob, DownloadPriority, JobContext, Progress, ProgressObserver, RetrievalScheduler,
    SubmitOptions, TaskId, TaskOutcome,
};
use crate::transport::status::{error_to_outcome, state_to_outcome};
use crate::transport::RetrieveRequest;

#[derive(Debug, Clone)]
pub(crate) enum DimseOp {
    Get,
    Move { destination: String },
}

/// One C-GET or C-MOVE sub-request, run in a scheduler slot
pub(crate) struct DimseRetrieveJob {
    pub scu: Arc<dyn ScuOperations>,
    pub node: RemoteNode,
    pub query: RetrieveQuery,
    pub op: DimseOp,
    pub output_dir: PathBuf,
}

fn counters(sub_ops: SubOperations) -> (u32, u32, u32) {
    (
        sub_ops.completed + sub_ops.warning,
        sub_ops.failed,
        sub_ops.remaining,
    )
}

#[async_trait]
impl DownloadJob for DimseRetrieveJob {
    fn describe(&self) -> String {
        let verb = match self.op {
            DimseOp::Get => "C-GET",
            DimseOp::Move { .. } => "C-MOVE",
        };
        if self.query.series_uids.is_empty() {
            format!("{} studies {}", verb, self.query.study_uids.join("\\"))
        } else {
            format!("{} series {}", verb, self.query.series_uids.join("\\"))
        }
    }

    async fn run(self: Box<Self>, ctx: JobContext) -> TaskOutcome {
        let reporter = ctx.reporter();
        let progress: ProgressFn = Arc::new(move |sub_ops: SubOperations| {
            let (c, f, r) = counters(sub_ops);
            reporter.report(c, f, r);
        });
        let transfer = TransferContext::new(self.output_dir.clone(), ctx.cancel.clone())
            .with_progress(progress);

        let result = match &self.op {
            DimseOp::Get => self.scu.get(&self.node, self.query.clone(), transfer).await,
            DimseOp::Move { destination } => {
                self.scu
                    .move_to(&self.node, self.query.clone(), destination, transfer)
                    .await
            }
        };

        match result {
            Ok(state) => {
                let (c, f, r) = counters(state.sub_ops);
                ctx.report(c, f, r);
                if ctx.is_cancelled() {
                    return TaskOutcome::Cancelled;
                }
                state_to_outcome(&state)
            }
            Err(e) => error_to_outcome(e),
        }
    }
}

/// Sub-requests of a retrieve: one per series target, or one batch of studies
pub(crate) fn plan_queries(request: &RetrieveRequest) -> Vec<(RetrieveQuery, DownloadPriority)> {
    if request.series.is_empty() {
        let first = request.study_uids.first().cloned().unwrap_or_default();
        return vec![(
            RetrieveQuery::studies(request.study_uids.clone()),
            DownloadPriority::new("", first, "", 0),
        )];
    }
    request
        .series
        .iter()
        .map(|t| {
            (
                RetrieveQuery::series(t.study_uid.clone(), vec![t.series_uid.clone()]),
                t.priority.clone(),
            )
        })
        .collect()
}

/// Run every job on the scheduler and fold the outcomes.
///
/// The first failure wins; otherwise any cancellation makes the whole
/// retrieve cancelled.
pub(crate) async fn run_jobs(
    scheduler: &RetrievalScheduler,
    jobs: Vec<(DimseRetrieveJob, DownloadPriority)>,
    request: &RetrieveRequest,
) -> Result<(), TransportError> {
    let totals: Arc<Mutex<HashMap<TaskId, Progress>>> = Arc::new(Mutex::new(HashMap::new()));
    let forward = request.clone();
    let observer: ProgressObserver = Arc::new(move |id, progress| {
        let aggregate = {
            let mut guard = match totals.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.insert(id, progress);
            Progress::aggregate(guard.values().copied())
        };
        forward.report(aggregate);
    });

    let handles: Vec<_> = jobs
        .into_iter()
        .map(|(job, priority)| {
            scheduler.submit_with(
                Box::new(job),
                priority,
                SubmitOptions {
                    parent_cancel: Some(request.cancel.clone()),
                    observer: Some(Arc::clone(&observer)),
                },
            )
        })
        .collect();

    let outcomes = join_all(handles.iter().map(|h| h.wait())).await;
    fold_outcomes(outcomes)
}

pub(crate) fn fold_outcomes(outcomes: Vec<TaskOutcome>) -> Result<(), TransportError> {
    let mut cancelled = false;
    for outcome in outcomes {
        match outcome {
            TaskOutcome::Failed(e) => return Err(e),
            TaskOutcome::Cancelled => cancelled = true,
            TaskOutcome::Completed => {}
        }
    }
    if cancelled {
        Err(TransportError::Cancelled)
    } else {
        Ok(())
    }
}
