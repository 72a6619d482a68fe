//! Priority-ordered, bounded execution of per-series download tasks.

mod pool;
mod priority;
mod progress;

pub use pool::{
    DownloadJob, JobContext, ProgressObserver, ProgressReporter, RetrievalScheduler, SubmitOptions, TaskHandle,
    TaskId, TaskOutcome,
};
pub use priority::DownloadPriority;
pub use progress::Progress;
