use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::events::{EventBus, ModelEvent};
use crate::scheduler::{DownloadPriority, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Terminal outcome of a download task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(TransportError),
    Cancelled,
}

pub type ProgressObserver = Arc<dyn Fn(TaskId, Progress) + Send + Sync>;

/// Handed to a running job: cancellation signal and progress reporting
pub struct JobContext {
    pub id: TaskId,
    pub cancel: CancellationToken,
    inner: Arc<Inner>,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn report(&self, completed: u32, failed: u32, remaining: u32) {
        self.inner.report(self.id, completed, failed, remaining);
    }

    /// Detached reporter for callbacks that outlive a borrow of the context
    pub fn reporter(&self) -> ProgressReporter {
        ProgressReporter {
            id: self.id,
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    id: TaskId,
    inner: Arc<Inner>,
}

impl ProgressReporter {
    pub fn report(&self, completed: u32, failed: u32, remaining: u32) {
        self.inner.report(self.id, completed, failed, remaining);
    }
}

/// One unit of work run by the scheduler (one series in practice)
#[async_trait]
pub trait DownloadJob: Send + 'static {
    fn describe(&self) -> String;

    async fn run(self: Box<Self>, ctx: JobContext) -> TaskOutcome;
}

#[derive(Default, Clone)]
pub struct SubmitOptions {
    /// Cancelling this token cancels the task too
    pub parent_cancel: Option<CancellationToken>,
    pub observer: Option<ProgressObserver>,
}

struct Pending {
    id: TaskId,
    seq: u64,
    priority: DownloadPriority,
    job: Box<dyn DownloadJob>,
}

/// Registry entry of a task that has not finished yet
struct TaskEntry {
    progress: watch::Sender<Progress>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<TaskOutcome>>,
    observer: Option<ProgressObserver>,
}

#[derive(Default)]
struct State {
    pending: Vec<Pending>,
    tasks: HashMap<TaskId, TaskEntry>,
    running: usize,
}

impl State {
    /// Stable: equal weights keep submission order
    fn resort(&mut self) {
        self.pending
            .sort_by(|a, b| a.priority.weight.cmp(&b.priority.weight).then(a.seq.cmp(&b.seq)));
    }
}

struct Inner {
    state: Mutex<State>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
    events: Option<EventBus>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn report(&self, id: TaskId, completed: u32, failed: u32, remaining: u32) {
        let (progress, observer) = {
            let mut state = self.lock();
            let Some(entry) = state.tasks.get(&id) else {
                return;
            };
            entry
                .progress
                .send_modify(|p| p.update(completed, failed, remaining));
            let progress = *entry.progress.borrow();
            (progress, entry.observer.clone())
        };
        if let Some(observer) = observer {
            observer(id, progress);
        }
        if let Some(events) = &self.events {
            events.publish(ModelEvent::ProgressUpdated { task: id, progress });
        }
    }

    /// Publish the outcome and forget the task; its handle keeps the last progress
    fn finish(&self, id: TaskId, outcome: TaskOutcome) {
        let entry = self.lock().tasks.remove(&id);
        if let Some(entry) = entry {
            tracing::debug!("{} finished: {:?}", id, outcome);
            entry.outcome.send_replace(Some(outcome));
        }
    }

    /// Start pending tasks while slots are free
    fn dispatch(self: &Arc<Self>) {
        loop {
            let permit = match self.slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let next = {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    None
                } else {
                    state.running += 1;
                    let next = state.pending.remove(0);
                    let cancel = state.tasks.get(&next.id).map(|e| e.cancel.clone());
                    Some((next, cancel.unwrap_or_default()))
                }
            };
            let Some((pending, cancel)) = next else {
                return;
            };
            self.spawn(pending, cancel, permit);
        }
    }

    fn spawn(self: &Arc<Self>, pending: Pending, cancel: CancellationToken, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let id = pending.id;
            let outcome = if cancel.is_cancelled() {
                TaskOutcome::Cancelled
            } else {
                tracing::debug!("starting {} ({})", id, pending.job.describe());
                let ctx = JobContext {
                    id,
                    cancel,
                    inner: Arc::clone(&inner),
                };
                // Separate task so a panicking job still releases its slot
                match tokio::spawn(pending.job.run(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(e) => TaskOutcome::Failed(TransportError::DicomFailure(format!(
                        "download task aborted: {}",
                        e
                    ))),
                }
            };

            inner.finish(id, outcome);
            inner.lock().running -= 1;
            drop(permit);
            inner.dispatch();
        });
    }
}

/// Waits for and controls one submitted task
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    outcome: watch::Receiver<Option<TaskOutcome>>,
    progress: watch::Receiver<Progress>,
    inner: Arc<Inner>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Terminal outcome, waiting for it if needed
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(|o| o.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(TaskOutcome::Cancelled),
            Err(_) => TaskOutcome::Cancelled,
        };
        outcome
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }

    /// Latest counters, still available once the task has finished
    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn cancel(&self) {
        RetrievalScheduler {
            inner: Arc::clone(&self.inner),
        }
        .cancel(self.id);
    }
}

/// Bounded worker pool with a priority-ordered pending list.
///
/// Running tasks are never preempted; only tasks still waiting for a slot
/// are reordered when new work arrives or a task is promoted.
#[derive(Clone)]
pub struct RetrievalScheduler {
    inner: Arc<Inner>,
}

impl RetrievalScheduler {
    pub fn new(slots: usize) -> Self {
        Self::build(slots, None)
    }

    /// Also publish progress on the event bus
    pub fn with_events(slots: usize, events: EventBus) -> Self {
        Self::build(slots, Some(events))
    }

    fn build(slots: usize, events: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                slots: Arc::new(Semaphore::new(slots.max(1))),
                next_id: AtomicU64::new(1),
                events,
            }),
        }
    }

    pub fn submit(&self, job: Box<dyn DownloadJob>, priority: DownloadPriority) -> TaskHandle {
        self.submit_with(job, priority, SubmitOptions::default())
    }

    pub fn submit_with(
        &self,
        job: Box<dyn DownloadJob>,
        priority: DownloadPriority,
        options: SubmitOptions,
    ) -> TaskHandle {
        let seq = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id = TaskId(seq);
        let cancel = match &options.parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (tx, rx) = watch::channel(None);
        let (progress_tx, progress_rx) = watch::channel(Progress::default());

        {
            let mut state = self.inner.lock();
            tracing::debug!("queueing {} for series {} (weight {})", id, priority.series, priority.weight);
            state.tasks.insert(
                id,
                TaskEntry {
                    progress: progress_tx,
                    cancel,
                    outcome: tx,
                    observer: options.observer,
                },
            );
            state.pending.push(Pending {
                id,
                seq,
                priority,
                job,
            });
            state.resort();
        }

        self.inner.dispatch();
        TaskHandle {
            id,
            outcome: rx,
            progress: progress_rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cancel a task. A task still waiting for a slot is dropped without running.
    pub fn cancel(&self, id: TaskId) {
        let removed = {
            let mut state = self.inner.lock();
            if let Some(entry) = state.tasks.get(&id) {
                entry.cancel.cancel();
            }
            let before = state.pending.len();
            state.pending.retain(|p| p.id != id);
            before != state.pending.len()
        };
        if removed {
            self.inner.finish(id, TaskOutcome::Cancelled);
        }
    }

    /// Run a pending task before all others. False if it already started.
    pub fn promote(&self, id: TaskId) -> bool {
        let mut state = self.inner.lock();
        let Some(pending) = state.pending.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        pending.priority.promote();
        state.resort();
        true
    }

    /// Counters of a task that is still pending or running
    pub fn progress(&self, id: TaskId) -> Option<Progress> {
        self.inner.lock().tasks.get(&id).map(|e| *e.progress.borrow())
    }

    /// Counters summed over the tasks still pending or running
    pub fn aggregate(&self) -> Progress {
        let state = self.inner.lock();
        Progress::aggregate(state.tasks.values().map(|e| *e.progress.borrow()))
    }

    /// Tasks still pending or running
    pub fn active(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Pending task ids in the order they will start
    pub fn pending(&self) -> Vec<TaskId> {
        self.inner.lock().pending.iter().map(|p| p.id).collect()
    }

    pub fn running(&self) -> usize {
        self.inner.lock().running
    }
}
