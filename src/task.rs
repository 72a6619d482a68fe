//! Top-level retrieve of a set of studies.
//!
//! A task picks its transport, runs it, and hands the result over: the local
//! folder to the import collaborator (C-GET and C-MOVE, even after a failure,
//! so that partially retrieved instances are not lost) or the manifest files
//! to the manifest loader (WADO). A failed retrieve produces exactly one
//! `on_error` call, titled with the transport name.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::collab::{LocalImport, RemoteManifestLoader, RetrieveListener};
use crate::error::TransportError;
use crate::events::{EventBus, ModelEvent};
use crate::scheduler::Progress;
use crate::transport::{
    RetrieveRequest, RetrieveTransport, SeriesTarget, TransportKind, TransportOutcome,
    TransportRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    SelectTransport,
    Executing,
    Success,
    Failure,
    Cancelled,
    HandedOff,
}

pub type CancelHook = Arc<dyn Fn() + Send + Sync>;

/// Collaborators receiving the task result
#[derive(Clone)]
pub struct TaskSinks {
    pub listener: Arc<dyn RetrieveListener>,
    pub import: Arc<dyn LocalImport>,
    pub manifest_loader: Arc<dyn RemoteManifestLoader>,
}

#[derive(Default)]
struct TaskInner {
    history: Vec<TaskState>,
    cancel_hooks: Vec<CancelHook>,
}

pub struct RetrieveTask {
    id: String,
    registry: TransportRegistry,
    kind: Option<TransportKind>,
    study_uids: Vec<String>,
    series: Vec<SeriesTarget>,
    sinks: TaskSinks,
    events: EventBus,
    cancel: CancellationToken,
    inner: Mutex<TaskInner>,
}

impl RetrieveTask {
    pub fn new(
        registry: TransportRegistry,
        study_uids: Vec<String>,
        sinks: TaskSinks,
        events: EventBus,
    ) -> Self {
        Self {
            id: format!("retrieve-{}", uuid::Uuid::new_v4().simple()),
            registry,
            kind: None,
            study_uids,
            series: Vec::new(),
            sinks,
            events,
            cancel: CancellationToken::new(),
            inner: Mutex::new(TaskInner::default()),
        }
    }

    /// Use this transport instead of the configured one
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Retrieve series by series instead of whole studies
    pub fn with_series(mut self, series: Vec<SeriesTarget>) -> Self {
        self.series = series;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, TaskInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: TaskState) {
        tracing::debug!("{}: {:?}", self.id, state);
        self.lock().history.push(state);
    }

    pub fn state(&self) -> Option<TaskState> {
        self.lock().history.last().copied()
    }

    /// Every state the task went through, in order
    pub fn history(&self) -> Vec<TaskState> {
        self.lock().history.clone()
    }

    /// Called when cancellation is requested, until the task completes
    pub fn add_cancel_listener(&self, hook: CancelHook) {
        self.lock().cancel_hooks.push(hook);
    }

    pub fn cancel_listener_count(&self) -> usize {
        self.lock().cancel_hooks.len()
    }

    pub fn cancel(&self) {
        let hooks = self.lock().cancel_hooks.clone();
        self.sinks.listener.on_cancel_requested();
        for hook in hooks {
            hook();
        }
        self.cancel.cancel();
    }

    fn select(&self) -> Result<Box<dyn RetrieveTransport>, TransportError> {
        match self.kind {
            Some(kind) => self.registry.create(kind),
            None => self.registry.configured(),
        }
    }

    fn request(&self) -> RetrieveRequest {
        let listener = Arc::clone(&self.sinks.listener);
        RetrieveRequest::studies(self.study_uids.clone())
            .with_series(self.series.clone())
            .with_cancel(self.cancel.clone())
            .with_progress(Arc::new(move |p: Progress| listener.on_progress(p)))
    }

    /// Run to completion and return the final state
    pub async fn run(&self) -> TaskState {
        self.set_state(TaskState::SelectTransport);
        let transport = match self.select() {
            Ok(transport) => transport,
            Err(e) => {
                let title = match self.kind {
                    Some(kind) => kind.to_string(),
                    None => self.registry.deps().config.retrieve.transport.clone(),
                };
                self.report_error(&e, &title);
                return self.done(TaskState::Failure);
            }
        };
        let title = transport.kind().to_string();

        self.set_state(TaskState::Executing);
        let request = self.request();
        let result = match transport.prepare().await {
            Ok(()) => transport.execute(&request).await,
            Err(e) => Err(e),
        };
        transport.teardown().await;

        let state = match result {
            Ok(outcome) => {
                self.set_state(TaskState::Success);
                self.hand_off(outcome).await;
                TaskState::HandedOff
            }
            Err(e) => {
                let state = if e.is_cancelled() {
                    tracing::info!("{}: {} retrieve cancelled", self.id, title);
                    TaskState::Cancelled
                } else {
                    self.report_error(&e, &title);
                    TaskState::Failure
                };
                if let Some(dir) = transport.local_dir() {
                    self.sinks.import.import(vec![dir]).await;
                }
                state
            }
        };
        self.done(state)
    }

    fn report_error(&self, err: &TransportError, title: &str) {
        let message = err.to_string();
        tracing::error!("Dicom retrieve error: {}", message);
        self.sinks.listener.on_error(&message, title);
    }

    async fn hand_off(&self, outcome: TransportOutcome) {
        match outcome {
            TransportOutcome::LocalFiles(dir) => {
                tracing::info!("{}: importing {}", self.id, dir.display());
                self.sinks.import.import(vec![dir]).await;
            }
            TransportOutcome::Manifest(paths) => {
                tracing::info!("{}: loading {} manifest(s)", self.id, paths.len());
                self.sinks.manifest_loader.load(paths).await;
            }
        }
    }

    fn done(&self, state: TaskState) -> TaskState {
        {
            let mut inner = self.lock();
            inner.cancel_hooks.clear();
            if inner.history.last() != Some(&state) {
                inner.history.push(state);
            }
        }
        tracing::info!("{} finished: {:?}", self.id, state);
        self.events.publish(ModelEvent::RetrieveCompleted {
            task_id: self.id.clone(),
            state,
        });
        state
    }
}
