#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arcfetch::error::QueryError;
use arcfetch::events::{EventBus, ModelEvent};
use arcfetch::query::{LevelQuery, QueryService};
use arcfetch::scheduler::DownloadPriority;
use arcfetch::task::{RetrieveTask, TaskState};
use arcfetch::transport::{SeriesTarget, TransportKind};
use async_trait::async_trait;
use common::{
    config_for, dimse_sections, registry, FakeListener, FakeScu, ScuBehavior, Sinks,
};
use dicom_attrs::Attributes;
use dimse::DimseStatus;
use tempfile::TempDir;

struct NoQuery;

#[async_trait]
impl QueryService for NoQuery {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn find(&self, _query: &LevelQuery) -> Result<Vec<Attributes>, QueryError> {
        Ok(Vec::new())
    }
}

struct Fixture {
    _tmp: TempDir,
    listener: Arc<FakeListener>,
    scu: Arc<FakeScu>,
    sinks: Sinks,
    events: EventBus,
    task: Arc<RetrieveTask>,
}

fn fixture(behavior: ScuBehavior, listener: Option<FakeListener>, transport: &str) -> Fixture {
    fixture_with(FakeScu::new(behavior), listener, transport, true)
}

fn fixture_with(
    scu: FakeScu,
    listener: Option<FakeListener>,
    transport: &str,
    attach_listener: bool,
) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let incoming = tmp.path().join("incoming");
    let listener = Arc::new(listener.unwrap_or_else(|| FakeListener::new(&incoming)));
    let scu = Arc::new(scu.watching(Arc::clone(&listener)));

    let extra = format!(
        "{}\n[retrieve]\ntransport = \"{}\"\n",
        dimse_sections(&tmp.path().join("scp")),
        transport
    );
    let config = config_for("http://127.0.0.1:8080/dicom-web", &extra);
    let store_listener: Option<Arc<dyn dimse::StoreListener>> = if attach_listener {
        Some(listener.clone())
    } else {
        None
    };
    let registry = registry(
        config,
        scu.clone(),
        store_listener,
        Arc::new(NoQuery),
        &tmp.path().join("store"),
    );

    let sinks = Sinks::new();
    let events = EventBus::new();
    let task = Arc::new(RetrieveTask::new(
        registry,
        vec!["1.2.3".into(), "1.2.4".into()],
        sinks.task_sinks(),
        events.clone(),
    ));
    Fixture {
        _tmp: tmp,
        listener,
        scu,
        sinks,
        events,
        task,
    }
}

#[tokio::test]
async fn test_cmove_success_hands_listener_folder_to_import() {
    let f = fixture(ScuBehavior::Succeed(3), None, "CMOVE");
    let mut events = f.events.subscribe();

    let state = f.task.run().await;
    assert_eq!(state, TaskState::HandedOff);
    assert_eq!(
        f.task.history(),
        vec![
            TaskState::SelectTransport,
            TaskState::Executing,
            TaskState::Success,
            TaskState::HandedOff
        ]
    );

    let calls = f.scu.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].op, "move");
    assert_eq!(calls[0].study_uids, vec!["1.2.3", "1.2.4"]);
    assert_eq!(calls[0].destination.as_deref(), Some("ARCFETCH_SCU"));
    // The listener runs during the transfer only
    assert_eq!(calls[0].listener_running, Some(true));
    assert!(!f.listener.running.load(Ordering::SeqCst));
    assert_eq!(f.listener.stops.load(Ordering::SeqCst), 1);

    assert_eq!(*f.sinks.import.folders.lock().unwrap(), vec![f.listener.dir.clone()]);
    assert!(f.sinks.errors().is_empty());
    let progress = f.sinks.listener.progress.lock().unwrap().clone();
    assert_eq!(progress.last().map(|p| p.percent), Some(100));

    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if let ModelEvent::RetrieveCompleted { task_id, state } = event {
            completed = Some((task_id, state));
        }
    }
    assert_eq!(completed, Some((f.task.id().to_string(), TaskState::HandedOff)));
}

#[tokio::test]
async fn test_cmove_failure_status_reports_one_error() {
    let f = fixture(ScuBehavior::FailStatus(1, 0xA801, None), None, "CMOVE");

    assert_eq!(f.task.run().await, TaskState::Failure);
    assert_eq!(
        f.sinks.errors(),
        vec![(
            "Refused: move destination unknown (0xA801)".to_string(),
            "C-MOVE".to_string()
        )]
    );
    assert!(!f.listener.running.load(Ordering::SeqCst));
    // Partially received instances are still imported
    assert_eq!(*f.sinks.import.folders.lock().unwrap(), vec![f.listener.dir.clone()]);
}

#[tokio::test]
async fn test_cmove_explicit_error_comment_wins() {
    let f = fixture(
        ScuBehavior::FailStatus(0, 0xC000, Some("Study not found on PACS".into())),
        None,
        "CMOVE",
    );
    assert_eq!(f.task.run().await, TaskState::Failure);
    assert_eq!(f.sinks.errors()[0].0, "Study not found on PACS");
}

#[tokio::test]
async fn test_association_rejection() {
    let f = fixture(ScuBehavior::Reject("called AE title not recognized".into()), None, "CMOVE");
    assert_eq!(f.task.run().await, TaskState::Failure);
    let errors = f.sinks.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "Association rejected: called AE title not recognized");
    assert_eq!(errors[0].1, "C-MOVE");
    assert!(!f.listener.running.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_listener_start_failure_stops_it_and_skips_transfer() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(
        ScuBehavior::Succeed(1),
        Some(FakeListener::new(tmp.path()).failing()),
        "CMOVE",
    );

    assert_eq!(f.task.run().await, TaskState::Failure);
    assert!(f.scu.calls().is_empty());
    assert!(!f.listener.running.load(Ordering::SeqCst));
    assert_eq!(f.listener.stops.load(Ordering::SeqCst), 1);
    let errors = f.sinks.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.starts_with("Cannot start the DICOM listener"));
}

#[tokio::test]
async fn test_running_listener_is_rejected_and_left_alone() {
    let f = fixture(ScuBehavior::Succeed(1), None, "CMOVE");
    f.listener.running.store(true, Ordering::SeqCst);

    assert_eq!(f.task.run().await, TaskState::Failure);
    assert!(f.scu.calls().is_empty());
    assert!(f.listener.running.load(Ordering::SeqCst));
    assert_eq!(f.listener.stops.load(Ordering::SeqCst), 0);
    assert!(f.sinks.errors()[0].0.contains("already running"));
}

#[tokio::test]
async fn test_listener_claimed_between_check_and_start_is_left_running() {
    let tmp = TempDir::new().unwrap();
    let f = fixture(
        ScuBehavior::Succeed(1),
        Some(FakeListener::new(tmp.path()).claimed_elsewhere()),
        "CMOVE",
    );

    assert_eq!(f.task.run().await, TaskState::Failure);
    assert!(f.scu.calls().is_empty());
    // The other owner's listener keeps running
    assert!(f.listener.running.load(Ordering::SeqCst));
    assert_eq!(f.listener.stops.load(Ordering::SeqCst), 0);
    let errors = f.sinks.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.contains("already running"), "{}", errors[0].0);
    assert_eq!(errors[0].1, "C-MOVE");
}

#[tokio::test]
async fn test_second_move_while_first_transfers() {
    let f = fixture(ScuBehavior::WaitForCancel, None, "CMOVE");
    let first = Arc::clone(&f.task);
    let run = tokio::spawn(async move { first.run().await });
    f.scu.started.notified().await;
    assert!(f.listener.running.load(Ordering::SeqCst));

    let second_sinks = Sinks::new();
    let second = RetrieveTask::new(
        f.task_registry(),
        vec!["1.2.4".into()],
        second_sinks.task_sinks(),
        EventBus::new(),
    )
    .with_transport(TransportKind::CMove);
    assert_eq!(second.run().await, TaskState::Failure);
    assert!(second_sinks.errors()[0].0.contains("already running"));

    // The first transfer still has its listener
    assert!(f.listener.running.load(Ordering::SeqCst));
    assert_eq!(f.listener.stops.load(Ordering::SeqCst), 0);
    assert_eq!(f.scu.calls().len(), 1);

    f.task.cancel();
    assert_eq!(run.await.unwrap(), TaskState::Cancelled);
    assert!(!f.listener.running.load(Ordering::SeqCst));
    assert_eq!(f.listener.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_final_pending_status_fails_the_retrieve() {
    let f = fixture(ScuBehavior::EndWith(1, DimseStatus::Pending), None, "CMOVE");

    assert_eq!(f.task.run().await, TaskState::Failure);
    assert_eq!(
        f.sinks.errors(),
        vec![("Unexpected DICOM error".to_string(), "C-MOVE".to_string())]
    );
    assert!(!f.listener.running.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_missing_listener() {
    let f = fixture_with(FakeScu::new(ScuBehavior::Succeed(1)), None, "CMOVE", false);
    assert_eq!(f.task.run().await, TaskState::Failure);
    assert_eq!(
        f.sinks.errors(),
        vec![(
            "Cannot start the DICOM listener: no DICOM listener is configured".to_string(),
            "C-MOVE".to_string()
        )]
    );
}

#[tokio::test]
async fn test_cancel_during_transfer() {
    let f = fixture(ScuBehavior::WaitForCancel, None, "CMOVE");
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let counter = hook_calls.clone();
    f.task.add_cancel_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(f.task.cancel_listener_count(), 1);

    let task = Arc::clone(&f.task);
    let run = tokio::spawn(async move { task.run().await });
    f.scu.started.notified().await;
    f.task.cancel();

    assert_eq!(run.await.unwrap(), TaskState::Cancelled);
    assert!(f.sinks.errors().is_empty());
    assert_eq!(f.sinks.listener.cancel_requests.load(Ordering::SeqCst), 1);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert_eq!(f.task.cancel_listener_count(), 0);
    assert!(!f.listener.running.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cget_series_targets_store_per_series() {
    let f = fixture(ScuBehavior::Succeed(2), None, "CMOVE");
    let task = RetrieveTask::new(
        f.task_registry(),
        vec!["1.2.3".into()],
        f.sinks.task_sinks(),
        EventBus::new(),
    )
    .with_transport(TransportKind::CGet)
    .with_series(vec![
        SeriesTarget {
            study_uid: "1.2.3".into(),
            series_uid: "1.2.3.1".into(),
            priority: DownloadPriority::new("P1", "1.2.3", "1.2.3.1", 0),
        },
        SeriesTarget {
            study_uid: "1.2.3".into(),
            series_uid: "1.2.3.2".into(),
            priority: DownloadPriority::new("P1", "1.2.3", "1.2.3.2", 0),
        },
    ]);

    assert_eq!(task.run().await, TaskState::HandedOff);
    let calls = f.scu.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.op == "get" && c.destination.is_none()));
    // C-GET needs no listener
    assert_eq!(f.listener.starts.load(Ordering::SeqCst), 0);

    let folders = f.sinks.import.folders.lock().unwrap().clone();
    assert_eq!(folders.len(), 1);
    let task_dir = &folders[0];
    assert!(task_dir
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("cget_")));
    for series in ["1.2.3.1", "1.2.3.2"] {
        let dir = task_dir.join(series);
        assert!(calls.iter().any(|c| c.output_dir == dir));
        assert!(dir.join(format!("{}_0.dcm", series)).exists());
        assert!(dir.join(format!("{}_1.dcm", series)).exists());
    }
}

#[tokio::test]
async fn test_unsupported_configured_transport() {
    let f = fixture(ScuBehavior::Succeed(1), None, "STOW");
    assert_eq!(f.task.run().await, TaskState::Failure);
    assert_eq!(
        f.sinks.errors(),
        vec![("Unsupported retrieve type: STOW".to_string(), "STOW".to_string())]
    );
    assert!(f.scu.calls().is_empty());
}

#[tokio::test]
async fn test_empty_calling_aet() {
    let mut scu = FakeScu::new(ScuBehavior::Succeed(1));
    scu.aet = String::new();
    let f = fixture_with(scu, None, "CMOVE", true);
    let task = RetrieveTask::new(
        f.task_registry(),
        vec!["1.2.3".into()],
        f.sinks.task_sinks(),
        EventBus::new(),
    )
    .with_transport(TransportKind::CMove);

    assert_eq!(task.run().await, TaskState::Failure);
    assert_eq!(
        f.sinks.errors(),
        vec![(
            "No calling DICOM node is configured".to_string(),
            "C-MOVE".to_string()
        )]
    );
}

impl Fixture {
    /// A second registry sharing the fixture's fakes
    fn task_registry(&self) -> arcfetch::transport::TransportRegistry {
        let config = config_for(
            "http://127.0.0.1:8080/dicom-web",
            &dimse_sections(&self._tmp.path().join("scp")),
        );
        registry(
            config,
            self.scu.clone(),
            Some(self.listener.clone()),
            Arc::new(NoQuery),
            &self._tmp.path().join("store"),
        )
    }
}
