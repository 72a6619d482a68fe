#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use arcfetch::config::{Config, WebNodeConfig};
use arcfetch::events::EventBus;
use arcfetch::model::HierarchyModel;
use arcfetch::query::QidoClient;
use arcfetch::scheduler::{DownloadPriority, RetrievalScheduler};
use arcfetch::storage::FilesystemStorage;
use arcfetch::task::{RetrieveTask, TaskState};
use arcfetch::transport::{
    normalize_host, SeriesTarget, TransportDeps, TransportRegistry, WebNodeChooser,
};
use common::{
    config_for, default_studies, spawn_archive, FakeScu, MockArchive, ScuBehavior, Sinks,
};
use tempfile::TempDir;

const LOCAL_NODES: &str = r#"
[retrieve]
transport = "WADO"

[[web_nodes]]
name = "local-qido"
url = "http://localhost:9091/qido"
web_type = "QIDO"

[[web_nodes]]
name = "local-wado"
url = "http://localhost:9090/wado"
web_type = "WADO"
headers = ["Authorization: &access_token=abc"]

[[web_nodes]]
name = "remote-wado"
url = "http://pacs.example.org/wado"
web_type = "WADO"
"#;

struct LastNode;

impl WebNodeChooser for LastNode {
    fn choose(&self, candidates: &[WebNodeConfig]) -> Option<usize> {
        Some(candidates.len() - 1)
    }
}

fn registry(config: Config, root: &TempDir, chooser: Arc<dyn WebNodeChooser>) -> TransportRegistry {
    let query = QidoClient::with_client(reqwest::Client::new(), &config.archive);
    TransportRegistry::new(TransportDeps {
        config: Arc::new(config),
        scu: Arc::new(FakeScu::new(ScuBehavior::Succeed(0))),
        listener: None,
        scheduler: RetrievalScheduler::new(1),
        storage: Arc::new(FilesystemStorage::new(root.path()).unwrap()),
        model: Arc::new(HierarchyModel::new(EventBus::new())),
        query: Arc::new(query),
        chooser,
    })
}

async fn archive_url() -> String {
    let archive = Arc::new(MockArchive::new(default_studies()));
    let (base_url, _server) = spawn_archive(archive).await;
    base_url
}

fn read_manifest(sinks: &Sinks) -> String {
    let manifests = sinks.loader.manifests.lock().unwrap().clone();
    assert_eq!(manifests.len(), 1);
    let path = &manifests[0];
    let name = path.file_name().and_then(|n| n.to_str()).unwrap();
    assert!(name.starts_with("wado_") && name.ends_with(".xml"), "{}", name);
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_wado_manifest_is_handed_to_loader() {
    let base_url = archive_url().await;
    let root = TempDir::new().unwrap();
    let config = config_for(&base_url, LOCAL_NODES);
    let sinks = Sinks::new();
    let task = RetrieveTask::new(
        registry(config, &root, Arc::new(arcfetch::transport::FirstNodeChooser)),
        vec!["1.2.3".into(), "1.2.4".into()],
        sinks.task_sinks(),
        EventBus::new(),
    );

    assert_eq!(task.run().await, TaskState::HandedOff);
    assert!(sinks.errors().is_empty(), "{:?}", sinks.errors());
    assert!(sinks.import.folders.lock().unwrap().is_empty());

    let xml = read_manifest(&sinks);
    assert!(xml.contains("arcId=\"localWadoRetrieve\""));
    assert!(xml.contains("baseUrl=\"http://localhost:9090/wado\""));
    assert!(xml.contains("<httpTag key=\"authorization\" value=\"Bearer abc\"/>"));
    assert!(xml.contains("PatientName=\"DOE^JOHN\""));
    for uid in ["1.2.3", "1.2.4", "1.2.3.1", "1.2.3.2", "1.2.4.1"] {
        assert!(xml.contains(&format!("InstanceUID=\"{}\"", uid)), "{} missing", uid);
    }
    assert!(xml.contains("SOPInstanceUID=\"1.2.3.1.1\""));
    // Newest study first
    assert!(xml.find("StudyInstanceUID=\"1.2.3\"").unwrap() < xml.find("StudyInstanceUID=\"1.2.4\"").unwrap());
}

#[tokio::test]
async fn test_series_targets_limit_the_manifest() {
    let base_url = archive_url().await;
    let root = TempDir::new().unwrap();
    let sinks = Sinks::new();
    let task = RetrieveTask::new(
        registry(
            config_for(&base_url, LOCAL_NODES),
            &root,
            Arc::new(arcfetch::transport::FirstNodeChooser),
        ),
        vec![],
        sinks.task_sinks(),
        EventBus::new(),
    )
    .with_series(vec![SeriesTarget {
        study_uid: "1.2.3".into(),
        series_uid: "1.2.3.2".into(),
        priority: DownloadPriority::new("P1", "1.2.3", "1.2.3.2", 0),
    }]);

    assert_eq!(task.run().await, TaskState::HandedOff);
    let xml = read_manifest(&sinks);
    assert!(xml.contains("SeriesInstanceUID=\"1.2.3.2\""));
    assert!(!xml.contains("SeriesInstanceUID=\"1.2.3.1\""));
}

#[tokio::test]
async fn test_chooser_picks_among_matching_nodes() {
    let base_url = archive_url().await;
    let root = TempDir::new().unwrap();
    let extra = format!(
        "{}\n[[web_nodes]]\nname = \"local-wado-2\"\nurl = \"http://127.0.0.1:9092/wado\"\nweb_type = \"WADO\"\n",
        LOCAL_NODES
    );
    let sinks = Sinks::new();
    let task = RetrieveTask::new(
        registry(config_for(&base_url, &extra), &root, Arc::new(LastNode)),
        vec!["1.2.4".into()],
        sinks.task_sinks(),
        EventBus::new(),
    );

    assert_eq!(task.run().await, TaskState::HandedOff);
    let xml = read_manifest(&sinks);
    assert!(xml.contains("baseUrl=\"http://127.0.0.1:9092/wado\""));
}

#[tokio::test]
async fn test_no_matching_web_node() {
    let base_url = archive_url().await;
    let root = TempDir::new().unwrap();
    let only_remote = r#"
[retrieve]
transport = "WADO"

[[web_nodes]]
name = "remote-wado"
url = "http://pacs.example.org/wado"
web_type = "WADO"
"#;
    let sinks = Sinks::new();
    let task = RetrieveTask::new(
        registry(
            config_for(&base_url, only_remote),
            &root,
            Arc::new(arcfetch::transport::FirstNodeChooser),
        ),
        vec!["1.2.3".into()],
        sinks.task_sinks(),
        EventBus::new(),
    );

    assert_eq!(task.run().await, TaskState::Failure);
    assert_eq!(
        sinks.errors(),
        vec![(
            "No WADO node matches the archive host 127.0.0.1".to_string(),
            "WADO".to_string()
        )]
    );
    assert!(sinks.loader.manifests.lock().unwrap().is_empty());
    assert!(sinks.import.folders.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_study_builds_nothing() {
    let base_url = archive_url().await;
    let root = TempDir::new().unwrap();
    let sinks = Sinks::new();
    let task = RetrieveTask::new(
        registry(
            config_for(&base_url, LOCAL_NODES),
            &root,
            Arc::new(arcfetch::transport::FirstNodeChooser),
        ),
        vec!["4.5.6".into()],
        sinks.task_sinks(),
        EventBus::new(),
    );

    assert_eq!(task.run().await, TaskState::Failure);
    let errors = sinks.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, "Cannot build the manifest: nothing to retrieve");
    assert_eq!(errors[0].1, "WADO");
}

#[test]
fn test_loopback_hosts_compare_equal() {
    assert_eq!(normalize_host("127.0.0.1"), "localhost");
    assert_eq!(normalize_host("[::1]"), "localhost");
    assert_eq!(normalize_host("PACS.Example.org"), "pacs.example.org");
}
