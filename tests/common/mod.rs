//! In-process DICOMweb archive used by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arcfetch::config::Config;
use arcfetch::download::multipart::build_multipart;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
pub struct SeriesFixture {
    pub uid: &'static str,
    pub modality: &'static str,
    pub number: i64,
    pub description: &'static str,
    /// (SOP Instance UID, Instance Number)
    pub instances: Vec<(&'static str, i64)>,
}

#[derive(Debug, Clone)]
pub struct StudyFixture {
    pub uid: &'static str,
    pub patient_id: &'static str,
    pub patient_name: &'static str,
    pub date: Option<&'static str>,
    pub time: Option<&'static str>,
    pub description: &'static str,
    pub accession: &'static str,
    pub modalities: &'static [&'static str],
    pub series: Vec<SeriesFixture>,
}

/// Two patients, four studies. Study `9.9.9` answers 500 on series queries.
pub fn default_studies() -> Vec<StudyFixture> {
    vec![
        StudyFixture {
            uid: "1.2.3",
            patient_id: "P1",
            patient_name: "DOE^JOHN",
            date: Some("20240105"),
            time: Some("101500"),
            description: "CT Thorax",
            accession: "ACC1",
            modalities: &["CT", "MR"],
            series: vec![
                SeriesFixture {
                    uid: "1.2.3.1",
                    modality: "CT",
                    number: 1,
                    description: "Axial",
                    instances: vec![("1.2.3.1.2", 2), ("1.2.3.1.1", 1)],
                },
                SeriesFixture {
                    uid: "1.2.3.2",
                    modality: "MR",
                    number: 2,
                    description: "T1",
                    instances: vec![("1.2.3.2.1", 1)],
                },
            ],
        },
        StudyFixture {
            uid: "1.2.4",
            patient_id: "P1",
            patient_name: "DOE^JOHN",
            date: Some("20230301"),
            time: None,
            description: "Échographie abdominale",
            accession: "ACC2",
            modalities: &["US"],
            series: vec![SeriesFixture {
                uid: "1.2.4.1",
                modality: "US",
                number: 1,
                description: "",
                instances: vec![("1.2.4.1.1", 1)],
            }],
        },
        StudyFixture {
            uid: "1.2.5",
            patient_id: "P1",
            patient_name: "DOE^JOHN",
            date: None,
            time: None,
            description: "Undated",
            accession: "ACC3",
            modalities: &["CR"],
            series: vec![SeriesFixture {
                uid: "1.2.5.1",
                modality: "CR",
                number: 1,
                description: "",
                instances: vec![("1.2.5.1.1", 1)],
            }],
        },
        StudyFixture {
            uid: "9.9.9",
            patient_id: "P2",
            patient_name: "ROE^JANE",
            date: Some("20220101"),
            time: None,
            description: "Broken",
            accession: "ACC9",
            modalities: &["CT"],
            series: Vec::new(),
        },
    ]
}

fn text(vr: &str, value: &str) -> Value {
    json!({ "vr": vr, "Value": [value] })
}

fn number(vr: &str, value: i64) -> Value {
    json!({ "vr": vr, "Value": [value] })
}

pub fn study_json(study: &StudyFixture) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("0020000D".into(), text("UI", study.uid));
    obj.insert("00100020".into(), text("LO", study.patient_id));
    obj.insert(
        "00100010".into(),
        json!({ "vr": "PN", "Value": [{ "Alphabetic": study.patient_name }] }),
    );
    if let Some(date) = study.date {
        obj.insert("00080020".into(), text("DA", date));
    }
    if let Some(time) = study.time {
        obj.insert("00080030".into(), text("TM", time));
    }
    obj.insert("00081030".into(), text("LO", study.description));
    obj.insert("00080050".into(), text("SH", study.accession));
    obj.insert(
        "00080061".into(),
        json!({ "vr": "CS", "Value": study.modalities }),
    );
    Value::Object(obj)
}

pub fn series_json(series: &SeriesFixture) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("0020000E".into(), text("UI", series.uid));
    obj.insert("00080060".into(), text("CS", series.modality));
    obj.insert("00200011".into(), number("IS", series.number));
    if !series.description.is_empty() {
        obj.insert("0008103E".into(), text("LO", series.description));
    }
    Value::Object(obj)
}

fn instance_json(sop: &str, number_value: i64) -> Value {
    json!({
        "00080018": text("UI", sop),
        "00200013": number("IS", number_value),
    })
}

fn merge(into: &mut Value, from: &Value) {
    if let (Some(a), Some(b)) = (into.as_object_mut(), from.as_object()) {
        for (k, v) in b {
            a.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

/// Fake DICOMweb archive state
pub struct MockArchive {
    pub studies: Vec<StudyFixture>,
    pub requests: Mutex<Vec<String>>,
    pub headers: Mutex<Vec<HeaderMap>>,
    /// SOP Instance UIDs answering 404 on WADO-RS
    pub missing: Vec<&'static str>,
    /// Send WADO-RS bodies in small chunks with this pause before each
    pub trickle: Option<Duration>,
}

impl MockArchive {
    pub fn new(studies: Vec<StudyFixture>) -> Self {
        Self {
            studies,
            requests: Mutex::new(Vec::new()),
            headers: Mutex::new(Vec::new()),
            missing: Vec::new(),
            trickle: None,
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn record(&self, uri: &Uri, headers: &HeaderMap) {
        self.requests.lock().unwrap().push(uri.to_string());
        self.headers.lock().unwrap().push(headers.clone());
    }

    fn study(&self, uid: &str) -> Option<&StudyFixture> {
        self.studies.iter().find(|s| s.uid == uid)
    }
}

fn dicom_json(items: Vec<Value>) -> Response {
    if items.is_empty() {
        return StatusCode::NO_CONTENT.into_response();
    }
    (
        [(header::CONTENT_TYPE, "application/dicom+json")],
        Value::Array(items).to_string(),
    )
        .into_response()
}

type Shared = State<Arc<MockArchive>>;
type Params = Query<HashMap<String, String>>;

async fn search_studies(State(a): Shared, Query(q): Params, uri: Uri, headers: HeaderMap) -> Response {
    a.record(&uri, &headers);
    let items = a
        .studies
        .iter()
        .filter(|s| q.get("0020000D").map_or(true, |v| v == s.uid))
        .filter(|s| q.get("00100020").map_or(true, |v| v == s.patient_id))
        .filter(|s| q.get("00080050").map_or(true, |v| v == s.accession))
        .map(study_json)
        .collect();
    dicom_json(items)
}

async fn series_of_study(
    State(a): Shared,
    Path(study): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    a.record(&uri, &headers);
    if study == "9.9.9" {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let items = a
        .study(&study)
        .map(|s| s.series.iter().map(series_json).collect())
        .unwrap_or_default();
    dicom_json(items)
}

async fn instances_of_series(
    State(a): Shared,
    Path((study, series)): Path<(String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    a.record(&uri, &headers);
    let items = a
        .study(&study)
        .and_then(|s| s.series.iter().find(|se| se.uid == series))
        .map(|se| {
            se.instances
                .iter()
                .map(|(sop, n)| instance_json(sop, *n))
                .collect()
        })
        .unwrap_or_default();
    dicom_json(items)
}

async fn search_series(State(a): Shared, Query(q): Params, uri: Uri, headers: HeaderMap) -> Response {
    a.record(&uri, &headers);
    let wanted = q.get("0020000E").cloned().unwrap_or_default();
    let mut items = Vec::new();
    for study in &a.studies {
        for series in study.series.iter().filter(|se| se.uid == wanted) {
            let mut v = series_json(series);
            merge(&mut v, &study_json(study));
            items.push(v);
        }
    }
    dicom_json(items)
}

async fn search_instances(State(a): Shared, Query(q): Params, uri: Uri, headers: HeaderMap) -> Response {
    a.record(&uri, &headers);
    let wanted = q.get("00080018").cloned().unwrap_or_default();
    let mut items = Vec::new();
    for study in &a.studies {
        for series in &study.series {
            for (sop, n) in series.instances.iter().filter(|(sop, _)| *sop == wanted) {
                let mut v = instance_json(sop, *n);
                merge(&mut v, &series_json(series));
                merge(&mut v, &study_json(study));
                items.push(v);
            }
        }
    }
    dicom_json(items)
}

/// WADO-RS instance retrieval: one DICOM part holding the SOP Instance UID
async fn retrieve_instance(
    State(a): Shared,
    Path((_study, _series, sop)): Path<(String, String, String)>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    a.record(&uri, &headers);
    if a.missing.contains(&sop.as_str()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let (boundary, body) = build_multipart(&[format!("DICM:{}", sop).into_bytes()]);
    let content_type = [(
        header::CONTENT_TYPE,
        format!(
            "multipart/related; type=\"application/dicom\"; boundary={}",
            boundary
        ),
    )];
    match a.trickle {
        None => (content_type, body).into_response(),
        Some(pause) => {
            let chunks: Vec<Vec<u8>> = body.chunks(16).map(<[u8]>::to_vec).collect();
            let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(pause).await;
                Ok::<_, std::io::Error>(chunk)
            });
            (content_type, Body::from_stream(stream)).into_response()
        }
    }
}

pub fn router(archive: Arc<MockArchive>) -> Router {
    Router::new()
        .route("/studies", get(search_studies))
        .route("/studies/{study}/series", get(series_of_study))
        .route("/studies/{study}/series/{series}/instances", get(instances_of_series))
        .route(
            "/studies/{study}/series/{series}/instances/{sop}",
            get(retrieve_instance),
        )
        .route("/series", get(search_series))
        .route("/instances", get(search_instances))
        .with_state(archive)
}

/// Serve the mock archive on an ephemeral port; returns its base URL
pub async fn spawn_archive(archive: Arc<MockArchive>) -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock archive");
    let addr = listener.local_addr().unwrap();
    let app = router(archive);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

/// Minimal valid configuration pointing at `base_url`
pub fn config_for(base_url: &str, extra: &str) -> Config {
    let toml = format!(
        r#"
[archive]
id = "mock"
base_url = "{}/"
retrieve_headers = ["Authorization: &access_token=secret"]

{}
"#,
        base_url, extra
    );
    Config::from_toml(&toml).expect("valid test configuration")
}

// Fake DIMSE peers and recording collaborators

use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arcfetch::collab::{LocalImport, RemoteManifestLoader, RetrieveListener};
use arcfetch::query::QueryService;
use arcfetch::scheduler::{Progress, RetrievalScheduler};
use arcfetch::storage::FilesystemStorage;
use arcfetch::task::TaskSinks;
use arcfetch::transport::{FirstNodeChooser, TransportDeps, TransportRegistry};
use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use dimse::{
    DimseError, DimseState, DimseStatus, FindQuery, RemoteNode, RetrieveQuery, ScuOperations,
    StoreListener, SubOperations, TransferContext,
};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum ScuBehavior {
    /// Store this many instances, then report success
    Succeed(u32),
    /// Store this many instances, then answer with a failure status
    FailStatus(u32, u16, Option<String>),
    Reject(String),
    /// Block until cancelled
    WaitForCancel,
    /// Store this many instances, then end with this status and no comment
    EndWith(u32, DimseStatus),
}

/// One recorded C-GET or C-MOVE
#[derive(Debug, Clone)]
pub struct ScuCall {
    pub op: &'static str,
    pub study_uids: Vec<String>,
    pub series_uids: Vec<String>,
    pub destination: Option<String>,
    pub output_dir: PathBuf,
    pub listener_running: Option<bool>,
}

pub struct FakeScu {
    pub aet: String,
    pub behavior: ScuBehavior,
    pub calls: Mutex<Vec<ScuCall>>,
    pub started: Notify,
    pub listener: Option<Arc<FakeListener>>,
}

impl FakeScu {
    pub fn new(behavior: ScuBehavior) -> Self {
        Self {
            aet: "ARCFETCH_SCU".into(),
            behavior,
            calls: Mutex::new(Vec::new()),
            started: Notify::new(),
            listener: None,
        }
    }

    pub fn watching(mut self, listener: Arc<FakeListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn calls(&self) -> Vec<ScuCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn transfer(
        &self,
        op: &'static str,
        query: RetrieveQuery,
        destination: Option<&str>,
        ctx: TransferContext,
    ) -> dimse::Result<DimseState> {
        self.calls.lock().unwrap().push(ScuCall {
            op,
            study_uids: query.study_uids.clone(),
            series_uids: query.series_uids.clone(),
            destination: destination.map(str::to_string),
            output_dir: ctx.output_dir.clone(),
            listener_running: self.listener.as_ref().map(|l| l.is_running()),
        });
        self.started.notify_one();

        let store = |count: u32| -> dimse::Result<SubOperations> {
            std::fs::create_dir_all(&ctx.output_dir)?;
            for i in 0..count {
                let name = format!("{}_{}.dcm", query.series_uids.first().map(String::as_str).unwrap_or("study"), i);
                std::fs::write(ctx.output_dir.join(name), b"DICM")?;
                if let Some(progress) = &ctx.progress {
                    progress(SubOperations {
                        completed: i + 1,
                        failed: 0,
                        warning: 0,
                        remaining: count - i - 1,
                    });
                }
            }
            Ok(SubOperations {
                completed: count,
                ..Default::default()
            })
        };

        match &self.behavior {
            ScuBehavior::Succeed(count) => {
                let sub_ops = store(*count)?;
                Ok(DimseState::new(DimseStatus::Success).with_sub_ops(sub_ops))
            }
            ScuBehavior::FailStatus(count, code, message) => {
                let mut sub_ops = store(*count)?;
                sub_ops.failed = 1;
                let mut state = DimseState::new(DimseStatus::Failure(*code)).with_sub_ops(sub_ops);
                if let Some(message) = message {
                    state = state.with_message(message.clone());
                }
                Ok(state)
            }
            ScuBehavior::Reject(reason) => Err(DimseError::AssociationRejected(reason.clone())),
            ScuBehavior::EndWith(count, status) => {
                let sub_ops = store(*count)?;
                Ok(DimseState::new(*status).with_sub_ops(sub_ops))
            }
            ScuBehavior::WaitForCancel => {
                ctx.cancel.cancelled().await;
                Ok(DimseState::new(DimseStatus::Cancel))
            }
        }
    }
}

#[async_trait]
impl ScuOperations for FakeScu {
    fn calling_aet(&self) -> &str {
        &self.aet
    }

    async fn find(&self, _node: &RemoteNode, _query: FindQuery) -> dimse::Result<Vec<InMemDicomObject>> {
        Ok(Vec::new())
    }

    async fn get(
        &self,
        _node: &RemoteNode,
        query: RetrieveQuery,
        ctx: TransferContext,
    ) -> dimse::Result<DimseState> {
        self.transfer("get", query, None, ctx).await
    }

    async fn move_to(
        &self,
        _node: &RemoteNode,
        query: RetrieveQuery,
        destination_aet: &str,
        ctx: TransferContext,
    ) -> dimse::Result<DimseState> {
        self.transfer("move", query, Some(destination_aet), ctx).await
    }
}

/// C-STORE listener that only tracks whether it runs
pub struct FakeListener {
    pub dir: PathBuf,
    pub running: AtomicBool,
    pub fail_start: bool,
    /// `start` loses to another owner that starts the listener first
    pub claimed_elsewhere: bool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeListener {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            running: AtomicBool::new(false),
            fail_start: false,
            claimed_elsewhere: false,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn claimed_elsewhere(mut self) -> Self {
        self.claimed_elsewhere = true;
        self
    }
}

#[async_trait]
impl StoreListener for FakeListener {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn storage_dir(&self) -> &FsPath {
        &self.dir
    }

    async fn start(&self) -> dimse::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.claimed_elsewhere {
            self.running.store(true, Ordering::SeqCst);
            return Err(DimseError::AlreadyRunning("STORESCP@0.0.0.0:11113".into()));
        }
        if self.fail_start {
            return Err(DimseError::Network(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "port 11113 in use",
            )));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> dimse::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingListener {
    pub errors: Mutex<Vec<(String, String)>>,
    pub progress: Mutex<Vec<Progress>>,
    pub cancel_requests: AtomicUsize,
}

impl RetrieveListener for RecordingListener {
    fn on_progress(&self, progress: Progress) {
        self.progress.lock().unwrap().push(progress);
    }

    fn on_cancel_requested(&self) {
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, message: &str, title: &str) {
        self.errors
            .lock()
            .unwrap()
            .push((message.to_string(), title.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingImport {
    pub folders: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl LocalImport for RecordingImport {
    async fn import(&self, folders: Vec<PathBuf>) {
        self.folders.lock().unwrap().extend(folders);
    }
}

#[derive(Default)]
pub struct RecordingLoader {
    pub manifests: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl RemoteManifestLoader for RecordingLoader {
    async fn load(&self, xml_paths: Vec<PathBuf>) {
        self.manifests.lock().unwrap().extend(xml_paths);
    }
}

/// Sinks plus typed handles on them
pub struct Sinks {
    pub listener: Arc<RecordingListener>,
    pub import: Arc<RecordingImport>,
    pub loader: Arc<RecordingLoader>,
}

impl Sinks {
    pub fn new() -> Self {
        Self {
            listener: Arc::new(RecordingListener::default()),
            import: Arc::new(RecordingImport::default()),
            loader: Arc::new(RecordingLoader::default()),
        }
    }

    pub fn task_sinks(&self) -> TaskSinks {
        TaskSinks {
            listener: self.listener.clone(),
            import: self.import.clone(),
            manifest_loader: self.loader.clone(),
        }
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.listener.errors.lock().unwrap().clone()
    }
}

/// `[archive.dimse]` and `[dimse]` sections for the DIMSE transports
pub fn dimse_sections(storage_dir: &FsPath) -> String {
    format!(
        r#"
[archive.dimse]
ae_title = "PACS"
host = "127.0.0.1"
port = 11112

[dimse]
local_aet = "ARCFETCH_SCU"
port = 11113
storage_dir = "{}"
"#,
        storage_dir.display()
    )
}

pub fn registry(
    config: Config,
    scu: Arc<dyn ScuOperations>,
    listener: Option<Arc<dyn StoreListener>>,
    query: Arc<dyn QueryService>,
    storage_root: &FsPath,
) -> TransportRegistry {
    let storage = FilesystemStorage::new(storage_root).expect("storage root");
    TransportRegistry::new(TransportDeps {
        config: Arc::new(config),
        scu,
        listener,
        scheduler: RetrievalScheduler::new(2),
        storage: Arc::new(storage),
        model: Arc::new(arcfetch::model::HierarchyModel::new(
            arcfetch::events::EventBus::new(),
        )),
        query,
        chooser: Arc::new(FirstNodeChooser),
    })
}
