use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dicom_attrs::Attributes;
use dicom_dictionary_std::tags;

use crate::config::WebNodeConfig;
use crate::error::TransportError;
use crate::events::EventBus;
use crate::manifest::{ArcQuery, ManifestBuilder};
use crate::model::HierarchyModel;
use crate::query::{LevelQuery, QueryService, StudyKey};
use crate::storage::StorageBackend;
use crate::transport::{
    RetrieveRequest, RetrieveTransport, StateCell, TransportKind, TransportOutcome, TransportState,
};

const LOCAL_ARC_ID: &str = "localWadoRetrieve";

/// Loopback spellings all compare as `localhost`
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().trim_matches(['[', ']']);
    match host {
        "127.0.0.1" | "127.0.1.1" | "::1" => "localhost".to_string(),
        other => other.to_lowercase(),
    }
}

/// Picks one node when several WADO nodes match the archive
pub trait WebNodeChooser: Send + Sync {
    fn choose(&self, candidates: &[WebNodeConfig]) -> Option<usize>;
}

/// Non-interactive choice: the first candidate
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstNodeChooser;

impl WebNodeChooser for FirstNodeChooser {
    fn choose(&self, _candidates: &[WebNodeConfig]) -> Option<usize> {
        Some(0)
    }
}

/// Asks on a terminal which of the matching nodes to use.
///
/// End of input, or an unusable reader or writer, leaves the choice to the
/// caller's default.
pub struct PromptNodeChooser<R, W> {
    io: Mutex<(R, W)>,
}

impl PromptNodeChooser<BufReader<io::Stdin>, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stderr())
    }
}

impl<R, W> PromptNodeChooser<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            io: Mutex::new((input, output)),
        }
    }
}

impl<R: BufRead + Send, W: Write + Send> WebNodeChooser for PromptNodeChooser<R, W> {
    fn choose(&self, candidates: &[WebNodeConfig]) -> Option<usize> {
        let mut guard = self.io.lock().ok()?;
        let (input, output) = &mut *guard;
        let n = candidates.len();

        writeln!(output, "Several WADO nodes match the archive:").ok()?;
        for (i, node) in candidates.iter().enumerate() {
            writeln!(output, "  {}) {} ({})", i + 1, node.name, node.url).ok()?;
        }
        loop {
            write!(output, "WADO node [1-{}]: ", n).ok()?;
            output.flush().ok()?;
            let mut line = String::new();
            if input.read_line(&mut line).ok()? == 0 {
                return None;
            }
            match line.trim().parse::<usize>() {
                Ok(i) if (1..=n).contains(&i) => return Some(i - 1),
                _ => writeln!(output, "Enter a number between 1 and {}", n).ok()?,
            }
        }
    }
}

/// WADO-RS: no transfer here. Builds a manifest describing the studies with
/// the matching WADO node as base URL and hands it to the manifest loader.
pub struct WadoTransport {
    archive_host: String,
    nodes: Vec<WebNodeConfig>,
    chooser: Arc<dyn WebNodeChooser>,
    model: Arc<HierarchyModel>,
    query: Arc<dyn QueryService>,
    storage: Arc<dyn StorageBackend>,
    state: StateCell,
}

impl WadoTransport {
    pub fn new(
        archive_host: impl Into<String>,
        nodes: Vec<WebNodeConfig>,
        chooser: Arc<dyn WebNodeChooser>,
        model: Arc<HierarchyModel>,
        query: Arc<dyn QueryService>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            archive_host: archive_host.into(),
            nodes,
            chooser,
            model,
            query,
            storage,
            state: StateCell::new(TransportKind::Wado),
        }
    }

    /// WADO nodes whose host contains the archive host
    pub fn matching_nodes(&self) -> Vec<WebNodeConfig> {
        let host = normalize_host(&self.archive_host);
        self.nodes
            .iter()
            .filter(|n| n.web_type == crate::config::WebType::Wado)
            .filter(|n| {
                n.hostname()
                    .map(|h| normalize_host(&h).contains(&host))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn select_node(&self) -> Result<WebNodeConfig, TransportError> {
        let mut candidates = self.matching_nodes();
        match candidates.len() {
            0 => Err(TransportError::NoMatchingWebNode(self.archive_host.clone())),
            1 => Ok(candidates.remove(0)),
            n => {
                let index = self.chooser.choose(&candidates).filter(|i| *i < n).unwrap_or(0);
                Ok(candidates.swap_remove(index))
            }
        }
    }

    /// Study and patient attributes, from the shared model when the study is
    /// known there, else from the archive
    async fn study_attributes(&self, study_uid: &str) -> Result<Option<Attributes>, TransportError> {
        if let Some(study) = self.model.study_by_uid(study_uid) {
            let mut attrs = study.attributes().clone();
            if let Some(patient) = self.model.parent(&study) {
                attrs.merge_missing(patient.attributes());
            }
            return Ok(Some(attrs));
        }
        let found = self
            .query
            .find(&LevelQuery::Studies(StudyKey::StudyUid(study_uid.to_string())))
            .await
            .map_err(|e| TransportError::ManifestBuildFailed(e.to_string()))?;
        Ok(found.into_iter().next())
    }

    /// Fill a scratch model with every series holding at least one instance
    async fn fill_series(
        &self,
        scratch: &HierarchyModel,
        request: &RetrieveRequest,
    ) -> Result<(), TransportError> {
        let lookup = |e: crate::error::QueryError| TransportError::ManifestBuildFailed(e.to_string());
        let model_err = |e: crate::error::ModelError| TransportError::ManifestBuildFailed(e.to_string());

        for study_uid in &request.study_uids {
            if request.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let Some(study_attrs) = self.study_attributes(study_uid).await? else {
                tracing::warn!("study {} not found, skipped from the manifest", study_uid);
                continue;
            };
            let patient = scratch.patient(&study_attrs).map_err(model_err)?;
            let study = scratch.study(&patient, &study_attrs).map_err(model_err)?;

            let wanted: Vec<&str> = request
                .series
                .iter()
                .filter(|t| &t.study_uid == study_uid)
                .map(|t| t.series_uid.as_str())
                .collect();

            let series_list = self
                .query
                .find(&LevelQuery::SeriesOfStudy {
                    study_uid: study_uid.clone(),
                })
                .await
                .map_err(lookup)?;

            for series_attrs in series_list {
                let Some(series_uid) = series_attrs.string(tags::SERIES_INSTANCE_UID) else {
                    continue;
                };
                if !wanted.is_empty() && !wanted.contains(&series_uid) {
                    continue;
                }
                let instances = self
                    .query
                    .find(&LevelQuery::InstancesOfSeries {
                        study_uid: study_uid.clone(),
                        series_uid: series_uid.to_string(),
                        retrieve_url: None,
                    })
                    .await
                    .map_err(lookup)?;
                if instances.is_empty() {
                    continue;
                }
                let series = scratch.series(&study, &series_attrs).map_err(model_err)?;
                for instance in &instances {
                    if let Err(e) = scratch.instance(&series, instance, None) {
                        tracing::debug!("instance skipped: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn build_manifest(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError> {
        let node = self.select_node()?;
        tracing::info!("WADO retrieve through {} ({})", node.name, node.url);
        self.state.set(TransportState::Associated);

        let scratch = HierarchyModel::new(EventBus::new());
        self.state.set(TransportState::Transferring);
        self.fill_series(&scratch, request).await?;

        let mut builder = ManifestBuilder::new();
        builder.add_patients(scratch.snapshot());
        let arc = ArcQuery {
            arc_id: LOCAL_ARC_ID.to_string(),
            base_url: node.url.clone(),
            http_tags: node.header_pairs(),
            ..ArcQuery::default()
        };
        let xml = builder
            .xml_manifest(&arc, None)
            .map_err(|e| TransportError::ManifestBuildFailed(e.to_string()))?
            .ok_or_else(|| TransportError::ManifestBuildFailed("nothing to retrieve".into()))?;

        let path = self
            .storage
            .write_manifest(&xml)
            .map_err(|e| TransportError::ManifestBuildFailed(e.to_string()))?;
        tracing::debug!("manifest written to {}", path.display());
        Ok(TransportOutcome::Manifest(vec![path]))
    }
}

#[async_trait]
impl RetrieveTransport for WadoTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Wado
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    async fn execute(&self, request: &RetrieveRequest) -> Result<TransportOutcome, TransportError> {
        let result = self.build_manifest(request).await;
        self.state.finish(&result);
        result
    }
}
