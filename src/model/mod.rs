//! Deduplicated patient, study, series and instance tree.

mod builders;
mod tree;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use dicom_attrs::Attributes;

pub use builders::{
    instance_attributes, instance_key, patient_attributes, patient_pseudo_uid,
    series_attributes, study_attributes,
};
pub use tree::{HierarchyModel, InstanceView, PatientView, SeriesView, StudyView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Patient,
    Study,
    Series,
    Instance,
}

impl Level {
    /// Level a node of this level hangs under
    pub fn parent(self) -> Option<Level> {
        match self {
            Level::Patient => None,
            Level::Study => Some(Level::Patient),
            Level::Series => Some(Level::Study),
            Level::Instance => Some(Level::Series),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Level::Patient => "PATIENT",
            Level::Study => "STUDY",
            Level::Series => "SERIES",
            Level::Instance => "INSTANCE",
        };
        f.write_str(name)
    }
}

/// Retrieval metadata that may still change after a node was created.
///
/// Everything else on a node is fixed by its first writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RetrievalField {
    RetrieveUrl,
    DirectDownloadFile,
    DirectDownloadThumbnail,
    WadoTransferSyntaxUid,
    WadoCompressionRate,
}

impl RetrievalField {
    pub const ALL: [RetrievalField; 5] = [
        RetrievalField::RetrieveUrl,
        RetrievalField::DirectDownloadFile,
        RetrievalField::DirectDownloadThumbnail,
        RetrievalField::WadoTransferSyntaxUid,
        RetrievalField::WadoCompressionRate,
    ];

    /// Name used in manifests and in update requests
    pub fn name(self) -> &'static str {
        match self {
            RetrievalField::RetrieveUrl => "RetrieveURL",
            RetrievalField::DirectDownloadFile => "DirectDownloadFile",
            RetrievalField::DirectDownloadThumbnail => "DirectDownloadThumbnail",
            RetrievalField::WadoTransferSyntaxUid => "WadoTransferSyntaxUID",
            RetrievalField::WadoCompressionRate => "WadoCompressionRate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
    }
}

/// One node of the tree. Shared as [`NodeRef`].
#[derive(Debug)]
pub struct HierarchyNode {
    level: Level,
    key: String,
    /// Keys of the ancestors, patient first
    path: Vec<String>,
    attributes: Attributes,
    retrieval: RwLock<BTreeMap<RetrievalField, String>>,
}

pub type NodeRef = Arc<HierarchyNode>;

impl HierarchyNode {
    fn new(level: Level, key: String, path: Vec<String>, attributes: Attributes) -> Self {
        Self {
            level,
            key,
            path,
            attributes,
            retrieval: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Pseudo-UID for patients, UID for the other levels
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn retrieval(&self, field: RetrievalField) -> Option<String> {
        let guard = match self.retrieval.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(&field).cloned()
    }

    /// Every retrieval field that has a value
    pub fn retrieval_fields(&self) -> Vec<(RetrievalField, String)> {
        let guard = match self.retrieval.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    fn set_retrieval(&self, field: RetrievalField, value: String, overwrite: bool) -> bool {
        let mut guard = match self.retrieval.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !overwrite && guard.contains_key(&field) {
            return false;
        }
        guard.insert(field, value);
        true
    }
}
