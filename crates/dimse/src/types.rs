//! Common types for DIMSE operations

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use dicom_core::Tag;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// DICOM query/retrieve levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryLevel {
    /// Patient level
    Patient,
    /// Study level
    Study,
    /// Series level
    Series,
    /// Image level
    Image,
}

/// Query parameters for C-FIND operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindQuery {
    /// Query level (PATIENT, STUDY, SERIES, IMAGE)
    pub query_level: QueryLevel,

    /// Matching and return keys, keyed by 8-hex-digit tag (`0020000D`)
    /// or DCMTK dictionary keyword. Empty values are return keys.
    pub parameters: BTreeMap<String, String>,
}

/// Matching keys of a C-GET or C-MOVE request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveQuery {
    /// Retrieve level (STUDY or SERIES in practice)
    pub query_level: QueryLevel,

    /// Study Instance UIDs; several values form a batch retrieve
    pub study_uids: Vec<String>,

    /// Series Instance UIDs (SERIES level only)
    pub series_uids: Vec<String>,

    /// Number of instances expected, when known from a previous query
    pub expected_instances: Option<u32>,
}

/// DIMSE operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimseStatus {
    /// Operation completed successfully
    Success,
    /// Operation is pending (more responses to follow)
    Pending,
    /// Operation cancelled by user
    Cancel,
    /// Operation failed with error
    Failure(u16), // DICOM status code
    /// Warning occurred during operation
    Warning(u16), // DICOM status code
}

/// Sub-operation counters of a C-GET or C-MOVE
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperations {
    pub completed: u32,
    pub failed: u32,
    pub warning: u32,
    pub remaining: u32,
}

/// Terminal state of a retrieve operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimseState {
    pub status: DimseStatus,
    /// Error comment or tool diagnostic, when one was produced
    pub message: Option<String>,
    pub sub_ops: SubOperations,
}

/// Callback receiving sub-operation progress
pub type ProgressFn = Arc<dyn Fn(SubOperations) + Send + Sync>;

/// Per-operation context for C-GET and C-MOVE
#[derive(Clone)]
pub struct TransferContext {
    /// Directory receiving the retrieved instances (C-GET output, or the
    /// listener's storage directory for C-MOVE)
    pub output_dir: PathBuf,
    pub progress: Option<ProgressFn>,
    pub cancel: CancellationToken,
}

impl FindQuery {
    /// Create an empty query at the given level
    pub fn new(query_level: QueryLevel) -> Self {
        Self {
            query_level,
            parameters: BTreeMap::new(),
        }
    }

    /// Create a new study-level query
    pub fn study(study_instance_uid: Option<String>) -> Self {
        let query = Self::new(QueryLevel::Study);
        match study_instance_uid {
            Some(uid) => query.with_tag(dicom_dictionary_std::tags::STUDY_INSTANCE_UID, uid),
            None => query,
        }
    }

    /// Add a query parameter
    pub fn with_parameter(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(tag.into(), value.into());
        self
    }

    /// Add a query parameter addressed by tag
    pub fn with_tag(self, tag: Tag, value: impl Into<String>) -> Self {
        self.with_parameter(tag_key(tag), value)
    }

    /// Request a return key
    pub fn returning(self, tag: Tag) -> Self {
        let key = tag_key(tag);
        if self.parameters.contains_key(&key) {
            return self;
        }
        self.with_parameter(key, "")
    }
}

impl RetrieveQuery {
    /// Study-level retrieve of one or more studies
    pub fn studies(study_uids: Vec<String>) -> Self {
        Self {
            query_level: QueryLevel::Study,
            study_uids,
            series_uids: Vec::new(),
            expected_instances: None,
        }
    }

    /// Series-level retrieve within one study
    pub fn series(study_uid: impl Into<String>, series_uids: Vec<String>) -> Self {
        Self {
            query_level: QueryLevel::Series,
            study_uids: vec![study_uid.into()],
            series_uids,
            expected_instances: None,
        }
    }

    pub fn with_expected_instances(mut self, count: u32) -> Self {
        self.expected_instances = Some(count);
        self
    }
}

impl DimseStatus {
    /// Classify a DIMSE status code (PS3.7 Annex C)
    pub fn from_code(code: u16) -> Self {
        match code {
            0x0000 => DimseStatus::Success,
            0xFF00 | 0xFF01 => DimseStatus::Pending,
            0xFE00 => DimseStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => DimseStatus::Warning(code),
            _ => DimseStatus::Failure(code),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            DimseStatus::Success => 0x0000,
            DimseStatus::Pending => 0xFF00,
            DimseStatus::Cancel => 0xFE00,
            DimseStatus::Failure(c) | DimseStatus::Warning(c) => *c,
        }
    }
}

impl SubOperations {
    pub fn total(&self) -> u32 {
        self.completed + self.failed + self.warning + self.remaining
    }
}

impl DimseState {
    pub fn new(status: DimseStatus) -> Self {
        Self {
            status,
            message: None,
            sub_ops: SubOperations::default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_sub_ops(mut self, sub_ops: SubOperations) -> Self {
        self.sub_ops = sub_ops;
        self
    }
}

impl TransferContext {
    pub fn new(output_dir: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            output_dir: output_dir.into(),
            progress: None,
            cancel,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub(crate) fn report(&self, sub_ops: SubOperations) {
        if let Some(progress) = &self.progress {
            progress(sub_ops);
        }
    }
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("output_dir", &self.output_dir)
            .field("progress", &self.progress.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// 8-hex-digit key for a tag, as used in DICOM JSON and query parameters
pub fn tag_key(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

impl std::fmt::Display for QueryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryLevel::Patient => write!(f, "PATIENT"),
            QueryLevel::Study => write!(f, "STUDY"),
            QueryLevel::Series => write!(f, "SERIES"),
            QueryLevel::Image => write!(f, "IMAGE"),
        }
    }
}

impl std::str::FromStr for QueryLevel {
    type Err = crate::error::DimseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PATIENT" => Ok(QueryLevel::Patient),
            "STUDY" => Ok(QueryLevel::Study),
            "SERIES" => Ok(QueryLevel::Series),
            "IMAGE" | "INSTANCE" => Ok(QueryLevel::Image),
            _ => Err(crate::error::DimseError::config(format!(
                "Invalid query level: {}",
                s
            ))),
        }
    }
}
