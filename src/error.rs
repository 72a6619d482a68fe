use dimse::DimseError;
use thiserror::Error;

/// Failure while querying the archive for one identifier.
///
/// The resolver logs these and keeps going with the other identifiers of the request.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("cannot decode query response: {0}")]
    Parse(String),

    #[error("C-FIND failed: {0}")]
    Dimse(#[from] DimseError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0} is not supported by this query backend")]
    Unsupported(String),
}

impl From<dicom_attrs::ConvertError> for QueryError {
    fn from(err: dicom_attrs::ConvertError) -> Self {
        QueryError::Parse(err.to_string())
    }
}

/// Malformed filter value. The filter is skipped, resolution continues.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid date '{value}' for {param}")]
    InvalidDate { param: String, value: String },

    #[error("invalid number '{value}' for {param}")]
    InvalidNumber { param: String, value: String },
}

/// Retrieve failure, collapsed into one user-facing message per task
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Cannot connect to the archive: {0}")]
    ConnectionError(String),

    #[error("Association rejected: {0}")]
    AssociationRejected(String),

    #[error("Retrieve cancelled")]
    Cancelled,

    #[error("Unsupported retrieve type: {0}")]
    UnsupportedRetrieveType(String),

    #[error("Cannot build the manifest: {0}")]
    ManifestBuildFailed(String),

    #[error("Cannot start the DICOM listener: {0}")]
    ListenerUnavailable(String),

    #[error("No WADO node matches the archive host {0}")]
    NoMatchingWebNode(String),

    #[error("No calling DICOM node is configured")]
    NoCallingNode,

    #[error("Cannot store retrieved data: {0}")]
    Storage(String),

    #[error("{0}")]
    DicomFailure(String),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

impl From<crate::storage::StorageError> for TransportError {
    fn from(err: crate::storage::StorageError) -> Self {
        TransportError::Storage(err.to_string())
    }
}

impl From<DimseError> for TransportError {
    fn from(err: DimseError) -> Self {
        match err {
            DimseError::Network(e) => TransportError::ConnectionError(e.to_string()),
            DimseError::Timeout(msg) => TransportError::ConnectionError(msg),
            DimseError::AssociationRejected(msg) => TransportError::AssociationRejected(msg),
            DimseError::AlreadyRunning(msg) => {
                TransportError::ListenerUnavailable(format!("already running ({})", msg))
            }
            other => TransportError::DicomFailure(other.to_string()),
        }
    }
}

/// Invalid mutation of the hierarchy model
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("parent node {0} does not exist")]
    MissingParent(String),

    #[error("a {child} node cannot be created under a {parent} node")]
    WrongParentLevel { parent: String, child: String },

    #[error("field {0} cannot be changed after creation")]
    ImmutableField(String),

    #[error("node {0} does not exist")]
    NotFound(String),
}

/// Manifest serialization failure
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot write manifest XML: {0}")]
    Xml(String),

    #[error("manifest is not valid UTF-8")]
    Encoding,
}
