//! DIMSE (DICOM Message Service Element) query/retrieve client
//!
//! This crate drives the outbound side of DICOM query/retrieve (C-FIND, C-GET,
//! C-MOVE) and the short-lived C-STORE listener that receives C-MOVE pushes.
//!
//! # Features
//! - Outbound DIMSE services (SCU): C-FIND, C-GET, C-MOVE through DCMTK tools
//! - Inbound C-STORE listener (SCP) with a process-wide running registry
//! - Sub-operation progress reporting and cooperative cancellation

pub mod config;
pub mod error;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{StoreListener, StoreScp};
pub use scu::{DimseScu, ScuOperations};
pub use types::{
    DimseState, DimseStatus, FindQuery, ProgressFn, QueryLevel, RetrieveQuery, SubOperations,
    TransferContext,
};

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
