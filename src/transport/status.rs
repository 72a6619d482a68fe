//! DIMSE status interpretation (PS3.4 Annex C).
//!
//! - `0x0000`: Success
//! - `0x0001`, `0xB000-0xBFFF`: Warning
//! - `0xFE00`: Cancel
//! - `0xFF00`, `0xFF01`: Pending
//! - anything else: Failure

use dimse::{DimseError, DimseState, DimseStatus};

use crate::error::TransportError;
use crate::scheduler::TaskOutcome;

pub const UNEXPECTED_DICOM_ERROR: &str = "Unexpected DICOM error";

/// Human message for the common failure codes
pub fn status_message(code: u16) -> Option<&'static str> {
    let msg = match code {
        0x0122 => "SOP class not supported",
        0x0124 => "Not authorized",
        0x0110 => "Processing failure",
        0x0211 => "Unrecognized operation",
        0xA700..=0xA7FF => "Refused: out of resources",
        0xA801 => "Refused: move destination unknown",
        0xA900..=0xA9FF => "Identifier does not match SOP class",
        0xC000..=0xCFFF => "Unable to process",
        _ => return None,
    };
    Some(msg)
}

/// Maps HTTP status codes of DICOMweb answers to DIMSE status codes
pub fn http_status_to_dimse(http_status: u16) -> DimseStatus {
    match http_status {
        200..=299 => DimseStatus::Success,
        401 | 403 => DimseStatus::Failure(0x0124),
        404 | 410 => DimseStatus::Failure(0xA900),
        413 | 429 | 507 => DimseStatus::Failure(0xA700),
        502..=504 => DimseStatus::Failure(0xA701),
        400..=499 => DimseStatus::Failure(0xC000),
        _ => DimseStatus::Failure(0x0110),
    }
}

/// Success, including warnings
pub fn is_successful_status(status: &DimseStatus) -> bool {
    matches!(status, DimseStatus::Success | DimseStatus::Warning(_))
}

/// Message for a failed state: explicit message, else status-derived, else generic
pub fn failure_message(state: &DimseState) -> String {
    if let Some(msg) = state.message.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        return msg.to_string();
    }
    if let DimseStatus::Failure(code) = state.status {
        if let Some(msg) = status_message(code) {
            return format!("{} (0x{:04X})", msg, code);
        }
    }
    UNEXPECTED_DICOM_ERROR.to_string()
}

/// Terminal outcome of a C-GET or C-MOVE
pub fn state_to_outcome(state: &DimseState) -> TaskOutcome {
    match state.status {
        DimseStatus::Cancel => TaskOutcome::Cancelled,
        ref s if is_successful_status(s) => {
            if let DimseStatus::Warning(code) = s {
                tracing::warn!(
                    "retrieve completed with warning 0x{:04X}, {} sub-operations failed",
                    code,
                    state.sub_ops.failed
                );
            }
            TaskOutcome::Completed
        }
        // A final Pending means the operation never finished
        _ => TaskOutcome::Failed(TransportError::DicomFailure(failure_message(state))),
    }
}

pub fn error_to_outcome(err: DimseError) -> TaskOutcome {
    match TransportError::from(err) {
        TransportError::Cancelled => TaskOutcome::Cancelled,
        other => TaskOutcome::Failed(other),
    }
}
