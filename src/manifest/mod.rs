//! XML manifest (schema 2.5) handed to a remote manifest loader.

mod builder;

pub use builder::{ArcQuery, ManifestBuilder, Severity, ViewerMessage, MANIFEST_NAMESPACE};
