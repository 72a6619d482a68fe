//! Resolution of Invoke Image Display requests against a remote archive.

pub mod cfind;
pub mod filters;
pub mod qido;
pub mod request;
pub mod resolver;
pub mod service;

pub use cfind::CFindClient;
pub use filters::StudyFilters;
pub use qido::QidoClient;
pub use request::{FilterParams, QueryRequest, RequestType};
pub use resolver::{QueryResolver, ResolveFailure, ResolveReport, ResolvedSeries};
pub use service::{LevelQuery, QueryService, StudyKey};
