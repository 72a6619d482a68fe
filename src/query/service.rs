use async_trait::async_trait;
use dicom_attrs::Attributes;

use crate::error::QueryError;

/// Matching key of a study-level query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StudyKey {
    Patient { id: String, issuer: Option<String> },
    StudyUid(String),
    Accession(String),
}

/// One query against the archive.
///
/// `Series` and `Instances` answers also carry the study and patient
/// attributes so the resolver can attach them to the right parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LevelQuery {
    Studies(StudyKey),
    SeriesOfStudy {
        study_uid: String,
    },
    Series {
        series_uid: String,
    },
    InstancesOfSeries {
        study_uid: String,
        series_uid: String,
        /// Series retrieve URL, used as QIDO-RS base when known
        retrieve_url: Option<String>,
    },
    Instances {
        sop_uid: String,
    },
}

impl LevelQuery {
    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            LevelQuery::Studies(StudyKey::Patient { id, issuer }) => match issuer {
                Some(i) => format!("PatientID {}^^^{}", id, i),
                None => format!("PatientID {}", id),
            },
            LevelQuery::Studies(StudyKey::StudyUid(uid)) => format!("studyUID {}", uid),
            LevelQuery::Studies(StudyKey::Accession(acc)) => format!("AccessionNumber {}", acc),
            LevelQuery::SeriesOfStudy { study_uid } => format!("all series with studyUID {}", study_uid),
            LevelQuery::Series { series_uid } => format!("seriesUID {}", series_uid),
            LevelQuery::InstancesOfSeries { series_uid, .. } => {
                format!("all instances with seriesUID {}", series_uid)
            }
            LevelQuery::Instances { sop_uid } => format!("sopInstanceUID {}", sop_uid),
        }
    }
}

/// Query backend (QIDO-RS or C-FIND)
#[async_trait]
pub trait QueryService: Send + Sync {
    fn name(&self) -> &'static str;

    async fn find(&self, query: &LevelQuery) -> Result<Vec<Attributes>, QueryError>;
}
