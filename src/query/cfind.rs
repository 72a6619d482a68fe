use std::sync::Arc;

use async_trait::async_trait;
use dicom_attrs::Attributes;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dimse::{FindQuery, QueryLevel, RemoteNode, ScuOperations};

use crate::error::QueryError;
use crate::query::service::{LevelQuery, QueryService, StudyKey};

const STUDY_RETURN_KEYS: &[Tag] = &[
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::ACCESSION_NUMBER,
    tags::MODALITIES_IN_STUDY,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::STUDY_DESCRIPTION,
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::ISSUER_OF_PATIENT_ID,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_SEX,
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_ID,
];

const SERIES_RETURN_KEYS: &[Tag] = &[
    tags::SERIES_INSTANCE_UID,
    tags::STUDY_INSTANCE_UID,
    tags::MODALITY,
    tags::SERIES_NUMBER,
    tags::SERIES_DESCRIPTION,
];

const INSTANCE_RETURN_KEYS: &[Tag] = &[
    tags::SOP_INSTANCE_UID,
    tags::SOP_CLASS_UID,
    tags::INSTANCE_NUMBER,
    tags::SERIES_INSTANCE_UID,
    tags::STUDY_INSTANCE_UID,
];

/// C-FIND query backend
#[derive(Clone)]
pub struct CFindClient {
    scu: Arc<dyn ScuOperations>,
    node: RemoteNode,
}

impl CFindClient {
    pub fn new(scu: Arc<dyn ScuOperations>, node: RemoteNode) -> Self {
        Self { scu, node }
    }

    async fn run(&self, query: FindQuery) -> Result<Vec<Attributes>, QueryError> {
        tracing::debug!(
            "C-FIND {} at {} with {:?}",
            query.query_level,
            self.node,
            query.parameters
        );
        let objects = self.scu.find(&self.node, query).await?;
        Ok(objects.iter().map(Attributes::from_object).collect())
    }

    async fn study_of(&self, study_uid: &str) -> Result<Option<Attributes>, QueryError> {
        let query = returning(
            FindQuery::new(QueryLevel::Study).with_tag(tags::STUDY_INSTANCE_UID, study_uid),
            STUDY_RETURN_KEYS,
        );
        Ok(self.run(query).await?.into_iter().next())
    }

    async fn series_of(&self, study_uid: &str, series_uid: &str) -> Result<Option<Attributes>, QueryError> {
        let query = returning(
            FindQuery::new(QueryLevel::Series)
                .with_tag(tags::STUDY_INSTANCE_UID, study_uid)
                .with_tag(tags::SERIES_INSTANCE_UID, series_uid),
            SERIES_RETURN_KEYS,
        );
        Ok(self.run(query).await?.into_iter().next())
    }

    /// Complete each answer with its study (and patient) attributes
    async fn with_study(&self, mut answers: Vec<Attributes>) -> Result<Vec<Attributes>, QueryError> {
        let mut cache: Vec<(String, Attributes)> = Vec::new();
        for answer in answers.iter_mut() {
            let Some(study_uid) = answer.string(tags::STUDY_INSTANCE_UID).map(str::to_string) else {
                continue;
            };
            if !cache.iter().any(|(uid, _)| uid == &study_uid) {
                if let Some(study) = self.study_of(&study_uid).await? {
                    cache.push((study_uid.clone(), study));
                }
            }
            if let Some((_, study)) = cache.iter().find(|(uid, _)| uid == &study_uid) {
                answer.merge_missing(study);
            }
        }
        Ok(answers)
    }
}

fn returning(mut query: FindQuery, keys: &[Tag]) -> FindQuery {
    for tag in keys {
        query = query.returning(*tag);
    }
    query
}

#[async_trait]
impl QueryService for CFindClient {
    fn name(&self) -> &'static str {
        "C-FIND"
    }

    async fn find(&self, query: &LevelQuery) -> Result<Vec<Attributes>, QueryError> {
        match query {
            LevelQuery::Studies(key) => {
                let mut find = FindQuery::new(QueryLevel::Study);
                find = match key {
                    StudyKey::Patient { id, issuer } => {
                        let find = find.with_tag(tags::PATIENT_ID, id.as_str());
                        match issuer {
                            Some(issuer) => find.with_tag(tags::ISSUER_OF_PATIENT_ID, issuer.as_str()),
                            None => find,
                        }
                    }
                    StudyKey::StudyUid(uid) => find.with_tag(tags::STUDY_INSTANCE_UID, uid.as_str()),
                    StudyKey::Accession(acc) => find.with_tag(tags::ACCESSION_NUMBER, acc.as_str()),
                };
                self.run(returning(find, STUDY_RETURN_KEYS)).await
            }
            LevelQuery::SeriesOfStudy { study_uid } => {
                let find = FindQuery::new(QueryLevel::Series)
                    .with_tag(tags::STUDY_INSTANCE_UID, study_uid.as_str());
                self.run(returning(find, SERIES_RETURN_KEYS)).await
            }
            LevelQuery::Series { series_uid } => {
                let find = FindQuery::new(QueryLevel::Series)
                    .with_tag(tags::SERIES_INSTANCE_UID, series_uid.as_str());
                let series = self.run(returning(find, SERIES_RETURN_KEYS)).await?;
                self.with_study(series).await
            }
            LevelQuery::InstancesOfSeries {
                study_uid,
                series_uid,
                ..
            } => {
                let find = FindQuery::new(QueryLevel::Image)
                    .with_tag(tags::STUDY_INSTANCE_UID, study_uid.as_str())
                    .with_tag(tags::SERIES_INSTANCE_UID, series_uid.as_str());
                self.run(returning(find, INSTANCE_RETURN_KEYS)).await
            }
            LevelQuery::Instances { sop_uid } => {
                let find = FindQuery::new(QueryLevel::Image)
                    .with_tag(tags::SOP_INSTANCE_UID, sop_uid.as_str());
                let mut instances = self.run(returning(find, INSTANCE_RETURN_KEYS)).await?;
                for instance in instances.iter_mut() {
                    let (Some(study), Some(series)) = (
                        instance.string(tags::STUDY_INSTANCE_UID).map(str::to_string),
                        instance.string(tags::SERIES_INSTANCE_UID).map(str::to_string),
                    ) else {
                        continue;
                    };
                    if let Some(series_attrs) = self.series_of(&study, &series).await? {
                        instance.merge_missing(&series_attrs);
                    }
                }
                self.with_study(instances).await
            }
        }
    }
}
