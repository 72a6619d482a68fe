use std::collections::HashMap;
use std::sync::Arc;

use dicom_attrs::Attributes;
use dicom_dictionary_std::tags;
use futures_util::future::join_all;

use crate::error::{ModelError, QueryError};
use crate::model::{HierarchyModel, Level, NodeRef, RetrievalField};
use crate::query::filters::StudyFilters;
use crate::query::request::{split_patient_id, QueryRequest, RequestType};
use crate::query::service::{LevelQuery, QueryService, StudyKey};
use crate::scheduler::DownloadPriority;

/// A series placed in the model by a resolution
#[derive(Debug, Clone)]
pub struct ResolvedSeries {
    pub patient: NodeRef,
    pub study: NodeRef,
    pub series: NodeRef,
    pub priority: DownloadPriority,
    /// False for series pulled in only to complete a study
    pub start_download: bool,
}

/// Identifier that could not be resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    pub level: Level,
    pub identifier: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ResolveReport {
    pub series: Vec<ResolvedSeries>,
    pub failures: Vec<ResolveFailure>,
}

impl ResolveReport {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Study Instance UIDs in resolution order
    pub fn study_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = Vec::new();
        for s in &self.series {
            if !uids.iter().any(|u| u == s.study.key()) {
                uids.push(s.study.key().to_string());
            }
        }
        uids
    }
}

/// Series found while resolving one identifier, before priorities are set
#[derive(Default)]
struct Partial {
    found: Vec<(NodeRef, NodeRef, NodeRef, bool)>,
    failures: Vec<ResolveFailure>,
}

impl Partial {
    fn fail(&mut self, level: Level, identifier: &str, reason: impl ToString) {
        let reason = reason.to_string();
        tracing::error!("{} query with {} failed: {}", level, identifier, reason);
        self.failures.push(ResolveFailure {
            level,
            identifier: identifier.to_string(),
            reason,
        });
    }

    fn merge(&mut self, other: Partial) {
        self.found.extend(other.found);
        self.failures.extend(other.failures);
    }
}

/// Resolves Invoke Image Display requests into the hierarchy model
pub struct QueryResolver {
    service: Arc<dyn QueryService>,
    model: Arc<HierarchyModel>,
    base_url: String,
    show_whole_study: bool,
}

impl QueryResolver {
    pub fn new(service: Arc<dyn QueryService>, model: Arc<HierarchyModel>, base_url: impl Into<String>) -> Self {
        Self {
            service,
            model,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            show_whole_study: false,
        }
    }

    /// Also resolve the whole owning study of requested series
    pub fn with_show_whole_study(mut self, enabled: bool) -> Self {
        self.show_whole_study = enabled;
        self
    }

    pub fn model(&self) -> &Arc<HierarchyModel> {
        &self.model
    }

    pub async fn resolve(&self, request: &QueryRequest) -> ResolveReport {
        let (filters, filter_errors) = StudyFilters::parse(&request.filters);
        for err in &filter_errors {
            tracing::error!("ignoring filter: {}", err);
        }

        let mut partial = Partial::default();
        match &request.request_type {
            Some(RequestType::Study) => {
                if !request.accession_numbers.is_empty() {
                    partial.merge(self.by_accession(&request.accession_numbers, &filters).await);
                } else {
                    partial.merge(self.by_study_uid(&request.study_uids, &filters).await);
                }
            }
            Some(RequestType::Patient) => {
                partial.merge(self.by_patient_id(&request.patient_ids, &filters).await);
            }
            Some(RequestType::Other(other)) => {
                partial.fail(Level::Patient, other, QueryError::InvalidRequest(format!(
                    "unsupported requestType {}",
                    other
                )));
            }
            None => {
                if !request.has_identifiers() {
                    tracing::warn!("request without any identifier");
                }
                partial.merge(self.by_sop_uid(&request.object_uids).await);
                partial.merge(self.by_series_uid(&request.series_uids).await);
                partial.merge(self.by_accession(&request.accession_numbers, &filters).await);
                partial.merge(self.by_study_uid(&request.study_uids, &filters).await);
                partial.merge(self.by_patient_id(&request.patient_ids, &filters).await);
            }
        }

        self.report(partial)
    }

    /// Dedupe by series and weight each series by the order its study first appeared
    fn report(&self, partial: Partial) -> ResolveReport {
        let mut study_order: HashMap<String, i64> = HashMap::new();
        let mut report = ResolveReport {
            series: Vec::new(),
            failures: partial.failures,
        };
        for (patient, study, series, start) in partial.found {
            if let Some(existing) = report
                .series
                .iter_mut()
                .find(|s| Arc::ptr_eq(&s.series, &series))
            {
                existing.start_download |= start;
                continue;
            }
            let next = study_order.len() as i64;
            let weight = *study_order.entry(study.key().to_string()).or_insert(next);
            let priority = DownloadPriority::new(patient.key(), study.key(), series.key(), weight);
            report.series.push(ResolvedSeries {
                patient,
                study,
                series,
                priority,
                start_download: start,
            });
        }
        report
    }

    async fn by_patient_id(&self, ids: &[String], filters: &StudyFilters) -> Partial {
        let futures = ids.iter().filter(|v| !v.trim().is_empty()).map(|raw| async move {
            let (id, issuer) = split_patient_id(raw);
            let key = StudyKey::Patient { id, issuer };
            self.studies(key, raw, Some(filters), true).await
        });
        collect(join_all(futures).await)
    }

    async fn by_study_uid(&self, uids: &[String], filters: &StudyFilters) -> Partial {
        let futures = uids.iter().filter(|v| !v.trim().is_empty()).map(|uid| {
            self.studies(StudyKey::StudyUid(uid.clone()), uid, Some(filters), true)
        });
        collect(join_all(futures).await)
    }

    async fn by_accession(&self, numbers: &[String], filters: &StudyFilters) -> Partial {
        let futures = numbers.iter().filter(|v| !v.trim().is_empty()).map(|acc| {
            self.studies(StudyKey::Accession(acc.clone()), acc, Some(filters), true)
        });
        collect(join_all(futures).await)
    }

    async fn by_series_uid(&self, uids: &[String]) -> Partial {
        let futures = uids
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(|uid| self.series_lookup(uid));
        let mut partial = collect(join_all(futures).await);

        if self.show_whole_study {
            let mut studies: Vec<String> = Vec::new();
            for (_, study, _, _) in &partial.found {
                if !studies.iter().any(|s| s == study.key()) {
                    studies.push(study.key().to_string());
                }
            }
            let futures = studies.iter().map(|uid| {
                self.studies(StudyKey::StudyUid(uid.clone()), uid, None, false)
            });
            partial.merge(collect(join_all(futures).await));
        }
        partial
    }

    async fn by_sop_uid(&self, uids: &[String]) -> Partial {
        let futures = uids
            .iter()
            .filter(|v| !v.trim().is_empty())
            .map(|uid| self.instance_lookup(uid));
        collect(join_all(futures).await)
    }

    async fn studies(
        &self,
        key: StudyKey,
        identifier: &str,
        filters: Option<&StudyFilters>,
        start: bool,
    ) -> Partial {
        let mut partial = Partial::default();
        let query = LevelQuery::Studies(key);
        let studies = match self.service.find(&query).await {
            Ok(studies) => studies,
            Err(e) => {
                partial.fail(Level::Study, identifier, e);
                return partial;
            }
        };
        tracing::debug!("{} returned {} studies", query.describe(), studies.len());

        let studies = match filters {
            Some(f) if !studies.is_empty() => f.apply(studies),
            _ => studies,
        };
        for study in &studies {
            partial.merge(self.fill_series(study, start).await);
        }
        partial
    }

    async fn fill_series(&self, study_attrs: &Attributes, start: bool) -> Partial {
        let mut partial = Partial::default();
        let Some(study_uid) = study_attrs.string(tags::STUDY_INSTANCE_UID) else {
            return partial;
        };
        let query = LevelQuery::SeriesOfStudy {
            study_uid: study_uid.to_string(),
        };
        let series_list = match self.service.find(&query).await {
            Ok(list) => list,
            Err(e) => {
                partial.fail(Level::Series, study_uid, e);
                return partial;
            }
        };
        if series_list.is_empty() {
            return partial;
        }

        // Patient is taken from each study, issuers may differ
        let (patient, study) = match self.parents(study_attrs) {
            Ok(p) => p,
            Err(e) => {
                partial.fail(Level::Study, study_uid, e);
                return partial;
            }
        };
        for series_attrs in &series_list {
            match self.add_series(&study, series_attrs) {
                Ok(series) => {
                    partial.merge(self.fill_instances(&study, &series).await);
                    partial.found.push((patient.clone(), study.clone(), series, start));
                }
                Err(e) => partial.fail(Level::Series, study_uid, e),
            }
        }
        partial
    }

    async fn fill_instances(&self, study: &NodeRef, series: &NodeRef) -> Partial {
        let mut partial = Partial::default();
        let series_url = series.retrieval(RetrievalField::RetrieveUrl);
        let query = LevelQuery::InstancesOfSeries {
            study_uid: study.key().to_string(),
            series_uid: series.key().to_string(),
            retrieve_url: series_url.clone(),
        };
        match self.service.find(&query).await {
            Ok(instances) => {
                for attrs in &instances {
                    if let Err(e) = self.add_instance(series, attrs) {
                        partial.fail(Level::Instance, series.key(), e);
                    }
                }
            }
            Err(e) => partial.fail(Level::Instance, series.key(), e),
        }
        partial
    }

    async fn series_lookup(&self, series_uid: &str) -> Partial {
        let mut partial = Partial::default();
        let query = LevelQuery::Series {
            series_uid: series_uid.to_string(),
        };
        let list = match self.service.find(&query).await {
            Ok(list) => list,
            Err(e) => {
                partial.fail(Level::Series, series_uid, e);
                return partial;
            }
        };
        let Some(first) = list.first() else {
            return partial;
        };
        let (patient, study) = match self.parents(first) {
            Ok(p) => p,
            Err(e) => {
                partial.fail(Level::Series, series_uid, e);
                return partial;
            }
        };
        for attrs in &list {
            match self.add_series(&study, attrs) {
                Ok(series) => {
                    partial.merge(self.fill_instances(&study, &series).await);
                    partial.found.push((patient.clone(), study.clone(), series, true));
                }
                Err(e) => partial.fail(Level::Series, series_uid, e),
            }
        }
        partial
    }

    async fn instance_lookup(&self, sop_uid: &str) -> Partial {
        let mut partial = Partial::default();
        let query = LevelQuery::Instances {
            sop_uid: sop_uid.to_string(),
        };
        let list = match self.service.find(&query).await {
            Ok(list) => list,
            Err(e) => {
                partial.fail(Level::Instance, sop_uid, e);
                return partial;
            }
        };
        let Some(first) = list.first() else {
            return partial;
        };
        let created = self
            .parents(first)
            .and_then(|(patient, study)| {
                let series = self.add_series(&study, first)?;
                Ok((patient, study, series))
            });
        match created {
            Ok((patient, study, series)) => {
                for attrs in &list {
                    if let Err(e) = self.add_instance(&series, attrs) {
                        partial.fail(Level::Instance, sop_uid, e);
                    }
                }
                partial.found.push((patient, study, series, true));
            }
            Err(e) => partial.fail(Level::Instance, sop_uid, e),
        }
        partial
    }

    fn parents(&self, attrs: &Attributes) -> Result<(NodeRef, NodeRef), ModelError> {
        let patient = self.model.patient(attrs)?;
        let study = self.model.study(&patient, attrs)?;
        Ok((patient, study))
    }

    fn add_series(&self, study: &NodeRef, attrs: &Attributes) -> Result<NodeRef, ModelError> {
        let series = self.model.series(study, attrs)?;
        if let Some(url) = attrs.string(tags::RETRIEVE_URL) {
            self.model.default_field(&series, RetrievalField::RetrieveUrl, url);
        }
        self.model.default_field(
            &series,
            RetrievalField::RetrieveUrl,
            format!("{}/studies/{}/series/{}", self.base_url, study.key(), series.key()),
        );
        Ok(series)
    }

    fn add_instance(&self, series: &NodeRef, attrs: &Attributes) -> Result<NodeRef, ModelError> {
        let instance = self.model.instance(series, attrs, None)?;
        let url = match attrs.string(tags::RETRIEVE_URL) {
            Some(url) => url.to_string(),
            None => {
                let series_url = series.retrieval(RetrievalField::RetrieveUrl).unwrap_or_default();
                format!("{}/instances/{}", series_url, instance.key())
            }
        };
        self.model
            .default_field(&instance, RetrievalField::DirectDownloadFile, url);
        Ok(instance)
    }
}

fn collect(parts: Vec<Partial>) -> Partial {
    parts.into_iter().fold(Partial::default(), |mut acc, p| {
        acc.merge(p);
        acc
    })
}
