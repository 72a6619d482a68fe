use std::collections::HashMap;

/// `requestType` of an Invoke Image Display request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestType {
    Study,
    Patient,
    Other(String),
}

/// Filter parameters as received, parsed later by [`StudyFilters`](super::StudyFilters)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    pub lower_date_time: Option<String>,
    pub upper_date_time: Option<String>,
    pub most_recent_results: Option<String>,
    pub modalities_in_study: Option<String>,
    pub keywords: Option<String>,
}

impl FilterParams {
    pub fn is_empty(&self) -> bool {
        self == &FilterParams::default()
    }
}

/// Parsed Invoke Image Display request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRequest {
    pub request_type: Option<RequestType>,
    pub patient_ids: Vec<String>,
    pub study_uids: Vec<String>,
    pub accession_numbers: Vec<String>,
    pub series_uids: Vec<String>,
    pub object_uids: Vec<String>,
    pub filters: FilterParams,
}

impl QueryRequest {
    /// Build from a parameter map. Names match case-insensitively, blank values are dropped.
    pub fn from_params(params: &HashMap<String, Vec<String>>) -> Self {
        let mut req = QueryRequest::default();
        for (name, values) in params {
            let values: Vec<String> = values
                .iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if values.is_empty() {
                continue;
            }
            match name.to_ascii_lowercase().as_str() {
                "requesttype" => {
                    req.request_type = Some(match values[0].to_ascii_uppercase().as_str() {
                        "STUDY" => RequestType::Study,
                        "PATIENT" => RequestType::Patient,
                        other => RequestType::Other(other.to_string()),
                    })
                }
                "patientid" => req.patient_ids.extend(values),
                "studyuid" => req.study_uids.extend(values),
                "accessionnumber" => req.accession_numbers.extend(values),
                "seriesuid" => req.series_uids.extend(values),
                "objectuid" => req.object_uids.extend(values),
                "lowerdatetime" => req.filters.lower_date_time = first(values),
                "upperdatetime" => req.filters.upper_date_time = first(values),
                "mostrecentresults" => req.filters.most_recent_results = first(values),
                "modalitiesinstudy" => req.filters.modalities_in_study = first(values),
                "keywords" => req.filters.keywords = first(values),
                other => tracing::debug!("ignoring request parameter {}", other),
            }
        }
        req
    }

    /// Build from a URL query string (`studyUID=1.2&studyUID=1.3`)
    pub fn from_query_string(query: &str) -> Self {
        let mut params: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            params.entry(k.into_owned()).or_default().push(v.into_owned());
        }
        Self::from_params(&params)
    }

    pub fn has_identifiers(&self) -> bool {
        !(self.patient_ids.is_empty()
            && self.study_uids.is_empty()
            && self.accession_numbers.is_empty()
            && self.series_uids.is_empty()
            && self.object_uids.is_empty())
    }
}

fn first(mut values: Vec<String>) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(values.swap_remove(0))
    }
}

/// Split an HL7-style `ID^^^ISSUER` patient identifier
pub fn split_patient_id(raw: &str) -> (String, Option<String>) {
    match raw.find("^^^") {
        Some(idx) if idx > 0 => {
            let issuer = raw[idx + 3..].trim();
            (
                raw[..idx].to_string(),
                (!issuer.is_empty()).then(|| issuer.to_string()),
            )
        }
        _ => (raw.to_string(), None),
    }
}
