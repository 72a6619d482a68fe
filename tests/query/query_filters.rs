use arcfetch::query::filters::normalize_text;
use arcfetch::query::{FilterParams, QueryRequest, StudyFilters};
use dicom_attrs::Attributes;
use dicom_dictionary_std::tags;

fn study(uid: &str, date: Option<&str>, modalities: &[&str], description: &str) -> Attributes {
    let mut attrs = Attributes::new()
        .with_str(tags::STUDY_INSTANCE_UID, uid)
        .with_str(tags::STUDY_DESCRIPTION, description);
    if let Some(date) = date {
        attrs.insert_str(tags::STUDY_DATE, date);
    }
    if !modalities.is_empty() {
        attrs.insert_strings(
            tags::MODALITIES_IN_STUDY,
            modalities.iter().map(|m| m.to_string()).collect(),
        );
    }
    attrs
}

fn sample() -> Vec<Attributes> {
    vec![
        study("1.1", Some("20200110"), &["CT"], "Thorax"),
        study("1.2", Some("20220301"), &["MR", "SR"], "Brain"),
        study("1.3", None, &[], "Echographie"),
        study("1.4", Some("20210615"), &["US"], "Échographie abdominale"),
        study("1.5", Some("20190101"), &["CR"], "Hand"),
    ]
}

fn uids(studies: &[Attributes]) -> Vec<&str> {
    studies
        .iter()
        .map(|s| s.string(tags::STUDY_INSTANCE_UID).unwrap_or(""))
        .collect()
}

fn filters(query: &str) -> StudyFilters {
    let request = QueryRequest::from_query_string(query);
    let (filters, errors) = StudyFilters::parse(&request.filters);
    assert!(errors.is_empty(), "{:?}", errors);
    filters
}

#[test]
fn test_no_filter_sorts_newest_first_undated_last() {
    let out = StudyFilters::default().apply(sample());
    assert_eq!(uids(&out), vec!["1.2", "1.4", "1.1", "1.5", "1.3"]);
}

#[test]
fn test_date_window_keeps_undated_studies() {
    let f = filters("lowerDateTime=2020-01-01&upperDateTime=2021-12-31");
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.4", "1.1", "1.3"]);
}

#[test]
fn test_window_bounds_are_inclusive() {
    let f = filters("lowerDateTime=20200110&upperDateTime=20200110");
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.1", "1.3"]);
}

#[test]
fn test_most_recent_results_applies_after_the_window() {
    let f = filters("lowerDateTime=2020-01-01&mostRecentResults=2");
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.2", "1.4"]);
}

#[test]
fn test_non_positive_most_recent_is_ignored() {
    let f = filters("mostRecentResults=0");
    assert_eq!(f.most_recent, None);
    assert_eq!(f.apply(sample()).len(), 5);
}

#[test]
fn test_modalities_keep_studies_without_modalities() {
    let f = filters("modalitiesInStudy=CT, MR");
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.2", "1.1", "1.3"]);
}

#[test]
fn test_keywords_ignore_case_and_accents() {
    let f = filters("keywords=echographie");
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.4", "1.3"]);

    let f = filters("keywords=brain,hand");
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.2", "1.5"]);
}

#[test]
fn test_malformed_filter_disables_only_itself() {
    let params = FilterParams {
        lower_date_time: Some("not a date".into()),
        modalities_in_study: Some("US".into()),
        ..Default::default()
    };
    let (f, errors) = StudyFilters::parse(&params);
    assert_eq!(errors.len(), 1);
    assert!(f.lower.is_none());
    let out = f.apply(sample());
    assert_eq!(uids(&out), vec!["1.4", "1.3"]);
}

#[test]
fn test_empty_input_stays_empty() {
    let f = filters("mostRecentResults=3&keywords=x");
    assert!(f.apply(Vec::new()).is_empty());
}

#[test]
fn test_normalize_text_strips_ligatures() {
    assert_eq!(normalize_text("Œdème Æ"), "OEDEME AE");
}
