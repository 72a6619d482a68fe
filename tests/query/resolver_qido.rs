#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use arcfetch::events::{EventBus, ModelEvent};
use arcfetch::model::{HierarchyModel, Level, RetrievalField};
use arcfetch::query::{QidoClient, QueryRequest, QueryResolver};
use common::{config_for, default_studies, spawn_archive, MockArchive};

async fn resolver() -> (QueryResolver, Arc<MockArchive>, String) {
    let archive = Arc::new(MockArchive::new(default_studies()));
    let (base_url, _server) = spawn_archive(Arc::clone(&archive)).await;
    let config = config_for(&base_url, "");
    let qido = QidoClient::with_client(reqwest::Client::new(), &config.archive);
    let model = Arc::new(HierarchyModel::new(EventBus::new()));
    let resolver = QueryResolver::new(Arc::new(qido), model, config.archive.base_url.clone());
    (resolver, archive, base_url)
}

#[tokio::test]
async fn test_study_request_builds_whole_hierarchy() {
    let (resolver, _archive, base_url) = resolver().await;
    let report = resolver
        .resolve(&QueryRequest::from_query_string("requestType=STUDY&studyUID=1.2.3"))
        .await;

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.study_uids(), vec!["1.2.3"]);
    let series: Vec<&str> = report.series.iter().map(|s| s.series.key()).collect();
    assert_eq!(series, vec!["1.2.3.1", "1.2.3.2"]);
    assert!(report.series.iter().all(|s| s.start_download));
    assert!(report.series.iter().all(|s| s.priority.weight == 0));

    let model = resolver.model();
    let study = model.study_by_uid("1.2.3").expect("study in model");
    assert_eq!(study.level(), Level::Study);
    let patient = model.parent(&study).expect("patient of study");
    assert_eq!(patient.key(), "P1");

    let ct = model.series_by_uid("1.2.3.1").expect("series in model");
    assert_eq!(model.children(&ct).len(), 2);
    assert_eq!(
        ct.retrieval(RetrievalField::RetrieveUrl).as_deref(),
        Some(format!("{}/studies/1.2.3/series/1.2.3.1", base_url).as_str())
    );
    let first = &model.children(&ct)[0];
    assert_eq!(
        first.retrieval(RetrievalField::DirectDownloadFile),
        Some(format!(
            "{}/studies/1.2.3/series/1.2.3.1/instances/{}",
            base_url,
            first.key()
        ))
    );
}

#[tokio::test]
async fn test_patient_request_orders_studies_newest_first() {
    let (resolver, _archive, _) = resolver().await;
    let report = resolver
        .resolve(&QueryRequest::from_query_string("requestType=PATIENT&patientID=P1"))
        .await;

    assert!(report.failures.is_empty());
    // The undated study comes last
    assert_eq!(report.study_uids(), vec!["1.2.3", "1.2.4", "1.2.5"]);
    let weights: Vec<(String, i64)> = report
        .series
        .iter()
        .map(|s| (s.study.key().to_string(), s.priority.weight))
        .collect();
    assert!(weights.contains(&("1.2.3".to_string(), 0)));
    assert!(weights.contains(&("1.2.4".to_string(), 1)));
    assert!(weights.contains(&("1.2.5".to_string(), 2)));
}

#[tokio::test]
async fn test_failed_identifier_does_not_abort_the_batch() {
    let (resolver, _archive, _) = resolver().await;
    let report = resolver
        .resolve(&QueryRequest::from_query_string(
            "requestType=STUDY&studyUID=9.9.9&studyUID=1.2.4",
        ))
        .await;

    assert_eq!(report.study_uids(), vec!["1.2.4"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].identifier, "9.9.9");
    assert_eq!(report.failures[0].level, Level::Series);
}

#[tokio::test]
async fn test_unknown_study_resolves_to_nothing() {
    let (resolver, _archive, _) = resolver().await;
    let report = resolver
        .resolve(&QueryRequest::from_query_string("requestType=STUDY&studyUID=4.5.6"))
        .await;
    assert!(report.is_empty());
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_unsupported_request_type_is_reported() {
    let (resolver, archive, _) = resolver().await;
    let report = resolver
        .resolve(&QueryRequest::from_query_string("requestType=VISIT&studyUID=1.2.3"))
        .await;
    assert!(report.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(archive.requests().is_empty());
}

#[tokio::test]
async fn test_series_and_object_identifiers_without_request_type() {
    let (resolver, archive, _) = resolver().await;
    let report = resolver
        .resolve(&QueryRequest::from_query_string(
            "seriesUID=1.2.3.2&objectUID=1.2.4.1.1",
        ))
        .await;

    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let mut series: Vec<&str> = report.series.iter().map(|s| s.series.key()).collect();
    series.sort();
    assert_eq!(series, vec!["1.2.3.2", "1.2.4.1"]);

    // Only the requested instance is placed in the model
    let model = resolver.model();
    let us = model.series_by_uid("1.2.4.1").unwrap();
    assert_eq!(model.children(&us).len(), 1);
    // The whole owning study was not resolved
    assert!(model.series_by_uid("1.2.3.1").is_none());
    assert!(archive.requests().iter().any(|r| r.starts_with("/series?0020000E=1.2.3.2")));
    assert!(archive.requests().iter().any(|r| r.starts_with("/instances?00080018=1.2.4.1.1")));
}

#[tokio::test]
async fn test_show_whole_study_adds_siblings_without_download() {
    let archive = Arc::new(MockArchive::new(default_studies()));
    let (base_url, _server) = spawn_archive(Arc::clone(&archive)).await;
    let config = config_for(&base_url, "");
    let qido = QidoClient::with_client(reqwest::Client::new(), &config.archive);
    let resolver = QueryResolver::new(
        Arc::new(qido),
        Arc::new(HierarchyModel::new(EventBus::new())),
        config.archive.base_url.clone(),
    )
    .with_show_whole_study(true);

    let report = resolver
        .resolve(&QueryRequest::from_query_string("seriesUID=1.2.3.2"))
        .await;
    let flags: Vec<(&str, bool)> = report
        .series
        .iter()
        .map(|s| (s.series.key(), s.start_download))
        .collect();
    assert!(flags.contains(&("1.2.3.2", true)));
    assert!(flags.contains(&("1.2.3.1", false)));
    assert_eq!(flags.len(), 2);
}

#[tokio::test]
async fn test_resolving_twice_reuses_nodes() {
    let (resolver, _archive, _) = resolver().await;
    let mut events = resolver.model().events().subscribe();
    let request = QueryRequest::from_query_string("requestType=STUDY&studyUID=1.2.3");

    let first = resolver.resolve(&request).await;
    let second = resolver.resolve(&request).await;
    for (a, b) in first.series.iter().zip(second.series.iter()) {
        assert!(Arc::ptr_eq(&a.series, &b.series));
    }

    let mut added = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ModelEvent::SeriesAdded { .. }) {
            added += 1;
        }
    }
    assert_eq!(added, 2);
}

#[tokio::test]
async fn test_configured_headers_are_sent() {
    let archive = Arc::new(MockArchive::new(default_studies()));
    let (base_url, _server) = spawn_archive(Arc::clone(&archive)).await;
    let config = config_for(&base_url, "").archive;
    let toml = format!(
        "base_url = \"{}\"\nquery_headers = [\"X-Site: north\"]",
        config.base_url
    );
    let archive_config: arcfetch::config::ArchiveConfig = toml::from_str(&toml).unwrap();
    let qido = QidoClient::with_client(reqwest::Client::new(), &archive_config);
    let resolver = QueryResolver::new(
        Arc::new(qido),
        Arc::new(HierarchyModel::new(EventBus::new())),
        archive_config.base_url.clone(),
    );

    resolver
        .resolve(&QueryRequest::from_query_string("requestType=STUDY&studyUID=1.2.4"))
        .await;
    let headers = archive.headers.lock().unwrap();
    assert!(!headers.is_empty());
    for h in headers.iter() {
        assert_eq!(h.get("x-site").and_then(|v| v.to_str().ok()), Some("north"));
        assert_eq!(
            h.get("accept").and_then(|v| v.to_str().ok()),
            Some("application/dicom+json")
        );
    }
}
