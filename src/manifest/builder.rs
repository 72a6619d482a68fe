use std::cmp::Ordering;
use std::fmt;
use std::io::Cursor;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;

use crate::error::ManifestError;
use crate::model::{HierarchyNode, PatientView, RetrievalField, SeriesView, StudyView};
use crate::query::filters::compare_studies;

pub const MANIFEST_NAMESPACE: &str = "http://www.weasis.org/xsd/2.5";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

const PATIENT_ATTRS: &[(Tag, &str)] = &[
    (tags::PATIENT_ID, "PatientID"),
    (tags::ISSUER_OF_PATIENT_ID, "IssuerOfPatientID"),
    (tags::PATIENT_NAME, "PatientName"),
    // Birth time is left out, archives rarely fill it consistently
    (tags::PATIENT_BIRTH_DATE, "PatientBirthDate"),
    (tags::PATIENT_SEX, "PatientSex"),
];

const STUDY_ATTRS: &[(Tag, &str)] = &[
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::STUDY_DESCRIPTION, "StudyDescription"),
    (tags::STUDY_DATE, "StudyDate"),
    (tags::STUDY_TIME, "StudyTime"),
    (tags::ACCESSION_NUMBER, "AccessionNumber"),
    (tags::STUDY_ID, "StudyID"),
    (tags::REFERRING_PHYSICIAN_NAME, "ReferringPhysicianName"),
];

const SERIES_ATTRS: &[(Tag, &str)] = &[
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
    (tags::SERIES_DESCRIPTION, "SeriesDescription"),
    (tags::SERIES_NUMBER, "SeriesNumber"),
    (tags::MODALITY, "Modality"),
];

const INSTANCE_ATTRS: &[(Tag, &str)] = &[
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
    (tags::INSTANCE_NUMBER, "InstanceNumber"),
];

/// Archive description written as `<arcQuery>`
#[derive(Debug, Clone, Default)]
pub struct ArcQuery {
    pub arc_id: String,
    pub base_url: String,
    pub web_login: Option<String>,
    pub require_only_sop_uid: bool,
    pub additional_params: Option<String>,
    pub override_tags: Option<String>,
    pub http_tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        })
    }
}

/// Message displayed by the viewer when it loads the manifest
#[derive(Debug, Clone)]
pub struct ViewerMessage {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

/// Collects patient subtrees and serializes them
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    patients: Vec<PatientView>,
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn xml_err(e: impl fmt::Display) -> ManifestError {
    ManifestError::Xml(e.to_string())
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_patients(&mut self, patients: impl IntoIterator<Item = PatientView>) {
        self.patients.extend(patients);
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    /// Serialize the manifest. `None` when there is neither a patient nor a message.
    pub fn xml_manifest(
        &self,
        arc: &ArcQuery,
        message: Option<&ViewerMessage>,
    ) -> Result<Option<String>, ManifestError> {
        if self.patients.is_empty() && message.is_none() {
            return Ok(None);
        }

        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_err)?;

        let mut root = BytesStart::new("manifest");
        root.push_attribute(("xmlns", MANIFEST_NAMESPACE));
        root.push_attribute(("xmlns:xsi", XSI_NAMESPACE));
        writer.write_event(Event::Start(root)).map_err(xml_err)?;

        let mut query = BytesStart::new("arcQuery");
        query.push_attribute(("arcId", arc.arc_id.as_str()));
        query.push_attribute(("baseUrl", arc.base_url.as_str()));
        push_opt(&mut query, "webLogin", arc.web_login.as_deref());
        if arc.require_only_sop_uid {
            query.push_attribute(("requireOnlySOPInstanceUID", "true"));
        }
        push_opt(&mut query, "additionnalParameters", arc.additional_params.as_deref());
        push_opt(&mut query, "overrideDicomTagsList", arc.override_tags.as_deref());
        writer.write_event(Event::Start(query)).map_err(xml_err)?;

        for (key, value) in &arc.http_tags {
            let mut tag = BytesStart::new("httpTag");
            tag.push_attribute(("key", key.as_str()));
            tag.push_attribute(("value", value.as_str()));
            writer.write_event(Event::Empty(tag)).map_err(xml_err)?;
        }

        if let Some(msg) = message {
            let severity = msg.severity.to_string();
            let mut tag = BytesStart::new("Message");
            tag.push_attribute(("title", msg.title.as_str()));
            tag.push_attribute(("description", msg.description.as_str()));
            tag.push_attribute(("severity", severity.as_str()));
            writer.write_event(Event::Empty(tag)).map_err(xml_err)?;
        }

        let mut patients: Vec<&PatientView> = self.patients.iter().collect();
        patients.sort_by(|a, b| name_of(&a.node).cmp(name_of(&b.node)));
        for patient in patients {
            write_patient(&mut writer, patient)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("arcQuery")))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("manifest")))
            .map_err(xml_err)?;

        let mut xml =
            String::from_utf8(writer.into_inner().into_inner()).map_err(|_| ManifestError::Encoding)?;
        // Loaders expect a trailing end of line
        xml.push('\n');
        Ok(Some(xml))
    }
}

fn push_opt(elem: &mut BytesStart<'_>, name: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        elem.push_attribute((name, v));
    }
}

fn name_of(node: &HierarchyNode) -> &str {
    node.attributes().string(tags::PATIENT_NAME).unwrap_or("")
}

fn number_of(node: &HierarchyNode, tag: Tag) -> i64 {
    node.attributes().int(tag).unwrap_or(0)
}

fn element(name: &str, node: &HierarchyNode, attrs: &[(Tag, &str)], retrieval: &[RetrievalField]) -> BytesStart<'static> {
    let mut elem = BytesStart::new(name.to_string());
    for (tag, key) in attrs {
        if let Some(value) = node.attributes().joined(*tag) {
            elem.push_attribute((*key, value.as_str()));
        }
    }
    for field in retrieval {
        if let Some(value) = node.retrieval(*field) {
            elem.push_attribute((field.name(), value.as_str()));
        }
    }
    elem
}

fn write_patient(writer: &mut XmlWriter, patient: &PatientView) -> Result<(), ManifestError> {
    writer
        .write_event(Event::Start(element("Patient", &patient.node, PATIENT_ATTRS, &[])))
        .map_err(xml_err)?;

    let mut studies: Vec<&StudyView> = patient.studies.iter().collect();
    studies.sort_by(|a, b| compare_studies(a.node.attributes(), b.node.attributes()));
    for study in studies {
        write_study(writer, study)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Patient")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_study(writer: &mut XmlWriter, study: &StudyView) -> Result<(), ManifestError> {
    writer
        .write_event(Event::Start(element("Study", &study.node, STUDY_ATTRS, &[])))
        .map_err(xml_err)?;

    let mut series: Vec<&SeriesView> = study.series.iter().collect();
    series.sort_by(|a, b| {
        number_of(&a.node, tags::SERIES_NUMBER)
            .cmp(&number_of(&b.node, tags::SERIES_NUMBER))
            .then_with(|| a.node.key().cmp(b.node.key()))
    });
    for s in series {
        write_series(writer, s)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Study")))
        .map_err(xml_err)?;
    Ok(())
}

fn write_series(writer: &mut XmlWriter, series: &SeriesView) -> Result<(), ManifestError> {
    let elem = element(
        "Series",
        &series.node,
        SERIES_ATTRS,
        &[
            RetrievalField::WadoTransferSyntaxUid,
            RetrievalField::WadoCompressionRate,
            RetrievalField::DirectDownloadThumbnail,
        ],
    );
    writer.write_event(Event::Start(elem)).map_err(xml_err)?;

    let mut instances: Vec<_> = series.instances.iter().collect();
    instances.sort_by(|a, b| {
        let order = number_of(&a.node, tags::INSTANCE_NUMBER).cmp(&number_of(&b.node, tags::INSTANCE_NUMBER));
        if order == Ordering::Equal {
            a.node.key().cmp(b.node.key())
        } else {
            order
        }
    });
    for instance in instances {
        let elem = element(
            "Instance",
            &instance.node,
            INSTANCE_ATTRS,
            &[RetrievalField::DirectDownloadFile],
        );
        writer.write_event(Event::Empty(elem)).map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("Series")))
        .map_err(xml_err)?;
    Ok(())
}
