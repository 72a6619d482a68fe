use dicom_attrs::{AttrValue, Attributes};
use dicom_core::Tag;
use dicom_dictionary_std::tags;

const PATIENT_TAGS: &[Tag] = &[
    tags::PATIENT_ID,
    tags::ISSUER_OF_PATIENT_ID,
    tags::PATIENT_NAME,
    tags::PATIENT_BIRTH_DATE,
    tags::PATIENT_BIRTH_TIME,
    tags::PATIENT_SEX,
];

const STUDY_TAGS: &[Tag] = &[
    tags::STUDY_INSTANCE_UID,
    tags::STUDY_DATE,
    tags::STUDY_TIME,
    tags::STUDY_DESCRIPTION,
    tags::ACCESSION_NUMBER,
    tags::STUDY_ID,
    tags::REFERRING_PHYSICIAN_NAME,
    tags::MODALITIES_IN_STUDY,
];

const SERIES_TAGS: &[Tag] = &[
    tags::SERIES_INSTANCE_UID,
    tags::MODALITY,
    tags::SERIES_NUMBER,
    tags::SERIES_DESCRIPTION,
];

const INSTANCE_TAGS: &[Tag] = &[
    tags::SOP_INSTANCE_UID,
    tags::SOP_CLASS_UID,
    tags::INSTANCE_NUMBER,
];

/// Patient identity: `PatientID`, plus `^^^IssuerOfPatientID` when an issuer is known
pub fn patient_pseudo_uid(patient_id: Option<&str>, issuer: Option<&str>) -> String {
    let id = patient_id.unwrap_or("").trim();
    match issuer.map(str::trim).filter(|i| !i.is_empty()) {
        Some(issuer) => format!("{}^^^{}", id, issuer),
        None => id.to_string(),
    }
}

/// Instance identity within its series
pub fn instance_key(sop_uid: &str, frame: Option<u32>) -> String {
    match frame {
        Some(frame) => format!("{}[{}]", sop_uid, frame),
        None => sop_uid.to_string(),
    }
}

pub fn patient_attributes(src: &Attributes) -> Attributes {
    select(src, PATIENT_TAGS)
}

pub fn study_attributes(src: &Attributes) -> Attributes {
    select(src, STUDY_TAGS)
}

pub fn series_attributes(src: &Attributes) -> Attributes {
    select(src, SERIES_TAGS)
}

pub fn instance_attributes(src: &Attributes) -> Attributes {
    select(src, INSTANCE_TAGS)
}

fn select(src: &Attributes, wanted: &[Tag]) -> Attributes {
    let mut out = Attributes::new();
    for tag in wanted {
        match src.get(*tag) {
            Some(AttrValue::Text(values)) => out.insert_strings(*tag, values.clone()),
            Some(AttrValue::Sequence(items)) => out.insert_sequence(*tag, items.clone()),
            None => {}
        }
    }
    out
}
