//! Tag-keyed DICOM attribute sets.
//!
//! QIDO-RS answers (DICOM JSON, PS3.18) and C-FIND identifiers (Part 10 files
//! written by `findscu -X`) are both decoded into [`Attributes`], a small
//! ordered map from [`Tag`] to either textual values or nested item sets.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use dicom_core::Tag;
use dicom_object::mem::InMemDicomObject;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("DICOM JSON conversion error: {0}")]
    Json(String),

    #[error("DICOM file error: {0}")]
    File(String),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Value held for one tag.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Textual rendering of every value of the element (multi-valued elements keep each value)
    Text(Vec<String>),
    /// Items of a sequence element
    Sequence(Vec<Attributes>),
}

/// Ordered attribute set keyed by DICOM tag
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    elements: BTreeMap<Tag, AttrValue>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn get(&self, tag: Tag) -> Option<&AttrValue> {
        self.elements.get(&tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tag, &AttrValue)> {
        self.elements.iter()
    }

    /// Set a single textual value, replacing any previous value
    pub fn insert_str(&mut self, tag: Tag, value: impl Into<String>) {
        self.elements.insert(tag, AttrValue::Text(vec![value.into()]));
    }

    pub fn insert_strings(&mut self, tag: Tag, values: Vec<String>) {
        self.elements.insert(tag, AttrValue::Text(values));
    }

    pub fn insert_sequence(&mut self, tag: Tag, items: Vec<Attributes>) {
        self.elements.insert(tag, AttrValue::Sequence(items));
    }

    pub fn remove(&mut self, tag: Tag) -> Option<AttrValue> {
        self.elements.remove(&tag)
    }

    /// Builder-style variant of [`Attributes::insert_str`]
    pub fn with_str(mut self, tag: Tag, value: impl Into<String>) -> Self {
        self.insert_str(tag, value);
        self
    }

    /// First non-empty textual value, trimmed of DICOM padding
    pub fn string(&self, tag: Tag) -> Option<&str> {
        match self.elements.get(&tag)? {
            AttrValue::Text(values) => values
                .iter()
                .map(|v| v.trim_matches(|c: char| c == ' ' || c == '\0'))
                .find(|v| !v.is_empty()),
            AttrValue::Sequence(_) => None,
        }
    }

    /// All textual values of a tag (empty for sequences or missing tags)
    pub fn strings(&self, tag: Tag) -> &[String] {
        match self.elements.get(&tag) {
            Some(AttrValue::Text(values)) => values,
            _ => &[],
        }
    }

    /// Values joined with the DICOM value delimiter (`\`)
    pub fn joined(&self, tag: Tag) -> Option<String> {
        let values = self.strings(tag);
        if values.iter().all(|v| v.trim().is_empty()) {
            return None;
        }
        Some(
            values
                .iter()
                .map(|v| v.trim())
                .collect::<Vec<_>>()
                .join("\\"),
        )
    }

    pub fn int(&self, tag: Tag) -> Option<i64> {
        let raw = self.string(tag)?;
        raw.parse::<i64>()
            .ok()
            .or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
    }

    /// DA value (`YYYYMMDD`, also accepts the legacy `YYYY.MM.DD` form)
    pub fn date(&self, tag: Tag) -> Option<NaiveDate> {
        parse_da(self.string(tag)?)
    }

    /// TM value (`HH`, `HHMM`, `HHMMSS` or `HHMMSS.FFFFFF`)
    pub fn time(&self, tag: Tag) -> Option<NaiveTime> {
        parse_tm(self.string(tag)?)
    }

    /// Combine a date tag and a time tag; a missing time means midnight
    pub fn date_time(&self, date_tag: Tag, time_tag: Tag) -> Option<NaiveDateTime> {
        let date = self.date(date_tag)?;
        let time = self.time(time_tag).unwrap_or(NaiveTime::MIN);
        Some(date.and_time(time))
    }

    pub fn sequence(&self, tag: Tag) -> Option<&[Attributes]> {
        match self.elements.get(&tag)? {
            AttrValue::Sequence(items) => Some(items),
            AttrValue::Text(_) => None,
        }
    }

    /// Copy every element of `other` whose tag is not present yet
    pub fn merge_missing(&mut self, other: &Attributes) {
        for (tag, value) in other.iter() {
            self.elements.entry(*tag).or_insert_with(|| value.clone());
        }
    }

    /// Decode a dataset produced by a DIMSE exchange
    pub fn from_object(obj: &InMemDicomObject) -> Self {
        let mut attrs = Attributes::new();
        for elem in obj.iter() {
            let tag = elem.header().tag;
            if let Some(items) = elem.items() {
                let nested = items.iter().map(Attributes::from_object).collect();
                attrs.insert_sequence(tag, nested);
                continue;
            }
            if let Ok(values) = elem.to_multi_str() {
                attrs.insert_strings(tag, values.to_vec());
            }
        }
        attrs
    }

    /// Decode one DICOM JSON object (keys are 8-hex-digit tags)
    pub fn from_json_value(v: &Value) -> Result<Self> {
        let obj = json_value_to_identifier(v)?;
        Ok(Self::from_object(&obj))
    }

    /// Read a Part 10 file (e.g. a C-FIND response extracted by findscu)
    pub fn from_file(path: &Path) -> Result<Self> {
        let obj = dicom_object::open_file(path)
            .map_err(|e| ConvertError::File(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_object(&obj))
    }
}

/// Decode a QIDO-RS response body.
///
/// Every array entry is decoded independently; an entry that fails to decode
/// is returned as an error in its slot so the caller can skip it.
pub fn parse_json_array(body: &str) -> Result<Vec<Result<Attributes>>> {
    if body.trim().is_empty() {
        // 204 No Content style answers
        return Ok(Vec::new());
    }
    let value: Value =
        serde_json::from_str(body).map_err(|e| ConvertError::Json(format!("{}", e)))?;
    match value {
        Value::Array(items) => Ok(items.iter().map(Attributes::from_json_value).collect()),
        other => Err(ConvertError::Json(format!(
            "expected a JSON array, found {}",
            json_kind(&other)
        ))),
    }
}

pub fn json_value_to_identifier(v: &Value) -> Result<InMemDicomObject> {
    let obj =
        dicom_json::from_value(v.clone()).map_err(|e| ConvertError::Json(format!("{}", e)))?;
    Ok(obj)
}

pub fn identifier_to_json_value(obj: &InMemDicomObject) -> Result<Value> {
    let v = dicom_json::to_value(obj).map_err(|e| ConvertError::Json(format!("{}", e)))?;
    Ok(v)
}

/// Write an identifier as a Part 10 file (explicit VR little endian)
pub fn write_part10(path: &Path, obj: &InMemDicomObject) -> Result<()> {
    use dicom_dictionary_std::uids;
    use dicom_object::meta::FileMetaTableBuilder;

    let ms_sop_uid = obj
        .element(dicom_dictionary_std::tags::SOP_CLASS_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uids::SECONDARY_CAPTURE_IMAGE_STORAGE.into());

    let mut meta = FileMetaTableBuilder::new()
        .transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
        .media_storage_sop_class_uid(ms_sop_uid.as_str());
    if let Some(sop_uid) = obj
        .element(dicom_dictionary_std::tags::SOP_INSTANCE_UID)
        .ok()
        .and_then(|e| e.to_str().ok())
    {
        meta = meta.media_storage_sop_instance_uid(sop_uid.to_string());
    }

    let file_obj = obj
        .clone()
        .with_meta(meta)
        .map_err(|e| ConvertError::File(e.to_string()))?;

    file_obj
        .write_to_file(path)
        .map_err(|e| ConvertError::File(e.to_string()))
}

fn parse_da(raw: &str) -> Option<NaiveDate> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 8 {
        return None;
    }
    NaiveDate::parse_from_str(&digits, "%Y%m%d").ok()
}

fn parse_tm(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    let (main, frac) = match raw.split_once('.') {
        Some((m, f)) => (m, Some(f)),
        None => (raw, None),
    };
    let main: String = main.chars().filter(|c| c.is_ascii_digit()).collect();
    let field = |range: std::ops::Range<usize>| -> Option<u32> {
        main.get(range).and_then(|s| s.parse::<u32>().ok())
    };
    let (h, m, s) = match main.len() {
        2 => (field(0..2)?, 0, 0),
        4 => (field(0..2)?, field(2..4)?, 0),
        6 => (field(0..2)?, field(2..4)?, field(4..6)?),
        _ => return None,
    };
    let micros = frac
        .map(|f| {
            let mut padded: String = f.chars().filter(|c| c.is_ascii_digit()).take(6).collect();
            while padded.len() < 6 {
                padded.push('0');
            }
            padded.parse::<u32>().unwrap_or(0)
        })
        .unwrap_or(0);
    NaiveTime::from_hms_micro_opt(h, m, s.min(59), micros)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
