use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use dicom_attrs::Attributes;
use dicom_dictionary_std::tags;
use once_cell::sync::Lazy;

use crate::error::FilterError;
use crate::query::request::FilterParams;

static ACCENTS: Lazy<HashMap<char, &'static str>> = Lazy::new(|| {
    const TABLE: &[(&str, &str)] = &[
        ("ÀÁÂÃÄÅĀĂĄ", "A"),
        ("ÇĆĈĊČ", "C"),
        ("ĎĐ", "D"),
        ("ÈÉÊËĒĔĖĘĚ", "E"),
        ("ĜĞĠĢ", "G"),
        ("ÌÍÎÏĨĪĬĮİ", "I"),
        ("Ł", "L"),
        ("ÑŃŅŇ", "N"),
        ("ÒÓÔÕÖØŌŎŐ", "O"),
        ("ŔŘ", "R"),
        ("ŚŜŞŠ", "S"),
        ("ŢŤ", "T"),
        ("ÙÚÛÜŨŪŬŮŰŲ", "U"),
        ("ÝŸ", "Y"),
        ("ŹŻŽ", "Z"),
        ("Æ", "AE"),
        ("Œ", "OE"),
    ];
    TABLE
        .iter()
        .flat_map(|(chars, plain)| chars.chars().map(move |c| (c, *plain)))
        .collect()
});

/// Uppercase and strip accents
pub fn normalize_text(text: &str) -> String {
    text.to_uppercase()
        .chars()
        .fold(String::with_capacity(text.len()), |mut out, c| {
            match ACCENTS.get(&c) {
                Some(plain) => out.push_str(plain),
                None => out.push(c),
            }
            out
        })
}

/// Study-level filters of an Invoke Image Display request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyFilters {
    pub lower: Option<NaiveDateTime>,
    pub upper: Option<NaiveDateTime>,
    pub most_recent: Option<usize>,
    pub modalities: Vec<String>,
    pub keywords: Vec<String>,
}

impl StudyFilters {
    /// Parse the raw parameters. A malformed value disables only its own filter.
    pub fn parse(params: &FilterParams) -> (Self, Vec<FilterError>) {
        let mut filters = StudyFilters::default();
        let mut errors = Vec::new();

        if let Some(v) = &params.lower_date_time {
            match parse_bound("lowerDateTime", v, false) {
                Ok(dt) => filters.lower = Some(dt),
                Err(e) => errors.push(e),
            }
        }
        if let Some(v) = &params.upper_date_time {
            match parse_bound("upperDateTime", v, true) {
                Ok(dt) => filters.upper = Some(dt),
                Err(e) => errors.push(e),
            }
        }
        if let Some(v) = &params.most_recent_results {
            match v.trim().parse::<i64>() {
                Ok(n) if n > 0 => filters.most_recent = Some(n as usize),
                Ok(_) => {}
                Err(_) => errors.push(FilterError::InvalidNumber {
                    param: "mostRecentResults".into(),
                    value: v.clone(),
                }),
            }
        }
        if let Some(v) = &params.modalities_in_study {
            filters.modalities = tokens(v, |t| t.to_string());
        }
        if let Some(v) = &params.keywords {
            filters.keywords = tokens(v, normalize_text);
        }

        (filters, errors)
    }

    pub fn is_empty(&self) -> bool {
        self == &StudyFilters::default()
    }

    /// Sort newest first, then drop what the filters exclude
    pub fn apply(&self, mut studies: Vec<Attributes>) -> Vec<Attributes> {
        studies.sort_by(compare_studies);

        if self.lower.is_some() || self.upper.is_some() {
            studies.retain(|s| match study_date_time(s) {
                // Undated studies are not removed by the window
                None => true,
                Some(dt) => {
                    self.lower.map_or(true, |l| dt >= l) && self.upper.map_or(true, |u| dt <= u)
                }
            });
        }

        if let Some(n) = self.most_recent {
            studies.truncate(n);
        }

        if !self.modalities.is_empty() {
            studies.retain(|s| match s.joined(tags::MODALITIES_IN_STUDY) {
                Some(m) if !m.is_empty() => self.modalities.iter().any(|t| m.contains(t.as_str())),
                _ => true,
            });
        }

        if !self.keywords.is_empty() {
            studies.retain(|s| {
                let desc = normalize_text(s.string(tags::STUDY_DESCRIPTION).unwrap_or(""));
                self.keywords.iter().any(|k| desc.contains(k.as_str()))
            });
        }

        studies
    }
}

pub fn study_date_time(study: &Attributes) -> Option<NaiveDateTime> {
    study.date_time(tags::STUDY_DATE, tags::STUDY_TIME)
}

/// Date and time descending, undated last, then Study Instance UID ascending
pub fn compare_studies(a: &Attributes, b: &Attributes) -> Ordering {
    match (study_date_time(a), study_date_time(b)) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| {
        let ua = a.string(tags::STUDY_INSTANCE_UID).unwrap_or("");
        let ub = b.string(tags::STUDY_INSTANCE_UID).unwrap_or("");
        ua.cmp(ub)
    })
}

fn tokens(raw: &str, map: impl Fn(&str) -> String) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(map)
        .collect()
}

/// Accepts RFC 3339, ISO local date-times, ISO dates and DICOM DA/DT forms.
/// A date alone covers the whole day.
fn parse_bound(param: &str, raw: &str, upper: bool) -> Result<NaiveDateTime, FilterError> {
    let v = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(v) {
        return Ok(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(v, fmt) {
            return Ok(dt);
        }
    }
    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(v, fmt) {
            let time = if upper {
                NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999)
            } else {
                Some(NaiveTime::MIN)
            };
            if let Some(t) = time {
                return Ok(d.and_time(t));
            }
        }
    }
    Err(FilterError::InvalidDate {
        param: param.to_string(),
        value: raw.to_string(),
    })
}
