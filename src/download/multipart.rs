//! `multipart/related` bodies as returned by WADO-RS instance retrieval.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("content type '{0}' has no boundary")]
    MissingBoundary(String),

    #[error("malformed multipart body: {0}")]
    Malformed(String),
}

/// Whether a part with this Content-Type holds a DICOM instance.
/// Parts without a Content-Type are taken as DICOM.
pub fn is_dicom_part(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => ct.trim().to_lowercase().starts_with("application/dicom"),
        None => true,
    }
}

/// `boundary` parameter of a multipart content type
pub fn boundary(content_type: &str) -> Result<String, MultipartError> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
        .ok_or_else(|| MultipartError::MissingBoundary(content_type.to_string()))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// What the splitter found in the bytes fed so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartEvent {
    /// A part begins, with its Content-Type when it has one
    Start(Option<String>),
    Data(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preamble,
    AfterBoundary,
    Headers,
    Body,
    Closed,
}

/// Incremental `multipart/related` splitter. Part content is handed out as
/// it arrives; at most one delimiter's length is held back.
pub struct PartSplitter {
    delimiter: Vec<u8>,
    buf: BytesMut,
    phase: Phase,
}

impl PartSplitter {
    pub fn new(boundary: &str) -> Self {
        let mut buf = BytesMut::new();
        // The opening boundary then matches the same CRLF-prefixed delimiter
        buf.extend_from_slice(b"\r\n");
        Self {
            delimiter: format!("\r\n--{}", boundary).into_bytes(),
            buf,
            phase: Phase::Preamble,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<PartEvent>, MultipartError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            match self.phase {
                Phase::Preamble => match find(&self.buf, &self.delimiter, 0) {
                    Some(pos) => {
                        self.buf.advance(pos + self.delimiter.len());
                        self.phase = Phase::AfterBoundary;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            self.buf.advance(self.buf.len() - keep);
                        }
                        return Ok(events);
                    }
                },
                Phase::AfterBoundary => {
                    if self.buf.len() < 2 {
                        return Ok(events);
                    }
                    if self.buf.starts_with(b"--") {
                        self.phase = Phase::Closed;
                        continue;
                    }
                    // transport padding, then CRLF
                    let padding = self.buf.iter().take_while(|b| **b == b' ' || **b == b'\t').count();
                    if padding == self.buf.len() || (padding + 1 == self.buf.len() && self.buf[padding] == b'\r') {
                        return Ok(events);
                    }
                    if !self.buf[padding..].starts_with(b"\r\n") {
                        return Err(MultipartError::Malformed("boundary line not terminated".into()));
                    }
                    self.buf.advance(padding + 2);
                    self.phase = Phase::Headers;
                }
                Phase::Headers => {
                    let (content_type, consumed) = if self.buf.starts_with(b"\r\n") {
                        (None, 2)
                    } else {
                        match find(&self.buf, b"\r\n\r\n", 0) {
                            Some(end) => (part_content_type(&self.buf[..end])?, end + 4),
                            None => return Ok(events),
                        }
                    };
                    self.buf.advance(consumed);
                    events.push(PartEvent::Start(content_type));
                    self.phase = Phase::Body;
                }
                Phase::Body => match find(&self.buf, &self.delimiter, 0) {
                    Some(pos) => {
                        let data = self.buf.split_to(pos).freeze();
                        if !data.is_empty() {
                            events.push(PartEvent::Data(data));
                        }
                        self.buf.advance(self.delimiter.len());
                        events.push(PartEvent::End);
                        self.phase = Phase::AfterBoundary;
                    }
                    None => {
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            let data = self.buf.split_to(self.buf.len() - keep).freeze();
                            events.push(PartEvent::Data(data));
                        }
                        return Ok(events);
                    }
                },
                Phase::Closed => {
                    self.buf.clear();
                    return Ok(events);
                }
            }
        }
    }

    /// Check the body ended with its closing boundary
    pub fn finish(&self) -> Result<(), MultipartError> {
        match self.phase {
            Phase::Closed => Ok(()),
            Phase::Preamble => Err(MultipartError::Malformed("no opening boundary".into())),
            _ => Err(MultipartError::Malformed("missing closing boundary".into())),
        }
    }
}

fn part_content_type(headers: &[u8]) -> Result<Option<String>, MultipartError> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| MultipartError::Malformed("part headers are not text".into()))?;
    Ok(text
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.trim().to_string()))
}

/// Build a `multipart/related` body of DICOM parts. Returns the boundary and the body.
pub fn build_multipart(parts: &[Vec<u8>]) -> (String, Vec<u8>) {
    let boundary = format!("dicomweb_{}", uuid::Uuid::new_v4().simple());
    let mut buf: Vec<u8> = Vec::new();
    for part in parts {
        buf.extend_from_slice(format!("--{}\r\n", &boundary).as_bytes());
        buf.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
        buf.extend_from_slice(part);
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(format!("--{}--\r\n", &boundary).as_bytes());
    (boundary, buf)
}
