//! NZB document model and parser
//!
//! An NZB is the XML manifest listing the articles that reconstruct a
//! binary payload: `<nzb><head><meta .../></head><file ...><groups>...
//! <segments>...</file></nzb>`. Message-ids are stored without angle
//! brackets; the NNTP layer adds them on the wire.

use crate::error::{Error, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use std::collections::HashMap;

/// Parsed NZB manifest
#[derive(Clone, Debug, Default)]
pub struct Nzb {
    /// Head metadata (`type` attribute → element text), e.g. `password`
    pub meta: HashMap<String, String>,
    /// File entries in document order
    pub files: Vec<NzbFile>,
}

/// One logical output file within an NZB
#[derive(Clone, Debug, Default)]
pub struct NzbFile {
    /// Raw subject line (filename is derived from this)
    pub subject: String,
    /// Poster address
    pub poster: String,
    /// Posting date, unix seconds
    pub date: i64,
    /// Newsgroups the file was posted to
    pub groups: Vec<String>,
    /// Segments ordered by ordinal
    pub segments: Vec<NzbSegment>,
}

/// One article reference
#[derive(Clone, Debug, Default)]
pub struct NzbSegment {
    /// 1-based ordinal; ordinal order equals byte-offset order
    pub number: u32,
    /// Declared decoded size in bytes
    pub bytes: u64,
    /// Message-id without angle brackets
    pub message_id: String,
}

impl Nzb {
    /// Password from `<meta type="password">`, if present
    pub fn password(&self) -> Option<&str> {
        self.meta.get("password").map(|s| s.as_str())
    }

    /// Sum of declared segment sizes across all files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.total_size()).sum()
    }
}

impl NzbFile {
    /// Sum of declared segment sizes for this file
    pub fn total_size(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }
}

/// Parse an NZB document from raw bytes.
///
/// Validates the invariants the engine relies on: at least one file,
/// every file has segments, every segment has a positive size and a
/// non-empty message-id. Segments are sorted by ordinal so cumulative
/// offsets can be computed by iteration order.
pub fn parse(content: &[u8]) -> Result<Nzb> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::InvalidNzb(format!("not valid UTF-8: {e}")))?;

    let mut reader = Reader::from_str(text);

    let mut nzb = Nzb::default();
    let mut current_file: Option<NzbFile> = None;
    let mut current_segment: Option<NzbSegment> = None;
    let mut current_meta_type: Option<String> = None;
    let mut in_group = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"file" => {
                    let mut file = NzbFile::default();
                    for attr in e.attributes() {
                        let attr =
                            attr.map_err(|e| Error::InvalidNzb(format!("bad attribute: {e}")))?;
                        let value = attr
                            .unescape_value()
                            .map_err(|e| Error::InvalidNzb(format!("bad attribute value: {e}")))?;
                        match attr.key.local_name().as_ref() {
                            b"subject" => file.subject = value.into_owned(),
                            b"poster" => file.poster = value.into_owned(),
                            b"date" => file.date = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current_file = Some(file);
                }
                b"segment" => {
                    let mut segment = NzbSegment::default();
                    for attr in e.attributes() {
                        let attr =
                            attr.map_err(|e| Error::InvalidNzb(format!("bad attribute: {e}")))?;
                        let value = attr
                            .unescape_value()
                            .map_err(|e| Error::InvalidNzb(format!("bad attribute value: {e}")))?;
                        match attr.key.local_name().as_ref() {
                            b"number" => segment.number = value.parse().unwrap_or(0),
                            b"bytes" => segment.bytes = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current_segment = Some(segment);
                }
                b"group" => in_group = true,
                b"meta" => {
                    for attr in e.attributes() {
                        let attr =
                            attr.map_err(|e| Error::InvalidNzb(format!("bad attribute: {e}")))?;
                        if attr.key.local_name().as_ref() == b"type" {
                            let value = attr.unescape_value().map_err(|e| {
                                Error::InvalidNzb(format!("bad attribute value: {e}"))
                            })?;
                            current_meta_type = Some(value.into_owned());
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| Error::InvalidNzb(format!("bad text node: {e}")))?;
                if let Some(segment) = current_segment.as_mut() {
                    segment.message_id = strip_brackets(text.trim()).to_string();
                } else if in_group {
                    if let Some(file) = current_file.as_mut() {
                        file.groups.push(text.trim().to_string());
                    }
                } else if let Some(meta_type) = current_meta_type.as_ref() {
                    nzb.meta
                        .insert(meta_type.clone(), text.trim().to_string());
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"file" => {
                    if let Some(mut file) = current_file.take() {
                        file.segments.sort_by_key(|s| s.number);
                        nzb.files.push(file);
                    }
                }
                b"segment" => {
                    if let (Some(segment), Some(file)) =
                        (current_segment.take(), current_file.as_mut())
                    {
                        file.segments.push(segment);
                    }
                }
                b"group" => in_group = false,
                b"meta" => current_meta_type = None,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::InvalidNzb(format!("XML parse error: {e}"))),
            _ => {}
        }
    }

    validate(&nzb)?;
    Ok(nzb)
}

fn strip_brackets(id: &str) -> &str {
    id.trim_start_matches('<').trim_end_matches('>')
}

fn validate(nzb: &Nzb) -> Result<()> {
    if nzb.files.is_empty() {
        return Err(Error::InvalidNzb("no file entries".into()));
    }
    for (i, file) in nzb.files.iter().enumerate() {
        if file.segments.is_empty() {
            return Err(Error::InvalidNzb(format!("file {i} has no segments")));
        }
        for segment in &file.segments {
            if segment.message_id.is_empty() {
                return Err(Error::InvalidNzb(format!(
                    "file {i} segment {} has an empty message-id",
                    segment.number
                )));
            }
            if segment.bytes == 0 {
                return Err(Error::InvalidNzb(format!(
                    "file {i} segment {} declares zero bytes",
                    segment.number
                )));
            }
        }
    }
    Ok(())
}
