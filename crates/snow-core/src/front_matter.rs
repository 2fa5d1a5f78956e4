//! Front matter parsing
//!
//! Content files are UTF-8 text that starts with a `---` delimited YAML
//! block, followed by a blank line and the body:
//!
//! ```text
//! ---
//! title: Hi
//! date: 2024-01-01T00:00:00Z
//! ---
//!
//! Body text
//! ```
//!
//! Files without a leading `---` block have no front matter; their fields
//! default to just the sentinel date.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Front matter key/value pairs, in document order
pub type Fields = Mapping;

/// Date used when a file has no parseable `date`
pub const SENTINEL_DATE: &str = "0001-01-01T12:00:00Z";

const DELIMITER: &str = "---";

#[derive(Error, Debug)]
pub enum FrontMatterError {
    #[error("Invalid front matter YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Front matter must be a mapping of keys to values")]
    NotAMapping,
}

/// The sentinel minimum date
pub fn sentinel_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 12, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Split text into `(front matter, body)`. Front matter is `None` when the
/// text does not open with a delimiter line or the block is never closed.
pub fn split(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim();

    let Some(after_open) = strip_delimiter_line(trimmed) else {
        return (None, trimmed);
    };

    // Find the closing delimiter on a line of its own
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            let front = &after_open[..offset];
            let body = &after_open[offset + line.len()..];
            return (Some(front), body.trim());
        }
        offset += line.len();
    }

    // A single trailing delimiter without a newline
    if let Some(front) = after_open.strip_suffix(DELIMITER) {
        if front.is_empty() || front.ends_with('\n') {
            return (Some(front), "");
        }
    }

    (None, trimmed)
}

fn strip_delimiter_line(text: &str) -> Option<&str> {
    let rest = text.strip_prefix(DELIMITER)?;
    rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))
}

/// Parse text into fields and body
pub fn parse(text: &str) -> Result<(Fields, String), FrontMatterError> {
    match split(text) {
        (Some(front), body) => {
            let fields = match serde_yaml::from_str::<Value>(front)? {
                Value::Mapping(map) => map,
                Value::Null => Mapping::new(),
                _ => return Err(FrontMatterError::NotAMapping),
            };
            Ok((fields, body.to_string()))
        }
        (None, body) => {
            let mut fields = Mapping::new();
            fields.insert(
                Value::String("date".to_string()),
                Value::String(SENTINEL_DATE.to_string()),
            );
            Ok((fields, body.to_string()))
        }
    }
}

/// Render fields and body as `---\n<yaml>---\n\n<body>`
pub fn serialize(fields: &Fields, body: &str) -> Result<String, FrontMatterError> {
    let yaml = serde_yaml::to_string(fields)?;
    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n\n{body}"))
}

/// Read a string field
pub fn get_str<'a>(fields: &'a Fields, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

/// Parse the `date` field, if present and recognizable
pub fn field_date(fields: &Fields) -> Option<DateTime<Utc>> {
    match fields.get("date")? {
        Value::String(s) => parse_date(s),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Effective ordering date: the `date` field, or the sentinel
pub fn effective_date(fields: &Fields) -> DateTime<Utc> {
    field_date(fields).unwrap_or_else(sentinel_date)
}

/// Parse the date formats editors commonly write
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
