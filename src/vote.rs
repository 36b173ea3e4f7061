//! Query parsing and vote validation.
//!
//! Both stages are pure functions over the raw query bytes plus an
//! optional client address, so they can be exercised without any HTTP
//! machinery. The router only maps their `Result` onto status codes.

use std::collections::HashMap;
use std::str;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::anonymize_ip;

pub const MAX_KEY_LEN: usize = 25;
pub const MAX_PAGE_LEN: usize = 255;
pub const MAX_VALUE_LEN: usize = 1024;

/// The closed set of scalar types a caller may submit. Anything a
/// JSON decoder produces outside this set (null, arrays, objects) is
/// rejected at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("query string is not valid UTF-8")]
    InvalidEncoding,

    #[error("parameter key exceeds {MAX_KEY_LEN} characters")]
    KeyTooLong,

    #[error("parameter value is not decodable as JSON")]
    UndecodableValue,

    #[error("parameter value is not a boolean, integer, float, or string")]
    InvalidValueType,
}

#[derive(Error, Debug, PartialEq)]
pub enum VoteError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("required parameter `{0}` is missing")]
    MissingField(&'static str),

    #[error("parameter `{0}` has the wrong type")]
    WrongType(&'static str),
}

/// One validated feedback submission, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub page: String,
    pub useful: bool,
    pub fields: HashMap<String, FieldValue>,
    pub ip: Option<String>,
}

impl Vote {
    /// Full pipeline: raw query bytes plus an optional client address
    /// in, a well-formed `Vote` out.
    ///
    /// An unparsable client address degrades the vote (no stored
    /// address) instead of rejecting it.
    pub fn from_query(raw: &[u8], client_addr: Option<&str>) -> Result<Self, VoteError> {
        let mut parameters = parse_query(raw)?;

        let page = match parameters.remove("p") {
            Some(FieldValue::Str(page)) => page,
            Some(_) => return Err(VoteError::WrongType("p")),
            None => return Err(VoteError::MissingField("p")),
        };

        // Older clients encode usefulness as 0/1 rather than a JSON
        // boolean, so integers coerce instead of failing.
        let useful = match parameters.remove("v") {
            Some(FieldValue::Bool(useful)) => useful,
            Some(FieldValue::Int(flag)) => flag != 0,
            Some(_) => return Err(VoteError::WrongType("v")),
            None => return Err(VoteError::MissingField("v")),
        };

        let ip = client_addr.and_then(|addr| anonymize_ip(addr).ok());

        Ok(Vote {
            page: truncate_chars(page, MAX_PAGE_LEN),
            useful,
            fields: parameters,
            ip,
        })
    }
}

/// Decode a raw query string into typed scalars.
///
/// Keys are capped at [`MAX_KEY_LEN`] characters. Each value is
/// truncated to [`MAX_VALUE_LEN`] bytes and then decoded as a single
/// JSON scalar. When a key repeats, the first occurrence wins and
/// later ones are dropped.
pub fn parse_query(raw: &[u8]) -> Result<HashMap<String, FieldValue>, ParseError> {
    let raw = str::from_utf8(raw).map_err(|_| ParseError::InvalidEncoding)?;

    let mut parameters = HashMap::new();
    for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
        if key.chars().count() > MAX_KEY_LEN {
            return Err(ParseError::KeyTooLong);
        }

        // Bare keys and blank values carry no scalar; drop them.
        if value.is_empty() || parameters.contains_key(key.as_ref()) {
            continue;
        }

        let value = decode_scalar(truncate_bytes(&value, MAX_VALUE_LEN))?;
        parameters.insert(key.into_owned(), value);
    }

    Ok(parameters)
}

fn decode_scalar(raw: &str) -> Result<FieldValue, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| ParseError::UndecodableValue)?;

    match value {
        serde_json::Value::Bool(value) => Ok(FieldValue::Bool(value)),
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Ok(FieldValue::Int(int))
            } else if let Some(float) = number.as_f64() {
                Ok(FieldValue::Float(float))
            } else {
                Err(ParseError::InvalidValueType)
            }
        }
        serde_json::Value::String(value) => Ok(FieldValue::Str(value)),
        _ => Err(ParseError::InvalidValueType),
    }
}

/// Cut to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }

    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }

    &s[..end]
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((index, _)) => s[..index].to_string(),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> HashMap<String, FieldValue> {
        parse_query(raw.as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_scalars() {
        let parameters = parse("a=true&b=7&c=1.5&d=%22hi%22");

        assert_eq!(parameters["a"], FieldValue::Bool(true));
        assert_eq!(parameters["b"], FieldValue::Int(7));
        assert_eq!(parameters["c"], FieldValue::Float(1.5));
        assert_eq!(parameters["d"], FieldValue::Str("hi".to_string()));
    }

    #[test]
    fn test_key_too_long() {
        let key = "k".repeat(MAX_KEY_LEN + 1);
        assert_eq!(
            parse_query(format!("{key}=1").as_bytes()),
            Err(ParseError::KeyTooLong)
        );
    }

    #[test]
    fn test_key_at_limit() {
        let key = "k".repeat(MAX_KEY_LEN);
        let parameters = parse(&format!("{key}=1"));
        assert_eq!(parameters[&key], FieldValue::Int(1));
    }

    #[test]
    fn test_non_scalar_values_rejected() {
        assert_eq!(
            parse_query(b"a=null"),
            Err(ParseError::InvalidValueType)
        );
        assert_eq!(
            parse_query(b"a=%5B1%2C2%5D"),
            Err(ParseError::InvalidValueType)
        );
        assert_eq!(
            parse_query(b"a=%7B%7D"),
            Err(ParseError::InvalidValueType)
        );
    }

    #[test]
    fn test_undecodable_value() {
        assert_eq!(parse_query(b"a=notjson"), Err(ParseError::UndecodableValue));
    }

    #[test]
    fn test_blank_values_dropped() {
        let parameters = parse("a=1&junk&b=");
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters["a"], FieldValue::Int(1));
    }

    #[test]
    fn test_first_duplicate_wins() {
        let parameters = parse("a=1&a=2");
        assert_eq!(parameters["a"], FieldValue::Int(1));
    }

    #[test]
    fn test_value_truncated_before_decode() {
        // The closing quote sits past the 1024-byte cutoff, so the
        // truncated value is no longer a complete JSON string.
        let raw = format!("a=%22{}%22", "x".repeat(MAX_VALUE_LEN));
        assert_eq!(
            parse_query(raw.as_bytes()),
            Err(ParseError::UndecodableValue)
        );

        // Quote included within the cutoff decodes fine.
        let raw = format!("a=%22{}%22", "x".repeat(MAX_VALUE_LEN - 2));
        let parameters = parse(&raw);
        assert!(matches!(parameters["a"], FieldValue::Str(_)));
    }

    #[test]
    fn test_build_vote() {
        let vote = Vote::from_query(b"p=%22/home%22&v=true&color=%22red%22", None).unwrap();

        assert_eq!(vote.page, "/home");
        assert!(vote.useful);
        assert_eq!(vote.fields["color"], FieldValue::Str("red".to_string()));
        assert!(!vote.fields.contains_key("p"));
        assert!(!vote.fields.contains_key("v"));
        assert_eq!(vote.ip, None);
    }

    #[test]
    fn test_integer_usefulness_coerced() {
        let vote = Vote::from_query(b"p=%22/home%22&v=1", None).unwrap();
        assert!(vote.useful);

        let vote = Vote::from_query(b"p=%22/home%22&v=0", None).unwrap();
        assert!(!vote.useful);
    }

    #[test]
    fn test_missing_required_fields() {
        assert_eq!(
            Vote::from_query(b"v=true", None),
            Err(VoteError::MissingField("p"))
        );
        assert_eq!(
            Vote::from_query(b"p=%22/home%22", None),
            Err(VoteError::MissingField("v"))
        );
    }

    #[test]
    fn test_wrong_required_field_types() {
        assert_eq!(
            Vote::from_query(b"p=3&v=true", None),
            Err(VoteError::WrongType("p"))
        );
        assert_eq!(
            Vote::from_query(b"p=%22/home%22&v=%22yes%22", None),
            Err(VoteError::WrongType("v"))
        );
    }

    #[test]
    fn test_page_truncated() {
        let page = "x".repeat(MAX_PAGE_LEN + 40);
        let raw = format!("p=%22{page}%22&v=true");

        let vote = Vote::from_query(raw.as_bytes(), None).unwrap();
        assert_eq!(vote.page.chars().count(), MAX_PAGE_LEN);
    }

    #[test]
    fn test_client_address_anonymized() {
        let vote = Vote::from_query(b"p=%22/home%22&v=true", Some("241.129.42.29")).unwrap();
        assert_eq!(vote.ip.as_deref(), Some("241.129.42.0"));
    }

    #[test]
    fn test_bad_client_address_degrades() {
        let vote = Vote::from_query(b"p=%22/home%22&v=true", Some("not-an-ip")).unwrap();
        assert_eq!(vote.ip, None);
    }
}
