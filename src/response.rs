//! Raw ESL records: ordered MIME-style headers plus an optional body

use percent_encoding::percent_decode_str;

use crate::constants::{HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT};
use crate::error::{EslError, EslResult};

/// Canonicalize a MIME header key: first letter and every letter after a
/// `-` uppercased, everything else lowercased (`unique-id` → `Unique-Id`).
///
/// A name containing bytes that are not valid in a header token is
/// returned unchanged.
fn canonical_key(name: &str) -> String {
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if !valid || name.is_empty() {
        return name.to_string();
    }

    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for b in name.bytes() {
        if upper {
            out.push(b.to_ascii_uppercase() as char);
        } else {
            out.push(b.to_ascii_lowercase() as char);
        }
        upper = b == b'-';
    }
    out
}

/// Ordered mapping from canonical header name to one or more values.
///
/// Order of first appearance is preserved; lookups are case-insensitive
/// through canonicalization. ESL sends some headers (notably on `sendevent`
/// echoes) more than once, hence the multi-value shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no headers are present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for the given name, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = canonical_key(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .and_then(|(_, vs)| vs.first())
            .map(|s| s.as_str())
    }

    /// All values recorded for the given name.
    pub fn get_all(&self, name: &str) -> &[String] {
        let key = canonical_key(name);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, vs)| vs.as_slice())
            .unwrap_or(&[])
    }

    /// Whether any value exists for the given name.
    pub fn contains(&self, name: &str) -> bool {
        let key = canonical_key(name);
        self.entries
            .iter()
            .any(|(k, _)| *k == key)
    }

    /// Append a value, keeping any existing values for the same name.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        let key = canonical_key(name);
        if let Some((_, vs)) = self
            .entries
            .iter_mut()
            .find(|(k, _)| *k == key)
        {
            vs.push(value.into());
        } else {
            self.entries
                .push((key, vec![value.into()]));
        }
    }

    /// Set a single value, replacing any existing values for the name.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let key = canonical_key(name);
        if let Some((_, vs)) = self
            .entries
            .iter_mut()
            .find(|(k, _)| *k == key)
        {
            vs.clear();
            vs.push(value.into());
        } else {
            self.entries
                .push((key, vec![value.into()]));
        }
    }

    /// Iterate `(name, first value)` pairs in order of first appearance.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .filter_map(|(k, vs)| {
                vs.first()
                    .map(|v| (k.as_str(), v.as_str()))
            })
    }
}

/// Split one `Name: value` line, percent-decoding the value.
///
/// ESL percent-encodes header values (`switch_event_serialize`); an invalid
/// escape sequence falls back to the raw text.
pub(crate) fn parse_header_line(line: &str) -> EslResult<(String, String)> {
    let colon = line
        .find(':')
        .ok_or_else(|| EslError::protocol(format!("malformed header line: {line:?}")))?;
    let name = line[..colon].trim();
    let raw_value = line[colon + 1..].trim();
    let value = percent_decode_str(raw_value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw_value.to_string());
    Ok((name.to_string(), value))
}

/// Parse a full header block (lines up to, not including, the blank line).
pub(crate) fn parse_header_block(block: &str) -> EslResult<Headers> {
    let mut headers = Headers::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let (name, value) = parse_header_line(line)?;
        headers.add(&name, value);
    }
    Ok(headers)
}

/// One record received from the softswitch: the MIME header block and the
/// `Content-Length`-delimited body, if any. Not mutated after parsing.
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    headers: Headers,
    body: Vec<u8>,
}

impl RawResponse {
    pub(crate) fn new(headers: Headers, body: Vec<u8>) -> Self {
        Self { headers, body }
    }

    /// All headers of the record.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
    }

    /// Whether the named header is present.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .contains(name)
    }

    /// `Content-Type` of the record, empty if absent.
    pub fn content_type(&self) -> &str {
        self.header(HEADER_CONTENT_TYPE)
            .unwrap_or("")
    }

    /// Raw `Reply-Text` header value (e.g. `+OK`, `-ERR invalid`).
    pub fn reply_text(&self) -> Option<&str> {
        self.header(HEADER_REPLY_TEXT)
    }

    /// Body bytes; empty when the record carried no `Content-Length`.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body as UTF-8, if valid.
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Success predicate: `Reply-Text` begins with `+OK`, or the body does
    /// (`api/response` reports status in the body).
    pub fn is_ok(&self) -> bool {
        if let Some(reply) = self.reply_text() {
            if reply.starts_with("+OK") {
                return true;
            }
        }
        self.body
            .starts_with(b"+OK")
    }

    /// Inject a header after parsing. Only the outbound acceptor uses this,
    /// to surface the WebSocket request id on the connect reply.
    pub(crate) fn insert_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .set(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_key() {
        assert_eq!(canonical_key("content-type"), "Content-Type");
        assert_eq!(canonical_key("CONTENT-LENGTH"), "Content-Length");
        assert_eq!(canonical_key("Unique-ID"), "Unique-Id");
        assert_eq!(canonical_key("unique-id"), "Unique-Id");
        assert_eq!(canonical_key("X-Request-ID"), "X-Request-Id");
    }

    #[test]
    fn test_canonical_key_invalid_chars_left_alone() {
        assert_eq!(canonical_key("bad key"), "bad key");
        assert_eq!(canonical_key(""), "");
    }

    #[test]
    fn test_get_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "command/reply");
        assert_eq!(headers.get("content-type"), Some("command/reply"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("command/reply"));
        assert!(headers.contains("Content-type"));
        assert!(!headers.contains("Reply-Text"));
    }

    #[test]
    fn test_add_appends_set_replaces() {
        let mut headers = Headers::new();
        headers.add("X-Test", "one");
        headers.add("X-Test", "two");
        assert_eq!(headers.get("X-Test"), Some("one"));
        assert_eq!(headers.get_all("X-Test"), &["one", "two"]);
        assert_eq!(headers.len(), 1);

        headers.set("X-Test", "three");
        assert_eq!(headers.get_all("X-Test"), &["three"]);
    }

    #[test]
    fn test_order_of_first_appearance() {
        let mut headers = Headers::new();
        headers.add("B-Header", "b");
        headers.add("A-Header", "a");
        headers.add("B-Header", "b2");
        let names: Vec<_> = headers
            .iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(names, &["B-Header", "A-Header"]);
    }

    #[test]
    fn test_parse_header_line_percent_decodes() {
        let (name, value) = parse_header_line("Up-Time: 0%20years%2C%200%20days").unwrap();
        assert_eq!(name, "Up-Time");
        assert_eq!(value, "0 years, 0 days");
    }

    #[test]
    fn test_parse_header_line_invalid_escape_falls_back() {
        let (_, value) = parse_header_line("X-Bad: %ZZinvalid").unwrap();
        assert_eq!(value, "%ZZinvalid");
    }

    #[test]
    fn test_parse_header_line_without_colon() {
        assert!(parse_header_line("no colon here").is_err());
    }

    #[test]
    fn test_parse_header_block() {
        let headers =
            parse_header_block("Content-Type: command/reply\r\nReply-Text: +OK accepted").unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("Content-Type"), Some("command/reply"));
        assert_eq!(headers.get("Reply-Text"), Some("+OK accepted"));
    }

    #[test]
    fn test_is_ok_from_reply_text() {
        let headers = parse_header_block("Reply-Text: +OK accepted").unwrap();
        let response = RawResponse::new(headers, Vec::new());
        assert!(response.is_ok());

        let headers = parse_header_block("Reply-Text: -ERR invalid").unwrap();
        let response = RawResponse::new(headers, Vec::new());
        assert!(!response.is_ok());
    }

    #[test]
    fn test_is_ok_from_body() {
        let response = RawResponse::new(Headers::new(), b"+OK event listener enabled".to_vec());
        assert!(response.is_ok());

        let response = RawResponse::new(Headers::new(), b"-ERR no".to_vec());
        assert!(!response.is_ok());
    }

    #[test]
    fn test_unique_id_spelling_variants_collide() {
        // FreeSWITCH writes `Unique-ID`; scripted peers often write
        // `Unique-Id`. Canonicalization makes them the same key.
        let mut headers = Headers::new();
        headers.add("Unique-ID", "call-1");
        let response = RawResponse::new(headers, Vec::new());
        assert_eq!(response.header("Unique-Id"), Some("call-1"));
    }
}
