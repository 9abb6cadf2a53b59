use bytes::Bytes;
use http::{HeaderMap, HeaderValue, header::HeaderName};
use thiserror::Error;

/// Response headers preserved in cache entries, written in canonical form.
/// Everything else the origin sent is dropped at store time.
const SAVED_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "content-type"),
    ("Content-Length", "content-length"),
    ("Content-Encoding", "content-encoding"),
    ("Cache-Control", "cache-control"),
    ("ETag", "etag"),
    ("Last-Modified", "last-modified"),
    ("Date", "date"),
];

/// Metadata the resolver itself stamps onto responses; preserved so a replay
/// carries the same shape as the original serve.
const CACHE_META_PREFIX: &str = "x-cache";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("cache entry has no blank line separating headers from body")]
    MissingSeparator,
    #[error("cache entry header line is malformed: {0:?}")]
    MalformedHeader(String),
}

/// Returns the subset of `headers` that belongs in a cache entry.
pub fn saved_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (_, lower) in SAVED_HEADERS {
        let name = HeaderName::from_static(*lower);
        for value in headers.get_all(&name) {
            out.append(name.clone(), value.clone());
        }
    }
    for (name, value) in headers.iter() {
        if name.as_str().starts_with(CACHE_META_PREFIX) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Encodes a cache entry as a header block, a blank line, and the raw body.
/// Values that cannot be rendered as a single text line are skipped.
pub fn encode(headers: &HeaderMap, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + body.len());
    for (name, value) in headers.iter() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        if value.contains('\n') || value.contains('\r') {
            continue;
        }
        buf.extend_from_slice(canonical_name(name.as_str()).as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.push(b'\n');
    }
    buf.push(b'\n');
    buf.extend_from_slice(body);
    buf
}

/// Decodes the wire form produced by [`encode`]. Accepts CRLF or LF line
/// endings. The body is returned as-is; a missing blank-line separator or a
/// header line without a `": "` split is a corrupt entry, not a miss.
pub fn decode(data: &[u8]) -> Result<(HeaderMap, Bytes), DecodeError> {
    let mut headers = HeaderMap::new();
    let mut pos = 0usize;
    loop {
        let rest = &data[pos..];
        let Some(eol) = rest.iter().position(|&b| b == b'\n') else {
            return Err(DecodeError::MissingSeparator);
        };
        let mut line = &rest[..eol];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        pos += eol + 1;
        if line.is_empty() {
            break;
        }
        let text = std::str::from_utf8(line)
            .map_err(|_| DecodeError::MalformedHeader(String::from_utf8_lossy(line).into_owned()))?;
        let Some((name, value)) = text.split_once(": ") else {
            return Err(DecodeError::MalformedHeader(text.to_string()));
        };
        let name = HeaderName::try_from(name)
            .map_err(|_| DecodeError::MalformedHeader(text.to_string()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| DecodeError::MalformedHeader(text.to_string()))?;
        headers.append(name, value);
    }
    Ok((headers, Bytes::copy_from_slice(&data[pos..])))
}

/// Renders a header name in canonical HTTP capitalization. Known saved
/// headers use their fixed spelling; anything else is title-cased segment by
/// segment (`x-cache-id` becomes `X-Cache-Id`).
fn canonical_name(lower: &str) -> String {
    for (canonical, known) in SAVED_HEADERS {
        if *known == lower {
            return (*canonical).to_string();
        }
    }
    let mut out = String::with_capacity(lower.len());
    for (i, segment) in lower.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}
