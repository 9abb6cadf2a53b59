use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, HeaderValue, Method, StatusCode, header::HeaderName};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;

/// Inbound scheme when the request line does not carry one. Outbound
/// forwarding follows the same default.
const DEFAULT_SCHEME: &str = "https";

/// A parsed HTTP/1.1 request head.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub scheme: String,
    /// Host (and optional port) the request addresses; also the target-list
    /// membership key.
    pub host: String,
    /// Path plus query, exactly as received.
    pub path: String,
    pub headers: HeaderMap,
    pub content_length: u64,
    pub close: bool,
}

impl RequestHead {
    /// The full request URL, the string every cache tier keys on.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

/// Reads one request head. Returns `None` on a clean EOF before the first
/// byte (client finished with the connection).
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    read_timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut request_line = String::new();
    let mut total = 0usize;
    let n = read_head_line(reader, &mut request_line, read_timeout, max_header_bytes, &mut total)
        .await?;
    if n == 0 {
        return Ok(None);
    }

    let line = request_line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("request line missing HTTP version"))?;
    ensure!(
        version == "HTTP/1.1" || version == "HTTP/1.0",
        "unsupported HTTP version {version:?}"
    );
    let method: Method = method
        .parse()
        .map_err(|_| anyhow!("invalid request method {method:?}"))?;

    let mut headers = HeaderMap::new();
    let mut content_length = 0u64;
    let mut close = version == "HTTP/1.0";
    loop {
        let mut header_line = String::new();
        let n = read_head_line(
            reader,
            &mut header_line,
            read_timeout,
            max_header_bytes,
            &mut total,
        )
        .await?;
        if n == 0 {
            bail!("client closed connection during request headers");
        }
        let line = header_line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("request header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .with_context(|| format!("invalid Content-Length value {value:?}"))?;
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            bail!("chunked request bodies are not supported");
        }
        if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    close = false;
                }
            }
        }
        let name = HeaderName::try_from(name)
            .map_err(|_| anyhow!("invalid request header name {name:?}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid request header value for {name}"))?;
        headers.append(name, value);
    }

    let (scheme, host, path) = split_target(target, &headers)?;
    Ok(Some(RequestHead {
        method,
        scheme,
        host,
        path,
        headers,
        content_length,
        close,
    }))
}

/// Splits a request target into scheme, authority, and path. Accepts both
/// absolute-form (`http://host/path`) and origin-form (`/path`, host taken
/// from the Host header, scheme defaulting to https).
fn split_target(target: &str, headers: &HeaderMap) -> Result<(String, String, String)> {
    if let Some((scheme, rest)) = target
        .strip_prefix("http://")
        .map(|rest| ("http", rest))
        .or_else(|| target.strip_prefix("https://").map(|rest| ("https", rest)))
    {
        let (host, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        ensure!(!host.is_empty(), "absolute-form target missing host");
        return Ok((scheme.to_string(), host.to_string(), path.to_string()));
    }

    ensure!(
        target.starts_with('/'),
        "unsupported request target {target:?}"
    );
    let host = headers
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| anyhow!("origin-form request without a Host header"))?;
    Ok((
        DEFAULT_SCHEME.to_string(),
        host.to_string(),
        target.to_string(),
    ))
}

async fn read_head_line<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    read_timeout: Duration,
    max_bytes: usize,
    total: &mut usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    let n = timeout(read_timeout, reader.read_line(buf))
        .await
        .map_err(|_| anyhow!("timed out reading request head"))??;
    *total += n;
    ensure!(
        *total <= max_bytes,
        "request head exceeds the configured limit"
    );
    Ok(n)
}

/// Writes a response head. Hop-by-hop and framing headers in `headers` are
/// skipped; framing is whatever `content_length`/`chunked` say.
pub async fn write_response_head<W>(
    writer: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    content_length: Option<u64>,
    chunked: bool,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) || is_framing(name.as_str()) {
            continue;
        }
        buf.extend_from_slice(name.as_str().as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if chunked {
        buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    } else if let Some(length) = content_length {
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(length.to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");

    writer.write_all(&buf).await?;
    Ok(())
}

/// Writes a complete fixed-length response and flushes it.
pub async fn write_simple_response<W>(
    writer: &mut W,
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_response_head(writer, status, headers, Some(body.len() as u64), false).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

fn is_framing(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
}
