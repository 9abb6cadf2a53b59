use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header::HeaderName};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::codec::{RequestHead, is_hop_by_hop};

/// Connects to origins and speaks HTTP/1.1 at them. TLS is optional so the
/// proxy can run in plain-http-only environments; an https target without a
/// TLS config is a forwarding error, not a startup error.
pub struct OriginClient {
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

pub enum OriginStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            OriginStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl OriginClient {
    pub fn new(
        tls: Option<Arc<ClientConfig>>,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Self {
        Self {
            tls,
            connect_timeout,
            io_timeout,
        }
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub async fn connect(&self, scheme: &str, host: &str) -> Result<OriginStream> {
        let (hostname, port) = split_host_port(host, scheme)?;
        let tcp = timeout(self.connect_timeout, TcpStream::connect((hostname.as_str(), port)))
            .await
            .map_err(|_| anyhow!("timed out connecting to {hostname}:{port}"))?
            .with_context(|| format!("failed to connect to {hostname}:{port}"))?;

        if scheme != "https" {
            return Ok(OriginStream::Plain(tcp));
        }

        let Some(tls) = self.tls.clone() else {
            bail!("no TLS client configuration available for https origin {hostname}");
        };
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| anyhow!("invalid TLS server name {hostname:?}"))?;
        let connector = TlsConnector::from(tls);
        let stream = timeout(self.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| anyhow!("TLS handshake with {hostname}:{port} timed out"))?
            .with_context(|| format!("TLS handshake with {hostname}:{port} failed"))?;
        Ok(OriginStream::Tls(Box::new(stream)))
    }

    /// Writes the rewritten request head: origin-form target, Host set to the
    /// inbound request's host, hop-by-hop headers dropped.
    pub async fn send_request(&self, origin: &mut OriginStream, head: &RequestHead) -> Result<()> {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(head.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(head.path.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        buf.extend_from_slice(head.host.as_bytes());
        buf.extend_from_slice(b"\r\n");
        for (name, value) in head.headers.iter() {
            if is_hop_by_hop(name.as_str()) || name == &http::header::HOST {
                continue;
            }
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        timeout(self.io_timeout, origin.write_all(&buf))
            .await
            .map_err(|_| anyhow!("timed out writing request to origin"))??;
        timeout(self.io_timeout, origin.flush())
            .await
            .map_err(|_| anyhow!("timed out flushing request to origin"))??;
        Ok(())
    }

    /// Streams a fixed-length request body from the client to the origin.
    pub async fn copy_request_body<S>(
        &self,
        client: &mut BufReader<S>,
        origin: &mut OriginStream,
        length: u64,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut remaining = length;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = timeout(self.io_timeout, client.read(&mut buf[..want]))
                .await
                .map_err(|_| anyhow!("timed out reading request body"))??;
            ensure!(n > 0, "client closed connection mid request body");
            timeout(self.io_timeout, origin.write_all(&buf[..n]))
                .await
                .map_err(|_| anyhow!("timed out writing request body to origin"))??;
            remaining -= n as u64;
        }
        timeout(self.io_timeout, origin.flush())
            .await
            .map_err(|_| anyhow!("timed out flushing request to origin"))??;
        Ok(())
    }
}

fn split_host_port(host: &str, scheme: &str) -> Result<(String, u16)> {
    let default_port = if scheme == "https" { 443 } else { 80 };
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in host {host:?}"))?;
            Ok((name.to_string(), port))
        }
        _ => Ok((host.to_string(), default_port)),
    }
}

/// Parsed origin response head.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub close: bool,
}

pub async fn read_response_head(
    reader: &mut BufReader<OriginStream>,
    read_timeout: Duration,
    max_header_bytes: usize,
) -> Result<ResponseHead> {
    let mut status_line = String::new();
    let mut total = 0usize;
    let n = timeout(read_timeout, reader.read_line(&mut status_line))
        .await
        .map_err(|_| anyhow!("timed out reading origin status line"))??;
    ensure!(n > 0, "origin closed connection before the status line");
    total += n;

    let line = status_line.trim_end_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing HTTP version"))?;
    ensure!(
        version == "HTTP/1.1" || version == "HTTP/1.0",
        "unsupported origin HTTP version {version:?}"
    );
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("origin status line missing status code"))?;
    let status: StatusCode = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid origin status code {status:?}"))?;

    let mut headers = HeaderMap::new();
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;
    let mut close = version == "HTTP/1.0";
    loop {
        let mut header_line = String::new();
        let n = timeout(read_timeout, reader.read_line(&mut header_line))
            .await
            .map_err(|_| anyhow!("timed out reading origin headers"))??;
        ensure!(n > 0, "origin closed connection during headers");
        total += n;
        ensure!(
            total <= max_header_bytes,
            "origin response head exceeds the configured limit"
        );
        let line = header_line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("origin header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            ensure!(
                content_length.is_none(),
                "origin sent multiple Content-Length headers"
            );
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid origin Content-Length {value:?}"))?;
            content_length = Some(parsed);
        }
        if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
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
            .map_err(|_| anyhow!("invalid origin header name {name:?}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid origin header value for {name}"))?;
        headers.append(name, value);
    }

    ensure!(
        !(transfer_encoding_present && content_length.is_some()),
        "origin sent both Transfer-Encoding and Content-Length"
    );

    Ok(ResponseHead {
        status,
        headers,
        content_length,
        chunked,
        close,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub fn response_body_plan(method: &Method, head: &ResponseHead) -> BodyPlan {
    if method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::Empty;
    }
    if head.chunked {
        return BodyPlan::Chunked;
    }
    if let Some(length) = head.content_length {
        return BodyPlan::Fixed(length);
    }
    BodyPlan::UntilClose
}

/// Bytes streamed to the client plus the capture buffer when one was
/// requested. The buffer is handed over only after the client copy finished,
/// so its contents always match what was served.
pub struct RelayOutcome {
    pub bytes: u64,
    pub captured: Option<Bytes>,
}

/// Streams the origin body to the client, optionally teeing it into a
/// capture buffer. For chunked bodies the captured form is the decoded
/// payload; the client sees re-encoded chunks.
pub async fn relay_body<C>(
    origin: &mut BufReader<OriginStream>,
    client: &mut C,
    plan: BodyPlan,
    capture: bool,
    io_timeout: Duration,
) -> Result<RelayOutcome>
where
    C: AsyncWrite + Unpin,
{
    let mut buffer = capture.then(Vec::new);
    let bytes = match plan {
        BodyPlan::Empty => 0,
        BodyPlan::Fixed(length) => {
            relay_fixed(origin, client, length, &mut buffer, io_timeout).await?
        }
        BodyPlan::Chunked => relay_chunked(origin, client, &mut buffer, io_timeout).await?,
        BodyPlan::UntilClose => relay_until_close(origin, client, &mut buffer, io_timeout).await?,
    };
    timeout(io_timeout, client.flush())
        .await
        .map_err(|_| anyhow!("timed out flushing response to client"))??;
    Ok(RelayOutcome {
        bytes,
        captured: buffer.map(Bytes::from),
    })
}

async fn relay_fixed<C>(
    origin: &mut BufReader<OriginStream>,
    client: &mut C,
    length: u64,
    buffer: &mut Option<Vec<u8>>,
    io_timeout: Duration,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    let mut remaining = length;
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = timeout(io_timeout, origin.read(&mut buf[..want]))
            .await
            .map_err(|_| anyhow!("timed out reading origin body"))??;
        ensure!(n > 0, "origin closed connection mid body");
        client.write_all(&buf[..n]).await?;
        if let Some(buffer) = buffer {
            buffer.extend_from_slice(&buf[..n]);
        }
        remaining -= n as u64;
    }
    Ok(length)
}

async fn relay_chunked<C>(
    origin: &mut BufReader<OriginStream>,
    client: &mut C,
    buffer: &mut Option<Vec<u8>>,
    io_timeout: Duration,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let mut size_line = String::new();
        let n = timeout(io_timeout, origin.read_line(&mut size_line))
            .await
            .map_err(|_| anyhow!("timed out reading chunk size"))??;
        ensure!(n > 0, "origin closed connection mid chunked body");
        let size_text = size_line
            .trim_end_matches(['\r', '\n'])
            .split(';')
            .next()
            .unwrap_or_default();
        let size = u64::from_str_radix(size_text.trim(), 16)
            .with_context(|| format!("invalid chunk size {size_text:?}"))?;

        if size == 0 {
            // Consume trailers, forward only the terminator.
            loop {
                let mut trailer = String::new();
                let n = timeout(io_timeout, origin.read_line(&mut trailer))
                    .await
                    .map_err(|_| anyhow!("timed out reading chunk trailers"))??;
                ensure!(n > 0, "origin closed connection mid chunk trailers");
                if trailer == "\r\n" || trailer == "\n" {
                    break;
                }
            }
            client.write_all(b"0\r\n\r\n").await?;
            return Ok(total);
        }

        client
            .write_all(format!("{size:X}\r\n").as_bytes())
            .await?;
        let mut remaining = size;
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = timeout(io_timeout, origin.read(&mut buf[..want]))
                .await
                .map_err(|_| anyhow!("timed out reading chunk data"))??;
            ensure!(n > 0, "origin closed connection mid chunk");
            client.write_all(&buf[..n]).await?;
            if let Some(buffer) = buffer {
                buffer.extend_from_slice(&buf[..n]);
            }
            remaining -= n as u64;
        }
        total += size;

        let mut crlf = [0u8; 2];
        timeout(io_timeout, origin.read_exact(&mut crlf))
            .await
            .map_err(|_| anyhow!("timed out reading chunk delimiter"))??;
        ensure!(&crlf == b"\r\n", "malformed chunk delimiter");
        client.write_all(b"\r\n").await?;
    }
}

async fn relay_until_close<C>(
    origin: &mut BufReader<OriginStream>,
    client: &mut C,
    buffer: &mut Option<Vec<u8>>,
    io_timeout: Duration,
) -> Result<u64>
where
    C: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = [0u8; 8192];
    loop {
        let n = timeout(io_timeout, origin.read(&mut buf))
            .await
            .map_err(|_| anyhow!("timed out reading origin body"))??;
        if n == 0 {
            return Ok(total);
        }
        client.write_all(&buf[..n]).await?;
        if let Some(buffer) = buffer {
            buffer.extend_from_slice(&buf[..n]);
        }
        total += n as u64;
    }
}
