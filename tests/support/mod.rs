#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use cachegate::cli::LogFormat;
use cachegate::metrics::CacheMetrics;
use cachegate::proxy::http::forward::OriginClient;
use cachegate::proxy::local::LocalCache;
use cachegate::proxy::memory::MemoryCache;
use cachegate::proxy::remote::{FsObjectStore, RemoteCache};
use cachegate::proxy::tasks::{TaskGroup, TimerQueue};
use cachegate::proxy::{ProxyContext, Resolver};
use cachegate::settings::Settings;

/// Stub origin answering every request on every connection with one scripted
/// response.
pub struct TestOrigin {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestOrigin {
    pub async fn with_response(response: impl Into<Vec<u8>>) -> Result<Self> {
        let response = Arc::new(response.into());
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let response = response.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    if read_until_double_crlf(&mut stream).await.is_ok() {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _ = stream.write_all(&response).await;
                    }
                    stream.shutdown().await.ok();
                });
            }
        });
        Ok(Self {
            addr,
            requests,
            handle,
        })
    }

    pub async fn http_ok(body: &str, cache_control: &str) -> Result<Self> {
        Self::with_response(ok_response(body, cache_control)).await
    }

    /// Host (with port) the proxy should treat as the target.
    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for TestOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn ok_response(body: &str, cache_control: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nCache-Control: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        cache_control,
        body
    )
    .into_bytes()
}

async fn read_until_double_crlf(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of request head"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.windows(4).any(|window| window == b"\r\n\r\n") {
            return Ok(data);
        }
    }
}

/// A proxy wired to temp-dir cache tiers, listening on an ephemeral port.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub metrics: Arc<CacheMetrics>,
    pub local_root: PathBuf,
    pub remote_root: PathBuf,
    _local_dir: TempDir,
    _remote_dir: TempDir,
    handle: JoinHandle<()>,
}

impl TestProxy {
    pub async fn start(target: &str) -> Result<Self> {
        let local_dir = TempDir::new()?;
        let remote_dir = TempDir::new()?;
        let local_root = local_dir.path().to_path_buf();
        let remote_root = remote_dir.path().to_path_buf();

        let settings = Arc::new(Settings {
            listen: "127.0.0.1:0".parse()?,
            targets: vec![target.to_string()],
            local: local_root.clone(),
            remote_root: remote_root.clone(),
            key_prefix: String::new(),
            log_requests: true,
            memory_budget: 10 * 1024 * 1024,
            log: LogFormat::Text,
            metrics_listen: None,
            client_timeout: 5,
            upstream_connect_timeout: 2,
            upstream_timeout: 5,
            max_header_size: 32 * 1024,
        });

        let metrics = Arc::new(CacheMetrics::new());
        let timers = TimerQueue::new();
        let resolver = Arc::new(Resolver::new(
            settings.targets.clone(),
            MemoryCache::new(settings.memory_budget, timers),
            LocalCache::new(local_root.clone())?,
            RemoteCache::new(
                Arc::new(FsObjectStore::new(remote_root.clone())?),
                settings.key_prefix.clone(),
            ),
            TaskGroup::new(2),
            metrics.clone(),
            settings.log_requests,
        ));
        let origin = Arc::new(OriginClient::new(
            None,
            settings.upstream_connect_timeout(),
            settings.upstream_timeout(),
        ));
        let ctx = ProxyContext {
            settings,
            resolver,
            origin,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = cachegate::proxy::http::serve_listener(listener, ctx).await;
        });

        Ok(Self {
            addr,
            metrics,
            local_root,
            remote_root,
            _local_dir: local_dir,
            _remote_dir: remote_dir,
            handle,
        })
    }

    pub fn local_entry_path(&self, hash: &str) -> PathBuf {
        self.local_root.join(&hash[..2]).join(hash)
    }

    pub fn remote_object_path(&self, hash: &str) -> PathBuf {
        self.remote_root.join(&hash[..2]).join(hash)
    }

    /// Polls until the write-behind push lands or the deadline passes.
    pub async fn wait_for_push(&self, count: u64) -> Result<()> {
        for _ in 0..200 {
            if self.metrics.rsp_push.get() + self.metrics.rsp_push_error.get() >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(anyhow!("remote push did not complete in time"))
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case(name))
            .count()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one absolute-form GET through the proxy and reads the complete
/// response. `Connection: close` keeps the read side simple.
pub async fn get(proxy: SocketAddr, url: &str, host: &str) -> Result<Response> {
    get_with_headers(proxy, url, host, &[]).await
}

pub async fn get_with_headers(
    proxy: SocketAddr,
    url: &str,
    host: &str,
    extra: &[(&str, &str)],
) -> Result<Response> {
    let mut stream = TcpStream::connect(proxy).await?;
    let mut request = format!("GET {url} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n");
    for (name, value) in extra {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

fn parse_response(raw: &[u8]) -> Result<Response> {
    let head_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .context("response missing head terminator")?;
    let head = std::str::from_utf8(&raw[..head_end]).context("response head is not UTF-8")?;
    let body = raw[head_end + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().context("response missing status line")?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .context("status line missing code")?
        .parse()
        .context("invalid status code")?;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .with_context(|| format!("malformed response header {line:?}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Response {
        status,
        headers,
        body,
    })
}
