use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;

const METRICS_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache-server counters. Each server instance owns its registry so counter
/// values are per-instance and directly readable in tests.
pub struct CacheMetrics {
    registry: Registry,
    pub req_received: IntCounter,
    pub req_memory_hit: IntCounter,
    pub req_local_hit: IntCounter,
    pub req_local_miss: IntCounter,
    pub req_fault_hit: IntCounter,
    pub req_fault_miss: IntCounter,
    pub req_forward: IntCounter,
    pub rsp_save: IntCounter,
    pub rsp_save_memory: IntCounter,
    pub rsp_save_error: IntCounter,
    pub rsp_save_bytes: IntCounter,
    pub rsp_push: IntCounter,
    pub rsp_push_error: IntCounter,
    pub rsp_push_bytes: IntCounter,
    pub rsp_not_cached: IntCounter,
}

impl CacheMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> IntCounter {
            let counter = IntCounter::new(name, help).expect("create counter");
            registry
                .register(Box::new(counter.clone()))
                .expect("register counter");
            counter
        };
        Self {
            req_received: counter("req_received", "Total requests received"),
            req_memory_hit: counter("req_memory_hit", "Hits in the memory cache"),
            req_local_hit: counter("req_local_hit", "Hits in the local cache"),
            req_local_miss: counter("req_local_miss", "Misses in the local cache"),
            req_fault_hit: counter("req_fault_hit", "Hits faulted in from the remote cache"),
            req_fault_miss: counter("req_fault_miss", "Misses in the remote cache"),
            req_forward: counter("req_forward", "Requests forwarded to the origin"),
            rsp_save: counter("rsp_save", "Responses saved in the local cache"),
            rsp_save_memory: counter("rsp_save_memory", "Responses saved in the memory cache"),
            rsp_save_error: counter("rsp_save_error", "Errors saving to the local cache"),
            rsp_save_bytes: counter("rsp_save_bytes", "Bytes written to the local cache"),
            rsp_push: counter("rsp_push", "Responses pushed to the remote cache"),
            rsp_push_error: counter("rsp_push_error", "Errors pushing to the remote cache"),
            rsp_push_bytes: counter("rsp_push_bytes", "Bytes pushed to the remote cache"),
            rsp_not_cached: counter("rsp_not_cached", "Responses not cached anywhere"),
            registry,
        }
    }

    pub fn gather(&self) -> Vec<u8> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .expect("encode metrics");
        buffer
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves the text exposition on a dedicated listener. One short-lived
/// connection per scrape; anything but `GET <path>` gets a 404.
pub async fn serve(addr: SocketAddr, path: String, metrics: Arc<CacheMetrics>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
    serve_on(listener, path, metrics).await
}

pub async fn serve_on(
    listener: TcpListener,
    path: String,
    metrics: Arc<CacheMetrics>,
) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let path = path.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_scrape(stream, &path, &metrics).await {
                tracing::debug!(error = %err, "metrics handler error");
            }
        });
    }
}

async fn handle_scrape(
    stream: tokio::net::TcpStream,
    path: &str,
    metrics: &CacheMetrics,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    timeout(METRICS_READ_TIMEOUT, reader.read_line(&mut request_line))
        .await
        .map_err(|_| anyhow!("timed out reading metrics request"))??;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let uri = parts.next().unwrap_or_default();

    // Drain request headers; scrapes carry nothing we need.
    loop {
        let mut line = String::new();
        let n = timeout(METRICS_READ_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| anyhow!("timed out reading metrics request headers"))??;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = if method == "GET" && uri == path {
        build_response(200, TextEncoder::new().format_type(), metrics.gather())
    } else {
        build_response(404, "text/plain", b"not found".to_vec())
    };

    reader.get_mut().write_all(&response).await?;
    reader.get_mut().shutdown().await?;
    Ok(())
}

fn build_response(status: u16, content_type: &str, body: Vec<u8>) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(&body);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.req_received.get(), 0);
        metrics.req_received.inc();
        metrics.rsp_save_bytes.inc_by(42);
        assert_eq!(metrics.req_received.get(), 1);
        assert_eq!(metrics.rsp_save_bytes.get(), 42);
    }

    #[test]
    fn gather_exposes_all_counter_names() {
        let metrics = CacheMetrics::new();
        let text = String::from_utf8(metrics.gather()).expect("utf8");
        for name in [
            "req_received",
            "req_memory_hit",
            "req_local_hit",
            "req_local_miss",
            "req_fault_hit",
            "req_fault_miss",
            "req_forward",
            "rsp_save",
            "rsp_save_memory",
            "rsp_save_error",
            "rsp_save_bytes",
            "rsp_push",
            "rsp_push_error",
            "rsp_push_bytes",
            "rsp_not_cached",
        ] {
            assert!(text.contains(name), "missing {name} in exposition");
        }
    }

    #[test]
    fn instances_do_not_share_counters() {
        let a = CacheMetrics::new();
        let b = CacheMetrics::new();
        a.req_received.inc();
        assert_eq!(b.req_received.get(), 0);
    }

    #[tokio::test]
    async fn scrape_endpoint_serves_exposition() -> Result<()> {
        let metrics = Arc::new(CacheMetrics::new());
        metrics.req_received.inc();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = {
            let metrics = metrics.clone();
            tokio::spawn(
                async move { serve_on(listener, "/metrics".to_string(), metrics).await },
            )
        };

        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n")
            .await?;
        let mut body = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut body).await?;
        server.abort();

        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("200"), "unexpected response: {text}");
        assert!(text.contains("req_received"), "unexpected body: {text}");
        Ok(())
    }
}
