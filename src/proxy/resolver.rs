use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, header::HeaderName};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::metrics::CacheMetrics;

use super::cache_control::{request_cacheable, response_durably_cacheable, response_memory_cacheable};
use super::entry;
use super::local::{LoadOutcome, LocalCache};
use super::memory::MemoryCache;
use super::remote::RemoteCache;
use super::tasks::TaskGroup;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_CACHE_ID: HeaderName = HeaderName::from_static("x-cache-id");

/// Computes the request fingerprint: lowercase hex SHA-256 over the full
/// request URL. The same value keys all three tiers.
pub fn fingerprint(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        write!(out, "{byte:02x}").expect("write to string");
    }
    out
}

/// A fully materialized cached response ready to serve.
pub struct CachedResponse {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Carried from lookup to classification and storage for a request that goes
/// to the origin.
pub struct ForwardContext {
    pub hash: String,
    pub can_cache: bool,
    start: Instant,
}

pub enum Lookup {
    /// Request host is not in the target list; answer 502 and stop.
    RejectedTarget,
    Hit(CachedResponse),
    Forward(ForwardContext),
}

/// What to do with the origin response body once the client copy completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePlan {
    None,
    Memory(Duration),
    Durable,
}

/// Per-request cache orchestration across the three tiers. Stateless per
/// request apart from the shared cache handles and counters; any tier error
/// is logged and treated as a miss, never surfaced to the client.
pub struct Resolver {
    targets: Vec<String>,
    memory: MemoryCache,
    local: LocalCache,
    remote: RemoteCache,
    tasks: TaskGroup,
    metrics: Arc<CacheMetrics>,
    log_requests: bool,
}

impl Resolver {
    pub fn new(
        targets: Vec<String>,
        memory: MemoryCache,
        local: LocalCache,
        remote: RemoteCache,
        tasks: TaskGroup,
        metrics: Arc<CacheMetrics>,
        log_requests: bool,
    ) -> Self {
        Self {
            targets,
            memory,
            local,
            remote,
            tasks,
            metrics,
            log_requests,
        }
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Steps the request through the tiers: target check, fingerprint,
    /// memory, local, then remote with synchronous local fault-in.
    pub async fn lookup(
        &self,
        method: &Method,
        url: &str,
        host: &str,
        req_headers: &HeaderMap,
    ) -> Lookup {
        self.metrics.req_received.inc();

        if !self.targets.iter().any(|target| target == host) {
            warn!(host, "rejecting proxy request for non-target host");
            return Lookup::RejectedTarget;
        }

        let hash = fingerprint(url);
        let can_cache = request_cacheable(method, req_headers);
        let start = Instant::now();
        self.vlog(format_args!("rp B U:{url:?} H:{hash} C:{can_cache}"));

        if can_cache {
            if let Some((mut headers, body)) = self.memory.load(&hash) {
                self.metrics.req_memory_hit.inc();
                set_cache_info(&mut headers, "hit, memory", Some(&hash));
                self.vlog(format_args!(
                    "rp E H:{hash} hit mem B:{} ({:?})",
                    body.len(),
                    start.elapsed()
                ));
                return Lookup::Hit(CachedResponse { headers, body });
            }

            match self.local.load(&hash).await {
                Ok(LoadOutcome::Hit(mut headers, body)) => {
                    self.metrics.req_local_hit.inc();
                    set_cache_info(&mut headers, "hit, local", Some(&hash));
                    self.vlog(format_args!(
                        "rp E H:{hash} hit disk B:{} ({:?})",
                        body.len(),
                        start.elapsed()
                    ));
                    return Lookup::Hit(CachedResponse { headers, body });
                }
                Ok(LoadOutcome::Missing) => {}
                Ok(LoadOutcome::Corrupt(err)) => {
                    warn!(hash, error = %err, "corrupt local cache entry; treating as miss");
                }
                Err(err) => {
                    warn!(hash, error = %err, "local cache read failed; treating as miss");
                }
            }
            self.metrics.req_local_miss.inc();

            match self.remote.load(&hash).await {
                Ok(LoadOutcome::Hit(mut headers, body)) => {
                    self.metrics.req_fault_hit.inc();
                    // Fault the entry back onto disk before serving; a write
                    // failure costs only the fault-in, not the response.
                    if let Err(err) = self.local.store(&hash, &headers, &body).await {
                        warn!(hash, error = %err, "failed to fault remote entry into local cache");
                    }
                    set_cache_info(&mut headers, "hit, remote", Some(&hash));
                    self.vlog(format_args!(
                        "rp E H:{hash} hit S3 B:{} ({:?})",
                        body.len(),
                        start.elapsed()
                    ));
                    return Lookup::Hit(CachedResponse { headers, body });
                }
                Ok(LoadOutcome::Missing) => {}
                Ok(LoadOutcome::Corrupt(err)) => {
                    warn!(hash, error = %err, "corrupt remote cache entry; treating as miss");
                }
                Err(err) => {
                    warn!(hash, error = %err, "remote cache read failed; treating as miss");
                }
            }
            self.metrics.req_fault_miss.inc();
            self.vlog(format_args!("rp - H:{hash} miss"));
        }

        self.metrics.req_forward.inc();
        Lookup::Forward(ForwardContext {
            hash,
            can_cache,
            start,
        })
    }

    /// Classifies the origin response before its body streams, stamping the
    /// disposition headers the client will see.
    pub fn classify(
        &self,
        ctx: &ForwardContext,
        status: StatusCode,
        headers: &mut HeaderMap,
    ) -> CachePlan {
        let durable = response_durably_cacheable(status, headers);
        let volatile = response_memory_cacheable(status, headers);

        if !ctx.can_cache || (!durable && volatile.is_none()) {
            set_cache_info(headers, "fetch, uncached", None);
            self.metrics.rsp_not_cached.inc();
            self.vlog(format_args!(
                "rp E H:{} fetch RC:no ({:?})",
                ctx.hash,
                ctx.start.elapsed()
            ));
            return CachePlan::None;
        }

        if durable {
            set_cache_info(headers, "fetch, cached", Some(&ctx.hash));
            CachePlan::Durable
        } else {
            set_cache_info(headers, "fetch, cached, volatile", Some(&ctx.hash));
            CachePlan::Memory(volatile.expect("volatile max-age checked above"))
        }
    }

    /// Populates the cache after the client copy completed. `body` must be
    /// the complete captured body; partial captures are the caller's cue to
    /// skip this entirely.
    pub async fn store(&self, ctx: &ForwardContext, plan: CachePlan, headers: &HeaderMap, body: Bytes) {
        let saved = entry::saved_headers(headers);
        match plan {
            CachePlan::None => {}
            CachePlan::Memory(max_age) => {
                let len = body.len();
                self.memory.store(&ctx.hash, max_age, saved, body);
                self.metrics.rsp_save_memory.inc();
                // Volatile entries are never persisted to disk or remote.
                self.vlog(format_args!(
                    "rp E H:{} fetch RC:mem B:{len} ({:?})",
                    ctx.hash,
                    ctx.start.elapsed()
                ));
            }
            CachePlan::Durable => {
                let len = body.len();
                match self.local.store(&ctx.hash, &saved, &body).await {
                    Err(err) => {
                        self.metrics.rsp_save_error.inc();
                        // Without a durable local copy there is nothing worth
                        // pushing to the remote either.
                        warn!(hash = %ctx.hash, error = %err, "failed to save response to local cache");
                    }
                    Ok(()) => {
                        self.metrics.rsp_save.inc();
                        self.metrics.rsp_save_bytes.inc_by(len as u64);
                        self.push_remote(ctx.hash.clone(), saved, body).await;
                    }
                }
                self.vlog(format_args!(
                    "rp E H:{} fetch RC:yes B:{len} ({:?})",
                    ctx.hash,
                    ctx.start.elapsed()
                ));
            }
        }
    }

    /// Write-behind: pushes the entry to the remote store on the bounded
    /// background pool. The task owns its data and outlives the request.
    async fn push_remote(&self, hash: String, headers: HeaderMap, body: Bytes) {
        let remote = self.remote.clone();
        let metrics = self.metrics.clone();
        self.tasks
            .submit(async move {
                let len = body.len() as u64;
                match remote.store(&hash, &headers, &body).await {
                    Ok(()) => {
                        metrics.rsp_push.inc();
                        metrics.rsp_push_bytes.inc_by(len);
                    }
                    Err(err) => {
                        metrics.rsp_push_error.inc();
                        warn!(hash, error = %err, "failed to push entry to remote cache");
                    }
                }
            })
            .await;
    }

    fn vlog(&self, line: std::fmt::Arguments<'_>) {
        if self.log_requests {
            info!(target: "request_log", "{line}");
        }
    }
}

fn set_cache_info(headers: &mut HeaderMap, disposition: &str, id: Option<&str>) {
    headers.insert(
        X_CACHE,
        HeaderValue::from_str(disposition).expect("valid disposition"),
    );
    if let Some(id) = id {
        headers.insert(X_CACHE_ID, HeaderValue::from_str(id).expect("valid hash"));
    }
}
