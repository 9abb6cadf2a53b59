pub mod cli;
pub mod logging;
pub mod metrics;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::metrics::CacheMetrics;
use crate::proxy::http::forward::OriginClient;
use crate::proxy::local::LocalCache;
use crate::proxy::memory::MemoryCache;
use crate::proxy::remote::{FsObjectStore, ObjectStore, RemoteCache};
use crate::proxy::tasks::{TaskGroup, TimerQueue};
use crate::proxy::{ProxyContext, Resolver};
use crate::settings::Settings;

/// Runs the proxy with the directory-backed object store from the settings.
pub async fn run(settings: Settings) -> Result<()> {
    let store = Arc::new(FsObjectStore::new(settings.remote_root.clone())?);
    run_with_store(settings, store).await
}

/// Runs the proxy against an arbitrary object store implementation. All
/// caches, the write-behind pool, and the expiration timer are built here,
/// before the listener accepts its first connection.
pub async fn run_with_store(settings: Settings, store: Arc<dyn ObjectStore>) -> Result<()> {
    let settings = Arc::new(settings);
    let metrics = Arc::new(CacheMetrics::new());

    if let Some(addr) = settings.metrics_listen {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = crate::metrics::serve(addr, "/metrics".to_string(), metrics).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let timers = TimerQueue::new();
    let memory = MemoryCache::new(settings.memory_budget, timers);
    let local = LocalCache::new(settings.local.clone())?;
    let remote = RemoteCache::new(store, settings.key_prefix.clone());
    let tasks = TaskGroup::new(num_cpus::get());
    let resolver = Arc::new(Resolver::new(
        settings.targets.clone(),
        memory,
        local,
        remote,
        tasks,
        metrics,
        settings.log_requests,
    ));

    let tls = build_tls_client_config();
    let origin = Arc::new(OriginClient::new(
        tls,
        settings.upstream_connect_timeout(),
        settings.upstream_timeout(),
    ));

    proxy::run(ProxyContext {
        settings,
        resolver,
        origin,
    })
    .await
}

/// Builds the outbound TLS client config from the system trust store. An
/// empty store degrades to plain-http-only operation rather than refusing to
/// start; https forwards then fail per request with a clear error.
fn build_tls_client_config() -> Option<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            if added == 0 {
                warn!("no system trust anchors found; https origins will fail");
                return None;
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors; https origins will fail");
            return None;
        }
    }

    let provider = ring::default_provider();
    let builder = match ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
    {
        Ok(builder) => builder,
        Err(err) => {
            warn!(error = %err, "failed to build TLS client config; https origins will fail");
            return None;
        }
    };
    let mut config = builder
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Some(Arc::new(config))
}
