pub mod cache_control;
pub mod entry;
pub mod http;
pub mod local;
pub mod memory;
pub mod remote;
mod resolver;
pub mod tasks;

use std::sync::Arc;

use anyhow::Result;

use crate::settings::Settings;

pub use resolver::{CachePlan, CachedResponse, ForwardContext, Lookup, Resolver, fingerprint};

/// Shared per-process state handed to every connection.
#[derive(Clone)]
pub struct ProxyContext {
    pub settings: Arc<Settings>,
    pub resolver: Arc<Resolver>,
    pub origin: Arc<http::forward::OriginClient>,
}

pub async fn run(ctx: ProxyContext) -> Result<()> {
    http::run(ctx).await
}
