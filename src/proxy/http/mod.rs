pub mod codec;
pub mod forward;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::ProxyContext;
use super::resolver::{CachePlan, Lookup};
use codec::RequestHead;
use forward::BodyPlan;

pub async fn run(ctx: ProxyContext) -> Result<()> {
    let listener = TcpListener::bind(ctx.settings.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", ctx.settings.listen))?;
    info!(address = %listener.local_addr()?, "proxy listening");
    serve_listener(listener, ctx).await
}

/// Accept loop over an already bound listener; split out so tests can bind an
/// ephemeral port first.
pub async fn serve_listener(listener: TcpListener, ctx: ProxyContext) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, ctx).await {
                debug!(peer = %peer, error = %err, "connection closed with error");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: ProxyContext) -> Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let head = match codec::read_request_head(
            &mut reader,
            ctx.settings.client_timeout(),
            ctx.settings.max_header_size,
        )
        .await?
        {
            Some(head) => head,
            None => return Ok(()),
        };
        let close_requested = head.close;
        let keep_alive = serve_request(&mut reader, peer, head, &ctx).await?;
        if close_requested || !keep_alive {
            return Ok(());
        }
    }
}

async fn serve_request(
    client: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    head: RequestHead,
    ctx: &ProxyContext,
) -> Result<bool> {
    let url = head.url();
    match ctx
        .resolver
        .lookup(&head.method, &url, &head.host, &head.headers)
        .await
    {
        Lookup::RejectedTarget => {
            codec::write_simple_response(
                client.get_mut(),
                StatusCode::BAD_GATEWAY,
                &HeaderMap::new(),
                b"Bad Gateway\n",
            )
            .await?;
            // The request body, if any, was never consumed.
            Ok(false)
        }
        Lookup::Hit(cached) => {
            // Every cached entry is a 200 by construction.
            codec::write_response_head(
                client.get_mut(),
                StatusCode::OK,
                &cached.headers,
                Some(cached.body.len() as u64),
                false,
            )
            .await?;
            client.get_mut().write_all(&cached.body).await?;
            client.get_mut().flush().await?;
            // An unread request body would bleed into the next head.
            Ok(head.content_length == 0)
        }
        Lookup::Forward(fwd) => forward_request(client, peer, head, fwd, ctx).await,
    }
}

async fn forward_request(
    client: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    head: RequestHead,
    fwd: super::resolver::ForwardContext,
    ctx: &ProxyContext,
) -> Result<bool> {
    let mut origin = match ctx.origin.connect(&head.scheme, &head.host).await {
        Ok(origin) => origin,
        Err(err) => {
            warn!(peer = %peer, host = %head.host, error = %err, "origin connect failed");
            return respond_bad_gateway(client).await;
        }
    };

    if let Err(err) = ctx.origin.send_request(&mut origin, &head).await {
        warn!(peer = %peer, host = %head.host, error = %err, "failed to send request to origin");
        return respond_bad_gateway(client).await;
    }
    if head.content_length > 0
        && let Err(err) = ctx
            .origin
            .copy_request_body(client, &mut origin, head.content_length)
            .await
    {
        warn!(peer = %peer, host = %head.host, error = %err, "failed to forward request body");
        return respond_bad_gateway(client).await;
    }

    let mut origin_reader = BufReader::new(origin);
    let mut rsp = match forward::read_response_head(
        &mut origin_reader,
        ctx.origin.io_timeout(),
        ctx.settings.max_header_size,
    )
    .await
    {
        Ok(rsp) => rsp,
        Err(err) => {
            warn!(peer = %peer, host = %head.host, error = %err, "failed to read origin response");
            return respond_bad_gateway(client).await;
        }
    };

    // Classification happens on the response head, before the body streams;
    // the disposition headers ride along to the client.
    let plan = ctx.resolver.classify(&fwd, rsp.status, &mut rsp.headers);
    let body_plan = forward::response_body_plan(&head.method, &rsp);

    let (content_length, chunked) = match body_plan {
        BodyPlan::Empty => (rsp.content_length, false),
        BodyPlan::Fixed(length) => (Some(length), false),
        BodyPlan::Chunked => (None, true),
        BodyPlan::UntilClose => (None, false),
    };
    codec::write_response_head(client.get_mut(), rsp.status, &rsp.headers, content_length, chunked)
        .await?;

    // Tee: the client copy drives the capture; the buffer is only read after
    // the relay finished, so cached bytes always match the served bytes.
    let capture = plan != CachePlan::None;
    let outcome = forward::relay_body(
        &mut origin_reader,
        client.get_mut(),
        body_plan,
        capture,
        ctx.origin.io_timeout(),
    )
    .await?;

    if let Some(body) = outcome.captured {
        ctx.resolver.store(&fwd, plan, &rsp.headers, body).await;
    }

    Ok(!matches!(body_plan, BodyPlan::UntilClose))
}

async fn respond_bad_gateway(client: &mut BufReader<TcpStream>) -> Result<bool> {
    codec::write_simple_response(
        client.get_mut(),
        StatusCode::BAD_GATEWAY,
        &HeaderMap::new(),
        b"Bad Gateway\n",
    )
    .await?;
    Ok(false)
}
