use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::transparent::ReplayStream;
use super::{CONN_SEQ, ProxyCtx, mitm, tunnel};
use crate::error::ProxyError;
use crate::http1::{
    BodyFraming, BodyProgress, H1Conn, Header, RequestHead, content_length,
    encode_response_head, is_chunked, remove_header, request_body_framing,
    response_body_framing, set_header, split_host_port, strip_hop_by_hop, wants_close,
    write_simple_response,
};
use crate::stats::ProtocolTag;

const KNOWN_METHODS: &[&str] = &[
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH", "CONNECT",
];

pub(crate) enum LoopAction {
    Continue,
    Close,
}

/// One accepted socket on the explicit proxy port: absolute-URI forwarding,
/// management routing, and CONNECT dispatch.
pub async fn handle_client(
    ctx: &ProxyCtx,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let mut conn = H1Conn::new(stream);
    let mut tagged = false;
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let head = match read_head_with_timeout(ctx, &mut conn, peer).await? {
            Some(head) => head,
            None => return Ok(()),
        };

        if !KNOWN_METHODS
            .iter()
            .any(|m| head.method.eq_ignore_ascii_case(m))
        {
            let _ = write_simple_response(conn.stream_mut(), 405, "method not allowed\n").await;
            return Ok(());
        }

        if head.method.eq_ignore_ascii_case("CONNECT") {
            return handle_connect(ctx, conn, head, peer).await;
        }

        if !tagged {
            ctx.stats.record_connection(ProtocolTag::Http);
            tagged = true;
        }

        let action = if head.path().starts_with(&ctx.cfg.management.path_prefix) {
            respond_management(ctx, &mut conn, &head).await?
        } else if head.target.starts_with("http://") {
            let rest = head.target.strip_prefix("http://").unwrap_or(&head.target);
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let (host, port) = split_host_port(authority, 80);
            if host.is_empty() {
                let _ = write_simple_response(conn.stream_mut(), 400, "missing host\n").await;
                return Ok(());
            }
            forward_request(ctx, &mut conn, &head, &host, port, path).await?
        } else {
            tracing::debug!(%peer, target = %head.target, "request target not proxyable");
            let _ = write_simple_response(conn.stream_mut(), 400, "absolute URI required\n").await;
            return Ok(());
        };
        match action {
            LoopAction::Continue => continue,
            LoopAction::Close => return Ok(()),
        }
    }
}

/// Reads the next request head under the read-header timeout. `None` means
/// the connection is done (clean EOF, timeout, or a 400 already sent).
pub(crate) async fn read_head_with_timeout<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &ProxyCtx,
    conn: &mut H1Conn<S>,
    peer: SocketAddr,
) -> Result<Option<RequestHead>, ProxyError> {
    match tokio::time::timeout(ctx.cfg.timeouts.read_header(), conn.read_request_head()).await {
        Err(_) => {
            tracing::debug!(%peer, "read-header timeout");
            Ok(None)
        }
        Ok(Err(ProxyError::Http(msg))) => {
            tracing::debug!(%peer, error = %msg, "malformed request");
            let _ = write_simple_response(conn.stream_mut(), 400, "malformed request\n").await;
            Ok(None)
        }
        Ok(Err(e)) => Err(e),
        Ok(Ok(head)) => Ok(head),
    }
}

/// Management requests never go upstream.
async fn respond_management(
    ctx: &ProxyCtx,
    conn: &mut H1Conn<TcpStream>,
    head: &RequestHead,
) -> Result<LoopAction, ProxyError> {
    let framing = request_body_framing(head)?;
    let body = conn.read_body(&framing).await?;
    let reply = ctx.mgmt.handle(head, &body);
    let mut resp = crate::http1::ResponseHead {
        status: reply.status,
        reason: String::new(),
        version_minor: 1,
        headers: vec![
            Header::new("Content-Type", reply.content_type),
            Header::new("Content-Length", reply.body.len().to_string()),
        ],
    };
    let close = wants_close(head.version_minor, &head.headers);
    if close {
        resp.headers.push(Header::new("Connection", "close"));
    }
    conn.write_raw(&encode_response_head(&resp)).await?;
    conn.write_raw(&reply.body).await?;
    conn.flush().await?;
    Ok(if close {
        LoopAction::Close
    } else {
        LoopAction::Continue
    })
}

/// CONNECT: block check first, then MITM for policy domains, opaque tunnel
/// for everything else.
async fn handle_connect(
    ctx: &ProxyCtx,
    mut conn: H1Conn<TcpStream>,
    head: RequestHead,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    let (host, port) = split_host_port(&head.target, 443);
    let conn_id = CONN_SEQ.fetch_add(1, Ordering::SeqCst);
    tracing::debug!(conn_id, %peer, host, port, "CONNECT");

    if host.is_empty() {
        let _ = write_simple_response(conn.stream_mut(), 400, "malformed CONNECT target\n").await;
        return Ok(());
    }
    // Block wins over MITM policy.
    if ctx.blocker.is_blocked(&host) {
        ctx.stats.record_blocked();
        tracing::info!(conn_id, host, "blocked CONNECT");
        let _ = write_simple_response(conn.stream_mut(), 403, "domain is blocked\n").await;
        return Ok(());
    }

    if ctx.is_mitm_domain(&host) {
        ctx.stats.record_connection(ProtocolTag::HttpsMitm);
        ctx.stats.record_intercept(&host);
        conn.write_raw(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        conn.flush().await?;
        let (stream, leftover) = conn.into_parts();
        return mitm::run_session(ctx, ReplayStream::new(leftover, stream), &host, conn_id).await;
    }

    ctx.stats.record_connection(ProtocolTag::HttpsTunnel);
    let upstream = match ctx.dial(&host, port).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(conn_id, host, error = %e, "CONNECT upstream dial failed");
            let _ = write_simple_response(conn.stream_mut(), 502, "upstream unreachable\n").await;
            return Ok(());
        }
    };
    conn.write_raw(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    conn.flush().await?;
    let (stream, leftover) = conn.into_parts();
    let client = ReplayStream::new(leftover, stream);
    let outcome = tunnel::relay(
        client,
        upstream,
        ctx.cfg.timeouts.idle(),
        ctx.cfg.timeouts.shutdown(),
        &ctx.cancel,
    )
    .await;
    ctx.stats
        .record_tunnel_close(&host, outcome.client_to_upstream, outcome.upstream_to_client);
    Ok(())
}

/// HTTP forwarding shared by the explicit handler and the transparent HTTP
/// listener: block check, upstream dial, origin-form rewrite, hop-by-hop
/// stripping both ways. Plugins are not applied here; plugin integration is
/// defined only for the MITM session.
pub(crate) async fn forward_request<S: AsyncRead + AsyncWrite + Unpin>(
    ctx: &ProxyCtx,
    conn: &mut H1Conn<S>,
    head: &RequestHead,
    host: &str,
    port: u16,
    origin_path: &str,
) -> Result<LoopAction, ProxyError> {
    let framing = request_body_framing(head)?;
    let body = conn.read_body(&framing).await?;
    let client_close = wants_close(head.version_minor, &head.headers);

    if ctx.blocker.is_blocked(host) {
        ctx.stats.record_blocked();
        tracing::info!(host, "blocked HTTP request");
        let _ = write_simple_response(conn.stream_mut(), 403, "domain is blocked\n").await;
        return Ok(LoopAction::Close);
    }
    ctx.stats.record_request(host);

    let upstream = match ctx.dial(host, port).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(host, error = %e, "upstream dial failed");
            let _ = write_simple_response(conn.stream_mut(), 502, "upstream unreachable\n").await;
            return Ok(LoopAction::Close);
        }
    };

    let mut up_head = RequestHead {
        method: head.method.clone(),
        target: origin_path.to_string(),
        version_minor: 1,
        headers: head.headers.clone(),
    };
    strip_hop_by_hop(&mut up_head.headers);
    remove_header(&mut up_head.headers, "proxy-authorization");
    if up_head.host_header().is_none() {
        let authority = if port == 80 {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        up_head.headers.push(Header::new("Host", authority));
    }
    remove_header(&mut up_head.headers, "content-length");
    if !body.is_empty() || !matches!(framing, BodyFraming::None) {
        set_header(&mut up_head.headers, "Content-Length", &body.len().to_string());
    }
    up_head.headers.push(Header::new("Connection", "close"));

    let mut upstream_conn = H1Conn::new(upstream);
    upstream_conn.write_request(&up_head, &body).await?;

    let resp_head = upstream_conn.read_response_head().await?;
    let resp_framing = response_body_framing(&head.method, &resp_head)?;
    let was_chunked = is_chunked(&resp_head.headers);
    let had_length = content_length(&resp_head.headers)?.is_some();
    let eof_framed = matches!(resp_framing, BodyFraming::UntilEof);

    let mut out_head = resp_head.clone();
    strip_hop_by_hop(&mut out_head.headers);
    if was_chunked {
        out_head
            .headers
            .push(Header::new("Transfer-Encoding", "chunked"));
    } else if eof_framed || client_close {
        out_head.headers.push(Header::new("Connection", "close"));
    }
    conn.write_raw(&encode_response_head(&out_head)).await?;
    upstream_conn
        .relay_remainder(BodyProgress::start(&resp_framing), was_chunked, conn)
        .await?;

    let close = client_close
        || eof_framed
        || (!was_chunked && !had_length && !matches!(resp_framing, BodyFraming::None))
        || wants_close(resp_head.version_minor, &resp_head.headers);
    Ok(if close {
        LoopAction::Close
    } else {
        LoopAction::Continue
    })
}
