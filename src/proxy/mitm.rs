use tokio::io::{AsyncRead, AsyncWrite};

use super::{ProxyCtx, tls};
use crate::error::ProxyError;
use crate::http1::{
    BodyFraming, BodyRead, H1Conn, Header, content_length, content_type_essence, is_chunked,
    is_text_like, remove_header, request_body_framing, response_body_framing, set_header,
    strip_hop_by_hop, wants_close,
};
use crate::plugins::RequestInfo;

/// TLS interception session: terminate the client with a minted leaf, dial
/// the real origin, then run a strictly sequential HTTP/1.1 proxy loop over
/// both TLS streams, feeding text-like responses through the modifier
/// pipeline.
pub async fn run_session<S>(
    ctx: &ProxyCtx,
    client_stream: S,
    domain: &str,
    conn_id: u64,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cache = ctx
        .leaf_cache
        .as_ref()
        .ok_or_else(|| ProxyError::Tls("MITM session without CA material".into()))?;
    let ca = ctx
        .ca
        .as_ref()
        .ok_or_else(|| ProxyError::Tls("MITM session without CA material".into()))?;

    let leaf = match cache.cert_for(domain) {
        Ok(leaf) => leaf,
        Err(e) => {
            tracing::error!(conn_id, domain, error = %e, "leaf mint failed");
            return Ok(());
        }
    };
    let acceptor = tls::acceptor_for_leaf(&leaf, ca.cert_der())?;
    // Usually the CA is simply not installed on the client, so this is not an
    // error-level event.
    let tls_client = match acceptor.accept(client_stream).await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(conn_id, domain, error = %e, "client TLS handshake failed");
            return Ok(());
        }
    };

    let upstream_tcp = match ctx.dial(domain, 443).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(conn_id, domain, error = %e, "upstream dial failed");
            return Ok(());
        }
    };
    let tls_upstream =
        match tls::connect_upstream_tls(&ctx.upstream_tls, domain, upstream_tcp).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(conn_id, domain, error = %e, "upstream TLS handshake failed");
                return Ok(());
            }
        };

    let mut client = H1Conn::new(tls_client);
    let mut upstream = H1Conn::new(tls_upstream);
    let modifier_active = ctx.pipeline.has_plugins_for(domain);
    let cap = ctx.cfg.limits.body_buffer_cap;

    // Request i fully completes before request i+1 is read.
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        let req_head = match client.read_request_head().await {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(conn_id, domain, error = %e, "request read ended");
                break;
            }
        };
        let req_framing = match request_body_framing(&req_head) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(conn_id, domain, error = %e, "bad request framing");
                break;
            }
        };
        let req_body = match client.read_body(&req_framing).await {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(conn_id, domain, error = %e, "request body read ended");
                break;
            }
        };
        let close_after = wants_close(req_head.version_minor, &req_head.headers);
        ctx.stats.record_request(domain);
        tracing::debug!(conn_id, domain, method = %req_head.method, path = %req_head.path(), "intercepted request");

        // Host stays exactly as the client sent it; Accept-Encoding is
        // dropped when a modifier is active so upstream answers in identity
        // encoding.
        let mut up_head = req_head.clone();
        strip_hop_by_hop(&mut up_head.headers);
        remove_header(&mut up_head.headers, "proxy-authorization");
        if modifier_active {
            remove_header(&mut up_head.headers, "accept-encoding");
        }
        if up_head.host_header().is_none() {
            up_head.headers.push(Header::new("Host", domain));
        }
        remove_header(&mut up_head.headers, "content-length");
        if !req_body.is_empty() || !matches!(req_framing, BodyFraming::None) {
            set_header(&mut up_head.headers, "Content-Length", &req_body.len().to_string());
        }

        if let Err(e) = upstream.write_request(&up_head, &req_body).await {
            tracing::error!(conn_id, domain, error = %e, "request write failed");
            break;
        }

        let resp_head = match upstream.read_response_head().await {
            Ok(head) => head,
            Err(e) => {
                tracing::error!(conn_id, domain, error = %e, "response read failed");
                break;
            }
        };
        let resp_framing = match response_body_framing(&req_head.method, &resp_head) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(conn_id, domain, error = %e, "bad response framing");
                break;
            }
        };

        let was_chunked = is_chunked(&resp_head.headers);
        let had_length = content_length(&resp_head.headers).unwrap_or(None).is_some();
        let eof_framed = matches!(resp_framing, BodyFraming::UntilEof);
        let has_body = !matches!(resp_framing, BodyFraming::None);
        let essence = content_type_essence(&resp_head.headers).unwrap_or_default();
        let within_cap = match content_length(&resp_head.headers).unwrap_or(None) {
            Some(n) => n <= cap as u64,
            None => true,
        };
        // The buffer-or-stream predicate, evaluated once at header time.
        let buffer = modifier_active && has_body && is_text_like(&essence) && within_cap;

        let mut out_head = resp_head.clone();
        strip_hop_by_hop(&mut out_head.headers);

        let session_done = eof_framed
            || close_after
            || wants_close(resp_head.version_minor, &resp_head.headers);

        if buffer {
            match upstream.read_body_capped(&resp_framing, cap).await {
                Err(e) => {
                    tracing::error!(conn_id, domain, error = %e, "response body read failed");
                    break;
                }
                Ok((BodyRead::Complete(body), _)) => {
                    let req_info = RequestInfo {
                        method: &req_head.method,
                        host: domain,
                        path: req_head.path(),
                        headers: &req_head.headers,
                    };
                    // A modifier error aborts the session, never the process.
                    let new_body =
                        match ctx.pipeline.modify(domain, &req_info, &resp_head, body) {
                            Ok(b) => b,
                            Err(e) => {
                                tracing::error!(conn_id, domain, error = %e, "modifier failed");
                                break;
                            }
                        };
                    let write = async {
                        if was_chunked {
                            // Chunked stays chunked: the new body goes out as
                            // a single chunk.
                            out_head
                                .headers
                                .push(Header::new("Transfer-Encoding", "chunked"));
                            client.write_response_head(&out_head).await?;
                            client.write_chunk(&new_body).await?;
                            client.write_chunked_end().await?;
                        } else {
                            if had_length {
                                set_header(
                                    &mut out_head.headers,
                                    "Content-Length",
                                    &new_body.len().to_string(),
                                );
                            } else if eof_framed {
                                out_head.headers.push(Header::new("Connection", "close"));
                            }
                            client.write_response_head(&out_head).await?;
                            client.write_raw(&new_body).await?;
                        }
                        client.flush().await
                    };
                    if let Err(e) = write.await {
                        tracing::debug!(conn_id, domain, error = %e, "client disconnected mid-response");
                        break;
                    }
                }
                Ok((BodyRead::Overflow(prefix), progress)) => {
                    // Cap crossed: pass the response through unmodified.
                    let write = async {
                        if was_chunked {
                            out_head
                                .headers
                                .push(Header::new("Transfer-Encoding", "chunked"));
                            client.write_response_head(&out_head).await?;
                            client.write_chunk(&prefix).await?;
                        } else {
                            if eof_framed {
                                out_head.headers.push(Header::new("Connection", "close"));
                            }
                            client.write_response_head(&out_head).await?;
                            client.write_raw(&prefix).await?;
                        }
                        upstream
                            .relay_remainder(progress, was_chunked, &mut client)
                            .await
                    };
                    if let Err(e) = write.await {
                        tracing::debug!(conn_id, domain, error = %e, "client disconnected mid-response");
                        break;
                    }
                }
            }
        } else {
            let write = async {
                if was_chunked {
                    out_head
                        .headers
                        .push(Header::new("Transfer-Encoding", "chunked"));
                } else if eof_framed {
                    out_head.headers.push(Header::new("Connection", "close"));
                }
                client.write_response_head(&out_head).await?;
                upstream
                    .relay_remainder(crate::http1::BodyProgress::start(&resp_framing), was_chunked, &mut client)
                    .await
            };
            if let Err(e) = write.await {
                tracing::debug!(conn_id, domain, error = %e, "client disconnected mid-response");
                break;
            }
        }

        if session_done {
            break;
        }
    }

    tracing::debug!(conn_id, domain, "MITM session ended");
    Ok(())
}
