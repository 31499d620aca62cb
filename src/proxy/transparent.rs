use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::sni::{ClientHelloParse, parse_client_hello};
use super::{CONN_SEQ, ProxyCtx, explicit, mitm, tunnel};
use crate::error::ProxyError;
use crate::http1::{H1Conn, split_host_port, write_simple_response};
use crate::stats::ProtocolTag;

/// Cap on bytes inspected while looking for a complete ClientHello.
const PEEK_CAP: usize = 16 * 1024;

/// Stream wrapper that replays already-consumed bytes before reading from the
/// socket again. Used to hand a peeked ClientHello (or pipelined CONNECT
/// payload) to the TLS acceptor or the relay.
pub struct ReplayStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Original destination recorded by the kernel before redirection.
#[cfg(target_os = "linux")]
pub fn original_dst(stream: &TcpStream) -> std::io::Result<SocketAddr> {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::os::fd::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;
    let fd = stream.as_raw_fd();
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
            u16::from_be(addr.sin_port),
        )))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn original_dst(_stream: &TcpStream) -> std::io::Result<SocketAddr> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "original-destination recovery requires Linux",
    ))
}

/// Transparent HTTP: destination from the Host header, falling back to the
/// original destination, then plain forwarding.
pub async fn handle_http(
    ctx: &ProxyCtx,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    ctx.stats.record_connection(ProtocolTag::TransparentHttp);
    let orig = original_dst(&stream).ok();
    let mut conn = H1Conn::new(stream);
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let head = match explicit::read_head_with_timeout(ctx, &mut conn, peer).await? {
            Some(head) => head,
            None => return Ok(()),
        };
        let (host, port) = match head.host_header() {
            Some(hh) => split_host_port(hh, orig.map(|a| a.port()).unwrap_or(80)),
            None => match orig {
                Some(addr) => (addr.ip().to_string(), addr.port()),
                None => {
                    tracing::debug!(%peer, "transparent request without Host or original destination");
                    let _ =
                        write_simple_response(conn.stream_mut(), 400, "cannot resolve destination\n")
                            .await;
                    return Ok(());
                }
            },
        };
        let path = head.path().to_string();
        match explicit::forward_request(ctx, &mut conn, &head, &host, port, &path).await? {
            explicit::LoopAction::Continue => continue,
            explicit::LoopAction::Close => return Ok(()),
        }
    }
}

/// Transparent HTTPS: recover the domain from the ClientHello SNI, then MITM
/// or tunnel; fall back to the original destination when no SNI is usable.
pub async fn handle_https(
    ctx: &ProxyCtx,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), ProxyError> {
    ctx.stats.record_connection(ProtocolTag::TransparentHttps);
    let conn_id = CONN_SEQ.fetch_add(1, Ordering::SeqCst);

    let mut peeked = Vec::new();
    let mut tmp = [0u8; 4096];
    let parse = loop {
        let read = tokio::time::timeout(ctx.cfg.timeouts.read_header(), stream.read(&mut tmp));
        let n = match read.await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::debug!(conn_id, %peer, error = %e, "transparent https read failed");
                return Ok(());
            }
            Err(_) => {
                tracing::debug!(conn_id, %peer, "transparent https read timeout");
                return Ok(());
            }
        };
        if n == 0 {
            if peeked.is_empty() {
                return Ok(());
            }
            break ClientHelloParse::NotTls;
        }
        peeked.extend_from_slice(&tmp[..n]);
        match parse_client_hello(&peeked) {
            ClientHelloParse::NeedMoreData if peeked.len() < PEEK_CAP => continue,
            ClientHelloParse::NeedMoreData => break ClientHelloParse::NoSni,
            outcome => break outcome,
        }
    };

    match parse {
        ClientHelloParse::Sni(domain) => {
            tracing::debug!(conn_id, %peer, domain, "transparent https client hello");
            if ctx.blocker.is_blocked(&domain) {
                // No HTTP framing to answer in: close the TCP connection.
                ctx.stats.record_blocked();
                tracing::info!(conn_id, domain, "blocked transparent https");
                return Ok(());
            }
            if ctx.is_mitm_domain(&domain) {
                ctx.stats.record_intercept(&domain);
                return mitm::run_session(
                    ctx,
                    ReplayStream::new(peeked, stream),
                    &domain,
                    conn_id,
                )
                .await;
            }
            let upstream = match ctx.dial(&domain, 443).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(conn_id, domain, error = %e, "transparent upstream dial failed");
                    return Ok(());
                }
            };
            relay_with_preface(ctx, stream, upstream, peeked, &domain).await
        }
        ClientHelloParse::NoSni | ClientHelloParse::NotTls | ClientHelloParse::NeedMoreData => {
            ctx.stats.record_sni_missing();
            let orig = match original_dst(&stream) {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::debug!(conn_id, %peer, error = %e, "no SNI and no original destination");
                    return Ok(());
                }
            };
            // An original destination equal to this listener means the
            // connection was not redirected; dialing it would loop back here.
            if stream.local_addr().map(|l| l == orig).unwrap_or(false) {
                tracing::debug!(conn_id, %peer, "original destination points at the proxy itself");
                return Ok(());
            }
            let upstream = match ctx.dial(&orig.ip().to_string(), orig.port()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(conn_id, %orig, error = %e, "original-destination dial failed");
                    return Ok(());
                }
            };
            let label = orig.to_string();
            relay_with_preface(ctx, stream, upstream, peeked, &label).await
        }
    }
}

/// Replays the inspected bytes to the upstream, then relays both ways.
async fn relay_with_preface(
    ctx: &ProxyCtx,
    client: TcpStream,
    mut upstream: TcpStream,
    preface: Vec<u8>,
    destination: &str,
) -> Result<(), ProxyError> {
    let preface_len = preface.len() as u64;
    upstream.write_all(&preface).await?;
    let outcome = tunnel::relay(
        client,
        upstream,
        ctx.cfg.timeouts.idle(),
        ctx.cfg.timeouts.shutdown(),
        &ctx.cancel,
    )
    .await;
    ctx.stats.record_tunnel_close(
        destination,
        outcome.client_to_upstream + preface_len,
        outcome.upstream_to_client,
    );
    Ok(())
}
