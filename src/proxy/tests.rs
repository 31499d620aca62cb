#![cfg(test)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::sni::testutil::{client_hello, sni_extension};
use super::{ProxyCtx, ProxyServer, tls};
use crate::ca::CertAuthority;
use crate::cert_cache::LeafEntry;
use crate::config::{Config, PluginConfig};
use crate::http1::{H1Conn, header_value, response_body_framing};
use crate::rewrite_store::{RewriteRuleStore, RuleDraft};

const TICK: Duration = Duration::from_secs(5);

/// Test CA on disk plus a loaded handle for signing fixture certificates.
struct CaFixture {
    dir: tempfile::TempDir,
    ca: Arc<CertAuthority>,
}

fn prepare_ca() -> CaFixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let cert = dir.path().join("rootCA.pem");
    let key = dir.path().join("rootCA.key.pem");
    let ca = CertAuthority::generate(&cert, &key, false).expect("generate ca");
    CaFixture {
        dir,
        ca: Arc::new(ca),
    }
}

struct TestEnv {
    ctx: Arc<ProxyCtx>,
    server: ProxyServer,
}

/// Boots a full proxy on loopback against the fixture CA. `dial_to` reroutes
/// every upstream dial to a fixture listener.
async fn start_proxy(
    fx: &CaFixture,
    mutate: impl FnOnce(&mut Config),
    dial_to: Option<SocketAddr>,
) -> TestEnv {
    let mut cfg = Config::default();
    cfg.listen = "127.0.0.1:0".into();
    cfg.mitm.ca_cert = fx.dir.path().join("rootCA.pem");
    cfg.mitm.ca_key = fx.dir.path().join("rootCA.key.pem");
    cfg.timeouts.shutdown_secs = 1;
    mutate(&mut cfg);

    let mut ctx = ProxyCtx::from_config(cfg).expect("context");
    {
        let inner = Arc::get_mut(&mut ctx).expect("fresh arc");
        inner.dial_override = dial_to;
        // Upstream verification must accept fixture certificates signed by
        // the test CA.
        inner.upstream_tls = connector_trusting(fx.ca.cert_der());
    }
    let server = ProxyServer::start(ctx.clone()).await.expect("start");
    TestEnv { ctx, server }
}

fn connector_trusting(ca_der: &[u8]) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca_der.to_vec()))
        .expect("add test root");
    let mut cfg = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(cfg))
}

fn rewrite_plugin_config(rules_path: &std::path::Path, domains: &[&str]) -> PluginConfig {
    let mut plugin = PluginConfig::default();
    plugin.domains = Some(domains.iter().map(|d| d.to_string()).collect());
    plugin.options = serde_json::json!({"rules_path": rules_path})
        .as_object()
        .cloned()
        .unwrap();
    plugin
}

fn seed_rule(dir: &std::path::Path, name: &str, pattern: &str, replacement: &str) -> std::path::PathBuf {
    let rules_path = dir.join("rules.json");
    let store = RewriteRuleStore::open(&rules_path).expect("store");
    store
        .add(RuleDraft {
            name: name.into(),
            pattern: pattern.into(),
            replacement: replacement.into(),
            ..Default::default()
        })
        .expect("add rule");
    rules_path
}

/// TLS upstream fixture for one MITM exchange: serves `response` and reports
/// the raw request head it saw.
async fn tls_upstream(
    ca: Arc<CertAuthority>,
    domain: &'static str,
    response: Vec<u8>,
) -> (SocketAddr, oneshot::Receiver<String>) {
    let material = ca.sign_leaf(domain).expect("leaf");
    let leaf = LeafEntry {
        domain: domain.to_string(),
        cert_der: material.cert_der,
        key_der: material.key_der,
        issued_at: material.issued_at,
        not_after: material.not_after,
    };
    let acceptor = tls::acceptor_for_leaf(&leaf, ca.cert_der()).expect("acceptor");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut stream = acceptor.accept(stream).await.expect("tls accept");
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read_exact(&mut byte).await.is_err() {
                break;
            }
            head.push(byte[0]);
        }
        let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
        stream.write_all(&response).await.expect("write response");
        stream.flush().await.expect("flush");
        // Hold the connection so content-length framing can drain.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });
    (addr, rx)
}

/// Plain-TCP fixture that captures `expect` bytes, replies, and reports what
/// it received.
async fn tcp_upstream(expect: usize, reply: Vec<u8>) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut seen = vec![0u8; expect];
        stream.read_exact(&mut seen).await.expect("read preface");
        let _ = tx.send(seen);
        stream.write_all(&reply).await.expect("reply");
        stream.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(500)).await;
    });
    (addr, rx)
}

async fn read_until_blank_line(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("read head byte");
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

#[tokio::test]
async fn blocked_plain_http_returns_403_without_touching_upstream() {
    let accepts = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let fixture = listener.local_addr().expect("addr");
    {
        let accepts = accepts.clone();
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {
                accepts.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let fx = prepare_ca();
    let env = start_proxy(
        &fx,
        |cfg| cfg.block.domains = vec!["blocked.example".into()],
        Some(fixture),
    )
    .await;

    let mut client = TcpStream::connect(env.server.listen_addr).await.expect("connect");
    client
        .write_all(b"GET http://blocked.example/ HTTP/1.1\r\nHost: blocked.example\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    timeout(TICK, client.read_to_string(&mut response))
        .await
        .expect("response in time")
        .expect("read");
    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    assert_eq!(env.ctx.stats.blocked_total(), 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 0, "upstream was contacted");
    env.server.shutdown().await;
}

#[tokio::test]
async fn plain_http_forwarding_is_identity_without_plugins() {
    let body = b"hello from origin";
    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        String::from_utf8_lossy(body)
    );
    // The fixture reads one byte before replying so the proxy's request is
    // accepted first.
    let (fixture, _seen) = tcp_upstream(1, reply.into_bytes()).await;
    let fx = prepare_ca();
    let env = start_proxy(&fx, |_| {}, Some(fixture)).await;

    let client = TcpStream::connect(env.server.listen_addr).await.expect("connect");
    let mut conn = H1Conn::new(client);
    conn.write_raw(b"GET http://origin.example/hello HTTP/1.1\r\nHost: origin.example\r\n\r\n")
        .await
        .expect("write");
    conn.flush().await.expect("flush");
    let head = timeout(TICK, conn.read_response_head())
        .await
        .expect("in time")
        .expect("head");
    assert_eq!(head.status, 200);
    let framing = response_body_framing("GET", &head).expect("framing");
    let got = conn.read_body(&framing).await.expect("body");
    assert_eq!(got, body);
    env.server.shutdown().await;
}

#[tokio::test]
async fn mitm_literal_rewrite_end_to_end() {
    let upstream_body = b"foo baz foo";
    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        upstream_body.len(),
        String::from_utf8_lossy(upstream_body)
    );

    let fx = prepare_ca();
    let rules_path = seed_rule(fx.dir.path(), "strip-foo", "foo", "bar");
    let (fixture, seen_head) = tls_upstream(fx.ca.clone(), "example.com", reply.into_bytes()).await;
    let env = start_proxy(
        &fx,
        |cfg| {
            cfg.mitm.domains = vec!["example.com".into()];
            cfg.plugins
                .insert("rewrite".into(), rewrite_plugin_config(&rules_path, &["example.com"]));
        },
        Some(fixture),
    )
    .await;

    let mut raw = TcpStream::connect(env.server.listen_addr).await.expect("connect");
    raw.write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .expect("connect write");
    let established = read_until_blank_line(&mut raw).await;
    assert!(established.starts_with("HTTP/1.1 200"), "got: {established}");

    let connector = connector_trusting(fx.ca.cert_der());
    let name = ServerName::try_from("example.com").expect("name");
    let tls_stream = timeout(TICK, connector.connect(name, raw))
        .await
        .expect("handshake in time")
        .expect("handshake");
    let mut conn = H1Conn::new(tls_stream);
    conn.write_raw(b"GET / HTTP/1.1\r\nHost: example.com\r\nAccept-Encoding: gzip\r\n\r\n")
        .await
        .expect("request");
    conn.flush().await.expect("flush");

    let head = timeout(TICK, conn.read_response_head())
        .await
        .expect("in time")
        .expect("head");
    assert_eq!(head.status, 200);
    assert_eq!(header_value(&head.headers, "content-length"), Some("11"));
    let framing = response_body_framing("GET", &head).expect("framing");
    let body = conn.read_body(&framing).await.expect("body");
    assert_eq!(body, b"bar baz bar");

    let upstream_saw = timeout(TICK, seen_head).await.expect("in time").expect("head");
    assert!(upstream_saw.contains("Host: example.com"), "{upstream_saw}");
    assert!(
        !upstream_saw.to_ascii_lowercase().contains("accept-encoding"),
        "Accept-Encoding must be stripped when a modifier is active: {upstream_saw}"
    );

    assert_eq!(env.ctx.stats.intercepts_total(), 1);
    assert_eq!(env.ctx.stats.inspected_for("rewrite"), 1);
    let agg = env
        .ctx
        .stats
        .match_stats_for("rewrite", "strip-foo")
        .expect("match stats");
    assert_eq!(agg.events, 1);
    assert_eq!(agg.removed, 2);
    env.server.shutdown().await;
}

#[tokio::test]
async fn mitm_html_rewrite_preserves_script_blocks() {
    let upstream_body = b"<p>word</p><script>var word = 1;</script><p>word</p>";
    let reply = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
        upstream_body.len(),
        String::from_utf8_lossy(upstream_body)
    );

    let fx = prepare_ca();
    let rules_path = seed_rule(fx.dir.path(), "shout", "word", "WORD");
    let (fixture, _seen) = tls_upstream(fx.ca.clone(), "example.com", reply.into_bytes()).await;
    let env = start_proxy(
        &fx,
        |cfg| {
            cfg.mitm.domains = vec!["example.com".into()];
            cfg.plugins
                .insert("rewrite".into(), rewrite_plugin_config(&rules_path, &["example.com"]));
        },
        Some(fixture),
    )
    .await;

    let mut raw = TcpStream::connect(env.server.listen_addr).await.expect("connect");
    raw.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .expect("connect write");
    let established = read_until_blank_line(&mut raw).await;
    assert!(established.starts_with("HTTP/1.1 200"));

    let connector = connector_trusting(fx.ca.cert_der());
    let name = ServerName::try_from("example.com").expect("name");
    let tls_stream = connector.connect(name, raw).await.expect("handshake");
    let mut conn = H1Conn::new(tls_stream);
    conn.write_raw(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .expect("request");
    conn.flush().await.expect("flush");

    let head = timeout(TICK, conn.read_response_head())
        .await
        .expect("in time")
        .expect("head");
    let framing = response_body_framing("GET", &head).expect("framing");
    let body = conn.read_body(&framing).await.expect("body");
    assert_eq!(body, b"<p>WORD</p><script>var word = 1;</script><p>WORD</p>");
    let agg = env
        .ctx
        .stats
        .match_stats_for("rewrite", "shout")
        .expect("match stats");
    assert_eq!(agg.removed, 2);
    env.server.shutdown().await;
}

#[tokio::test]
async fn block_wins_over_mitm_policy_on_connect() {
    let fx = prepare_ca();
    let env = start_proxy(
        &fx,
        |cfg| {
            cfg.mitm.domains = vec!["blocked.example".into()];
            cfg.block.domains = vec!["blocked.example".into()];
        },
        None,
    )
    .await;

    let mut client = TcpStream::connect(env.server.listen_addr).await.expect("connect");
    client
        .write_all(b"CONNECT blocked.example:443 HTTP/1.1\r\n\r\n")
        .await
        .expect("write");
    let mut response = String::new();
    timeout(TICK, client.read_to_string(&mut response))
        .await
        .expect("in time")
        .expect("read");
    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    let cache = env.ctx.leaf_cache.as_ref().expect("cache");
    assert_eq!(cache.minted_total(), 0, "no leaf for a blocked domain");
    env.server.shutdown().await;
}

#[tokio::test]
async fn transparent_https_passthrough_replays_client_hello() {
    let hello = client_hello(&sni_extension("passthrough.example"));
    let (fixture, seen) = tcp_upstream(hello.len(), b"TLS-SERVER-BYTES".to_vec()).await;

    let fx = prepare_ca();
    let env = start_proxy(
        &fx,
        |cfg| {
            cfg.transparent.https_addr = Some("127.0.0.1:0".into());
            cfg.mitm.domains = vec!["example.com".into()];
        },
        Some(fixture),
    )
    .await;
    let transparent = env
        .server
        .transparent_https_addr
        .expect("transparent listener");

    let mut client = TcpStream::connect(transparent).await.expect("connect");
    client.write_all(&hello).await.expect("send hello");
    let mut reply = vec![0u8; 16];
    timeout(TICK, client.read_exact(&mut reply))
        .await
        .expect("in time")
        .expect("read reply");
    assert_eq!(&reply, b"TLS-SERVER-BYTES");

    let replayed = timeout(TICK, seen).await.expect("in time").expect("preface");
    assert_eq!(replayed, hello, "ClientHello must be replayed verbatim");

    let cache = env.ctx.leaf_cache.as_ref().expect("cache");
    assert_eq!(cache.minted_total(), 0, "passthrough must not mint leaves");
    assert_eq!(env.ctx.stats.intercepts_total(), 0);
    assert_eq!(env.ctx.stats.sni_missing(), 0);
    drop(client);
    env.server.shutdown().await;
}

#[tokio::test]
async fn transparent_https_blocked_domain_is_closed() {
    let hello = client_hello(&sni_extension("blocked.example"));
    let fx = prepare_ca();
    let env = start_proxy(
        &fx,
        |cfg| {
            cfg.transparent.https_addr = Some("127.0.0.1:0".into());
            cfg.block.domains = vec!["blocked.example".into()];
        },
        None,
    )
    .await;
    let transparent = env
        .server
        .transparent_https_addr
        .expect("transparent listener");

    let mut client = TcpStream::connect(transparent).await.expect("connect");
    client.write_all(&hello).await.expect("send hello");
    let mut buf = [0u8; 1];
    let n = timeout(TICK, client.read(&mut buf))
        .await
        .expect("in time")
        .expect("read");
    assert_eq!(n, 0, "blocked HTTPS closes without bytes");
    assert_eq!(env.ctx.stats.blocked_total(), 1);
    env.server.shutdown().await;
}

#[tokio::test]
async fn transparent_https_without_sni_counts_and_closes() {
    let fx = prepare_ca();
    let env = start_proxy(
        &fx,
        |cfg| {
            cfg.transparent.https_addr = Some("127.0.0.1:0".into());
        },
        None,
    )
    .await;
    let transparent = env
        .server
        .transparent_https_addr
        .expect("transparent listener");

    // Not a TLS handshake at all; loopback has no redirect entry either, so
    // the original-destination fallback cannot resolve and the socket closes.
    let mut client = TcpStream::connect(transparent).await.expect("connect");
    client.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.expect("write");
    let mut buf = [0u8; 1];
    let n = timeout(TICK, client.read(&mut buf))
        .await
        .expect("in time")
        .expect("read");
    assert_eq!(n, 0);
    assert_eq!(env.ctx.stats.sni_missing(), 1);
    env.server.shutdown().await;
}

#[tokio::test]
async fn management_prefix_is_answered_locally() {
    // No dial fixture: a forwarded request would fail loudly.
    let fx = prepare_ca();
    let env = start_proxy(&fx, |_| {}, None).await;

    let client = TcpStream::connect(env.server.listen_addr).await.expect("connect");
    let mut conn = H1Conn::new(client);
    conn.write_raw(b"GET /fps/heartbeat HTTP/1.1\r\nHost: proxy\r\nConnection: close\r\n\r\n")
        .await
        .expect("write");
    conn.flush().await.expect("flush");
    let head = timeout(TICK, conn.read_response_head())
        .await
        .expect("in time")
        .expect("head");
    assert_eq!(head.status, 200);
    let framing = response_body_framing("GET", &head).expect("framing");
    let body = conn.read_body(&framing).await.expect("body");
    let v: serde_json::Value = serde_json::from_slice(&body).expect("json");
    assert_eq!(v["status"], "ok");
    env.server.shutdown().await;
}
