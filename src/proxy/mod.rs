use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use once_cell::sync::Lazy;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::blocker::{Blocker, DomainBlocklist};
use crate::ca::CertAuthority;
use crate::cert_cache::LeafCache;
use crate::config::Config;
use crate::error::ProxyError;
use crate::mgmt::{BuiltinManagement, Management};
use crate::plugins::PluginPipeline;
use crate::stats::Stats;

pub mod explicit;
pub mod mitm;
pub mod sni;
pub mod tls;
pub mod transparent;
pub mod tunnel;

#[cfg(test)]
mod tests;

pub(crate) static CONN_SEQ: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(1));

/// Everything a connection handler needs, shared across all listeners.
pub struct ProxyCtx {
    pub cfg: Config,
    pub blocker: Arc<dyn Blocker>,
    pub stats: Arc<Stats>,
    pub pipeline: PluginPipeline,
    pub mgmt: Arc<dyn Management>,
    pub ca: Option<Arc<CertAuthority>>,
    pub leaf_cache: Option<Arc<LeafCache>>,
    pub upstream_tls: TlsConnector,
    pub cancel: CancellationToken,
    /// Routes every upstream dial to a fixture listener.
    #[cfg(test)]
    pub(crate) dial_override: Option<SocketAddr>,
}

impl ProxyCtx {
    pub fn from_config(cfg: Config) -> Result<Arc<Self>, ProxyError> {
        let stats = Arc::new(Stats::new());
        let blocker: Arc<dyn Blocker> = Arc::new(DomainBlocklist::from_config(&cfg.block));
        let pipeline = PluginPipeline::build(&cfg, stats.clone())?;
        let mgmt: Arc<dyn Management> = Arc::new(BuiltinManagement::new(
            cfg.management.path_prefix.clone(),
            stats.clone(),
        ));
        let (ca, leaf_cache) = if cfg.mitm.domains.is_empty() {
            (None, None)
        } else {
            let ca = Arc::new(CertAuthority::load(&cfg.mitm.ca_cert, &cfg.mitm.ca_key)?);
            tracing::info!(fingerprint = ca.fingerprint(), "CA material loaded");
            ca.warn_if_expiring();
            let cache = Arc::new(LeafCache::new(ca.clone()));
            (Some(ca), Some(cache))
        };
        Ok(Arc::new(Self {
            cfg,
            blocker,
            stats,
            pipeline,
            mgmt,
            ca,
            leaf_cache,
            upstream_tls: tls::build_upstream_connector(),
            cancel: CancellationToken::new(),
            #[cfg(test)]
            dial_override: None,
        }))
    }

    pub fn is_mitm_domain(&self, domain: &str) -> bool {
        self.cfg.is_mitm_domain(domain) && self.leaf_cache.is_some()
    }

    /// Upstream TCP dial with the configured connect timeout.
    pub(crate) async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        #[cfg(test)]
        let addr = match self.dial_override {
            Some(fixture) => fixture.to_string(),
            None => format!("{host}:{port}"),
        };
        #[cfg(not(test))]
        let addr = format!("{host}:{port}");
        match tokio::time::timeout(self.cfg.timeouts.connect(), TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::UpstreamDial {
                host: addr,
                source: e,
            }),
            Err(_) => Err(ProxyError::UpstreamTimeout(addr)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ListenerKind {
    Explicit,
    TransparentHttp,
    TransparentHttps,
}

/// Listeners bound and accept loops running.
pub struct ProxyServer {
    pub listen_addr: SocketAddr,
    pub transparent_http_addr: Option<SocketAddr>,
    pub transparent_https_addr: Option<SocketAddr>,
    ctx: Arc<ProxyCtx>,
    tracker: TaskTracker,
}

impl ProxyServer {
    pub async fn start(ctx: Arc<ProxyCtx>) -> Result<Self, ProxyError> {
        let tracker = TaskTracker::new();
        let explicit = TcpListener::bind(&ctx.cfg.listen).await?;
        let listen_addr = explicit.local_addr()?;
        spawn_accept_loop(explicit, ctx.clone(), tracker.clone(), ListenerKind::Explicit);

        let mut transparent_http_addr = None;
        if let Some(addr) = &ctx.cfg.transparent.http_addr {
            let listener = TcpListener::bind(addr).await?;
            transparent_http_addr = Some(listener.local_addr()?);
            spawn_accept_loop(
                listener,
                ctx.clone(),
                tracker.clone(),
                ListenerKind::TransparentHttp,
            );
        }
        let mut transparent_https_addr = None;
        if let Some(addr) = &ctx.cfg.transparent.https_addr {
            let listener = TcpListener::bind(addr).await?;
            transparent_https_addr = Some(listener.local_addr()?);
            spawn_accept_loop(
                listener,
                ctx.clone(),
                tracker.clone(),
                ListenerKind::TransparentHttps,
            );
        }

        Ok(Self {
            listen_addr,
            transparent_http_addr,
            transparent_https_addr,
            ctx,
            tracker,
        })
    }

    /// Stops accepting, signals handlers, and waits up to the shutdown
    /// deadline for in-flight connections before giving up on them.
    pub async fn shutdown(&self) {
        self.ctx.cancel.cancel();
        self.tracker.close();
        let deadline = self.ctx.cfg.timeouts.shutdown();
        if tokio::time::timeout(deadline, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("shutdown deadline reached with connections still open");
        }
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    ctx: Arc<ProxyCtx>,
    tracker: TaskTracker,
    kind: ListenerKind,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        tracker.spawn(async move {
                            let result = match kind {
                                ListenerKind::Explicit => {
                                    explicit::handle_client(&ctx, stream, peer).await
                                }
                                ListenerKind::TransparentHttp => {
                                    transparent::handle_http(&ctx, stream, peer).await
                                }
                                ListenerKind::TransparentHttps => {
                                    transparent::handle_https(&ctx, stream, peer).await
                                }
                            };
                            if let Err(e) = result {
                                tracing::debug!(%peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    }
                }
            }
        }
    });
}

/// Full daemon entry: wire everything from config, serve until SIGINT or
/// SIGTERM, then drain within the shutdown deadline.
pub async fn run_until_signal(cfg: Config) -> Result<(), ProxyError> {
    let ctx = ProxyCtx::from_config(cfg)?;
    let server = ProxyServer::start(ctx.clone()).await?;
    tracing::info!(addr = %server.listen_addr, "explicit proxy listening");
    if let Some(addr) = server.transparent_http_addr {
        tracing::info!(%addr, "transparent http listening");
    }
    if let Some(addr) = server.transparent_https_addr {
        tracing::info!(%addr, "transparent https listening");
    }

    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    server.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
