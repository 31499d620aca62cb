use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::cert_cache::LeafEntry;
use crate::error::ProxyError;

/// Client-side acceptor for one MITM session: minted leaf plus the CA so the
/// presented chain is complete. No ALPN is advertised, forcing HTTP/1.1.
pub fn acceptor_for_leaf(leaf: &LeafEntry, ca_der: &[u8]) -> Result<TlsAcceptor, ProxyError> {
    let certs = vec![
        CertificateDer::from(leaf.cert_der.clone()),
        CertificateDer::from(ca_der.to_vec()),
    ];
    let key: PrivatePkcs8KeyDer<'static> = PrivatePkcs8KeyDer::from(leaf.key_der.clone());
    let server_cfg = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKeyDer::Pkcs8(key))
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server_cfg)))
}

/// Upstream connector with standard root verification (native store plus the
/// bundled webpki roots) and ALPN restricted to `http/1.1`.
pub fn build_upstream_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    if let Ok(certs) = rustls_native_certs::load_native_certs() {
        for cert in certs {
            let _ = roots.add(cert);
        }
    }
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut client_cfg = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(client_cfg))
}

pub async fn connect_upstream_tls(
    connector: &TlsConnector,
    domain: &str,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name `{domain}`")))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Tls(e.to_string()))
}
