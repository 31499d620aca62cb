use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;

use crate::error::ProxyError;

const CA_COMMON_NAME: &str = "Adscrub Root CA";
const CA_VALIDITY_DAYS: i64 = 3650;
pub const LEAF_VALIDITY_HOURS: i64 = 24;
const EXPIRY_WARN_DAYS: i64 = 30;

/// Process-wide CA material. Loaded once at startup, immutable thereafter.
pub struct CertAuthority {
    cert_pem: String,
    cert_der: Vec<u8>,
    /// Signer reconstructed from the on-disk key; shares subject and key with
    /// the persisted certificate so issued leaves chain to it.
    signer: Certificate,
    not_after: OffsetDateTime,
    fingerprint: String,
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAuthority")
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Material for one freshly minted leaf certificate.
pub struct LeafMaterial {
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub issued_at: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    SerialNumber::from_slice(&bytes)
}

fn ca_params(key_pair: KeyPair, subject_cn: &str) -> CertificateParams {
    let mut params = CertificateParams::new(vec![]);
    params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject_cn);
    params.distinguished_name = dn;
    params.key_pair = Some(key_pair);
    params
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl CertAuthority {
    /// Creates CA files on disk. Refuses to overwrite existing material unless
    /// `force` is set.
    pub fn generate(cert_path: &Path, key_path: &Path, force: bool) -> Result<Self, ProxyError> {
        if !force && (cert_path.exists() || key_path.exists()) {
            return Err(ProxyError::Ca(format!(
                "refusing to overwrite {} / {}; pass --force to regenerate",
                cert_path.display(),
                key_path.display()
            )));
        }
        if let Some(dir) = cert_path.parent() {
            fs::create_dir_all(dir).map_err(|e| ProxyError::Ca(e.to_string()))?;
        }
        if let Some(dir) = key_path.parent() {
            fs::create_dir_all(dir).map_err(|e| ProxyError::Ca(e.to_string()))?;
        }

        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Ca(e.to_string()))?;
        let mut params = ca_params(key_pair, CA_COMMON_NAME);
        let now = OffsetDateTime::now_utc();
        params.not_before = now.saturating_sub(Duration::days(1));
        params.not_after = now.saturating_add(Duration::days(CA_VALIDITY_DAYS));
        params.serial_number = Some(random_serial());

        let ca = Certificate::from_params(params).map_err(|e| ProxyError::Ca(e.to_string()))?;
        let cert_pem = ca.serialize_pem().map_err(|e| ProxyError::Ca(e.to_string()))?;
        let key_pem = ca.serialize_private_key_pem();

        fs::write(cert_path, &cert_pem).map_err(|e| ProxyError::Ca(e.to_string()))?;
        restrict_permissions(cert_path).map_err(|e| ProxyError::Ca(e.to_string()))?;
        fs::write(key_path, &key_pem).map_err(|e| ProxyError::Ca(e.to_string()))?;
        restrict_permissions(key_path).map_err(|e| ProxyError::Ca(e.to_string()))?;

        Self::load(cert_path, key_path)
    }

    /// Reads and parses CA material, verifying the certificate really is a CA.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, ProxyError> {
        let cert_pem = fs::read_to_string(cert_path).map_err(|e| {
            ProxyError::Ca(format!("cannot read {}: {}", cert_path.display(), e))
        })?;
        let key_pem = fs::read_to_string(key_path).map_err(|e| {
            ProxyError::Ca(format!("cannot read {}: {}", key_path.display(), e))
        })?;

        let cert_der = pem_to_der_first_cert(&cert_pem)?;
        let (_, parsed) = X509Certificate::from_der(&cert_der)
            .map_err(|e| ProxyError::Ca(format!("invalid CA certificate: {e}")))?;
        match parsed.basic_constraints() {
            Ok(Some(ext)) if ext.value.ca => {}
            _ => {
                return Err(ProxyError::Ca(
                    "certificate is not marked CA:TRUE in Basic Constraints".into(),
                ));
            }
        }
        let subject_cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or(CA_COMMON_NAME)
            .to_string();
        let not_after = parsed.validity().not_after.to_datetime();

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| ProxyError::Ca(e.to_string()))?;
        let signer = Certificate::from_params(ca_params(key_pair, &subject_cn))
            .map_err(|e| ProxyError::Ca(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&cert_der);
        let fingerprint = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":");

        Ok(Self {
            cert_pem,
            cert_der,
            signer,
            not_after,
            fingerprint,
        })
    }

    /// SHA-256 fingerprint of the certificate DER, colon-separated hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn warn_if_expiring(&self) {
        let now = OffsetDateTime::now_utc();
        if self.not_after - now < Duration::days(EXPIRY_WARN_DAYS) {
            tracing::warn!(expires = %self.not_after, "CA certificate expires soon");
        }
    }

    /// Mints a leaf for one domain: P-256, single DNS SAN, 24 h validity,
    /// fresh random serial, signed by this CA.
    pub fn sign_leaf(&self, domain: &str) -> Result<LeafMaterial, ProxyError> {
        let issued_at = OffsetDateTime::now_utc();
        let mut params = CertificateParams::new(vec![]);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.subject_alt_names = vec![SanType::DnsName(domain.to_string())];
        params.not_before = issued_at.saturating_sub(Duration::minutes(5));
        params.not_after = issued_at.saturating_add(Duration::hours(LEAF_VALIDITY_HOURS));
        params.distinguished_name.push(DnType::CommonName, domain);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial());
        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ProxyError::Ca(e.to_string()))?;
        params.key_pair = Some(key_pair);

        let leaf = Certificate::from_params(params).map_err(|e| ProxyError::Ca(e.to_string()))?;
        let cert_der = leaf
            .serialize_der_with_signer(&self.signer)
            .map_err(|e| ProxyError::Ca(e.to_string()))?;
        let key_der = leaf.serialize_private_key_der();
        Ok(LeafMaterial {
            cert_der,
            key_der,
            issued_at,
            not_after: issued_at.saturating_add(Duration::hours(LEAF_VALIDITY_HOURS)),
        })
    }
}

/// Decodes the first CERTIFICATE block of a PEM string.
pub fn pem_to_der_first_cert(pem: &str) -> Result<Vec<u8>, ProxyError> {
    use base64::Engine as _;
    let begin = "-----BEGIN CERTIFICATE-----";
    let end = "-----END CERTIFICATE-----";
    let bpos = pem
        .find(begin)
        .ok_or_else(|| ProxyError::Ca("invalid pem: missing begin".into()))?;
    let rest = &pem[bpos + begin.len()..];
    let epos = rest
        .find(end)
        .ok_or_else(|| ProxyError::Ca("invalid pem: missing end".into()))?;
    let b64 = rest[..epos].lines().map(|l| l.trim()).collect::<String>();
    base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| ProxyError::Ca(e.to_string()))
}
