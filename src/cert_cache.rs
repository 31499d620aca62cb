use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::{Duration, OffsetDateTime};

use crate::ca::CertAuthority;
use crate::error::ProxyError;

/// Remaining lifetime below which a cached leaf is replaced.
const REGEN_THRESHOLD_HOURS: i64 = 1;

/// One cached leaf. Immutable once inserted; replaced wholesale on regeneration.
pub struct LeafEntry {
    pub domain: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub issued_at: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// Process-lifetime cache of signed leaf certificates keyed by lowercased
/// domain. The map shards give per-domain locking: minting for one domain
/// does not block lookups for another, and contended callers for the same
/// domain observe a single mint.
pub struct LeafCache {
    ca: Arc<CertAuthority>,
    entries: DashMap<String, Arc<LeafEntry>>,
    minted: AtomicU64,
}

impl LeafCache {
    pub fn new(ca: Arc<CertAuthority>) -> Self {
        Self {
            ca,
            entries: DashMap::new(),
            minted: AtomicU64::new(0),
        }
    }

    pub fn minted_total(&self) -> u64 {
        self.minted.load(Ordering::Relaxed)
    }

    /// Returns a valid leaf for the domain, minting lazily and regenerating
    /// when the remaining lifetime dips under the threshold.
    pub fn cert_for(&self, domain: &str) -> Result<Arc<LeafEntry>, ProxyError> {
        let key = domain.to_ascii_lowercase();
        let now = OffsetDateTime::now_utc();
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occ) => {
                if occ.get().not_after - now > Duration::hours(REGEN_THRESHOLD_HOURS) {
                    return Ok(occ.get().clone());
                }
                let fresh = Arc::new(self.mint(&key)?);
                occ.insert(fresh.clone());
                Ok(fresh)
            }
            Entry::Vacant(vac) => {
                let fresh = Arc::new(self.mint(&key)?);
                vac.insert(fresh.clone());
                Ok(fresh)
            }
        }
    }

    fn mint(&self, domain: &str) -> Result<LeafEntry, ProxyError> {
        let material = self.ca.sign_leaf(domain)?;
        self.minted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(domain, "minted leaf certificate");
        Ok(LeafEntry {
            domain: domain.to_string(),
            cert_der: material.cert_der,
            key_der: material.key_der,
            issued_at: material.issued_at,
            not_after: material.not_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, Arc<LeafCache>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert = dir.path().join("rootCA.pem");
        let key = dir.path().join("rootCA.key.pem");
        let ca = CertAuthority::generate(&cert, &key, false).expect("ca");
        (dir, Arc::new(LeafCache::new(Arc::new(ca))))
    }

    #[test]
    fn caches_by_lowercased_domain() {
        let (_dir, cache) = cache();
        let a = cache.cert_for("Example.COM").expect("first");
        let b = cache.cert_for("example.com").expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.minted_total(), 1);
        assert_eq!(a.domain, "example.com");
    }

    #[test]
    fn returned_leaves_outlive_the_regen_threshold() {
        let (_dir, cache) = cache();
        let entry = cache.cert_for("fresh.example").expect("leaf");
        let remaining = entry.not_after - OffsetDateTime::now_utc();
        assert!(remaining > Duration::hours(REGEN_THRESHOLD_HOURS));
    }

    #[test]
    fn concurrent_calls_for_one_domain_mint_once() {
        let (_dir, cache) = cache();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                cache.cert_for("contended.example").expect("leaf").cert_der.clone()
            }));
        }
        let first = handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect::<Vec<_>>();
        assert_eq!(cache.minted_total(), 1);
        assert!(first.windows(2).all(|w| w[0] == w[1]));
    }
}
