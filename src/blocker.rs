use std::collections::HashSet;

use dashmap::DashMap;

use crate::config::BlockConfig;

/// Interface the traffic plane consults before dialing anywhere.
pub trait Blocker: Send + Sync {
    fn is_blocked(&self, domain: &str) -> bool;
}

/// Built-in blocklist: exact lowercase domains, with parent-domain matching
/// (`ads.example.com` is blocked by an `example.com` entry) and allow entries
/// overriding block entries. Keeps per-domain hit counters for the stats
/// collaborator.
pub struct DomainBlocklist {
    blocked: HashSet<String>,
    allowed: HashSet<String>,
    blocked_hits: DashMap<String, u64>,
    allowed_hits: DashMap<String, u64>,
}

fn matches_set(set: &HashSet<String>, domain: &str) -> bool {
    if set.contains(domain) {
        return true;
    }
    let mut rest = domain;
    while let Some(idx) = rest.find('.') {
        rest = &rest[idx + 1..];
        if set.contains(rest) {
            return true;
        }
    }
    false
}

impl DomainBlocklist {
    pub fn from_config(cfg: &BlockConfig) -> Self {
        Self {
            blocked: cfg.domains.iter().cloned().collect(),
            allowed: cfg.allow.iter().cloned().collect(),
            blocked_hits: DashMap::new(),
            allowed_hits: DashMap::new(),
        }
    }

    pub fn top_blocked(&self, n: usize) -> Vec<(String, u64)> {
        let mut hits: Vec<(String, u64)> = self
            .blocked_hits
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(n);
        hits
    }
}

impl Blocker for DomainBlocklist {
    fn is_blocked(&self, domain: &str) -> bool {
        let lower = domain.to_ascii_lowercase();
        if matches_set(&self.allowed, &lower) {
            *self.allowed_hits.entry(lower).or_insert(0) += 1;
            return false;
        }
        if matches_set(&self.blocked, &lower) {
            *self.blocked_hits.entry(lower).or_insert(0) += 1;
            return true;
        }
        *self.allowed_hits.entry(lower).or_insert(0) += 1;
        false
    }
}
