use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Protocol tag attached to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolTag {
    Http,
    HttpsTunnel,
    HttpsMitm,
    TransparentHttp,
    TransparentHttps,
}

impl ProtocolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolTag::Http => "http",
            ProtocolTag::HttpsTunnel => "https-tunnel",
            ProtocolTag::HttpsMitm => "https-mitm",
            ProtocolTag::TransparentHttp => "transparent-http",
            ProtocolTag::TransparentHttps => "transparent-https",
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PluginRuleStats {
    pub events: u64,
    pub removed: u64,
    pub modified: u64,
}

/// Lock-free operational counters fed by callbacks along every path.
#[derive(Default)]
pub struct Stats {
    connections: DashMap<&'static str, u64>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    blocked_total: AtomicU64,
    sni_missing: AtomicU64,
    intercepts_total: AtomicU64,
    tunnels_total: AtomicU64,
    requests_by_domain: DashMap<String, u64>,
    plugin_inspected: DashMap<String, u64>,
    plugin_matches: DashMap<(String, String), PluginRuleStats>,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub connections: BTreeMap<String, u64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub blocked_total: u64,
    pub sni_missing: u64,
    pub intercepts_total: u64,
    pub tunnels_total: u64,
    pub requests_by_domain: BTreeMap<String, u64>,
    pub plugin_inspected: BTreeMap<String, u64>,
    pub plugin_matches: BTreeMap<String, PluginRuleStats>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self, tag: ProtocolTag) {
        *self.connections.entry(tag.as_str()).or_insert(0) += 1;
    }

    pub fn add_bytes(&self, client_to_upstream: u64, upstream_to_client: u64) {
        self.bytes_in.fetch_add(client_to_upstream, Ordering::Relaxed);
        self.bytes_out.fetch_add(upstream_to_client, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sni_missing(&self) {
        self.sni_missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_intercept(&self, domain: &str) {
        self.intercepts_total.fetch_add(1, Ordering::Relaxed);
        *self.requests_by_domain.entry(domain.to_string()).or_insert(0) += 1;
    }

    pub fn record_request(&self, domain: &str) {
        *self.requests_by_domain.entry(domain.to_string()).or_insert(0) += 1;
    }

    /// Tunnel close event carrying both direction counters.
    pub fn record_tunnel_close(&self, domain: &str, up: u64, down: u64) {
        self.tunnels_total.fetch_add(1, Ordering::Relaxed);
        self.add_bytes(up, down);
        tracing::debug!(domain, up, down, "tunnel closed");
    }

    pub fn plugin_inspected(&self, plugin: &str) {
        *self.plugin_inspected.entry(plugin.to_string()).or_insert(0) += 1;
    }

    pub fn plugin_match(&self, plugin: &str, rule: &str, modified: bool, removed: u64) {
        let mut entry = self
            .plugin_matches
            .entry((plugin.to_string(), rule.to_string()))
            .or_default();
        entry.events += 1;
        entry.removed += removed;
        if modified {
            entry.modified += 1;
        }
    }

    pub fn intercepts_total(&self) -> u64 {
        self.intercepts_total.load(Ordering::Relaxed)
    }

    pub fn sni_missing(&self) -> u64 {
        self.sni_missing.load(Ordering::Relaxed)
    }

    pub fn blocked_total(&self) -> u64 {
        self.blocked_total.load(Ordering::Relaxed)
    }

    pub fn inspected_for(&self, plugin: &str) -> u64 {
        self.plugin_inspected.get(plugin).map(|v| *v).unwrap_or(0)
    }

    pub fn match_stats_for(&self, plugin: &str, rule: &str) -> Option<PluginRuleStats> {
        self.plugin_matches
            .get(&(plugin.to_string(), rule.to_string()))
            .map(|v| PluginRuleStats {
                events: v.events,
                removed: v.removed,
                modified: v.modified,
            })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self
                .connections
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            blocked_total: self.blocked_total.load(Ordering::Relaxed),
            sni_missing: self.sni_missing.load(Ordering::Relaxed),
            intercepts_total: self.intercepts_total.load(Ordering::Relaxed),
            tunnels_total: self.tunnels_total.load(Ordering::Relaxed),
            requests_by_domain: self
                .requests_by_domain
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            plugin_inspected: self
                .plugin_inspected
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            plugin_matches: self
                .plugin_matches
                .iter()
                .map(|e| {
                    let (plugin, rule) = e.key();
                    (
                        format!("{plugin}/{rule}"),
                        PluginRuleStats {
                            events: e.value().events,
                            removed: e.value().removed,
                            modified: e.value().modified,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_events_aggregate() {
        let stats = Stats::new();
        stats.plugin_inspected("rewrite");
        stats.plugin_inspected("rewrite");
        stats.plugin_match("rewrite", "strip-foo", true, 2);
        stats.plugin_match("rewrite", "strip-foo", false, 0);
        assert_eq!(stats.inspected_for("rewrite"), 2);
        let agg = stats.match_stats_for("rewrite", "strip-foo").expect("agg");
        assert_eq!(agg.events, 2);
        assert_eq!(agg.removed, 2);
        assert_eq!(agg.modified, 1);
    }

    #[test]
    fn snapshot_is_serializable() {
        let stats = Stats::new();
        stats.record_connection(ProtocolTag::Http);
        stats.record_intercept("example.com");
        stats.record_sni_missing();
        let snap = stats.snapshot();
        let json = serde_json::to_string(&snap).expect("serialize");
        assert!(json.contains("\"sni_missing\":1"));
        assert!(json.contains("example.com"));
    }
}
