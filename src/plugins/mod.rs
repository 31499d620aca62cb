use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, DEFAULT_PLUGIN_PRIORITY};
use crate::error::ProxyError;
use crate::http1::ResponseHead;
use crate::stats::Stats;

pub mod html_guard;
pub mod placeholder;
pub mod promoted;
pub mod rewrite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginMode {
    Filter,
    Intercept,
}

impl PluginMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "filter" => Some(Self::Filter),
            "intercept" => Some(Self::Intercept),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderMode {
    Visible,
    Comment,
    None,
}

impl PlaceholderMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "visible" => Some(Self::Visible),
            "comment" => Some(Self::Comment),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Per-rule sub-result so one invocation applying several independent rules
/// reports each to stats separately.
#[derive(Debug, Clone)]
pub struct RuleHit {
    pub rule: String,
    pub count: u64,
    pub modified: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub matched: bool,
    pub modified: bool,
    /// Primary rule label: the first rule that produced a removal.
    pub rule: String,
    pub removed: u64,
    pub rules: Vec<RuleHit>,
}

impl FilterResult {
    pub fn unmatched() -> Self {
        Self::default()
    }
}

/// Request fields filters may scope on.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub headers: &'a [crate::http1::Header],
}

/// Configuration resolved for one plugin instance at startup.
#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub mode: PluginMode,
    pub placeholder: PlaceholderMode,
    pub priority: u16,
    pub domains: Vec<String>,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// The filter contract. `filter` returns the possibly new body (`None` means
/// unchanged) plus the stats result; errors abort the current response but
/// never the process.
pub trait ContentFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    fn default_domains(&self) -> &'static [&'static str];
    fn init(&mut self, settings: &PluginSettings) -> Result<(), ProxyError>;
    fn filter(
        &self,
        req: &RequestInfo<'_>,
        resp: &ResponseHead,
        body: &[u8],
    ) -> Result<(Option<Vec<u8>>, FilterResult), ProxyError>;
    /// Hot-reload hook; no-op for filters without external rule state.
    fn reload(&self) -> Result<(), ProxyError> {
        Ok(())
    }
}

type Constructor = fn() -> Box<dyn ContentFilter>;

fn new_promoted() -> Box<dyn ContentFilter> {
    Box::new(promoted::PromotedContentFilter::new())
}

fn new_rewrite() -> Box<dyn ContentFilter> {
    Box::new(rewrite::RewritePlugin::new())
}

/// Name → constructor registry of built-in filters.
fn registry() -> Vec<(&'static str, Constructor)> {
    vec![("promoted", new_promoted), ("rewrite", new_rewrite)]
}

struct ChainEntry {
    plugin: Arc<dyn ContentFilter>,
    priority: u16,
}

/// Priority-ordered plugin chains keyed by lowercased domain, built once at
/// startup.
pub struct PluginPipeline {
    chains: HashMap<String, Vec<ChainEntry>>,
    plugins: Vec<Arc<dyn ContentFilter>>,
    stats: Arc<Stats>,
}

impl std::fmt::Debug for PluginPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginPipeline")
            .field("chain_domains", &self.chains.len())
            .field("plugin_count", &self.plugins.len())
            .finish()
    }
}

impl PluginPipeline {
    pub fn empty(stats: Arc<Stats>) -> Self {
        Self {
            chains: HashMap::new(),
            plugins: Vec::new(),
            stats,
        }
    }

    /// Builds every configured plugin, rejecting the whole configuration with
    /// the full problem list when anything is off.
    pub fn build(cfg: &Config, stats: Arc<Stats>) -> Result<Self, ProxyError> {
        let constructors: HashMap<&str, Constructor> = registry().into_iter().collect();
        let mut problems = Vec::<String>::new();
        let mut plugins = Vec::<Arc<dyn ContentFilter>>::new();
        let mut chains: HashMap<String, Vec<ChainEntry>> = HashMap::new();
        let mut taken: HashMap<(String, u16), String> = HashMap::new();

        for (name, pcfg) in &cfg.plugins {
            if !pcfg.enabled {
                continue;
            }
            let Some(ctor) = constructors.get(name.as_str()) else {
                problems.push(format!("plugin `{name}` is not registered"));
                continue;
            };
            let mode = match pcfg.mode.as_deref() {
                None => PluginMode::Filter,
                Some(raw) => match PluginMode::parse(raw) {
                    Some(m) => m,
                    None => {
                        problems.push(format!("plugin `{name}`: mode `{raw}` is invalid"));
                        continue;
                    }
                },
            };
            let placeholder = match pcfg.placeholder.as_deref() {
                None => PlaceholderMode::Visible,
                Some(raw) => match PlaceholderMode::parse(raw) {
                    Some(p) => p,
                    None => {
                        problems.push(format!("plugin `{name}`: placeholder `{raw}` is invalid"));
                        continue;
                    }
                },
            };
            let priority = pcfg.priority.unwrap_or(DEFAULT_PLUGIN_PRIORITY);
            if !(1..=999).contains(&priority) {
                problems.push(format!(
                    "plugin `{name}`: priority {priority} is outside [1, 999]"
                ));
                continue;
            }

            let mut plugin = ctor();
            let domains: Vec<String> = match &pcfg.domains {
                Some(list) if !list.is_empty() => list.clone(),
                _ => plugin
                    .default_domains()
                    .iter()
                    .map(|d| d.to_string())
                    .collect(),
            };
            if domains.is_empty() {
                problems.push(format!("plugin `{name}` resolves to no domains"));
                continue;
            }
            let mut domain_problems = false;
            for domain in &domains {
                if !cfg.is_mitm_domain(domain) {
                    problems.push(format!(
                        "plugin `{name}`: domain `{domain}` is not in the interception policy"
                    ));
                    domain_problems = true;
                }
                if let Some(other) = taken.get(&(domain.clone(), priority)) {
                    problems.push(format!(
                        "plugin `{name}`: priority {priority} on `{domain}` already used by `{other}`"
                    ));
                    domain_problems = true;
                }
            }
            if domain_problems {
                continue;
            }

            let settings = PluginSettings {
                mode,
                placeholder,
                priority,
                domains: domains.clone(),
                options: pcfg.options.clone(),
            };
            if let Err(e) = plugin.init(&settings) {
                problems.push(format!("plugin `{name}`: init failed: {e}"));
                continue;
            }

            let plugin: Arc<dyn ContentFilter> = Arc::from(plugin);
            for domain in &domains {
                taken.insert((domain.clone(), priority), name.clone());
                chains
                    .entry(domain.clone())
                    .or_default()
                    .push(ChainEntry {
                        plugin: plugin.clone(),
                        priority,
                    });
            }
            plugins.push(plugin);
        }

        if !problems.is_empty() {
            return Err(ProxyError::Config(problems.join("; ")));
        }
        for chain in chains.values_mut() {
            chain.sort_by_key(|e| e.priority);
        }
        Ok(Self {
            chains,
            plugins,
            stats,
        })
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn ContentFilter>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    /// True when a response modifier is registered for the domain; half of
    /// the buffer-or-stream predicate.
    pub fn has_plugins_for(&self, domain: &str) -> bool {
        self.chains.contains_key(&domain.to_ascii_lowercase())
    }

    /// Runs the chain for the domain over the buffered body. Each plugin sees
    /// the previous plugin's output; a plugin error stops the chain and
    /// propagates to the session.
    pub fn modify(
        &self,
        domain: &str,
        req: &RequestInfo<'_>,
        resp: &ResponseHead,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, ProxyError> {
        let Some(chain) = self.chains.get(&domain.to_ascii_lowercase()) else {
            return Ok(body);
        };
        let mut current = body;
        for entry in chain {
            let name = entry.plugin.name();
            self.stats.plugin_inspected(name);
            let (output, result) = entry.plugin.filter(req, resp, &current)?;
            if !result.rules.is_empty() {
                for hit in &result.rules {
                    self.stats.plugin_match(name, &hit.rule, hit.modified, hit.count);
                }
            } else if result.matched {
                self.stats
                    .plugin_match(name, &result.rule, result.modified, result.removed);
            }
            if let Some(output) = output {
                current = output;
            }
        }
        Ok(current)
    }
}
