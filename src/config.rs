use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ProxyError;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:3128";
pub const DEFAULT_MGMT_PREFIX: &str = "/fps";
pub const DEFAULT_BODY_BUFFER_CAP: usize = 10 * 1024 * 1024;
pub const DEFAULT_PLUGIN_PRIORITY: u16 = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub transparent: TransparentConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub mitm: MitmConfig,
    #[serde(default)]
    pub block: BlockConfig,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub limits: LimitConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransparentConfig {
    #[serde(default)]
    pub http_addr: Option<String>,
    #[serde(default)]
    pub https_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_read_header_secs")]
    pub read_header_secs: u64,
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
    pub fn read_header(&self) -> Duration {
        Duration::from_secs(self.read_header_secs)
    }
    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown_secs)
    }
    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MitmConfig {
    #[serde(default = "default_ca_cert")]
    pub ca_cert: PathBuf,
    #[serde(default = "default_ca_key")]
    pub ca_key: PathBuf,
    /// Interception policy: exact lowercase domains for which TLS is terminated.
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub placeholder: Option<String>,
    #[serde(default)]
    pub priority: Option<u16>,
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: None,
            placeholder: None,
            priority: None,
            domains: None,
            options: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagementConfig {
    #[serde(default = "default_mgmt_prefix")]
    pub path_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    #[serde(default = "default_body_buffer_cap")]
    pub body_buffer_cap: usize,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.into()
}
fn default_connect_secs() -> u64 {
    10
}
fn default_read_header_secs() -> u64 {
    15
}
fn default_shutdown_secs() -> u64 {
    10
}
fn default_idle_secs() -> u64 {
    300
}
fn default_ca_cert() -> PathBuf {
    PathBuf::from("adscrub-ca/rootCA.pem")
}
fn default_ca_key() -> PathBuf {
    PathBuf::from("adscrub-ca/rootCA.key.pem")
}
fn default_mgmt_prefix() -> String {
    DEFAULT_MGMT_PREFIX.into()
}
fn default_body_buffer_cap() -> usize {
    DEFAULT_BODY_BUFFER_CAP
}
fn default_true() -> bool {
    true
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            read_header_secs: default_read_header_secs(),
            shutdown_secs: default_shutdown_secs(),
            idle_secs: default_idle_secs(),
        }
    }
}

impl Default for MitmConfig {
    fn default() -> Self {
        Self {
            ca_cert: default_ca_cert(),
            ca_key: default_ca_key(),
            domains: Vec::new(),
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            path_prefix: default_mgmt_prefix(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            body_buffer_cap: default_body_buffer_cap(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            transparent: TransparentConfig::default(),
            timeouts: TimeoutConfig::default(),
            mitm: MitmConfig::default(),
            block: BlockConfig::default(),
            plugins: BTreeMap::new(),
            management: ManagementConfig::default(),
            limits: LimitConfig::default(),
        }
    }
}

/// CLI-provided values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
}

impl Config {
    pub fn from_json_str(s: &str) -> Result<Self, ProxyError> {
        serde_json::from_str(s).map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn load(path: Option<&Path>, overrides: CliOverrides) -> Result<Self, ProxyError> {
        let mut cfg = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    ProxyError::Config(format!("cannot read {}: {}", p.display(), e))
                })?;
                Self::from_json_str(&raw)?
            }
            None => Self::default(),
        };
        if let Some(listen) = overrides.listen {
            cfg.listen = listen;
        }
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Lowercase every domain so policy checks are exact matches.
    fn normalize(&mut self) {
        for d in self.mitm.domains.iter_mut() {
            *d = d.trim().to_ascii_lowercase();
        }
        for d in self.block.domains.iter_mut() {
            *d = d.trim().to_ascii_lowercase();
        }
        for d in self.block.allow.iter_mut() {
            *d = d.trim().to_ascii_lowercase();
        }
        for plugin in self.plugins.values_mut() {
            if let Some(domains) = plugin.domains.as_mut() {
                for d in domains.iter_mut() {
                    *d = d.trim().to_ascii_lowercase();
                }
            }
        }
    }

    /// Collects every problem instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let mut problems = Vec::<String>::new();

        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            problems.push(format!("listen address `{}` is not a socket address", self.listen));
        }
        for (label, addr) in [
            ("transparent.http_addr", &self.transparent.http_addr),
            ("transparent.https_addr", &self.transparent.https_addr),
        ] {
            if let Some(a) = addr {
                if a.parse::<std::net::SocketAddr>().is_err() {
                    problems.push(format!("{label} `{a}` is not a socket address"));
                }
            }
        }
        if !self.management.path_prefix.starts_with('/') {
            problems.push(format!(
                "management.path_prefix `{}` must start with `/`",
                self.management.path_prefix
            ));
        }
        if self.limits.body_buffer_cap == 0 {
            problems.push("limits.body_buffer_cap must be non-zero".into());
        }
        for d in &self.mitm.domains {
            if d.is_empty() || d.contains(|c: char| c.is_whitespace() || c == '/') {
                problems.push(format!("mitm.domains entry `{d}` is not a bare domain"));
            }
        }
        if !self.mitm.domains.is_empty() {
            for (label, path) in [("mitm.ca_cert", &self.mitm.ca_cert), ("mitm.ca_key", &self.mitm.ca_key)] {
                if !path.exists() {
                    problems.push(format!(
                        "{label} `{}` does not exist; run `adscrub gen-ca` first",
                        path.display()
                    ));
                }
            }
        }
        for (name, plugin) in &self.plugins {
            if let Some(mode) = plugin.mode.as_deref() {
                if !matches!(mode, "filter" | "intercept") {
                    problems.push(format!("plugins.{name}.mode `{mode}` is not filter|intercept"));
                }
            }
            if let Some(ph) = plugin.placeholder.as_deref() {
                if !matches!(ph, "visible" | "comment" | "none") {
                    problems.push(format!(
                        "plugins.{name}.placeholder `{ph}` is not visible|comment|none"
                    ));
                }
            }
            if let Some(prio) = plugin.priority {
                if !(1..=999).contains(&prio) {
                    problems.push(format!("plugins.{name}.priority {prio} is outside [1, 999]"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Config(problems.join("; ")))
        }
    }

    pub fn is_mitm_domain(&self, domain: &str) -> bool {
        let lower = domain.to_ascii_lowercase();
        self.mitm.domains.iter().any(|d| d == &lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        cfg.validate().expect("default config is valid");
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
        assert_eq!(cfg.management.path_prefix, "/fps");
        assert_eq!(cfg.limits.body_buffer_cap, DEFAULT_BODY_BUFFER_CAP);
    }

    #[test]
    fn collects_every_problem() {
        let mut cfg = Config::default();
        cfg.listen = "not-an-addr".into();
        cfg.management.path_prefix = "fps".into();
        cfg.limits.body_buffer_cap = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("not-an-addr"));
        assert!(err.contains("path_prefix"));
        assert!(err.contains("body_buffer_cap"));
    }

    #[test]
    fn domains_are_lowercased() {
        let mut cfg = Config::from_json_str(
            r#"{"mitm": {"domains": ["Example.COM"]}, "block": {"domains": ["ADS.example.net"]}}"#,
        )
        .expect("parse");
        cfg.normalize();
        assert!(cfg.is_mitm_domain("EXAMPLE.com"));
        assert_eq!(cfg.block.domains, vec!["ads.example.net".to_string()]);
    }

    #[test]
    fn mitm_policy_without_ca_files_is_rejected() {
        let mut cfg = Config::default();
        cfg.mitm.domains = vec!["example.com".into()];
        cfg.mitm.ca_cert = PathBuf::from("/nonexistent/rootCA.pem");
        cfg.mitm.ca_key = PathBuf::from("/nonexistent/rootCA.key.pem");
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("gen-ca"));
    }
}
