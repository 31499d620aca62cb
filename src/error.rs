use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("certificate authority error: {0}")]
    Ca(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("malformed http: {0}")]
    Http(String),
    #[error("upstream dial failed for {host}: {source}")]
    UpstreamDial {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("upstream dial timed out for {0}")]
    UpstreamTimeout(String),
    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },
    #[error("rule store error: {0}")]
    Store(String),
    #[error("rule not found: {0}")]
    RuleNotFound(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}
