//! Runtime configuration assembled from the command line.

use crate::sandbox::DEFAULT_TTL_MINUTES;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Only one session may run at a time.
    pub exclusive: bool,
    /// Log every status broadcast and gate transition.
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8888,
            exclusive: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub base_url: String,
    pub token: String,
    pub default_ttl_minutes: u32,
}

impl SandboxConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            default_ttl_minutes: DEFAULT_TTL_MINUTES,
        }
    }
}
