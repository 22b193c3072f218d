//! DNS Server Configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

use super::DnsError;

/// Authoritative DNS server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// UDP listen address (default: 0.0.0.0:53)
    pub udp_addr: SocketAddr,

    /// TCP listen address (default: 0.0.0.0:53)
    pub tcp_addr: SocketAddr,

    /// TCP connection limits
    pub tcp_limits: TcpLimitConfig,

    /// Nameservers placed in the NS set of every new domain
    pub nameservers: Vec<String>,

    /// Maximum CNAME links followed for one question
    pub max_cname_depth: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            udp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 53)),
            tcp_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 53)),
            tcp_limits: TcpLimitConfig::default(),
            nameservers: vec!["ns1.wired.network.".to_string(), "ns2.wired.network.".to_string()],
            max_cname_depth: 8,
        }
    }
}

impl DnsConfig {
    pub fn validate(&self) -> Result<(), DnsError> {
        if self.tcp_limits.max_connections == 0 {
            return Err(DnsError::ConfigError(
                "tcp_limits.max_connections must be > 0".to_string(),
            ));
        }

        if self.tcp_limits.idle_timeout_secs == 0 {
            return Err(DnsError::ConfigError(
                "tcp_limits.idle_timeout_secs must be > 0".to_string(),
            ));
        }

        if self.nameservers.is_empty() {
            return Err(DnsError::ConfigError(
                "at least one nameserver is required".to_string(),
            ));
        }

        if self.max_cname_depth == 0 {
            return Err(DnsError::ConfigError("max_cname_depth must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self, DnsError> {
        toml::from_str(content)
            .map_err(|e| DnsError::ConfigError(format!("TOML parse error: {}", e)))
    }
}

/// TCP connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpLimitConfig {
    /// Maximum concurrent TCP connections
    pub max_connections: usize,
    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,
}

impl Default for TcpLimitConfig {
    fn default() -> Self {
        Self {
            max_connections: 10000,
            idle_timeout_secs: 30,
        }
    }
}
