use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::acme::AcmeConfig;
use crate::dns::DnsConfig;
use crate::nodes::{binary_hash, Location, NodeInfo};
use crate::protocol::MasterConfig;
use crate::proxy::ProxyConfig;
use crate::snowflake::MAX_MACHINE_ID;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSection,
    pub master: MasterSection,
    pub paths: PathsConfig,
    pub dns: DnsConfig,
    pub proxy: ProxyConfig,
    pub acme: AcmeConfig,
    pub geoip: GeoIpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Principal name, also the key file name under `paths.keys`
    pub key: String,
    /// Master address (`host:port`)
    pub gateway: String,
    /// Snowflake machine id, unique per node
    pub machine_id: u16,
    /// Public addresses handed out in geo answers
    pub listeners: Vec<IpAddr>,
    pub location: Option<Location>,
    pub modules: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            key: "edge".to_string(),
            gateway: "127.0.0.1:2000".to_string(),
            machine_id: 1,
            listeners: Vec::new(),
            location: None,
            modules: vec!["dns".to_string(), "proxy".to_string()],
        }
    }
}

impl NodeSection {
    /// Login identity for this node
    pub fn node_info(&self) -> NodeInfo {
        let mut info = NodeInfo::new(self.key.clone())
            .with_listeners(self.listeners.clone())
            .with_modules(self.modules.clone());
        if let Some(location) = self.location {
            info = info.with_location(location);
        }
        match binary_hash() {
            Ok(hash) => info = info.with_hash(hash),
            Err(e) => warn!("Cannot hash the running binary: {}", e),
        }
        info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterSection {
    /// Run as the master instead of an edge node
    pub enabled: bool,
    pub listen_addr: SocketAddr,
    pub challenge_ttl_secs: u64,
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 2000)),
            challenge_ttl_secs: 30,
            handshake_timeout_secs: 10,
            idle_timeout_secs: 90,
        }
    }
}

impl MasterSection {
    pub fn master_config(&self) -> MasterConfig {
        MasterConfig {
            listen_addr: self.listen_addr,
            challenge_ttl: Duration::from_secs(self.challenge_ttl_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// `<name>-private.pem` and `<name>-public.pem` key pairs
    pub keys: PathBuf,
    pub zones: PathBuf,
    pub certs: PathBuf,
    /// Holds `error.html`
    pub public: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            keys: PathBuf::from("keys"),
            zones: PathBuf::from("zones"),
            certs: PathBuf::from("certs"),
            public: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoIpConfig {
    /// MaxMind City (or Country) database
    pub city_db: Option<PathBuf>,
    pub asn_db: Option<PathBuf>,
    /// Used for clients the database cannot place
    pub default_location: Option<Location>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = &self.node.key;
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(ConfigError::Invalid(format!("node.key '{}' is not a valid key name", key)));
        }

        if self.node.machine_id > MAX_MACHINE_ID {
            return Err(ConfigError::Invalid(format!(
                "node.machine_id must be <= {}",
                MAX_MACHINE_ID
            )));
        }

        if !self.master.enabled && self.node.gateway.is_empty() {
            return Err(ConfigError::Invalid("node.gateway is required".to_string()));
        }

        if self.master.challenge_ttl_secs == 0 || self.master.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("master timeouts must be > 0".to_string()));
        }

        self.dns
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.proxy.backend_timeout_secs == 0 {
            return Err(ConfigError::Invalid("proxy.backend_timeout_secs must be > 0".to_string()));
        }

        if self.acme.enabled && self.acme.batch_size == 0 {
            return Err(ConfigError::Invalid("acme.batch_size must be > 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.key, "edge");
        assert_eq!(config.master.listen_addr.port(), 2000);
        assert_eq!(config.dns.udp_addr.port(), 53);
        assert_eq!(config.proxy.http_addr.port(), 80);
        assert_eq!(config.proxy.https_addr.port(), 443);
        assert!(!config.master.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_fails_bad_machine_id() {
        let mut config = Config::default();
        config.node.machine_id = MAX_MACHINE_ID + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_fails_bad_key() {
        let mut config = Config::default();
        config.node.key = "../master".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [node]
            key = "edge-a"
            gateway = "master.wired.test:2000"
            machine_id = 12
            listeners = ["192.0.2.10"]
            location = { lat = 40.7, lon = -74.0 }

            [paths]
            keys = "/etc/wired/keys"

            [dns]
            udp_addr = "0.0.0.0:5353"

            [acme]
            enabled = true
            contact = "ops@wired.test"
        "#;

        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.node.key, "edge-a");
        assert_eq!(config.node.machine_id, 12);
        assert_eq!(config.paths.keys, PathBuf::from("/etc/wired/keys"));
        assert_eq!(config.paths.zones, PathBuf::from("zones"));
        assert_eq!(config.dns.udp_addr.port(), 5353);
        assert!(config.acme.enabled);
        assert_eq!(config.acme.batch_size, 100);

        let info = config.node.node_info();
        assert_eq!(info.listeners, vec!["192.0.2.10".parse::<IpAddr>().unwrap()]);
        assert_eq!(info.location, Location::new(40.7, -74.0));
        assert_eq!(info.hash.len(), 64);
        assert!(info.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wired.toml");
        let original = Config::default();
        original.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(original.node.gateway, loaded.node.gateway);
        assert_eq!(original.dns.nameservers, loaded.dns.nameservers);
    }

    #[test]
    fn test_master_config_conversion() {
        let section = MasterSection::default();
        let config = section.master_config();
        assert_eq!(config.challenge_ttl, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }
}
