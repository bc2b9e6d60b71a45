//! kappa.toml configuration.
//!
//! ```toml
//! node_name = "kappa-1"
//! cluster_name = "local"
//! bind_address = ":9022"
//! authorized_keys = "/etc/kappa/authorized_keys"
//! existing_nodes = ["10.0.0.1:7946"]
//! bootstrap_expect = 3
//!
//! [gossip]
//! bind_addr = "0.0.0.0"
//! bind_port = 7946
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kappa_membership::DEFAULT_GOSSIP_PORT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("authorized keys line {line}: {reason}")]
    AuthorizedKeys { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node_name: String,
    pub cluster_name: String,
    /// Build identifier advertised in gossip tags.
    pub build: String,
    /// `host:port` or `:port`.
    pub bind_address: String,
    pub accept_deadline_ms: u64,
    pub host_cert: Option<PathBuf>,
    pub host_key: Option<PathBuf>,
    pub authorized_keys: Option<PathBuf>,
    /// Gossip seeds joined on start.
    pub existing_nodes: Vec<String>,
    /// Form a single-node cluster.
    pub bootstrap: bool,
    /// Number of servers to wait for before forming the cluster.
    pub bootstrap_expect: usize,
    pub datacenter: Option<String>,
    pub service: Option<String>,
    pub reconcile_buffer: usize,
    pub event_buffer: usize,
    pub user_event_buffer: usize,
    pub gossip: GossipSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            cluster_name: "local".to_string(),
            build: env!("CARGO_PKG_VERSION").to_string(),
            bind_address: ":9022".to_string(),
            accept_deadline_ms: 1000,
            host_cert: None,
            host_key: None,
            authorized_keys: None,
            existing_nodes: Vec::new(),
            bootstrap: false,
            bootstrap_expect: 0,
            datacenter: None,
            service: None,
            reconcile_buffer: 32,
            event_buffer: 256,
            user_event_buffer: 256,
            gossip: GossipSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipSection {
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    pub advertise_addr: Option<IpAddr>,
    pub advertise_port: Option<u16>,
}

impl Default for GossipSection {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            bind_port: DEFAULT_GOSSIP_PORT,
            advertise_addr: None,
            advertise_port: None,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn accept_deadline(&self) -> Duration {
        Duration::from_millis(self.accept_deadline_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name must be set".into()));
        }
        if self.cluster_name.trim().is_empty() {
            return Err(ConfigError::Invalid("cluster_name must be set".into()));
        }
        if self.bind_address.is_empty() {
            return Err(ConfigError::Invalid("bind_address must be set".into()));
        }
        if self.bootstrap && self.bootstrap_expect != 0 {
            return Err(ConfigError::Invalid(
                "bootstrap and bootstrap_expect are mutually exclusive".into(),
            ));
        }
        if self.bootstrap_expect == 1 {
            return Err(ConfigError::Invalid(
                "bootstrap_expect of 1 is not allowed, use bootstrap instead".into(),
            ));
        }
        if self.host_cert.is_some() != self.host_key.is_some() {
            return Err(ConfigError::Invalid(
                "host_cert and host_key must be set together".into(),
            ));
        }
        for (name, value) in [
            ("reconcile_buffer", self.reconcile_buffer),
            ("event_buffer", self.event_buffer),
            ("user_event_buffer", self.user_event_buffer),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn named() -> ServerConfig {
        ServerConfig {
            node_name: "kappa-1".into(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn defaults_apply_to_missing_fields() {
        let cfg = ServerConfig::from_toml_str("node_name = \"n1\"\n").unwrap();
        assert_eq!(cfg.node_name, "n1");
        assert_eq!(cfg.bind_address, ":9022");
        assert_eq!(cfg.accept_deadline(), Duration::from_secs(1));
        assert_eq!(cfg.reconcile_buffer, 32);
        assert_eq!(cfg.gossip.bind_port, 7946);
        cfg.validate().unwrap();
    }

    #[test]
    fn parses_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
node_name = "kappa-2"
cluster_name = "prod"
bind_address = "127.0.0.1:9100"
existing_nodes = ["10.0.0.1:7946", "10.0.0.2:7946"]
bootstrap_expect = 3
datacenter = "dc1"

[gossip]
bind_addr = "127.0.0.1"
bind_port = 8000
advertise_addr = "192.168.1.5"
"#
        )
        .unwrap();

        let cfg = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.cluster_name, "prod");
        assert_eq!(cfg.existing_nodes.len(), 2);
        assert_eq!(cfg.bootstrap_expect, 3);
        assert_eq!(cfg.datacenter.as_deref(), Some("dc1"));
        assert_eq!(cfg.gossip.bind_port, 8000);
        assert_eq!(cfg.gossip.advertise_addr, Some("192.168.1.5".parse().unwrap()));
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ServerConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            ServerConfig::from_toml_str("node_name = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn validation_rules() {
        assert!(ServerConfig::default().validate().is_err());

        let mut cfg = named();
        cfg.cluster_name = " ".into();
        assert!(cfg.validate().is_err());

        let mut cfg = named();
        cfg.bootstrap = true;
        cfg.bootstrap_expect = 3;
        assert!(cfg.validate().is_err());

        let mut cfg = named();
        cfg.bootstrap_expect = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = named();
        cfg.host_cert = Some("cert.pem".into());
        assert!(cfg.validate().is_err());

        let mut cfg = named();
        cfg.event_buffer = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = named();
        cfg.bootstrap = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn serializes_back_to_toml() {
        let text = named().to_toml_string().unwrap();
        let back = ServerConfig::from_toml_str(&text).unwrap();
        assert_eq!(back, named());
    }
}
