//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use crate::error::{Error, Result};
use crate::node::NodeName;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Protocol version negotiation bounds: the only semantic difference
/// between 1 and 2 is that `alive`/`indirectPing`/`pushNodeState` carry an
/// explicit port starting at version 2.
pub const PROTOCOL_VERSION_MIN: u8 = 1;
pub const PROTOCOL_VERSION_MAX: u8 = 2;

/// Node metadata is capped at 512 bytes. This is a protocol constant, not
/// something an embedder tunes.
pub const NODE_META_LIMIT: usize = 512;

/// Top-level struct holding all runtime configuration for a membership
/// instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Local node name. Must be unique cluster-wide.
    pub name: NodeName,

    pub bind_addr: IpAddr,
    pub bind_port: u16,

    /// Address/port advertised to peers, if different from the bind address
    /// (e.g. behind NAT). Defaults to the bind address/port.
    pub advertise_addr: Option<IpAddr>,
    pub advertise_port: Option<u16>,

    /// Protocol version vector (pcur, pmin/pmax implicit via the crate
    /// constants; dcur/dmin/dmax are the delegate's own negotiation range).
    pub protocol_version: u8,
    pub delegate_protocol_min: u8,
    pub delegate_protocol_max: u8,
    pub delegate_protocol_current: u8,

    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub indirect_checks: usize,
    pub suspicion_mult: u32,

    pub gossip_interval_ms: u64,
    pub gossip_nodes: usize,
    pub retransmit_mult: u32,

    pub push_pull_interval_ms: u64,
    pub tcp_timeout_ms: u64,

    /// Interval after which a node is fully reaped from the member list
    /// once it has been `dead`.
    pub dead_node_reclaim_ms: u64,

    pub enable_compression: bool,

    /// Base64-encoded 16-byte AES-128-GCM key. If absent, the keyring starts
    /// empty and encryption is disabled entirely.
    pub secret_key: Option<String>,
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables,
    /// layered over `Config::default()`.
    pub fn load() -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("SWIM_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validates invariants that `figment` cannot express: protocol version
    /// bounds and secret-key length. A failure here fails `Create` fatally.
    pub fn validate(&self) -> Result<()> {
        if !(PROTOCOL_VERSION_MIN..=PROTOCOL_VERSION_MAX).contains(&self.protocol_version) {
            return Err(Error::InvalidConfig(format!(
                "protocol_version {} outside supported range [{}, {}]",
                self.protocol_version, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX
            )));
        }
        if self.delegate_protocol_min > self.delegate_protocol_max
            || !(self.delegate_protocol_min..=self.delegate_protocol_max)
                .contains(&self.delegate_protocol_current)
        {
            return Err(Error::InvalidConfig(
                "delegate protocol version vector is inconsistent".into(),
            ));
        }
        if let Some(key) = &self.secret_key {
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, key)
                .map_err(|e| Error::InvalidConfig(format!("secret_key is not valid base64: {e}")))?;
            if bytes.len() != 16 {
                return Err(Error::InvalidConfig(format!(
                    "secret_key must decode to 16 bytes for AES-128-GCM, got {}",
                    bytes.len()
                )));
            }
        }
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn push_pull_interval(&self) -> Duration {
        Duration::from_millis(self.push_pull_interval_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn dead_node_reclaim(&self) -> Duration {
        Duration::from_millis(self.dead_node_reclaim_ms)
    }

    /// The address this node advertises to the rest of the cluster.
    pub fn advertise_addr(&self) -> IpAddr {
        self.advertise_addr.unwrap_or(self.bind_addr)
    }

    pub fn advertise_port(&self) -> u16 {
        self.advertise_port.unwrap_or(self.bind_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: NodeName::new("node-1"),
            bind_addr: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            bind_port: 7946,
            advertise_addr: None,
            advertise_port: None,
            protocol_version: PROTOCOL_VERSION_MAX,
            delegate_protocol_min: 0,
            delegate_protocol_max: 1,
            delegate_protocol_current: 1,
            probe_interval_ms: 1_000,
            probe_timeout_ms: 500,
            indirect_checks: 3,
            suspicion_mult: 4,
            gossip_interval_ms: 200,
            gossip_nodes: 3,
            retransmit_mult: 4,
            push_pull_interval_ms: 30_000,
            tcp_timeout_ms: 10_000,
            dead_node_reclaim_ms: 60_000,
            enable_compression: false,
            secret_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_pass_validation() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_protocol_version_outside_range() {
        let config = Config {
            protocol_version: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            protocol_version: 3,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_secret_key() {
        let config = Config {
            secret_key: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                b"too-short",
            )),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_16_byte_secret_key() {
        let config = Config {
            secret_key: Some(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                [7u8; 16],
            )),
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_loading_from_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            let config_content = r#"
                name = "seed-a"
                bind_addr = "127.0.0.1"
                bind_port = 1234
                gossip_interval_ms = 100
                gossip_nodes = 5
            "#;
            jail.create_file("config.toml", config_content)?;

            let config = Config::load().unwrap();
            assert_eq!(config.name, NodeName::new("seed-a"));
            assert_eq!(config.bind_port, 1234);
            assert_eq!(config.gossip_nodes, 5);
            // Untouched fields keep their defaults.
            assert_eq!(config.probe_interval_ms, Config::default().probe_interval_ms);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("config.toml", r#"bind_port = 1111"#)?;
            jail.set_env("SWIM_BIND_PORT", "9999");
            let config = Config::load().unwrap();
            assert_eq!(config.bind_port, 9999);
            Ok(())
        });
    }
}
