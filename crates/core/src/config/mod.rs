use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::Result;

/// Port used by both ends when nothing else is configured.
pub const DEFAULT_PORT: u16 = 10100;
/// Packet size assumed to fit a single datagram on common networks.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 1400;

/// Selects the wire strategy used by a distribution domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// State travels as a single OSC blob message.
    #[default]
    Osc,
    /// State travels as raw, possibly fragmented, broadcast datagrams.
    Broadcast,
    /// In-process bus, for tests and single-process setups.
    Loopback,
}

/// Network parameters of a single send or receive domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    pub address: String,
    pub port: u16,
    pub max_packet_size: u16,
    pub transport: TransportKind,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self::receiver_defaults()
    }
}

impl DistributionConfig {
    /// Listen on every interface at the default port.
    pub fn receiver_defaults() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            transport: TransportKind::default(),
        }
    }

    /// Send to the local host at the default port.
    pub fn sender_defaults() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            ..Self::receiver_defaults()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(deserialize_with = "sender_overrides")]
    pub sender: DistributionConfig,
    #[serde(deserialize_with = "receiver_overrides")]
    pub receiver: DistributionConfig,
    pub tick_rate_hz: f32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sender: DistributionConfig::sender_defaults(),
            receiver: DistributionConfig::receiver_defaults(),
            tick_rate_hz: 60.0,
        }
    }
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Partially specified [`DistributionConfig`]; unset fields keep the role's defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DistributionOverrides {
    address: Option<String>,
    port: Option<u16>,
    max_packet_size: Option<u16>,
    transport: Option<TransportKind>,
}

impl DistributionOverrides {
    fn apply(self, base: DistributionConfig) -> DistributionConfig {
        DistributionConfig {
            address: self.address.unwrap_or(base.address),
            port: self.port.unwrap_or(base.port),
            max_packet_size: self.max_packet_size.unwrap_or(base.max_packet_size),
            transport: self.transport.unwrap_or(base.transport),
        }
    }
}

fn sender_overrides<'de, D>(deserializer: D) -> std::result::Result<DistributionConfig, D::Error>
where
    D: Deserializer<'de>,
{
    DistributionOverrides::deserialize(deserializer)
        .map(|overrides| overrides.apply(DistributionConfig::sender_defaults()))
}

fn receiver_overrides<'de, D>(deserializer: D) -> std::result::Result<DistributionConfig, D::Error>
where
    D: Deserializer<'de>,
{
    DistributionOverrides::deserialize(deserializer)
        .map(|overrides| overrides.apply(DistributionConfig::receiver_defaults()))
}
