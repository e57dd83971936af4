//! Orchestrator Configuration
//!
//! Every knob of the connection engine: timeouts, retry policy, the Smart
//! protocol order, default ports, liveness checking and guest hole setup.
//!
//! # Usage
//!
//! ```rust,ignore
//! let config = OrchestratorConfig::load(Path::new("tunl.toml"))?;
//! config.validate()?;
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.

use crate::protocol::{ProtocolSelection, TransmissionProtocol, VpnProtocol};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    /// Parse a document in this format
    pub(crate) fn parse<T: serde::de::DeserializeOwned>(&self, content: &str) -> Result<T, ConfigError> {
        match self {
            ConfigFormat::Toml => {
                toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
            }
            ConfigFormat::Json => {
                serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
            }
        }
    }
}

/// Timeouts (milliseconds)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Single port probe
    pub probe_ms: u64,
    /// Whole discovery step of one backend
    pub discovery_ms: u64,
    /// Handshake, after which the attempt counts as a non-final failure
    pub handshake_ms: u64,
    /// Backend teardown
    pub disconnect_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe_ms: 3_000,
            discovery_ms: 5_000,
            handshake_ms: 15_000,
            disconnect_ms: 3_000,
        }
    }
}

impl Timeouts {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }
}

/// Fallback retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Connection attempts before a non-final error is surfaced
    pub max_attempts: u32,
    /// Delay before the first fallback
    pub initial_backoff_ms: u64,
    /// Growth factor between fallbacks
    pub multiplier: f64,
    /// Delay ceiling
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before fallback number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay ceiling, also the network re-check interval
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Smart protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartConfig {
    /// Concrete selections to try, fastest handshake first
    pub order: Vec<ProtocolSelection>,
    /// Prepare every backend in parallel and keep the lowest latency
    pub wait_for_all: bool,
    /// Ports probed per protocol/transmission
    pub max_ports_scanned: usize,
}

impl Default for SmartConfig {
    fn default() -> Self {
        use TransmissionProtocol::*;
        let sel = |vpn, transmission| ProtocolSelection { vpn, transmission };
        Self {
            order: vec![
                sel(VpnProtocol::WireGuard, Some(Udp)),
                sel(VpnProtocol::ProTun, None),
                sel(VpnProtocol::Ikev2, None),
                sel(VpnProtocol::OpenVpn, Some(Udp)),
                sel(VpnProtocol::OpenVpn, Some(Tcp)),
                sel(VpnProtocol::WireGuard, Some(Tcp)),
                sel(VpnProtocol::WireGuard, Some(Tls)),
            ],
            wait_for_all: false,
            max_ports_scanned: 16,
        }
    }
}

/// Default ports per protocol and transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub wireguard_udp: Vec<u16>,
    pub wireguard_tcp: Vec<u16>,
    pub wireguard_tls: Vec<u16>,
    pub openvpn_udp: Vec<u16>,
    pub openvpn_tcp: Vec<u16>,
    pub ikev2: Vec<u16>,
    pub protun: Vec<u16>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            wireguard_udp: vec![443, 88, 1224, 51820, 500, 4500],
            wireguard_tcp: vec![443],
            wireguard_tls: vec![443],
            openvpn_udp: vec![80, 51820, 4569, 1194, 5060],
            openvpn_tcp: vec![443, 7770, 8443],
            ikev2: vec![500, 4500],
            protun: vec![443],
        }
    }
}

impl PortConfig {
    /// Ports for a protocol and transmission
    pub fn ports(&self, protocol: VpnProtocol, transmission: Option<TransmissionProtocol>) -> &[u16] {
        use TransmissionProtocol::*;
        match (protocol, transmission) {
            (VpnProtocol::WireGuard, Some(Tcp)) => &self.wireguard_tcp,
            (VpnProtocol::WireGuard, Some(Tls)) => &self.wireguard_tls,
            (VpnProtocol::WireGuard, _) => &self.wireguard_udp,
            (VpnProtocol::OpenVpn, Some(Tcp)) => &self.openvpn_tcp,
            (VpnProtocol::OpenVpn, _) => &self.openvpn_udp,
            (VpnProtocol::Ikev2, _) => &self.ikev2,
            (VpnProtocol::ProTun, _) => &self.protun,
            (VpnProtocol::Smart, _) => &[],
        }
    }
}

/// Liveness checking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Check interval
    pub interval_ms: u64,
    /// Single check timeout
    pub check_timeout_ms: u64,
    /// Consecutive failures before reporting unreachable
    pub failure_threshold: u32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            check_timeout_ms: 2_000,
            failure_threshold: 3,
        }
    }
}

impl LivenessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

/// Guest hole settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestHoleConfig {
    /// Server ids usable as guest hole (looked up in the catalog)
    pub servers: Vec<String>,
    /// Servers tried per unblock
    pub server_count: usize,
    /// Time to reach Connected per server
    pub server_timeout_ms: u64,
    /// Bound for the whole unblock operation
    pub overall_timeout_ms: u64,
    /// Delay between Connected and running the call
    pub settle_ms: u64,
    /// Protocol used for guest hole tunnels
    pub protocol: ProtocolSelection,
}

impl Default for GuestHoleConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            server_count: 5,
            server_timeout_ms: 10_000,
            overall_timeout_ms: 50_000,
            settle_ms: 500,
            protocol: ProtocolSelection {
                vpn: VpnProtocol::OpenVpn,
                transmission: Some(TransmissionProtocol::Tcp),
            },
        }
    }
}

impl GuestHoleConfig {
    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Protocol used by `connect`
    pub protocol: ProtocolSelection,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub smart: SmartConfig,
    pub ports: PortConfig,
    pub liveness: LivenessConfig,
    pub guest_hole: GuestHoleConfig,
    /// CIDRs routed outside the tunnel
    pub split_tunnel: Vec<String>,
    /// DNS servers used inside the tunnel
    pub dns: Vec<IpAddr>,
    /// Route IPv6 through the tunnel
    pub enable_ipv6: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolSelection::SMART,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            smart: SmartConfig::default(),
            ports: PortConfig::default(),
            liveness: LivenessConfig::default(),
            guest_hole: GuestHoleConfig::default(),
            split_tunnel: Vec::new(),
            dns: vec![IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1))],
            enable_ipv6: false,
        }
    }
}

impl OrchestratorConfig {
    /// Load from a TOML or JSON file, chosen by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_str(&content, format)
    }

    /// Load from a string
    pub fn from_str(content: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        format.parse(content)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.probe_ms == 0 || self.timeouts.discovery_ms == 0 {
            return Err(ConfigError::InvalidTimeout("discovery"));
        }
        if self.timeouts.handshake_ms == 0 {
            return Err(ConfigError::InvalidTimeout("handshake"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidRetry);
        }
        if self.smart.order.is_empty() {
            return Err(ConfigError::EmptySmartOrder);
        }
        if let Some(sel) = self.smart.order.iter().find(|s| s.is_smart()) {
            return Err(ConfigError::InvalidProtocol(sel.to_string()));
        }
        if self.smart.max_ports_scanned == 0 {
            return Err(ConfigError::InvalidPorts);
        }
        if self.guest_hole.protocol.is_smart() {
            return Err(ConfigError::InvalidProtocol(self.guest_hole.protocol.to_string()));
        }
        if self.liveness.failure_threshold == 0 || self.liveness.interval_ms == 0 {
            return Err(ConfigError::InvalidLiveness);
        }
        for cidr in &self.split_tunnel {
            crate::params::Cidr::parse(cidr)
                .ok_or_else(|| ConfigError::InvalidCidr(cidr.clone()))?;
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,

    #[error("Invalid {0} timeout")]
    InvalidTimeout(&'static str),

    #[error("Retry multiplier must be at least 1")]
    InvalidRetry,

    #[error("Smart protocol order is empty")]
    EmptySmartOrder,

    #[error("Invalid protocol here: {0}")]
    InvalidProtocol(String),

    #[error("At least one port must be scanned")]
    InvalidPorts,

    #[error("Invalid liveness settings")]
    InvalidLiveness,

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.protocol.is_smart());
        assert_eq!(config.smart.order[0].vpn, VpnProtocol::WireGuard);
        assert_eq!(config.guest_hole.server_count, 5);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = OrchestratorConfig::from_str("", ConfigFormat::Toml).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let toml = r#"
            split_tunnel = ["192.168.0.0/16"]

            [retry]
            max_attempts = 5

            [smart]
            wait_for_all = true
            order = [{ vpn = "wireguard", transmission = "tcp" }]
        "#;
        let config = OrchestratorConfig::from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert!(config.smart.wait_for_all);
        assert_eq!(config.smart.order.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = OrchestratorConfig::default();
        let parsed = OrchestratorConfig::from_str(&config.to_toml(), ConfigFormat::Toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_json_config() {
        let json = r#"{"protocol": {"vpn": "openvpn", "transmission": "tcp"}}"#;
        let config = OrchestratorConfig::from_str(json, ConfigFormat::Json).unwrap();
        assert_eq!(config.protocol.vpn, VpnProtocol::OpenVpn);
    }

    #[test]
    fn test_validate_rejects_smart_in_order() {
        let mut config = OrchestratorConfig::default();
        config.smart.order.push(ProtocolSelection::SMART);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidProtocol(_))));
    }

    #[test]
    fn test_validate_rejects_bad_cidr() {
        let mut config = OrchestratorConfig::default();
        config.split_tunnel.push("10.0.0.0/40".into());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidCidr("10.0.0.0/40".into()))
        );
    }

    #[test]
    fn test_backoff() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(0), Duration::ZERO);
        assert_eq!(retry.backoff(1), Duration::from_millis(500));
        assert_eq!(retry.backoff(2), Duration::from_millis(1000));
        assert_eq!(retry.backoff(10), Duration::from_millis(5000));
    }

    #[test]
    fn test_ports_lookup() {
        let ports = PortConfig::default();
        assert_eq!(
            ports.ports(VpnProtocol::OpenVpn, Some(TransmissionProtocol::Tcp)),
            &[443, 7770, 8443]
        );
        assert_eq!(ports.ports(VpnProtocol::WireGuard, None)[0], 443);
    }

    #[test]
    fn test_unsupported_format() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("tunl.yaml")),
            Err(ConfigError::UnsupportedFormat)
        );
    }
}
