//! Server model
//!
//! A logical [`Server`] is what the resolver hands back for an intent: an
//! identity plus one or more [`ConnectingDomain`]s, each listing which
//! protocols (and optionally which ports) it accepts.

use crate::intent::ServerFeature;
use crate::protocol::{ProtocolSelection, TransmissionProtocol, VpnProtocol};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Protocol support advertised by a connecting domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainProtocol {
    /// Protocol
    pub protocol: VpnProtocol,
    /// Supported transmissions (empty = everything the protocol supports)
    #[serde(default)]
    pub transmissions: Vec<TransmissionProtocol>,
    /// Port override (empty = configured defaults)
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl DomainProtocol {
    /// Support for every transmission on default ports
    pub fn all(protocol: VpnProtocol) -> Self {
        Self {
            protocol,
            transmissions: Vec::new(),
            ports: Vec::new(),
        }
    }

    fn allows(&self, transmission: Option<TransmissionProtocol>) -> bool {
        match transmission {
            None => true,
            Some(t) => {
                let supported = if self.transmissions.is_empty() {
                    self.protocol.transmissions()
                } else {
                    self.transmissions.as_slice()
                };
                supported.contains(&t)
            }
        }
    }
}

/// Entry point of a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectingDomain {
    /// Domain identifier
    pub id: String,
    /// Entry hostname (also used as TLS SNI / IKE remote id)
    pub entry_domain: String,
    /// Entry IP address
    pub entry_ip: IpAddr,
    /// Exit IP address (differs from entry for secure core)
    pub exit_ip: IpAddr,
    /// WireGuard public key of the peer (base64)
    #[serde(default)]
    pub public_key: Option<String>,
    /// Supported protocols
    #[serde(default)]
    pub protocols: Vec<DomainProtocol>,
    /// Is this domain taking connections?
    #[serde(default = "default_true")]
    pub online: bool,
}

fn default_true() -> bool {
    true
}

impl ConnectingDomain {
    /// Does this domain accept the given selection?
    ///
    /// A Smart selection is accepted when any protocol is listed.
    pub fn supports(&self, selection: &ProtocolSelection) -> bool {
        if !self.online {
            return false;
        }
        if selection.is_smart() {
            return !self.protocols.is_empty();
        }
        self.protocols
            .iter()
            .any(|p| p.protocol == selection.vpn && p.allows(selection.transmission))
    }

    /// Port override for a protocol, if the domain carries one
    pub fn port_override(&self, protocol: VpnProtocol) -> Option<&[u16]> {
        self.protocols
            .iter()
            .find(|p| p.protocol == protocol && !p.ports.is_empty())
            .map(|p| p.ports.as_slice())
    }

    /// Transmissions of `protocol` this domain accepts out of `wanted`
    pub fn transmissions_for(
        &self,
        protocol: VpnProtocol,
        wanted: &[TransmissionProtocol],
    ) -> Vec<TransmissionProtocol> {
        wanted
            .iter()
            .copied()
            .filter(|t| self.supports(&ProtocolSelection { vpn: protocol, transmission: Some(*t) }))
            .collect()
    }
}

/// Logical VPN server, also the unit the resolver returns as a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Server identifier
    pub id: String,
    /// Display name (e.g. "CH#12")
    pub name: String,
    /// Exit country code
    pub exit_country: String,
    /// Entry country code (secure core only)
    #[serde(default)]
    pub entry_country: Option<String>,
    /// City
    #[serde(default)]
    pub city: Option<String>,
    /// Features
    #[serde(default)]
    pub features: Vec<ServerFeature>,
    /// Plan tier needed
    #[serde(default)]
    pub tier: u8,
    /// Load percentage
    #[serde(default)]
    pub load: u8,
    /// Lower is better
    #[serde(default)]
    pub score: f32,
    /// Is the server online?
    #[serde(default = "default_true")]
    pub online: bool,
    /// Gateway name, for dedicated gateway servers
    #[serde(default)]
    pub gateway: Option<String>,
    /// Connecting domains
    pub domains: Vec<ConnectingDomain>,
}

impl Server {
    /// Is this a secure core server?
    pub fn is_secure_core(&self) -> bool {
        self.features.contains(&ServerFeature::SecureCore)
    }

    /// Does any domain accept the selection?
    pub fn supports(&self, selection: &ProtocolSelection) -> bool {
        self.domains.iter().any(|d| d.supports(selection))
    }

    /// Domains accepting the selection
    pub fn domains_for(&self, selection: &ProtocolSelection) -> Vec<&ConnectingDomain> {
        self.domains.iter().filter(|d| d.supports(selection)).collect()
    }

    /// Has every one of the given features?
    pub fn has_features(&self, features: &[ServerFeature]) -> bool {
        features.iter().all(|f| self.features.contains(f))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use std::net::Ipv4Addr;

    pub fn domain(id: &str, protocols: Vec<DomainProtocol>) -> ConnectingDomain {
        ConnectingDomain {
            id: id.to_string(),
            entry_domain: format!("{}.example.net", id),
            entry_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            exit_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            public_key: None,
            protocols,
            online: true,
        }
    }

    pub fn server(id: &str, country: &str, domains: Vec<ConnectingDomain>) -> Server {
        Server {
            id: id.to_string(),
            name: format!("{}#{}", country, id),
            exit_country: country.to_string(),
            entry_country: None,
            city: None,
            features: Vec::new(),
            tier: 0,
            load: 10,
            score: 1.0,
            online: true,
            gateway: None,
            domains,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_domain_supports() {
        let d = domain(
            "d1",
            vec![DomainProtocol {
                protocol: VpnProtocol::OpenVpn,
                transmissions: vec![TransmissionProtocol::Tcp],
                ports: vec![],
            }],
        );
        let tcp: ProtocolSelection = "openvpn/tcp".parse().unwrap();
        let udp: ProtocolSelection = "openvpn/udp".parse().unwrap();
        assert!(d.supports(&tcp));
        assert!(!d.supports(&udp));
        assert!(d.supports(&ProtocolSelection::of(VpnProtocol::OpenVpn)));
        assert!(!d.supports(&ProtocolSelection::of(VpnProtocol::WireGuard)));
    }

    #[test]
    fn test_offline_domain_supports_nothing() {
        let mut d = domain("d1", vec![DomainProtocol::all(VpnProtocol::WireGuard)]);
        d.online = false;
        assert!(!d.supports(&ProtocolSelection::SMART));
    }

    #[test]
    fn test_port_override() {
        let d = domain(
            "d1",
            vec![DomainProtocol {
                protocol: VpnProtocol::WireGuard,
                transmissions: vec![],
                ports: vec![51820],
            }],
        );
        assert_eq!(d.port_override(VpnProtocol::WireGuard), Some(&[51820u16][..]));
        assert_eq!(d.port_override(VpnProtocol::OpenVpn), None);
    }

    #[test]
    fn test_server_domains_for() {
        let s = server(
            "X",
            "CH",
            vec![
                domain("a", vec![DomainProtocol::all(VpnProtocol::Ikev2)]),
                domain("b", vec![DomainProtocol::all(VpnProtocol::WireGuard)]),
            ],
        );
        let wg = ProtocolSelection::of(VpnProtocol::WireGuard);
        assert_eq!(s.domains_for(&wg).len(), 1);
        assert!(s.supports(&ProtocolSelection::SMART));
    }
}
