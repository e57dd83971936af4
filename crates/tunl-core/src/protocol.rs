//! Protocol Selection
//!
//! A tunnel protocol plus, where it applies, the transmission mode used to
//! carry it. `Smart` is a meta-value: it asks the backend provider to pick
//! a concrete protocol and never reaches a backend itself.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    /// WireGuard (UDP, or TCP/TLS wrapped)
    WireGuard,
    /// Legacy OpenVPN
    OpenVpn,
    /// Legacy IKEv2/IPsec
    Ikev2,
    /// Unified transport negotiating entry IP/port/transmission per peer
    ProTun,
    /// Let the orchestrator choose
    Smart,
}

impl VpnProtocol {
    /// All concrete protocols
    pub fn concrete() -> &'static [VpnProtocol] {
        &[
            VpnProtocol::WireGuard,
            VpnProtocol::ProTun,
            VpnProtocol::Ikev2,
            VpnProtocol::OpenVpn,
        ]
    }

    /// Transmissions this protocol can be carried over.
    ///
    /// IKEv2 has no transmission choice, so the list is empty.
    pub fn transmissions(&self) -> &'static [TransmissionProtocol] {
        match self {
            VpnProtocol::WireGuard | VpnProtocol::ProTun => &[
                TransmissionProtocol::Udp,
                TransmissionProtocol::Tcp,
                TransmissionProtocol::Tls,
            ],
            VpnProtocol::OpenVpn => &[TransmissionProtocol::Udp, TransmissionProtocol::Tcp],
            VpnProtocol::Ikev2 | VpnProtocol::Smart => &[],
        }
    }

    /// Short lowercase name used in logs and config files
    pub fn name(&self) -> &'static str {
        match self {
            VpnProtocol::WireGuard => "wireguard",
            VpnProtocol::OpenVpn => "openvpn",
            VpnProtocol::Ikev2 => "ikev2",
            VpnProtocol::ProTun => "protun",
            VpnProtocol::Smart => "smart",
        }
    }
}

impl fmt::Display for VpnProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for VpnProtocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "wireguard" | "wg" => Ok(VpnProtocol::WireGuard),
            "openvpn" | "ovpn" => Ok(VpnProtocol::OpenVpn),
            "ikev2" => Ok(VpnProtocol::Ikev2),
            "protun" => Ok(VpnProtocol::ProTun),
            "smart" => Ok(VpnProtocol::Smart),
            _ => Err(ProtocolError::Unknown(s.to_string())),
        }
    }
}

/// Transmission sub-mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionProtocol {
    /// Datagram
    Udp,
    /// Stream
    Tcp,
    /// Obfuscated stream
    Tls,
}

impl TransmissionProtocol {
    /// Whether probing this transmission means opening a stream
    pub fn is_stream(&self) -> bool {
        matches!(self, TransmissionProtocol::Tcp | TransmissionProtocol::Tls)
    }
}

impl fmt::Display for TransmissionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmissionProtocol::Udp => f.write_str("udp"),
            TransmissionProtocol::Tcp => f.write_str("tcp"),
            TransmissionProtocol::Tls => f.write_str("tls"),
        }
    }
}

impl std::str::FromStr for TransmissionProtocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(TransmissionProtocol::Udp),
            "tcp" => Ok(TransmissionProtocol::Tcp),
            "tls" | "stealth" => Ok(TransmissionProtocol::Tls),
            _ => Err(ProtocolError::Unknown(s.to_string())),
        }
    }
}

/// Tunnel protocol together with its transmission mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolSelection {
    /// Protocol
    pub vpn: VpnProtocol,
    /// Transmission, `None` when the protocol has no choice or any is fine
    #[serde(default)]
    pub transmission: Option<TransmissionProtocol>,
}

impl ProtocolSelection {
    /// The "let the orchestrator choose" selection
    pub const SMART: ProtocolSelection = ProtocolSelection {
        vpn: VpnProtocol::Smart,
        transmission: None,
    };

    /// Create a selection, validating the transmission against the protocol
    pub fn new(
        vpn: VpnProtocol,
        transmission: Option<TransmissionProtocol>,
    ) -> Result<Self, ProtocolError> {
        if let Some(t) = transmission {
            if !vpn.transmissions().contains(&t) {
                return Err(ProtocolError::UnsupportedTransmission(vpn, t));
            }
        }
        Ok(Self { vpn, transmission })
    }

    /// Selection without a transmission preference
    pub fn of(vpn: VpnProtocol) -> Self {
        Self {
            vpn,
            transmission: None,
        }
    }

    /// Is this the Smart meta-selection?
    pub fn is_smart(&self) -> bool {
        self.vpn == VpnProtocol::Smart
    }

    /// Turn this selection into one a backend may receive.
    ///
    /// Smart is rejected; a missing transmission defaults to the protocol's
    /// first (datagram) transmission where the protocol has a choice.
    pub fn resolve_concrete(&self) -> Result<ProtocolSelection, ProtocolError> {
        if self.is_smart() {
            return Err(ProtocolError::SmartNotConcrete);
        }
        let transmission = self
            .transmission
            .or_else(|| self.vpn.transmissions().first().copied());
        Ok(ProtocolSelection {
            vpn: self.vpn,
            transmission,
        })
    }

    /// Transmissions this selection allows
    pub fn allowed_transmissions(&self) -> Vec<TransmissionProtocol> {
        match self.transmission {
            Some(t) => vec![t],
            None => self.vpn.transmissions().to_vec(),
        }
    }
}

impl Default for ProtocolSelection {
    fn default() -> Self {
        Self::SMART
    }
}

impl fmt::Display for ProtocolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transmission {
            Some(t) => write!(f, "{}/{}", self.vpn, t),
            None => write!(f, "{}", self.vpn),
        }
    }
}

impl std::str::FromStr for ProtocolSelection {
    type Err = ProtocolError;

    /// Parses `wireguard`, `wireguard/tcp`, `openvpn/udp`, `smart`...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((vpn, transmission)) => {
                ProtocolSelection::new(vpn.parse()?, Some(transmission.parse()?))
            }
            None => Ok(ProtocolSelection::of(s.parse()?)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown protocol: {0}")]
    Unknown(String),

    #[error("{0} does not support {1} transmission")]
    UnsupportedTransmission(VpnProtocol, TransmissionProtocol),

    #[error("Smart protocol must be resolved before reaching a backend")]
    SmartNotConcrete,
}
