//! Connection Parameters
//!
//! Fully resolved, protocol-specific parameters produced by a backend's
//! discovery step, plus the routing helpers used to build them.

use crate::config::OrchestratorConfig;
use crate::intent::ConnectIntent;
use crate::protocol::{ProtocolSelection, TransmissionProtocol, VpnProtocol};
use crate::server::{ConnectingDomain, Server};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Network address (host bits cleared)
    pub addr: IpAddr,
    /// Prefix length
    pub prefix: u8,
}

impl Cidr {
    /// Every IPv4 address
    pub const ALL_V4: Cidr = Cidr {
        addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        prefix: 0,
    };

    /// Every IPv6 address
    pub const ALL_V6: Cidr = Cidr {
        addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        prefix: 0,
    };

    /// Parse CIDR notation (e.g. "10.0.0.0/8"), clearing host bits.
    /// A bare address is a host route.
    pub fn parse(s: &str) -> Option<Cidr> {
        let (ip, prefix) = match s.split_once('/') {
            Some((ip, prefix)) => {
                let ip: IpAddr = ip.trim().parse().ok()?;
                (ip, prefix.trim().parse::<u8>().ok()?)
            }
            None => {
                let ip: IpAddr = s.trim().parse().ok()?;
                (ip, width(&ip))
            }
        };
        if prefix > width(&ip) {
            return None;
        }
        Some(Self::from_bits(to_bits(&ip), prefix, ip.is_ipv6()))
    }

    /// Does this block contain `other`?
    pub fn contains(&self, other: &Cidr) -> bool {
        self.addr.is_ipv6() == other.addr.is_ipv6()
            && other.prefix >= self.prefix
            && mask(to_bits(&other.addr), self.prefix, width(&self.addr)) == to_bits(&self.addr)
    }

    fn overlaps(&self, other: &Cidr) -> bool {
        self.contains(other) || other.contains(self)
    }

    fn halves(&self) -> (Cidr, Cidr) {
        let w = width(&self.addr);
        let v6 = self.addr.is_ipv6();
        let bits = to_bits(&self.addr);
        let high_bit = 1u128 << (w - self.prefix - 1);
        (
            Self::from_bits(bits, self.prefix + 1, v6),
            Self::from_bits(bits | high_bit, self.prefix + 1, v6),
        )
    }

    fn from_bits(bits: u128, prefix: u8, v6: bool) -> Cidr {
        let addr = if v6 {
            IpAddr::V6(Ipv6Addr::from(mask(bits, prefix, 128)))
        } else {
            IpAddr::V4(Ipv4Addr::from(mask(bits, prefix, 32) as u32))
        };
        Cidr { addr, prefix }
    }

    /// This block with `excluded` removed, as the fewest blocks
    fn subtract(self, excluded: &Cidr) -> Vec<Cidr> {
        if !self.overlaps(excluded) {
            return vec![self];
        }
        if excluded.contains(&self) {
            return Vec::new();
        }
        let (low, high) = self.halves();
        let mut out = low.subtract(excluded);
        out.extend(high.subtract(excluded));
        out
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

fn width(ip: &IpAddr) -> u8 {
    if ip.is_ipv6() { 128 } else { 32 }
}

fn to_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn mask(bits: u128, prefix: u8, width: u8) -> u128 {
    let host_bits = (width - prefix) as u32;
    if host_bits >= 128 {
        0
    } else {
        (bits >> host_bits) << host_bits
    }
}

/// Routes sent through the tunnel: everything minus the excluded blocks.
///
/// IPv6 is only routed when enabled. Unparseable exclusions are skipped
/// (the config validator reports them).
pub fn compute_allowed_ips(excluded: &[String], ipv6: bool) -> Vec<Cidr> {
    let excluded: Vec<Cidr> = excluded.iter().filter_map(|s| Cidr::parse(s)).collect();
    let mut roots = vec![Cidr::ALL_V4];
    if ipv6 {
        roots.push(Cidr::ALL_V6);
    }
    excluded.iter().fold(roots, |blocks, ex| {
        blocks.into_iter().flat_map(|b| b.subtract(ex)).collect()
    })
}

/// A ProTun peer: one negotiated way into the same server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProTunPeer {
    /// Connecting domain id
    pub domain_id: String,
    /// Entry endpoint
    pub entry: SocketAddr,
    /// Transmission negotiated for this peer
    pub transmission: TransmissionProtocol,
}

/// Fully resolved parameters for one tunnel
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Unique id of this parameter set
    pub id: u64,
    /// Intent that produced it
    pub intent: ConnectIntent,
    /// Logical server
    pub server: Server,
    /// Chosen connecting domain
    pub domain: ConnectingDomain,
    /// Concrete protocol (never Smart)
    pub protocol: ProtocolSelection,
    /// Entry endpoint
    pub entry: SocketAddr,
    /// Peer public key (WireGuard family)
    pub peer_public_key: Option<String>,
    /// Routes through the tunnel
    pub allowed_ips: Vec<Cidr>,
    /// DNS servers inside the tunnel
    pub dns: Vec<IpAddr>,
    /// IPv6 routed through the tunnel
    pub ipv6: bool,
    /// ProTun peers, best first (empty for other protocols)
    pub peers: Vec<ProTunPeer>,
}

impl ConnectionParams {
    /// Build parameters for a concrete selection and entry endpoint
    pub fn new(
        intent: &ConnectIntent,
        server: &Server,
        domain: &ConnectingDomain,
        protocol: ProtocolSelection,
        entry: SocketAddr,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            id: rand::random(),
            intent: intent.clone(),
            server: server.clone(),
            domain: domain.clone(),
            protocol,
            entry,
            peer_public_key: domain.public_key.clone(),
            allowed_ips: compute_allowed_ips(&config.split_tunnel, config.enable_ipv6),
            dns: config.dns.clone(),
            ipv6: config.enable_ipv6,
            peers: Vec::new(),
        }
    }

    /// Attach ProTun peers
    pub fn with_peers(mut self, peers: Vec<ProTunPeer>) -> Self {
        self.peers = peers;
        self
    }

    /// Protocol of these parameters
    pub fn vpn_protocol(&self) -> VpnProtocol {
        self.protocol.vpn
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} ({}) at {}",
            self.server.name, self.protocol, self.domain.entry_domain, self.entry
        )
    }
}

/// Outcome of one backend's discovery step, ready to be connected
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareResult {
    /// Backend that produced it (the provider's lookup key)
    pub backend: VpnProtocol,
    /// Parameters to connect with
    pub params: ConnectionParams,
    /// Probe round trip, when the entry was scanned
    pub rtt: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cidrs(list: &[Cidr]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_cidr_parse() {
        let c = Cidr::parse("10.1.2.3/8").unwrap();
        assert_eq!(c.to_string(), "10.0.0.0/8");
        assert_eq!(Cidr::parse("192.168.1.1").unwrap().prefix, 32);
        assert!(Cidr::parse("10.0.0.0/33").is_none());
        assert!(Cidr::parse("garbage").is_none());
        assert_eq!(Cidr::parse("fd00::1/8").unwrap().to_string(), "fd00::/8");
    }

    #[test]
    fn test_cidr_contains() {
        let big = Cidr::parse("10.0.0.0/8").unwrap();
        let small = Cidr::parse("10.20.0.0/16").unwrap();
        assert!(big.contains(&small));
        assert!(!small.contains(&big));
        assert!(Cidr::ALL_V4.contains(&big));
        assert!(!Cidr::ALL_V6.contains(&big));
    }

    #[test]
    fn test_allowed_ips_no_exclusions() {
        assert_eq!(cidrs(&compute_allowed_ips(&[], false)), vec!["0.0.0.0/0"]);
        assert_eq!(
            cidrs(&compute_allowed_ips(&[], true)),
            vec!["0.0.0.0/0", "::/0"]
        );
    }

    #[test]
    fn test_allowed_ips_exclude_half() {
        let ips = compute_allowed_ips(&["128.0.0.0/1".into()], false);
        assert_eq!(cidrs(&ips), vec!["0.0.0.0/1"]);
    }

    #[test]
    fn test_allowed_ips_exclude_private() {
        let ips = compute_allowed_ips(&["10.0.0.0/8".into()], false);
        // One block per level above /8
        assert_eq!(ips.len(), 8);
        assert!(!ips.iter().any(|c| c.contains(&Cidr::parse("10.1.1.1").unwrap())));
        assert!(ips.iter().any(|c| c.contains(&Cidr::parse("11.0.0.1").unwrap())));
        assert!(ips.iter().any(|c| c.contains(&Cidr::parse("9.255.255.255").unwrap())));
    }

    #[test]
    fn test_allowed_ips_ipv6_exclusion_keeps_v4() {
        let ips = compute_allowed_ips(&["::/1".into()], true);
        assert_eq!(cidrs(&ips), vec!["0.0.0.0/0", "8000::/1"]);
    }

    #[test]
    fn test_params_from_domain() {
        use crate::server::fixtures::{domain, server};
        use crate::server::DomainProtocol;

        let mut d = domain("d", vec![DomainProtocol::all(VpnProtocol::WireGuard)]);
        d.public_key = Some("key".into());
        let s = server("X", "CH", vec![d.clone()]);
        let mut config = OrchestratorConfig::default();
        config.split_tunnel = vec!["128.0.0.0/1".into()];

        let entry = SocketAddr::new(d.entry_ip, 51820);
        let sel = ProtocolSelection::of(VpnProtocol::WireGuard)
            .resolve_concrete()
            .unwrap();
        let p = ConnectionParams::new(&ConnectIntent::server("X"), &s, &d, sel, entry, &config);

        assert_eq!(p.peer_public_key.as_deref(), Some("key"));
        assert_eq!(cidrs(&p.allowed_ips), vec!["0.0.0.0/1"]);
        assert_eq!(p.vpn_protocol(), VpnProtocol::WireGuard);
        assert!(p.peers.is_empty());
    }
}
