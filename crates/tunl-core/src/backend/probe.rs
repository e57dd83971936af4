//! Port Scanning
//!
//! Concurrent reachability probes for candidate entry ports. Datagram
//! protocols get a protocol-shaped packet and count as alive when anything
//! answers; stream transmissions count as alive when the connect succeeds.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Shape of the probe sent to a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// WireGuard handshake initiation
    WireGuard,
    /// OpenVPN hard reset (client, v2)
    OpenVpn,
    /// IKE_SA_INIT header
    Ike,
    /// TCP connect
    Stream,
}

impl ProbeKind {
    /// Datagram payload, `None` for stream probes
    fn payload(&self) -> Option<Vec<u8>> {
        match self {
            ProbeKind::WireGuard => Some(super::userspace::handshake_initiation(
                rand::random(),
                &crate::keys::KeyPair::generate().public,
            )),
            ProbeKind::OpenVpn => {
                // P_CONTROL_HARD_RESET_CLIENT_V2, key id 0
                let mut msg = vec![7 << 3];
                let mut session = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut session);
                msg.extend_from_slice(&session);
                msg.push(0); // ack array length
                msg.extend_from_slice(&0u32.to_be_bytes()); // packet id
                Some(msg)
            }
            ProbeKind::Ike => {
                let mut msg = Vec::with_capacity(28);
                let mut spi = [0u8; 8];
                rand::thread_rng().fill_bytes(&mut spi);
                msg.extend_from_slice(&spi); // initiator SPI
                msg.extend_from_slice(&[0u8; 8]); // responder SPI
                msg.push(0); // next payload
                msg.push(0x20); // version 2.0
                msg.push(34); // IKE_SA_INIT
                msg.push(0x08); // initiator flag
                msg.extend_from_slice(&0u32.to_be_bytes()); // message id
                msg.extend_from_slice(&28u32.to_be_bytes()); // length
                Some(msg)
            }
            ProbeKind::Stream => None,
        }
    }
}

/// A port that answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeHit {
    pub port: u16,
    pub rtt: Duration,
}

/// Runs probes with a per-probe timeout
#[derive(Debug, Clone)]
pub struct PortProber {
    timeout: Duration,
}

impl PortProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Probe one address, returning the round trip if it answered
    pub async fn probe(&self, addr: SocketAddr, kind: ProbeKind) -> Option<Duration> {
        let started = Instant::now();
        let result = match kind.payload() {
            Some(payload) => tokio::time::timeout(self.timeout, probe_datagram(addr, &payload)).await,
            None => tokio::time::timeout(self.timeout, probe_stream(addr)).await,
        };
        match result {
            Ok(Ok(())) => Some(started.elapsed()),
            Ok(Err(e)) => {
                trace!("Probe {} failed: {}", addr, e);
                None
            }
            Err(_) => None,
        }
    }

    /// Probe up to `max_ports` ports concurrently.
    ///
    /// Returns on the first answer unless `wait_for_all`, in which case every
    /// answer is returned sorted by round trip. Cancellation returns nothing.
    pub async fn scan(
        &self,
        ip: IpAddr,
        ports: &[u16],
        kind: ProbeKind,
        max_ports: usize,
        wait_for_all: bool,
        cancel: &CancellationToken,
    ) -> Vec<ProbeHit> {
        let mut probes = JoinSet::new();
        for &port in ports.iter().take(max_ports.max(1)) {
            let prober = self.clone();
            probes.spawn(async move {
                let rtt = prober.probe(SocketAddr::new(ip, port), kind).await;
                rtt.map(|rtt| ProbeHit { port, rtt })
            });
        }

        let mut hits = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Port scan of {} cancelled", ip);
                    return Vec::new();
                }
                next = probes.join_next() => match next {
                    Some(Ok(Some(hit))) => {
                        hits.push(hit);
                        if !wait_for_all {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        // Remaining probes are aborted when the set drops
        drop(probes);

        hits.sort_by_key(|h| h.rtt);
        debug!("Port scan of {} ({:?}): {} port(s) answered", ip, kind, hits.len());
        hits
    }
}

async fn probe_datagram(addr: SocketAddr, payload: &[u8]) -> std::io::Result<()> {
    let local: SocketAddr = if addr.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(addr).await?;
    socket.send(payload).await?;
    let mut buf = [0u8; 256];
    socket.recv(&mut buf).await?;
    Ok(())
}

async fn probe_stream(addr: SocketAddr) -> std::io::Result<()> {
    TcpStream::connect(addr).await.map(|_| ())
}
