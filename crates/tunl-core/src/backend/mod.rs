//! Tunnel Backends
//!
//! One backend per concrete protocol. Each discovers workable entries for
//! a server (`prepare`), establishes the tunnel through its engine
//! (`connect`), tears it down (`disconnect`), and publishes its own status
//! on a watch channel which the connection manager forwards while that
//! backend is active.
//!
//! # Contract
//!
//! - `prepare` never mutates shared state and never fails loudly: a server
//!   with no domain for the protocol yields an empty list.
//! - `connect` reports failures only through the status channel, as
//!   `VpnState::Error` with a stable kind and finality.
//! - Cancellation means "stop and release", never an error.

pub mod engine;
pub mod ikev2;
pub mod openvpn;
pub mod probe;
pub mod protun;
pub mod userspace;
pub mod wireguard;

pub use engine::{EngineConfig, EngineError, EngineSession, EngineStatus, TunnelEngine};
pub use ikev2::Ikev2Backend;
pub use openvpn::OpenVpnBackend;
pub use protun::ProTunBackend;
pub use userspace::UserspaceWireGuard;
pub use wireguard::WireGuardBackend;

use crate::config::OrchestratorConfig;
use crate::credentials::Credential;
use crate::intent::ConnectIntent;
use crate::params::{ConnectionParams, PrepareResult};
use crate::protocol::{TransmissionProtocol, VpnProtocol};
use crate::server::{ConnectingDomain, Server};
use crate::state::VpnState;
use async_trait::async_trait;
use probe::{PortProber, ProbeKind};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Input of a discovery step
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub intent: ConnectIntent,
    pub server: Server,
    /// Transmissions allowed (empty for protocols without a choice)
    pub transmissions: Vec<TransmissionProtocol>,
    /// Probe entries instead of trusting static config
    pub scan: bool,
    /// Ports probed per domain and transmission
    pub ports_wanted: usize,
    /// Probe every port instead of stopping at the first answer
    pub wait_for_all: bool,
}

/// Polymorphic tunnel backend
#[async_trait]
pub trait VpnBackend: Send + Sync {
    /// Protocol implemented (also the provider's lookup key)
    fn protocol(&self) -> VpnProtocol;

    /// Discover 0..N workable ways to reach the request's server
    async fn prepare(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
    ) -> Vec<PrepareResult>;

    /// Release resources held by a prepared result that will not be used
    async fn release(&self, _result: &PrepareResult) {}

    /// Establish the tunnel. Outcome is reported on the status channel.
    async fn connect(
        &self,
        params: &ConnectionParams,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    );

    /// Tear the tunnel down. Without state change the caller applies its own
    /// transition.
    async fn disconnect(&self, with_state_change: bool);

    /// Internal status stream
    fn status(&self) -> watch::Receiver<VpnState>;

    /// Check the tunnel's control channel once
    async fn check_liveness(&self, timeout: Duration) -> bool;

    /// Parameters of a tunnel that is still up, for re-attaching after a
    /// process restart
    async fn live_tunnel(&self) -> Option<ConnectionParams>;
}

/// A reachable entry found by discovery
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub domain: ConnectingDomain,
    pub transmission: Option<TransmissionProtocol>,
    pub addr: SocketAddr,
    pub rtt: Option<Duration>,
}

/// Discovery shared by every backend: per domain and transmission, either
/// probe the candidate ports or take the first configured one.
///
/// Scans of every (domain, transmission) pair run at once. When the
/// discovery deadline passes, the entries found so far are returned.
/// Entries keep domain/transmission order.
pub(crate) async fn discover(
    protocol: VpnProtocol,
    request: &PrepareRequest,
    config: &OrchestratorConfig,
    probe_kind: impl Fn(Option<TransmissionProtocol>) -> ProbeKind,
    cancel: &CancellationToken,
) -> Vec<Entry> {
    if cancel.is_cancelled() {
        return Vec::new();
    }

    // Protocols without a transmission choice are probed once with `None`
    let transmissions: Vec<Option<TransmissionProtocol>> = if protocol.transmissions().is_empty() {
        vec![None]
    } else {
        request.transmissions.iter().copied().map(Some).collect()
    };

    let mut pairs = Vec::new();
    for domain in &request.server.domains {
        for transmission in &transmissions {
            let selection = crate::protocol::ProtocolSelection {
                vpn: protocol,
                transmission: *transmission,
            };
            if !domain.supports(&selection) {
                continue;
            }
            let ports = domain
                .port_override(protocol)
                .unwrap_or_else(|| config.ports.ports(protocol, *transmission));
            if let Some(&first) = ports.first() {
                pairs.push((domain, *transmission, ports, first));
            }
        }
    }

    if !request.scan {
        return pairs
            .into_iter()
            .map(|(domain, transmission, _, first)| Entry {
                domain: domain.clone(),
                transmission,
                addr: SocketAddr::new(domain.entry_ip, first),
                rtt: None,
            })
            .collect();
    }

    let prober = PortProber::new(config.timeouts.probe());
    let mut scans = JoinSet::new();
    for (index, (domain, transmission, ports, _)) in pairs.into_iter().enumerate() {
        let prober = prober.clone();
        let cancel = cancel.clone();
        let kind = probe_kind(transmission);
        let domain = domain.clone();
        let ports = ports.to_vec();
        let (wanted, wait_for_all) = (request.ports_wanted, request.wait_for_all);
        scans.spawn(async move {
            let hits = prober
                .scan(domain.entry_ip, &ports, kind, wanted, wait_for_all, &cancel)
                .await;
            (index, domain, transmission, hits)
        });
    }

    let deadline = tokio::time::sleep(config.timeouts.discovery());
    tokio::pin!(deadline);
    let mut found: Vec<(usize, Entry)> = Vec::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Vec::new(),
            _ = &mut deadline => {
                debug!("{} discovery deadline hit, keeping {} entr(ies)", protocol, found.len());
                break;
            }
            next = scans.join_next() => match next {
                Some(Ok((index, domain, transmission, hits))) => {
                    found.extend(hits.into_iter().map(|hit| {
                        let entry = Entry {
                            domain: domain.clone(),
                            transmission,
                            addr: SocketAddr::new(domain.entry_ip, hit.port),
                            rtt: Some(hit.rtt),
                        };
                        (index, entry)
                    }));
                }
                Some(Err(e)) => warn!("{} port scan task failed: {}", protocol, e),
                None => break,
            }
        }
    }
    // Stable: hits of one pair stay fastest first
    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, entry)| entry).collect()
}

/// Turn entries into prepare results, one per entry
pub(crate) fn results_from_entries(
    protocol: VpnProtocol,
    request: &PrepareRequest,
    config: &OrchestratorConfig,
    entries: Vec<Entry>,
) -> Vec<PrepareResult> {
    entries
        .into_iter()
        .map(|entry| {
            let selection = crate::protocol::ProtocolSelection {
                vpn: protocol,
                transmission: entry.transmission,
            };
            PrepareResult {
                backend: protocol,
                params: ConnectionParams::new(
                    &request.intent,
                    &request.server,
                    &entry.domain,
                    selection,
                    entry.addr,
                    config,
                ),
                rtt: entry.rtt,
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::server::DomainProtocol;
    use crate::server::fixtures::{domain, server};

    pub fn request(server: Server, transmissions: Vec<TransmissionProtocol>) -> PrepareRequest {
        PrepareRequest {
            intent: ConnectIntent::server(&server.id),
            server,
            transmissions,
            scan: false,
            ports_wanted: 4,
            wait_for_all: false,
        }
    }

    pub fn server_with(protocols: Vec<DomainProtocol>) -> Server {
        server("X", "CH", vec![domain("x1", protocols)])
    }
}
