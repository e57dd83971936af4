//! ProTun Backend
//!
//! Unified transport that negotiates entry IP, port and transmission per
//! peer. Discovery collects every reachable (domain, transmission, port)
//! and hands them to the engine as an ordered peer list inside a single
//! prepare result; the first peer is the primary entry.

use super::engine::{EngineSession, TunnelEngine};
use super::probe::ProbeKind;
use super::{PrepareRequest, VpnBackend, discover};
use crate::config::OrchestratorConfig;
use crate::credentials::Credential;
use crate::params::{ConnectionParams, PrepareResult, ProTunPeer};
use crate::protocol::{ProtocolSelection, TransmissionProtocol, VpnProtocol};
use crate::state::VpnState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ProTunBackend {
    session: EngineSession,
    config: Arc<OrchestratorConfig>,
}

impl ProTunBackend {
    pub fn new(engine: Arc<dyn TunnelEngine>, config: Arc<OrchestratorConfig>) -> Self {
        Self {
            session: EngineSession::new(
                engine,
                config.timeouts.handshake(),
                config.timeouts.disconnect(),
            ),
            config,
        }
    }
}

#[async_trait]
impl VpnBackend for ProTunBackend {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::ProTun
    }

    async fn prepare(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
    ) -> Vec<PrepareResult> {
        let mut entries = discover(
            VpnProtocol::ProTun,
            request,
            &self.config,
            |t| match t {
                Some(t) if t.is_stream() => ProbeKind::Stream,
                _ => ProbeKind::WireGuard,
            },
            cancel,
        )
        .await;
        if entries.is_empty() {
            return Vec::new();
        }
        // Scanned peers go fastest first; the sort is stable so static
        // entries keep domain/transmission order.
        entries.sort_by_key(|e| e.rtt.unwrap_or(Duration::MAX));

        let peers: Vec<ProTunPeer> = entries
            .iter()
            .map(|e| ProTunPeer {
                domain_id: e.domain.id.clone(),
                entry: e.addr,
                transmission: e.transmission.unwrap_or(TransmissionProtocol::Udp),
            })
            .collect();
        let primary = &entries[0];
        debug!("ProTun: {} peer(s) for {}, primary {}", peers.len(), request.server.name, primary.addr);

        let selection = ProtocolSelection {
            vpn: VpnProtocol::ProTun,
            transmission: primary.transmission,
        };
        let params = ConnectionParams::new(
            &request.intent,
            &request.server,
            &primary.domain,
            selection,
            primary.addr,
            &self.config,
        )
        .with_peers(peers);

        vec![PrepareResult {
            backend: VpnProtocol::ProTun,
            params,
            rtt: primary.rtt,
        }]
    }

    async fn connect(
        &self,
        params: &ConnectionParams,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) {
        self.session.connect(params, credential, cancel).await;
    }

    async fn disconnect(&self, with_state_change: bool) {
        self.session.disconnect(with_state_change).await;
    }

    fn status(&self) -> watch::Receiver<VpnState> {
        self.session.status()
    }

    async fn check_liveness(&self, timeout: Duration) -> bool {
        self.session.check_liveness(timeout).await
    }

    async fn live_tunnel(&self) -> Option<ConnectionParams> {
        self.session.live_tunnel().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::engine::fixtures::ScriptedEngine;
    use crate::backend::fixtures::request;
    use crate::server::DomainProtocol;
    use crate::server::fixtures::{domain, server};

    #[tokio::test]
    async fn test_prepare_collects_peers() {
        let backend = ProTunBackend::new(ScriptedEngine::ok(), Arc::new(OrchestratorConfig::default()));
        let s = server(
            "X",
            "CH",
            vec![
                domain("a", vec![DomainProtocol::all(VpnProtocol::ProTun)]),
                domain("b", vec![DomainProtocol::all(VpnProtocol::ProTun)]),
                domain("c", vec![DomainProtocol::all(VpnProtocol::WireGuard)]),
            ],
        );
        let req = request(s, vec![TransmissionProtocol::Udp, TransmissionProtocol::Tls]);
        let results = backend.prepare(&req, &CancellationToken::new()).await;

        assert_eq!(results.len(), 1);
        let params = &results[0].params;
        assert_eq!(params.peers.len(), 4);
        assert_eq!(params.peers[0].domain_id, "a");
        assert_eq!(params.peers[1].transmission, TransmissionProtocol::Tls);
        assert_eq!(params.domain.id, "a");
        assert!(params.peers.iter().all(|p| p.domain_id != "c"));
    }

    #[tokio::test]
    async fn test_prepare_without_protun_domain() {
        let backend = ProTunBackend::new(ScriptedEngine::ok(), Arc::new(OrchestratorConfig::default()));
        let s = server("X", "CH", vec![domain("a", vec![DomainProtocol::all(VpnProtocol::Ikev2)])]);
        let req = request(s, vec![TransmissionProtocol::Udp]);
        assert!(backend.prepare(&req, &CancellationToken::new()).await.is_empty());
    }
}
