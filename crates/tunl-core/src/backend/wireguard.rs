//! WireGuard Backend
//!
//! Datagram entries are probed with a handshake initiation, stream
//! transmissions (TCP/TLS) with a connect. Defaults to the userspace
//! engine.

use super::engine::{EngineSession, TunnelEngine};
use super::probe::ProbeKind;
use super::userspace::UserspaceWireGuard;
use super::{PrepareRequest, VpnBackend, discover, results_from_entries};
use crate::config::OrchestratorConfig;
use crate::credentials::Credential;
use crate::params::{ConnectionParams, PrepareResult};
use crate::protocol::VpnProtocol;
use crate::state::VpnState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct WireGuardBackend {
    session: EngineSession,
    config: Arc<OrchestratorConfig>,
}

impl WireGuardBackend {
    /// Backend driving the given engine
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

    /// Backend on the userspace engine
    pub fn userspace(config: Arc<OrchestratorConfig>) -> Self {
        let engine = Arc::new(UserspaceWireGuard::new(config.timeouts.handshake()));
        Self::new(engine, config)
    }
}

#[async_trait]
impl VpnBackend for WireGuardBackend {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::WireGuard
    }

    async fn prepare(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
    ) -> Vec<PrepareResult> {
        let entries = discover(
            VpnProtocol::WireGuard,
            request,
            &self.config,
            |t| match t {
                Some(t) if t.is_stream() => ProbeKind::Stream,
                _ => ProbeKind::WireGuard,
            },
            cancel,
        )
        .await;
        debug!("WireGuard: {} entr(ies) for {}", entries.len(), request.server.name);
        results_from_entries(VpnProtocol::WireGuard, request, &self.config, entries)
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
