//! IKEv2 Backend
//!
//! Legacy IPsec. No transmission choice; entries are probed with an
//! IKE_SA_INIT header on the IKE ports.

use super::engine::{EngineSession, TunnelEngine};
use super::probe::ProbeKind;
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

pub struct Ikev2Backend {
    session: EngineSession,
    config: Arc<OrchestratorConfig>,
}

impl Ikev2Backend {
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
impl VpnBackend for Ikev2Backend {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::Ikev2
    }

    async fn prepare(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
    ) -> Vec<PrepareResult> {
        let entries = discover(VpnProtocol::Ikev2, request, &self.config, |_| ProbeKind::Ike, cancel).await;
        results_from_entries(VpnProtocol::Ikev2, request, &self.config, entries)
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
