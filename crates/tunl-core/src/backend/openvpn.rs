//! OpenVPN Backend
//!
//! Legacy protocol over UDP or TCP. The engine is supplied by the platform.

use super::engine::{EngineSession, TunnelEngine};
use super::probe::ProbeKind;
use super::{PrepareRequest, VpnBackend, discover, results_from_entries};
use crate::config::OrchestratorConfig;
use crate::credentials::Credential;
use crate::params::{ConnectionParams, PrepareResult};
use crate::protocol::{TransmissionProtocol, VpnProtocol};
use crate::state::VpnState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct OpenVpnBackend {
    session: EngineSession,
    config: Arc<OrchestratorConfig>,
}

impl OpenVpnBackend {
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
impl VpnBackend for OpenVpnBackend {
    fn protocol(&self) -> VpnProtocol {
        VpnProtocol::OpenVpn
    }

    async fn prepare(
        &self,
        request: &PrepareRequest,
        cancel: &CancellationToken,
    ) -> Vec<PrepareResult> {
        let entries = discover(
            VpnProtocol::OpenVpn,
            request,
            &self.config,
            |t| match t {
                Some(TransmissionProtocol::Udp) | None => ProbeKind::OpenVpn,
                Some(_) => ProbeKind::Stream,
            },
            cancel,
        )
        .await;
        debug!("OpenVPN: {} entr(ies) for {}", entries.len(), request.server.name);
        results_from_entries(VpnProtocol::OpenVpn, request, &self.config, entries)
    }

    async fn connect(
        &self,
        params: &ConnectionParams,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) {
        if credential.is_some_and(|c| c.certificate.is_none()) {
            warn!("OpenVPN: no client certificate, connecting with key only");
        }
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
