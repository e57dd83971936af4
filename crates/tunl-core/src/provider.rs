//! Backend Provider
//!
//! Owns the backends, keyed by protocol, and turns a [`ProtocolSelection`]
//! into a prepared connection.
//!
//! # Smart protocol
//!
//! Backends are tried in the configured priority order with `scan = true`,
//! stopping at the first one that returns anything. With `wait_for_all`
//! every candidate is prepared in parallel and the lowest round trip wins
//! (ties go to the earlier entry in the order). Results that are not
//! chosen are released.

use crate::backend::{PrepareRequest, VpnBackend};
use crate::config::OrchestratorConfig;
use crate::intent::ConnectIntent;
use crate::params::PrepareResult;
use crate::protocol::{ProtocolSelection, VpnProtocol};
use crate::server::Server;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A prepared connection and the selection that produced it
#[derive(Debug, Clone)]
pub struct Prepared {
    pub result: PrepareResult,
    /// Concrete selection tried (an entry of the Smart order, or the
    /// resolved user selection)
    pub selection: ProtocolSelection,
}

/// Maps selections to backends
pub struct BackendProvider {
    backends: HashMap<VpnProtocol, Arc<dyn VpnBackend>>,
    config: Arc<OrchestratorConfig>,
}

impl BackendProvider {
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self {
            backends: HashMap::new(),
            config,
        }
    }

    /// Register a backend, replacing any for the same protocol
    pub fn register(&mut self, backend: Arc<dyn VpnBackend>) {
        let protocol = backend.protocol();
        if protocol == VpnProtocol::Smart {
            warn!("Ignoring backend claiming the Smart protocol");
            return;
        }
        debug!("Registered {} backend", protocol);
        self.backends.insert(protocol, backend);
    }

    /// Builder form of [`register`](Self::register)
    pub fn with_backend(mut self, backend: Arc<dyn VpnBackend>) -> Self {
        self.register(backend);
        self
    }

    /// Backend for a protocol
    pub fn backend(&self, protocol: VpnProtocol) -> Option<Arc<dyn VpnBackend>> {
        self.backends.get(&protocol).cloned()
    }

    /// All backends, in Smart priority order first
    pub fn backends(&self) -> Vec<Arc<dyn VpnBackend>> {
        let mut list: Vec<_> = self.backends.values().cloned().collect();
        let rank = |p: VpnProtocol| {
            self.config
                .smart
                .order
                .iter()
                .position(|s| s.vpn == p)
                .unwrap_or(usize::MAX)
        };
        list.sort_by_key(|b| (rank(b.protocol()), b.protocol()));
        list
    }

    /// Configuration in use
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Prepare a connection to `server`.
    ///
    /// `skip` lists Smart entries already tried by this attempt. Returns
    /// `None` when no backend found a workable entry.
    pub async fn prepare(
        &self,
        selection: &ProtocolSelection,
        intent: &ConnectIntent,
        server: &Server,
        scan: bool,
        skip: &[ProtocolSelection],
        cancel: &CancellationToken,
    ) -> Option<Prepared> {
        if selection.is_smart() {
            self.prepare_smart(intent, server, scan, skip, cancel).await
        } else {
            self.prepare_concrete(selection, intent, server, scan, cancel).await
        }
    }

    fn request(
        &self,
        selection: &ProtocolSelection,
        intent: &ConnectIntent,
        server: &Server,
        scan: bool,
        wait_for_all: bool,
    ) -> PrepareRequest {
        PrepareRequest {
            intent: intent.clone(),
            server: server.clone(),
            transmissions: selection.allowed_transmissions(),
            scan,
            ports_wanted: self.config.smart.max_ports_scanned,
            wait_for_all,
        }
    }

    async fn prepare_concrete(
        &self,
        selection: &ProtocolSelection,
        intent: &ConnectIntent,
        server: &Server,
        scan: bool,
        cancel: &CancellationToken,
    ) -> Option<Prepared> {
        let concrete = match selection.resolve_concrete() {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot prepare {}: {}", selection, e);
                return None;
            }
        };
        let Some(backend) = self.backend(concrete.vpn) else {
            warn!("No backend registered for {}", concrete.vpn);
            return None;
        };
        // A concrete selection without transmission accepts any the domain has
        let request = self.request(selection, intent, server, scan, false);
        let results = run_prepare(backend.clone(), request, self.config.timeouts.discovery(), cancel).await;
        let chosen = choose(&backend, results).await?;
        info!("Prepared {} for {}", chosen.params, intent);
        Some(Prepared {
            result: chosen,
            selection: concrete,
        })
    }

    async fn prepare_smart(
        &self,
        intent: &ConnectIntent,
        server: &Server,
        scan: bool,
        skip: &[ProtocolSelection],
        cancel: &CancellationToken,
    ) -> Option<Prepared> {
        let candidates: Vec<(ProtocolSelection, Arc<dyn VpnBackend>)> = self
            .config
            .smart
            .order
            .iter()
            .filter(|sel| !skip.contains(sel))
            .filter(|sel| server.supports(sel))
            .filter_map(|sel| self.backend(sel.vpn).map(|b| (*sel, b)))
            .collect();
        if candidates.is_empty() {
            debug!("Smart: nothing left to try for {}", server.name);
            return None;
        }

        if self.config.smart.wait_for_all {
            return self.prepare_all(candidates, intent, server, scan, cancel).await;
        }

        for (selection, backend) in candidates {
            if cancel.is_cancelled() {
                return None;
            }
            debug!("Smart: trying {}", selection);
            let request = self.request(&selection, intent, server, scan, false);
            let results =
                run_prepare(backend.clone(), request, self.config.timeouts.discovery(), cancel).await;
            if let Some(chosen) = choose(&backend, results).await {
                info!("Smart: picked {} ({})", selection, chosen.params);
                return Some(Prepared {
                    result: chosen,
                    selection,
                });
            }
        }
        None
    }

    async fn prepare_all(
        &self,
        candidates: Vec<(ProtocolSelection, Arc<dyn VpnBackend>)>,
        intent: &ConnectIntent,
        server: &Server,
        scan: bool,
        cancel: &CancellationToken,
    ) -> Option<Prepared> {
        let mut tasks = JoinSet::new();
        for (rank, (selection, backend)) in candidates.iter().enumerate() {
            let request = self.request(selection, intent, server, scan, true);
            let backend = backend.clone();
            let timeout = self.config.timeouts.discovery();
            let cancel = cancel.clone();
            let selection = *selection;
            tasks.spawn(async move {
                let results = run_prepare(backend, request, timeout, &cancel).await;
                (rank, selection, results)
            });
        }

        let mut all: Vec<(usize, ProtocolSelection, PrepareResult)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((rank, selection, results)) = joined {
                all.extend(results.into_iter().map(|r| (rank, selection, r)));
            }
        }
        if cancel.is_cancelled() {
            release_all(&candidates, all.into_iter().map(|(_, _, r)| r)).await;
            return None;
        }

        // Lowest round trip, then priority, then discovery order
        let best = all
            .iter()
            .enumerate()
            .min_by_key(|(i, (rank, _, r))| (r.rtt.unwrap_or(Duration::MAX), *rank, *i))
            .map(|(i, _)| i)?;
        let (_, selection, chosen) = all.swap_remove(best);
        release_all(&candidates, all.into_iter().map(|(_, _, r)| r)).await;
        info!("Smart (all): picked {} ({})", selection, chosen.params);
        Some(Prepared {
            result: chosen,
            selection,
        })
    }
}

/// Slack after the discovery deadline for backends to hand back what they
/// found by then
const PREPARE_GRACE: Duration = Duration::from_millis(250);

/// Run one backend's discovery bounded by the discovery timeout and the
/// attempt's cancellation
async fn run_prepare(
    backend: Arc<dyn VpnBackend>,
    request: PrepareRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Vec<PrepareResult> {
    tokio::select! {
        _ = cancel.cancelled() => Vec::new(),
        r = tokio::time::timeout(timeout + PREPARE_GRACE, backend.prepare(&request, cancel)) => match r {
            Ok(results) => results,
            Err(_) => {
                warn!("{} discovery timed out for {}", backend.protocol(), request.server.name);
                Vec::new()
            }
        },
    }
}

/// Pick the lowest round trip (first on ties) and release the rest
async fn choose(backend: &Arc<dyn VpnBackend>, mut results: Vec<PrepareResult>) -> Option<PrepareResult> {
    let best = results
        .iter()
        .enumerate()
        .min_by_key(|(i, r)| (r.rtt.unwrap_or(Duration::MAX), *i))
        .map(|(i, _)| i)?;
    let chosen = results.swap_remove(best);
    for other in &results {
        backend.release(other).await;
    }
    Some(chosen)
}

async fn release_all(
    candidates: &[(ProtocolSelection, Arc<dyn VpnBackend>)],
    results: impl Iterator<Item = PrepareResult>,
) {
    for result in results {
        if let Some((_, backend)) = candidates.iter().find(|(_, b)| b.protocol() == result.backend) {
            backend.release(&result).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::params::ConnectionParams;
    use crate::protocol::TransmissionProtocol;
    use crate::server::DomainProtocol;
    use crate::server::fixtures::{domain, server};
    use crate::state::VpnState;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::watch;

    /// Backend returning one result per domain supporting it, with scripted
    /// round trips
    struct FakeBackend {
        protocol: VpnProtocol,
        rtts: Vec<Option<Duration>>,
        delay: Duration,
        config: Arc<OrchestratorConfig>,
        prepares: AtomicUsize,
        released: Mutex<Vec<u64>>,
        state: watch::Sender<VpnState>,
    }

    impl FakeBackend {
        fn new(protocol: VpnProtocol, rtts: Vec<Option<Duration>>) -> Arc<Self> {
            Arc::new(Self {
                protocol,
                rtts,
                delay: Duration::ZERO,
                config: Arc::new(OrchestratorConfig::default()),
                prepares: AtomicUsize::new(0),
                released: Mutex::new(Vec::new()),
                state: watch::channel(VpnState::Disabled).0,
            })
        }

        fn released(&self) -> usize {
            self.released.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VpnBackend for FakeBackend {
        fn protocol(&self) -> VpnProtocol {
            self.protocol
        }

        async fn prepare(&self, request: &PrepareRequest, _cancel: &CancellationToken) -> Vec<PrepareResult> {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let sel = ProtocolSelection {
                vpn: self.protocol,
                transmission: request.transmissions.first().copied(),
            };
            let domains = request.server.domains_for(&ProtocolSelection::of(self.protocol));
            let Some(d) = domains.first() else {
                return Vec::new();
            };
            self.rtts
                .iter()
                .enumerate()
                .map(|(i, rtt)| PrepareResult {
                    backend: self.protocol,
                    params: ConnectionParams::new(
                        &request.intent,
                        &request.server,
                        d,
                        sel,
                        SocketAddr::new(d.entry_ip, 1000 + i as u16),
                        &self.config,
                    ),
                    rtt: *rtt,
                })
                .collect()
        }

        async fn release(&self, result: &PrepareResult) {
            self.released.lock().unwrap().push(result.params.id);
        }

        async fn connect(&self, _p: &ConnectionParams, _c: Option<&Credential>, _t: &CancellationToken) {}

        async fn disconnect(&self, _with_state_change: bool) {}

        fn status(&self) -> watch::Receiver<VpnState> {
            self.state.subscribe()
        }

        async fn check_liveness(&self, _timeout: Duration) -> bool {
            true
        }

        async fn live_tunnel(&self) -> Option<ConnectionParams> {
            None
        }
    }

    fn all_protocols_server() -> Server {
        server(
            "X",
            "CH",
            vec![domain(
                "x1",
                vec![
                    DomainProtocol::all(VpnProtocol::WireGuard),
                    DomainProtocol::all(VpnProtocol::OpenVpn),
                    DomainProtocol::all(VpnProtocol::Ikev2),
                ],
            )],
        )
    }

    fn ms(v: u64) -> Option<Duration> {
        Some(Duration::from_millis(v))
    }

    #[tokio::test]
    async fn test_concrete_calls_only_that_backend() {
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![None]);
        let ike = FakeBackend::new(VpnProtocol::Ikev2, vec![None]);
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default()))
            .with_backend(wg.clone())
            .with_backend(ike.clone());

        let prepared = provider
            .prepare(
                &ProtocolSelection::of(VpnProtocol::Ikev2),
                &ConnectIntent::server("X"),
                &all_protocols_server(),
                true,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(prepared.result.backend, VpnProtocol::Ikev2);
        assert_eq!(wg.prepares.load(Ordering::SeqCst), 0);
        assert_eq!(ike.prepares.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_smart_short_circuits() {
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![None]);
        let ike = FakeBackend::new(VpnProtocol::Ikev2, vec![None]);
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default()))
            .with_backend(wg.clone())
            .with_backend(ike.clone());

        let prepared = provider
            .prepare(
                &ProtocolSelection::SMART,
                &ConnectIntent::fastest_in("CH"),
                &all_protocols_server(),
                true,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(prepared.result.backend, VpnProtocol::WireGuard);
        assert_eq!(
            prepared.selection,
            ProtocolSelection::new(VpnProtocol::WireGuard, Some(TransmissionProtocol::Udp)).unwrap()
        );
        assert_eq!(ike.prepares.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_smart_falls_through_empty_backends() {
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![]);
        let ike = FakeBackend::new(VpnProtocol::Ikev2, vec![None]);
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default()))
            .with_backend(wg.clone())
            .with_backend(ike.clone());

        let prepared = provider
            .prepare(
                &ProtocolSelection::SMART,
                &ConnectIntent::fastest_in("CH"),
                &all_protocols_server(),
                true,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(prepared.result.backend, VpnProtocol::Ikev2);
        // WireGuard/udp, then WireGuard/tcp and /tls come after IKEv2
        assert_eq!(wg.prepares.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_smart_skip_list() {
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![None]);
        let ike = FakeBackend::new(VpnProtocol::Ikev2, vec![None]);
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default()))
            .with_backend(wg.clone())
            .with_backend(ike.clone());

        let skip = [ProtocolSelection::new(VpnProtocol::WireGuard, Some(TransmissionProtocol::Udp)).unwrap()];
        let prepared = provider
            .prepare(
                &ProtocolSelection::SMART,
                &ConnectIntent::fastest_in("CH"),
                &all_protocols_server(),
                true,
                &skip,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(prepared.result.backend, VpnProtocol::Ikev2);
    }

    #[tokio::test]
    async fn test_nothing_compatible() {
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![None]);
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default())).with_backend(wg.clone());
        let ike_only = server("X", "CH", vec![domain("x1", vec![DomainProtocol::all(VpnProtocol::Ikev2)])]);

        let prepared = provider
            .prepare(
                &ProtocolSelection::of(VpnProtocol::WireGuard),
                &ConnectIntent::server("X"),
                &ike_only,
                true,
                &[],
                &CancellationToken::new(),
            )
            .await;
        assert!(prepared.is_none());
    }

    #[tokio::test]
    async fn test_lowest_rtt_chosen_and_rest_released() {
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![ms(30), ms(10), ms(20)]);
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default())).with_backend(wg.clone());

        let prepared = provider
            .prepare(
                &ProtocolSelection::of(VpnProtocol::WireGuard),
                &ConnectIntent::server("X"),
                &all_protocols_server(),
                true,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(prepared.result.rtt, ms(10));
        assert_eq!(wg.released(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_all_picks_fastest_backend() {
        let mut config = OrchestratorConfig::default();
        config.smart.wait_for_all = true;
        let wg = FakeBackend::new(VpnProtocol::WireGuard, vec![ms(50)]);
        let ovpn = FakeBackend::new(VpnProtocol::OpenVpn, vec![ms(5)]);
        let ike = FakeBackend::new(VpnProtocol::Ikev2, vec![ms(5)]);
        let provider = BackendProvider::new(Arc::new(config))
            .with_backend(wg.clone())
            .with_backend(ovpn.clone())
            .with_backend(ike.clone());

        let prepared = provider
            .prepare(
                &ProtocolSelection::SMART,
                &ConnectIntent::fastest_in("CH"),
                &all_protocols_server(),
                true,
                &[],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // IKEv2 ranks above OpenVPN in the default order
        assert_eq!(prepared.result.backend, VpnProtocol::Ikev2);
        assert!(wg.released() >= 1);
        assert!(ovpn.released() >= 1);
        assert_eq!(ike.released(), 0);
    }

    #[tokio::test]
    async fn test_discovery_timeout() {
        let mut config = OrchestratorConfig::default();
        config.timeouts.discovery_ms = 50;
        let mut slow = FakeBackend::new(VpnProtocol::WireGuard, vec![None]);
        Arc::get_mut(&mut slow).unwrap().delay = Duration::from_secs(5);
        let provider = BackendProvider::new(Arc::new(config)).with_backend(slow);

        let prepared = provider
            .prepare(
                &ProtocolSelection::of(VpnProtocol::WireGuard),
                &ConnectIntent::server("X"),
                &all_protocols_server(),
                true,
                &[],
                &CancellationToken::new(),
            )
            .await;
        assert!(prepared.is_none());
    }

    #[test]
    fn test_backends_in_priority_order() {
        let provider = BackendProvider::new(Arc::new(OrchestratorConfig::default()))
            .with_backend(FakeBackend::new(VpnProtocol::OpenVpn, vec![]))
            .with_backend(FakeBackend::new(VpnProtocol::WireGuard, vec![]));
        let order: Vec<_> = provider.backends().iter().map(|b| b.protocol()).collect();
        assert_eq!(order, vec![VpnProtocol::WireGuard, VpnProtocol::OpenVpn]);
    }
}
