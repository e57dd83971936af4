//! Guest hole
//!
//! Opens a short-lived tunnel to one of a few fixed servers so that a
//! call which cannot reach the API directly (typically login) can go
//! through, then closes it again. The tunnel is never left running after
//! the call, its timeout, or a failure.

use crate::config::GuestHoleConfig;
use crate::intent::{ConnectIntent, Trigger};
use crate::manager::{ConnectionManager, ManagerError};
use rand::seq::SliceRandom;
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Guest hole errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuestHoleError {
    #[error("No guest hole servers configured")]
    NoServers,

    #[error("No guest hole server could be reached")]
    Unavailable,

    #[error("Guest hole timed out")]
    TimedOut,

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Runs calls through a temporary tunnel
pub struct GuestHole {
    manager: ConnectionManager,
    config: GuestHoleConfig,
    last_success: Mutex<Option<String>>,
}

impl GuestHole {
    pub fn new(manager: ConnectionManager, config: GuestHoleConfig) -> Self {
        Self {
            manager,
            config,
            last_success: Mutex::new(None),
        }
    }

    /// Run `call`, opening the guest hole around it unless a tunnel is
    /// already up
    pub async fn unblock<F, Fut, T>(&self, call: F) -> Result<T, GuestHoleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.manager.monitor().is_connected() {
            debug!("Tunnel already up, no guest hole needed");
            return Ok(call().await);
        }
        if self.config.servers.is_empty() {
            return Err(GuestHoleError::NoServers);
        }

        let candidates = self.candidates();
        let outcome = tokio::time::timeout(self.config.overall_timeout(), async {
            self.open(&candidates).await?;
            tokio::time::sleep(self.config.settle()).await;
            Ok::<T, GuestHoleError>(call().await)
        })
        .await;

        // Only closes when the active intent is still the guest hole
        if let Err(e) = self.manager.disconnect_guest_hole().await {
            warn!("Could not close guest hole: {}", e);
        }
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!("Guest hole timed out after {:?}", self.config.overall_timeout());
                Err(GuestHoleError::TimedOut)
            }
        }
    }

    /// Shuffled servers, last successful one first
    fn candidates(&self) -> Vec<String> {
        let mut servers = self.config.servers.clone();
        servers.shuffle(&mut rand::thread_rng());
        let last = self.last_success.lock().ok().and_then(|l| l.clone());
        if let Some(pos) = last.and_then(|id| servers.iter().position(|s| *s == id)) {
            let preferred = servers.remove(pos);
            servers.insert(0, preferred);
        }
        servers.truncate(self.config.server_count.max(1));
        servers
    }

    async fn open(&self, candidates: &[String]) -> Result<(), GuestHoleError> {
        for server_id in candidates {
            let intent = ConnectIntent::GuestHole {
                server_id: server_id.clone(),
            };
            let mut states = self.manager.subscribe();
            self.manager
                .connect_with(intent.clone(), self.config.protocol, Trigger::GuestHole)?;

            let monitor = self.manager.monitor();
            let reached = tokio::time::timeout(self.config.server_timeout(), async {
                while let Some(state) = states.recv().await {
                    if state.final_error().is_some() {
                        return false;
                    }
                    let ours = monitor
                        .status()
                        .params
                        .is_some_and(|p| p.intent == intent);
                    if state.is_connected() && ours {
                        return true;
                    }
                }
                false
            })
            .await;

            match reached {
                Ok(true) => {
                    info!("Guest hole open via {}", server_id);
                    if let Ok(mut last) = self.last_success.lock() {
                        *last = Some(server_id.clone());
                    }
                    return Ok(());
                }
                Ok(false) => warn!("Guest hole server {} failed", server_id),
                Err(_) => warn!("Guest hole server {} timed out", server_id),
            }
        }
        Err(GuestHoleError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::engine::fixtures::ScriptedEngine;
    use crate::backend::{EngineError, WireGuardBackend};
    use crate::catalog::ServerCatalog;
    use crate::config::OrchestratorConfig;
    use crate::credentials::LocalCredentialStore;
    use crate::history::MemoryHistory;
    use crate::protocol::{ProtocolSelection, VpnProtocol};
    use crate::provider::BackendProvider;
    use crate::server::DomainProtocol;
    use crate::server::fixtures::{domain, server};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn setup(engine: Arc<ScriptedEngine>) -> (GuestHole, ConnectionManager, Arc<MemoryHistory>) {
        let mut config = OrchestratorConfig::default();
        config.retry.initial_backoff_ms = 0;
        config.timeouts.probe_ms = 50;
        config.guest_hole.servers = vec!["GH#1".into(), "GH#2".into()];
        config.guest_hole.protocol = ProtocolSelection::of(VpnProtocol::WireGuard);
        config.guest_hole.settle_ms = 10;
        let config = Arc::new(config);

        let provider = BackendProvider::new(config.clone())
            .with_backend(Arc::new(WireGuardBackend::new(engine, config.clone())));
        let wg = || vec![DomainProtocol::all(VpnProtocol::WireGuard)];
        let catalog = ServerCatalog::new(vec![
            server("GH#1", "NL", vec![domain("gh1", wg())]),
            server("GH#2", "NL", vec![domain("gh2", wg())]),
            server("CH#1", "CH", vec![domain("ch1", wg())]),
        ]);
        let history = Arc::new(MemoryHistory::new());
        let manager = ConnectionManager::spawn(
            config.clone(),
            provider,
            Arc::new(catalog),
            Arc::new(LocalCredentialStore::new(Duration::from_secs(60))),
            history.clone(),
        );
        let guest_hole = GuestHole::new(manager.clone(), config.guest_hole.clone());
        (guest_hole, manager, history)
    }

    #[tokio::test]
    async fn test_call_runs_inside_guest_hole() {
        let (guest_hole, manager, history) = setup(ScriptedEngine::ok());
        let monitor = manager.monitor().clone();

        // No session: the guest hole needs none
        let result = guest_hole
            .unblock(|| async move { monitor.is_connected() })
            .await
            .unwrap();
        assert!(result);
        assert!(manager.monitor().is_disabled());
        assert!(history.intents().is_empty());
        assert_eq!(manager.monitor().last_trigger(), Some(Trigger::GuestHole));
    }

    #[tokio::test]
    async fn test_prefers_last_successful_server() {
        let (guest_hole, _manager, _history) = setup(ScriptedEngine::ok());
        guest_hole.unblock(|| async {}).await.unwrap();
        let first = guest_hole.last_success.lock().unwrap().clone().unwrap();
        for _ in 0..5 {
            assert_eq!(guest_hole.candidates()[0], first);
        }
    }

    #[tokio::test]
    async fn test_skipped_when_connected() {
        let engine = ScriptedEngine::ok();
        let (guest_hole, manager, _history) = setup(engine.clone());
        manager.set_session(Some(crate::credentials::SessionId::new("s"))).unwrap();
        manager
            .connect(ConnectIntent::fastest_in("CH"), Trigger::User("test".into()))
            .unwrap();
        manager.monitor().wait_for(|s| s.is_connected()).await;
        let starts = engine.starts.load(Ordering::SeqCst);

        assert_eq!(guest_hole.unblock(|| async { 7 }).await.unwrap(), 7);
        assert_eq!(engine.starts.load(Ordering::SeqCst), starts);
        // The user's tunnel stays up
        assert!(manager.monitor().is_connected());
    }

    #[tokio::test]
    async fn test_unavailable_when_every_server_fails() {
        let engine = ScriptedEngine::new(Err(EngineError::HandshakeFailed("nope".into())), Duration::ZERO);
        let (guest_hole, manager, _history) = setup(engine);
        let err = guest_hole.unblock(|| async {}).await.unwrap_err();
        assert_eq!(err, GuestHoleError::Unavailable);
        assert!(manager.monitor().is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out_and_closes_tunnel() {
        let engine = ScriptedEngine::ok();
        let (guest_hole, manager, _history) = setup(engine.clone());
        let overall = guest_hole.config.overall_timeout();

        let err = guest_hole
            .unblock(|| tokio::time::sleep(overall * 2))
            .await
            .unwrap_err();
        assert_eq!(err, GuestHoleError::TimedOut);
        assert!(manager.monitor().is_disabled());
        assert!(engine.stops.load(Ordering::SeqCst) >= 1);
        assert_eq!(manager.monitor().last_trigger(), Some(Trigger::GuestHole));
    }

    #[tokio::test]
    async fn test_no_servers() {
        let (_guest_hole, manager, _history) = setup(ScriptedEngine::ok());
        let empty = GuestHole::new(manager, GuestHoleConfig {
            servers: vec![],
            ..GuestHoleConfig::default()
        });
        assert_eq!(empty.unblock(|| async {}).await.unwrap_err(), GuestHoleError::NoServers);
    }
}
