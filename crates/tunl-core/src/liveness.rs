//! Liveness Tracker
//!
//! Pings the active tunnel's control channel at a fixed interval and
//! reports [`Unreachable`] after N consecutive failures. Checks only run
//! while the published state is `Connected`; any other state (an attempt
//! or a teardown in progress) resets the count.

use crate::backend::VpnBackend;
use crate::config::LivenessConfig;
use crate::monitor::StateMonitor;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Raised when the tunnel stopped answering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unreachable {
    /// Attempt generation of the tunnel being watched
    pub generation: u64,
    /// Consecutive failed checks
    pub failures: u32,
}

/// Check record of the watched tunnel
#[derive(Debug, Clone, Default)]
pub struct TunnelHealth {
    /// Last successful check
    pub last_ok: Option<Instant>,
    /// Checks performed
    pub checks: u64,
    /// Checks answered
    pub answered: u64,
    /// Consecutive failures
    pub failures: u32,
}

impl TunnelHealth {
    /// Percentage of unanswered checks
    pub fn loss(&self) -> f32 {
        if self.checks == 0 {
            0.0
        } else {
            ((self.checks - self.answered) as f32 / self.checks as f32) * 100.0
        }
    }

    pub fn record_success(&mut self) {
        self.last_ok = Some(Instant::now());
        self.checks += 1;
        self.answered += 1;
        self.failures = 0;
    }

    /// Returns the consecutive failure count
    pub fn record_failure(&mut self) -> u32 {
        self.checks += 1;
        self.failures += 1;
        self.failures
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Watchdog for one established tunnel
pub struct LivenessTracker {
    config: LivenessConfig,
    monitor: Arc<StateMonitor>,
}

impl LivenessTracker {
    pub fn new(config: LivenessConfig, monitor: Arc<StateMonitor>) -> Self {
        Self { config, monitor }
    }

    /// Watch `backend` until cancelled or the tunnel is declared unreachable
    pub fn spawn(
        self,
        backend: Arc<dyn VpnBackend>,
        generation: u64,
        signal: mpsc::UnboundedSender<Unreachable>,
        cancel: CancellationToken,
    ) -> JoinHandle<TunnelHealth> {
        tokio::spawn(async move { self.run(backend, generation, signal, cancel).await })
    }

    async fn run(
        self,
        backend: Arc<dyn VpnBackend>,
        generation: u64,
        signal: mpsc::UnboundedSender<Unreachable>,
        cancel: CancellationToken,
    ) -> TunnelHealth {
        let mut health = TunnelHealth::default();
        let threshold = self.config.failure_threshold.max(1);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.interval(),
            self.config.interval(),
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return health,
                _ = ticker.tick() => {}
            }
            if !self.monitor.is_connected() {
                health.reset();
                continue;
            }

            let alive = tokio::select! {
                _ = cancel.cancelled() => return health,
                alive = backend.check_liveness(self.config.check_timeout()) => alive,
            };
            if alive {
                health.record_success();
                continue;
            }

            let failures = health.record_failure();
            debug!("{} liveness check failed ({}/{})", backend.protocol(), failures, threshold);
            if failures < threshold {
                continue;
            }
            // Something else may have taken over while the check ran
            if cancel.is_cancelled() || !self.monitor.is_connected() {
                health.reset();
                continue;
            }
            warn!(
                "{} tunnel unreachable after {} failed checks ({:.0}% loss)",
                backend.protocol(),
                failures,
                health.loss()
            );
            let _ = signal.send(Unreachable { generation, failures });
            return health;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PrepareRequest;
    use crate::credentials::Credential;
    use crate::params::{ConnectionParams, PrepareResult};
    use crate::protocol::VpnProtocol;
    use crate::state::VpnState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::watch;

    struct Pingable {
        alive: AtomicBool,
        checks: AtomicUsize,
        state: watch::Sender<VpnState>,
    }

    impl Pingable {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                checks: AtomicUsize::new(0),
                state: watch::channel(VpnState::Connected).0,
            })
        }
    }

    #[async_trait]
    impl VpnBackend for Pingable {
        fn protocol(&self) -> VpnProtocol {
            VpnProtocol::WireGuard
        }

        async fn prepare(&self, _r: &PrepareRequest, _c: &CancellationToken) -> Vec<PrepareResult> {
            Vec::new()
        }

        async fn connect(&self, _p: &ConnectionParams, _c: Option<&Credential>, _t: &CancellationToken) {}

        async fn disconnect(&self, _with_state_change: bool) {}

        fn status(&self) -> watch::Receiver<VpnState> {
            self.state.subscribe()
        }

        async fn check_liveness(&self, _timeout: Duration) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.alive.load(Ordering::SeqCst)
        }

        async fn live_tunnel(&self) -> Option<ConnectionParams> {
            None
        }
    }

    fn config() -> LivenessConfig {
        LivenessConfig {
            interval_ms: 1000,
            check_timeout_ms: 100,
            failure_threshold: 3,
        }
    }

    #[test]
    fn test_health_record() {
        let mut health = TunnelHealth::default();
        health.record_success();
        assert_eq!(health.record_failure(), 1);
        assert_eq!(health.record_failure(), 2);
        assert!((health.loss() - 66.67).abs() < 0.01);
        health.record_success();
        assert_eq!(health.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_threshold() {
        let monitor = Arc::new(StateMonitor::new());
        monitor.publish(VpnState::Connected, None);
        let backend = Pingable::new(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = LivenessTracker::new(config(), monitor).spawn(backend.clone(), 7, tx, CancellationToken::new());
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal, Unreachable { generation: 7, failures: 3 });
        assert_eq!(backend.checks.load(Ordering::SeqCst), 3);
        assert_eq!(handle.await.unwrap().failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_tunnel_never_fires() {
        let monitor = Arc::new(StateMonitor::new());
        monitor.publish(VpnState::Connected, None);
        let backend = Pingable::new(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = LivenessTracker::new(config(), monitor).spawn(backend.clone(), 1, tx, cancel.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        let health = handle.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(health.answered >= 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_while_connecting() {
        let monitor = Arc::new(StateMonitor::new());
        monitor.publish(VpnState::Connecting, None);
        let backend = Pingable::new(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let handle = LivenessTracker::new(config(), monitor.clone()).spawn(backend.clone(), 1, tx, cancel.clone());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.checks.load(Ordering::SeqCst), 0);

        monitor.publish(VpnState::Disconnecting, None);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.checks.load(Ordering::SeqCst), 0);
        cancel.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
