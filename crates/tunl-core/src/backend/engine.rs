//! Tunnel Engines
//!
//! The opaque low-level protocol implementation behind a backend. Backends
//! own an engine through an [`EngineSession`], which drives it and maps its
//! status onto [`VpnState`].
//!
//! # Status mapping
//!
//! | Engine | VpnState |
//! |--------|----------|
//! | Connecting | Connecting |
//! | Up | Connected |
//! | WaitingForNetwork | WaitingForNetwork |
//! | Error (auth) | Error(AuthenticationFailure, final) |
//! | Error (other) x5 | Error(TransientUnreachable, non-final) |
//! | Closed | Disabled |

use crate::credentials::Credential;
use crate::keys::KeyPair;
use crate::params::ConnectionParams;
use crate::state::{ErrorKind, VpnError, VpnState};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive engine errors tolerated before reporting unreachable
pub const FAIL_COUNTDOWN_INIT: u32 = 5;

/// Engine status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Not started
    Down,
    /// Handshake in progress
    Connecting,
    /// Tunnel up
    Up,
    /// Network gone, engine waiting
    WaitingForNetwork,
    /// Engine reported an error, may recover
    Error(EngineError),
    /// Engine shut down for good
    Closed,
}

/// Everything an engine needs to bring a tunnel up
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub params: ConnectionParams,
    /// Client keys (ephemeral for guest hole connections)
    pub keys: KeyPair,
    /// Client certificate, when issued
    pub certificate: Option<String>,
    /// Persistent keepalive
    pub keepalive: Duration,
}

/// Low-level tunnel implementation
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Engine name for logs
    fn name(&self) -> &'static str;

    /// Bring the tunnel up, returning once the handshake completed
    async fn start(&self, config: EngineConfig) -> Result<(), EngineError>;

    /// Shut the tunnel down
    async fn stop(&self);

    /// Status stream
    fn status(&self) -> watch::Receiver<EngineStatus>;

    /// Round trip over the control channel
    async fn ping(&self, timeout: Duration) -> Result<Duration, EngineError>;
}

/// Maps engine statuses to backend states, with a failure countdown
#[derive(Debug)]
pub struct StatusMapper {
    countdown: u32,
}

impl StatusMapper {
    pub fn new() -> Self {
        Self {
            countdown: FAIL_COUNTDOWN_INIT,
        }
    }

    /// Backend state for an engine status, `None` when nothing changes
    pub fn map(&mut self, status: &EngineStatus) -> Option<VpnState> {
        match status {
            EngineStatus::Down => None,
            EngineStatus::Connecting => Some(VpnState::Connecting),
            EngineStatus::Up => {
                self.countdown = FAIL_COUNTDOWN_INIT;
                Some(VpnState::Connected)
            }
            EngineStatus::WaitingForNetwork => Some(VpnState::WaitingForNetwork),
            EngineStatus::Error(e) if e.is_auth() => Some(VpnState::Error(VpnError::fatal(
                ErrorKind::AuthenticationFailure,
                e.to_string(),
            ))),
            EngineStatus::Error(EngineError::NoNetwork) => Some(VpnState::WaitingForNetwork),
            EngineStatus::Error(e) => {
                self.countdown = self.countdown.saturating_sub(1);
                if self.countdown == 0 {
                    self.countdown = FAIL_COUNTDOWN_INIT;
                    Some(VpnState::Error(VpnError::transient(
                        ErrorKind::TransientUnreachable,
                        e.to_string(),
                    )))
                } else {
                    Some(VpnState::Connecting)
                }
            }
            EngineStatus::Closed => Some(VpnState::Disabled),
        }
    }
}

impl Default for StatusMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// State for a failed start
pub fn start_failure(error: &EngineError) -> VpnState {
    let kind = match error {
        e if e.is_auth() => ErrorKind::AuthenticationFailure,
        EngineError::NoNetwork => ErrorKind::NetworkUnavailable,
        _ => ErrorKind::TransientUnreachable,
    };
    let mut err = VpnError::new(kind);
    err.description = Some(error.to_string());
    VpnState::Error(err)
}

/// Drives one engine on behalf of a backend
pub struct EngineSession {
    engine: Arc<dyn TunnelEngine>,
    state: watch::Sender<VpnState>,
    active: Mutex<Option<ActiveTunnel>>,
    handshake_timeout: Duration,
    disconnect_timeout: Duration,
    keepalive: Duration,
}

struct ActiveTunnel {
    params: ConnectionParams,
    monitor: JoinHandle<()>,
    stop: CancellationToken,
}

impl EngineSession {
    pub fn new(
        engine: Arc<dyn TunnelEngine>,
        handshake_timeout: Duration,
        disconnect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(VpnState::Disabled);
        Self {
            engine,
            state,
            active: Mutex::new(None),
            handshake_timeout,
            disconnect_timeout,
            keepalive: Duration::from_secs(25),
        }
    }

    /// Status stream
    pub fn status(&self) -> watch::Receiver<VpnState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: VpnState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Start the engine and forward its status
    pub async fn connect(
        &self,
        params: &ConnectionParams,
        credential: Option<&Credential>,
        cancel: &CancellationToken,
    ) {
        self.shutdown_monitor().await;
        self.set_state(VpnState::Connecting);
        info!("{}: connecting to {}", self.engine.name(), params);

        let config = EngineConfig {
            params: params.clone(),
            keys: credential
                .map(|c| c.keys.clone())
                .unwrap_or_else(KeyPair::generate),
            certificate: credential.and_then(|c| c.certificate.clone()),
            keepalive: self.keepalive,
        };

        // Subscribed before start so nothing published after start is missed
        let engine_status = self.engine.status();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("{}: connect cancelled", self.engine.name());
                self.engine.stop().await;
                self.set_state(VpnState::Disabled);
                return;
            }
            r = tokio::time::timeout(self.handshake_timeout, self.engine.start(config)) => r,
        };

        match result {
            Ok(Ok(())) => {
                self.set_state(VpnState::Connected);
                let stop = CancellationToken::new();
                let monitor = spawn_monitor(engine_status, self.state.clone(), stop.clone());
                *self.active.lock().await = Some(ActiveTunnel {
                    params: params.clone(),
                    monitor,
                    stop,
                });
            }
            Ok(Err(e)) => {
                warn!("{}: start failed: {}", self.engine.name(), e);
                self.engine.stop().await;
                self.set_state(start_failure(&e));
            }
            Err(_) => {
                warn!("{}: handshake timed out", self.engine.name());
                self.engine.stop().await;
                self.set_state(start_failure(&EngineError::HandshakeTimeout));
            }
        }
    }

    async fn shutdown_monitor(&self) -> Option<ConnectionParams> {
        let active = self.active.lock().await.take()?;
        active.stop.cancel();
        active.monitor.abort();
        Some(active.params)
    }

    /// Stop the engine
    pub async fn disconnect(&self, with_state_change: bool) {
        let was_active = self.shutdown_monitor().await.is_some();
        if with_state_change && !self.state.borrow().is_disabled() {
            self.set_state(VpnState::Disconnecting);
        }
        if tokio::time::timeout(self.disconnect_timeout, self.engine.stop())
            .await
            .is_err()
        {
            warn!("{}: stop timed out", self.engine.name());
        }
        if was_active {
            debug!("{}: tunnel closed", self.engine.name());
        }
        if with_state_change {
            self.set_state(VpnState::Disabled);
        }
    }

    /// Ping the control channel once
    pub async fn check_liveness(&self, timeout: Duration) -> bool {
        match self.engine.ping(timeout).await {
            Ok(rtt) => {
                debug!("{}: control channel answered in {:?}", self.engine.name(), rtt);
                true
            }
            Err(e) => {
                debug!("{}: control channel check failed: {}", self.engine.name(), e);
                false
            }
        }
    }

    /// Parameters of the tunnel, when the engine still reports it up
    pub async fn live_tunnel(&self) -> Option<ConnectionParams> {
        let active = self.active.lock().await;
        let params = active.as_ref()?.params.clone();
        let up = *self.engine.status().borrow() == EngineStatus::Up;
        up.then_some(params)
    }
}

fn spawn_monitor(
    mut engine: watch::Receiver<EngineStatus>,
    state: watch::Sender<VpnState>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut mapper = StatusMapper::new();
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = engine.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = engine.borrow_and_update().clone();
                    let closed = status == EngineStatus::Closed;
                    if let Some(next) = mapper.map(&status) {
                        state.send_if_modified(|current| {
                            if *current == next {
                                false
                            } else {
                                *current = next;
                                true
                            }
                        });
                    }
                    if closed {
                        break;
                    }
                }
            }
        }
    })
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Tunnel not connected")]
    NotConnected,

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timeout")]
    HandshakeTimeout,

    #[error("Peer rejected credentials: {0}")]
    AuthRejected(String),

    #[error("Invalid peer key: {0}")]
    InvalidPeerKey(String),

    #[error("No network")]
    NoNetwork,

    #[error("Connection lost")]
    ConnectionLost,
}

impl EngineError {
    /// Does this error mean the credentials are no good?
    pub fn is_auth(&self) -> bool {
        matches!(self, EngineError::AuthRejected(_) | EngineError::InvalidPeerKey(_))
    }
}
