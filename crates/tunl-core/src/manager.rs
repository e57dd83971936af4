//! Connection Manager
//!
//! Top-level orchestrator. All requests go through one actor task that
//! owns the active backend, the current intent and the attempt in flight.
//!
//! # Attempts
//!
//! Every connect, reconnect or disconnect bumps a generation number and
//! cancels whatever was running. The work itself (resolve, prepare,
//! connect, fallback) runs in a spawned task that first waits for the
//! superseded task to wind down and tears down what it left behind.
//! Events carry their generation; anything from an older one is dropped.
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::spawn(config, provider, resolver, credentials, history);
//! manager.set_session(Some(SessionId::new("me")))?;
//! manager.connect(ConnectIntent::fastest_in("CH"), Trigger::User("quick connect".into()))?;
//! manager.monitor().wait_for(|s| s.is_connected()).await;
//! manager.disconnect(Trigger::User("off".into())).await?;
//! ```

use crate::backend::VpnBackend;
use crate::catalog::{ResolveError, ServerResolver};
use crate::config::OrchestratorConfig;
use crate::credentials::{Credential, CredentialService, SessionId};
use crate::history::ConnectionHistory;
use crate::intent::{ConnectIntent, Trigger};
use crate::liveness::{LivenessTracker, Unreachable};
use crate::monitor::{StateMonitor, StateStream};
use crate::params::ConnectionParams;
use crate::protocol::ProtocolSelection;
use crate::provider::{BackendProvider, Prepared};
use crate::server::Server;
use crate::state::{ErrorKind, VpnError, VpnState};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of [`ConnectionManager::on_restore_process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A live tunnel was adopted without reconnecting
    Reattached,
    /// Nothing was up, a new connection was started
    Connecting,
    /// Something is already in progress
    Ignored,
}

/// Observability signals
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    ConnectRequested {
        intent: ConnectIntent,
        trigger: Trigger,
    },
    /// A non-final failure moved the attempt to the next candidate
    FallbackStarted {
        from: ProtocolSelection,
        server: String,
        error: VpnError,
        attempt: u32,
    },
    /// The liveness tracker gave up on the tunnel
    Unreachable {
        failures: u32,
    },
    ReconnectInitiated {
        intent: ConnectIntent,
        trigger: Trigger,
    },
    /// A final error reached the user
    Surfaced(VpnError),
}

/// Manager errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("Connection manager has stopped")]
    Stopped,
}

enum Command {
    Connect {
        intent: ConnectIntent,
        trigger: Trigger,
        protocol: Option<ProtocolSelection>,
    },
    Disconnect {
        trigger: Trigger,
        done: oneshot::Sender<()>,
    },
    Reconnect {
        intent: Option<ConnectIntent>,
        trigger: Trigger,
    },
    RestoreProcess {
        intent: ConnectIntent,
        reason: String,
        reply: oneshot::Sender<RestoreOutcome>,
    },
    AlwaysOn {
        intent: ConnectIntent,
        reply: oneshot::Sender<bool>,
    },
    DisconnectGuestHole {
        done: oneshot::Sender<()>,
    },
    SetSession(Option<SessionId>),
    SetProtocol(ProtocolSelection),
    Logout {
        done: oneshot::Sender<()>,
    },
}

enum Event {
    /// State produced by an attempt
    State { generation: u64, state: VpnState },
    /// Observability event produced by an attempt
    Notice { generation: u64, event: ManagerEvent },
    AttemptDone { generation: u64, outcome: AttemptOutcome },
    TeardownDone {
        generation: u64,
        done: Option<oneshot::Sender<()>>,
    },
    /// Status change of the active backend
    Backend { generation: u64, state: VpnState },
}

enum AttemptOutcome {
    Connected {
        backend: Arc<dyn VpnBackend>,
        params: ConnectionParams,
    },
    Failed(VpnError),
    Cancelled,
}

/// Every attempt/teardown task hands back the backend it left connected
type Task = JoinHandle<Option<Arc<dyn VpnBackend>>>;

/// Collaborators shared with attempt tasks
struct Shared {
    config: Arc<OrchestratorConfig>,
    provider: BackendProvider,
    resolver: Arc<dyn ServerResolver>,
    credentials: Arc<dyn CredentialService>,
    history: Arc<dyn ConnectionHistory>,
}

/// Handle to the connection manager actor
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    monitor: Arc<StateMonitor>,
    events: broadcast::Sender<ManagerEvent>,
}

impl ConnectionManager {
    /// Start the actor. Must be called inside a tokio runtime.
    pub fn spawn(
        config: Arc<OrchestratorConfig>,
        provider: BackendProvider,
        resolver: Arc<dyn ServerResolver>,
        credentials: Arc<dyn CredentialService>,
        history: Arc<dyn ConnectionHistory>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (unreachable, unreachable_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let monitor = Arc::new(StateMonitor::new());

        let actor = Actor {
            protocol: config.protocol,
            selection: config.protocol,
            shared: Arc::new(Shared {
                config,
                provider,
                resolver,
                credentials,
                history,
            }),
            monitor: monitor.clone(),
            events: events.clone(),
            internal,
            unreachable,
            session: None,
            generation: 0,
            phase: Phase::Idle,
            attempt_cancel: None,
            last_task: None,
            intent: None,
            active: None,
        };
        tokio::spawn(actor.run(command_rx, internal_rx, unreachable_rx));

        Self {
            commands,
            monitor,
            events,
        }
    }

    fn send(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Stopped)
    }

    /// Connect with the configured protocol, superseding anything in flight
    pub fn connect(&self, intent: ConnectIntent, trigger: Trigger) -> Result<(), ManagerError> {
        self.send(Command::Connect {
            intent,
            trigger,
            protocol: None,
        })
    }

    /// Connect with an explicit protocol selection
    pub fn connect_with(
        &self,
        intent: ConnectIntent,
        protocol: ProtocolSelection,
        trigger: Trigger,
    ) -> Result<(), ManagerError> {
        self.send(Command::Connect {
            intent,
            trigger,
            protocol: Some(protocol),
        })
    }

    /// Tear everything down; resolves once the state is `Disabled` or a
    /// later connect took over
    pub async fn disconnect(&self, trigger: Trigger) -> Result<(), ManagerError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Disconnect { trigger, done })?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Disconnect then connect again, to `intent` or the current intent
    pub fn reconnect(&self, intent: Option<ConnectIntent>, trigger: Trigger) -> Result<(), ManagerError> {
        self.send(Command::Reconnect { intent, trigger })
    }

    /// Re-attach to a tunnel that survived a process restart, or connect
    /// if nothing is up
    pub async fn on_restore_process(
        &self,
        intent: ConnectIntent,
        reason: impl Into<String>,
    ) -> Result<RestoreOutcome, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RestoreProcess {
            intent,
            reason: reason.into(),
            reply,
        })?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Always-on relaunch: connects only when fully disabled. Returns whether
    /// a connection was started.
    pub async fn on_always_on(&self, intent: ConnectIntent) -> Result<bool, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AlwaysOn { intent, reply })?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Disconnect only if the current intent is a guest hole
    pub(crate) async fn disconnect_guest_hole(&self) -> Result<(), ManagerError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::DisconnectGuestHole { done })?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    pub fn set_session(&self, session: Option<SessionId>) -> Result<(), ManagerError> {
        self.send(Command::SetSession(session))
    }

    /// Protocol used by later connects
    pub fn set_protocol(&self, protocol: ProtocolSelection) -> Result<(), ManagerError> {
        self.send(Command::SetProtocol(protocol))
    }

    /// Disconnect and drop the session's credential
    pub async fn logout(&self) -> Result<(), ManagerError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Logout { done })?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    pub fn monitor(&self) -> &Arc<StateMonitor> {
        &self.monitor
    }

    /// Subscribe to state changes (current state first)
    pub fn subscribe(&self) -> StateStream {
        self.monitor.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Disconnecting,
}

struct ActiveTunnel {
    backend: Arc<dyn VpnBackend>,
    params: ConnectionParams,
    /// Stops the status forwarder and the liveness tracker
    watch: CancellationToken,
}

struct Actor {
    shared: Arc<Shared>,
    monitor: Arc<StateMonitor>,
    events: broadcast::Sender<ManagerEvent>,
    internal: mpsc::UnboundedSender<Event>,
    unreachable: mpsc::UnboundedSender<Unreachable>,
    /// Protocol for new connects
    protocol: ProtocolSelection,
    /// Protocol of the current intent
    selection: ProtocolSelection,
    session: Option<SessionId>,
    generation: u64,
    phase: Phase,
    attempt_cancel: Option<CancellationToken>,
    last_task: Option<Task>,
    intent: Option<ConnectIntent>,
    active: Option<ActiveTunnel>,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Event>,
        mut unreachable: mpsc::UnboundedReceiver<Unreachable>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = internal.recv() => self.handle_event(event),
                Some(signal) = unreachable.recv() => self.handle_unreachable(signal),
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                intent,
                trigger,
                protocol,
            } => {
                info!("Connect to {} ({})", intent, trigger);
                self.monitor.record_trigger(trigger.clone());
                let _ = self.events.send(ManagerEvent::ConnectRequested {
                    intent: intent.clone(),
                    trigger: trigger.clone(),
                });
                let selection = protocol.unwrap_or(self.protocol);
                self.start_attempt(intent, trigger, selection, false);
            }
            Command::Disconnect { trigger, done } => {
                self.start_teardown(trigger, Some(done), None);
            }
            Command::Reconnect { intent, trigger } => {
                let Some(intent) = intent.or_else(|| self.intent.clone()) else {
                    warn!("Reconnect requested with nothing to reconnect to ({})", trigger);
                    return;
                };
                info!("Reconnect to {} ({})", intent, trigger);
                self.monitor.record_trigger(trigger.clone());
                let _ = self.events.send(ManagerEvent::ReconnectInitiated {
                    intent: intent.clone(),
                    trigger: trigger.clone(),
                });
                let reconnecting = self.active.is_some() || self.phase == Phase::Connecting;
                self.start_attempt(intent, trigger, self.protocol, reconnecting);
            }
            Command::RestoreProcess {
                intent,
                reason,
                reply,
            } => {
                let outcome = self.restore(intent, reason).await;
                let _ = reply.send(outcome);
            }
            Command::AlwaysOn { intent, reply } => {
                let idle = self.phase == Phase::Idle && self.active.is_none() && self.monitor.is_disabled();
                if idle {
                    info!("Always-on relaunch, connecting to {}", intent);
                    self.monitor.record_trigger(Trigger::AlwaysOn);
                    let _ = self.events.send(ManagerEvent::ConnectRequested {
                        intent: intent.clone(),
                        trigger: Trigger::AlwaysOn,
                    });
                    self.start_attempt(intent, Trigger::AlwaysOn, self.protocol, false);
                } else {
                    debug!("Always-on relaunch ignored, state is {}", self.monitor.state());
                }
                let _ = reply.send(idle);
            }
            Command::DisconnectGuestHole { done } => {
                if self.intent.as_ref().is_some_and(|i| i.is_guest_hole()) {
                    self.start_teardown(Trigger::GuestHole, Some(done), None);
                } else {
                    let _ = done.send(());
                }
            }
            Command::SetSession(session) => {
                debug!("Session {}", if session.is_some() { "set" } else { "cleared" });
                self.session = session;
            }
            Command::SetProtocol(protocol) => {
                info!("Protocol set to {}", protocol);
                self.protocol = protocol;
            }
            Command::Logout { done } => {
                let session = self.session.take();
                self.start_teardown(Trigger::Logout, Some(done), session);
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::State { generation, state } => {
                if generation == self.generation {
                    self.monitor.publish(state, None);
                }
            }
            Event::Notice { generation, event } => {
                if generation != self.generation {
                    return;
                }
                if let ManagerEvent::FallbackStarted { error, .. } = &event {
                    self.monitor.record_trigger(Trigger::Fallback(error.to_string()));
                }
                let _ = self.events.send(event);
            }
            Event::AttemptDone { generation, outcome } => self.attempt_done(generation, outcome),
            Event::TeardownDone { generation, done } => {
                if generation == self.generation {
                    self.phase = Phase::Idle;
                    self.attempt_cancel = None;
                    self.monitor.publish(VpnState::Disabled, None);
                    info!("Disconnected");
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Event::Backend { generation, state } => self.backend_state(generation, state),
        }
    }

    /// Bump the generation and cancel the attempt in flight
    fn supersede(&mut self) -> u64 {
        self.generation += 1;
        if let Some(cancel) = self.attempt_cancel.take() {
            cancel.cancel();
        }
        self.generation
    }

    fn take_active(&mut self) -> Option<Arc<dyn VpnBackend>> {
        self.active.take().map(|active| {
            active.watch.cancel();
            active.backend
        })
    }

    fn start_attempt(
        &mut self,
        intent: ConnectIntent,
        trigger: Trigger,
        selection: ProtocolSelection,
        reconnecting: bool,
    ) {
        let generation = self.supersede();
        let teardown = self.take_active();
        let cancel = CancellationToken::new();
        self.attempt_cancel = Some(cancel.clone());
        self.phase = Phase::Connecting;
        self.intent = Some(intent.clone());
        self.selection = selection;
        self.monitor.publish(
            if reconnecting {
                VpnState::Reconnecting
            } else {
                VpnState::CheckingAvailability
            },
            None,
        );

        let attempt = Attempt {
            shared: self.shared.clone(),
            generation,
            intent,
            trigger,
            selection,
            session: self.session.clone(),
            reconnecting,
            cancel,
            events: self.internal.clone(),
        };
        let previous = self.last_task.take();
        let internal = self.internal.clone();
        let timeout = self.shared.config.timeouts.disconnect();
        self.last_task = Some(tokio::spawn(async move {
            release(previous, teardown, false, timeout).await;
            let outcome = attempt.run().await;
            let leftover = match &outcome {
                AttemptOutcome::Connected { backend, .. } => Some(backend.clone()),
                _ => None,
            };
            let _ = internal.send(Event::AttemptDone { generation, outcome });
            leftover
        }));
    }

    fn start_teardown(
        &mut self,
        trigger: Trigger,
        done: Option<oneshot::Sender<()>>,
        clear: Option<SessionId>,
    ) {
        info!("Disconnect ({})", trigger);
        self.monitor.record_trigger(trigger);
        let generation = self.supersede();
        let teardown = self.take_active();
        self.intent = None;
        self.phase = Phase::Disconnecting;
        if !self.monitor.is_disabled() {
            self.monitor.publish(VpnState::Disconnecting, None);
        }

        let previous = self.last_task.take();
        let internal = self.internal.clone();
        let credentials = self.shared.credentials.clone();
        let timeout = self.shared.config.timeouts.disconnect();
        self.last_task = Some(tokio::spawn(async move {
            release(previous, teardown, true, timeout).await;
            if let Some(session) = clear {
                credentials.clear(&session).await;
            }
            let _ = internal.send(Event::TeardownDone { generation, done });
            None
        }));
    }

    /// Disconnect a backend in the background, after the current task
    fn chain_cleanup(&mut self, backend: Arc<dyn VpnBackend>) {
        let previous = self.last_task.take();
        let timeout = self.shared.config.timeouts.disconnect();
        self.last_task = Some(tokio::spawn(async move {
            release(previous, Some(backend), true, timeout).await;
            None
        }));
    }

    fn attempt_done(&mut self, generation: u64, outcome: AttemptOutcome) {
        if generation != self.generation {
            debug!("Discarding outcome of superseded attempt {}", generation);
            return;
        }
        self.phase = Phase::Idle;
        self.attempt_cancel = None;
        match outcome {
            AttemptOutcome::Connected { backend, params } => {
                info!("Connected to {}", params);
                self.monitor.publish(VpnState::Connected, Some(params.clone()));
                self.install(backend, params, generation);
            }
            AttemptOutcome::Failed(error) => self.surface(error),
            AttemptOutcome::Cancelled => {}
        }
    }

    /// Final error: shown once, then back to Disabled
    fn surface(&mut self, error: VpnError) {
        let error = error.into_final();
        error!("Connection failed: {}", error);
        self.intent = None;
        self.monitor.publish(VpnState::Error(error.clone()), None);
        self.monitor.publish(VpnState::Disabled, None);
        let _ = self.events.send(ManagerEvent::Surfaced(error));
    }

    /// Make `backend` the active one and start watching it
    fn install(&mut self, backend: Arc<dyn VpnBackend>, params: ConnectionParams, generation: u64) {
        let watch = CancellationToken::new();
        forward_status(backend.status(), generation, self.internal.clone(), watch.clone());
        LivenessTracker::new(self.shared.config.liveness.clone(), self.monitor.clone()).spawn(
            backend.clone(),
            generation,
            self.unreachable.clone(),
            watch.clone(),
        );
        self.active = Some(ActiveTunnel {
            backend,
            params,
            watch,
        });
    }

    fn backend_state(&mut self, generation: u64, state: VpnState) {
        if generation != self.generation || self.phase != Phase::Idle {
            return;
        }
        let Some(active) = &self.active else {
            return;
        };
        let params = active.params.clone();
        match state {
            VpnState::Error(error) if error.kind == ErrorKind::NetworkUnavailable && !error.is_final => {
                self.monitor.publish(VpnState::WaitingForNetwork, Some(params));
            }
            VpnState::Error(error) if error.is_final => {
                warn!("{} reported a final error: {}", params.vpn_protocol(), error);
                if error.kind == ErrorKind::AuthenticationFailure {
                    self.clear_credential();
                }
                self.supersede();
                if let Some(backend) = self.take_active() {
                    self.chain_cleanup(backend);
                }
                self.surface(error);
            }
            VpnState::Error(error) => {
                warn!("{} lost the tunnel: {}", params.vpn_protocol(), error);
                self.reconnect_active(Trigger::Reconnect(error.to_string()));
            }
            VpnState::Disabled => {
                warn!("{} went down on its own", params.vpn_protocol());
                self.reconnect_active(Trigger::Reconnect("backend disabled".into()));
            }
            state => self.monitor.publish(state, Some(params)),
        }
    }

    fn handle_unreachable(&mut self, signal: Unreachable) {
        if signal.generation != self.generation
            || self.phase != Phase::Idle
            || self.active.is_none()
            || !self.monitor.is_connected()
        {
            debug!("Ignoring unreachable signal for attempt {}", signal.generation);
            return;
        }
        let _ = self.events.send(ManagerEvent::Unreachable {
            failures: signal.failures,
        });
        self.reconnect_active(Trigger::Reconnect("tunnel unreachable".into()));
    }

    /// Reconnect to the current intent with the current protocol
    fn reconnect_active(&mut self, trigger: Trigger) {
        let Some(intent) = self.intent.clone() else {
            return;
        };
        info!("Reconnecting to {} ({})", intent, trigger);
        self.monitor.record_trigger(trigger.clone());
        let _ = self.events.send(ManagerEvent::ReconnectInitiated {
            intent: intent.clone(),
            trigger: trigger.clone(),
        });
        self.start_attempt(intent, trigger, self.selection, true);
    }

    fn clear_credential(&self) {
        if let Some(session) = self.session.clone() {
            let credentials = self.shared.credentials.clone();
            tokio::spawn(async move { credentials.clear(&session).await });
        }
    }

    async fn restore(&mut self, intent: ConnectIntent, reason: String) -> RestoreOutcome {
        if self.phase != Phase::Idle {
            debug!("Process restore ignored, an operation is in progress");
            return RestoreOutcome::Ignored;
        }
        if self.active.is_some() {
            return RestoreOutcome::Reattached;
        }
        for backend in self.shared.provider.backends() {
            let up = backend.status().borrow().is_connected();
            if !up {
                continue;
            }
            let Some(params) = backend.live_tunnel().await else {
                continue;
            };
            info!("Re-attached to {} after restart ({})", params, reason);
            self.monitor.record_trigger(Trigger::ProcessRestore(reason));
            let generation = self.supersede();
            self.intent = Some(params.intent.clone());
            self.selection = self.protocol;
            self.monitor.publish(VpnState::Connected, Some(params.clone()));
            self.install(backend, params, generation);
            return RestoreOutcome::Reattached;
        }
        if !self.monitor.is_disabled() {
            return RestoreOutcome::Ignored;
        }
        let trigger = Trigger::ProcessRestore(reason);
        info!("Nothing to re-attach to, connecting to {} ({})", intent, trigger);
        self.monitor.record_trigger(trigger.clone());
        let _ = self.events.send(ManagerEvent::ConnectRequested {
            intent: intent.clone(),
            trigger: trigger.clone(),
        });
        self.start_attempt(intent, trigger, self.protocol, false);
        RestoreOutcome::Connecting
    }

    async fn shutdown(mut self) {
        debug!("Connection manager stopping");
        self.supersede();
        let teardown = self.take_active();
        let timeout = self.shared.config.timeouts.disconnect();
        release(self.last_task.take(), teardown, true, timeout).await;
        self.monitor.publish(VpnState::Disabled, None);
    }
}

/// Wait for the superseded task, then disconnect what it and the previous
/// active tunnel left behind
async fn release(
    previous: Option<Task>,
    teardown: Option<Arc<dyn VpnBackend>>,
    with_state_change: bool,
    timeout: Duration,
) {
    let leftover = match previous {
        Some(task) => task.await.ok().flatten(),
        None => None,
    };
    let mut backends: Vec<Arc<dyn VpnBackend>> = teardown.into_iter().collect();
    if let Some(backend) = leftover {
        if !backends.iter().any(|b| Arc::ptr_eq(b, &backend)) {
            backends.push(backend);
        }
    }
    for backend in backends {
        debug!("Tearing down {}", backend.protocol());
        if tokio::time::timeout(timeout, backend.disconnect(with_state_change))
            .await
            .is_err()
        {
            warn!("{} did not disconnect within {:?}", backend.protocol(), timeout);
        }
    }
}

/// Forward an active backend's status changes to the actor
fn forward_status(
    mut status: watch::Receiver<VpnState>,
    generation: u64,
    internal: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let current = status.borrow_and_update().clone();
        if !current.is_connected() {
            let _ = internal.send(Event::Backend {
                generation,
                state: current,
            });
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = status.borrow_and_update().clone();
                    if internal.send(Event::Backend { generation, state }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Resolves once the backend reports `Connected`; never if its channel closes
async fn until_connected(mut status: watch::Receiver<VpnState>) {
    loop {
        if status.borrow_and_update().is_connected() {
            return;
        }
        if status.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// One connection attempt, fallback included
struct Attempt {
    shared: Arc<Shared>,
    generation: u64,
    intent: ConnectIntent,
    trigger: Trigger,
    selection: ProtocolSelection,
    session: Option<SessionId>,
    reconnecting: bool,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<Event>,
}

impl Attempt {
    fn publish(&self, state: VpnState) {
        let _ = self.events.send(Event::State {
            generation: self.generation,
            state,
        });
    }

    /// Intermediate states are only shown on a fresh connect
    fn progress(&self, state: VpnState) {
        if !self.reconnecting {
            self.publish(state);
        }
    }

    fn notify(&self, event: ManagerEvent) {
        let _ = self.events.send(Event::Notice {
            generation: self.generation,
            event,
        });
    }

    async fn run(mut self) -> AttemptOutcome {
        match self.establish().await {
            Ok(outcome) => outcome,
            Err(_) if self.cancel.is_cancelled() => AttemptOutcome::Cancelled,
            Err(error) => AttemptOutcome::Failed(error),
        }
    }

    async fn establish(&mut self) -> Result<AttemptOutcome, VpnError> {
        let shared = self.shared.clone();
        let Some(mut servers) = self.resolve().await? else {
            return Ok(AttemptOutcome::Cancelled);
        };
        let guest_hole = self.intent.is_guest_hole();
        let credential = if guest_hole {
            None
        } else {
            match self.credential().await? {
                Some(credential) => Some(credential),
                None => return Ok(AttemptOutcome::Cancelled),
            }
        };
        if !guest_hole {
            shared.history.record_attempt(&self.intent, SystemTime::now());
        }

        let policy = &shared.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let handshake_limit = shared.config.timeouts.handshake() + shared.config.timeouts.disconnect();
        let mut failures = 0u32;
        let mut server_index = 0usize;
        let mut tried: Vec<ProtocolSelection> = Vec::new();
        let mut last_error: Option<VpnError> = None;
        let mut fallbacks_fetched = false;

        loop {
            let server = &servers[server_index];
            let Some(prepared) = self.prepare(server, &tried).await else {
                if self.cancel.is_cancelled() {
                    return Ok(AttemptOutcome::Cancelled);
                }
                debug!("Nothing (left) to try on {}", server.name);
                tried.clear();
                match self.next_server(&mut servers, server_index, &mut fallbacks_fetched).await {
                    Some(next) => server_index = next,
                    None => return Err(last_error.unwrap_or_else(|| self.no_compatible_server())),
                }
                continue;
            };

            let Prepared { result, selection } = prepared;
            let Some(backend) = shared.provider.backend(result.backend) else {
                warn!(
                    "{} prepared a {} result with no backend, skipping {}",
                    selection, result.backend, server.name
                );
                tried.clear();
                match self.next_server(&mut servers, server_index, &mut fallbacks_fetched).await {
                    Some(next) => server_index = next,
                    None => return Err(last_error.unwrap_or_else(|| self.no_compatible_server())),
                }
                continue;
            };
            let params = result.params;
            self.progress(VpnState::Connecting);
            info!("Connecting to {} ({})", params, self.trigger);

            let finished = tokio::time::timeout(
                handshake_limit,
                backend.connect(&params, credential.as_ref(), &self.cancel),
            )
            .await
            .is_ok();
            if self.cancel.is_cancelled() {
                backend.disconnect(false).await;
                return Ok(AttemptOutcome::Cancelled);
            }
            let state = if finished {
                backend.status().borrow().clone()
            } else {
                VpnState::Error(VpnError::transient(
                    ErrorKind::TransientUnreachable,
                    "handshake timed out",
                ))
            };

            let error = match state {
                VpnState::Connected => return Ok(AttemptOutcome::Connected { backend, params }),
                VpnState::WaitingForNetwork => VpnError::transient(ErrorKind::NetworkUnavailable, "no network"),
                VpnState::Error(error) => error,
                other => VpnError::transient(
                    ErrorKind::TransientUnreachable,
                    format!("{} ended in {}", backend.protocol(), other.name()),
                ),
            };

            if error.is_final {
                backend.disconnect(false).await;
                if error.kind == ErrorKind::AuthenticationFailure {
                    if let Some(session) = &self.session {
                        shared.credentials.clear(session).await;
                    }
                }
                return Err(error);
            }

            if error.kind == ErrorKind::NetworkUnavailable {
                // Not counted; wait for the network and try the same candidate
                self.publish(VpnState::WaitingForNetwork);
                let resumed = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        backend.disconnect(false).await;
                        return Ok(AttemptOutcome::Cancelled);
                    }
                    _ = until_connected(backend.status()) => true,
                    _ = tokio::time::sleep(policy.max_backoff()) => false,
                };
                if resumed {
                    return Ok(AttemptOutcome::Connected { backend, params });
                }
                backend.disconnect(false).await;
                self.progress(VpnState::Connecting);
                continue;
            }

            failures += 1;
            warn!(
                "{} on {} failed ({}/{}): {}",
                selection, server.name, failures, max_attempts, error
            );
            backend.disconnect(false).await;
            if failures >= max_attempts {
                return Err(error);
            }

            self.notify(ManagerEvent::FallbackStarted {
                from: selection,
                server: server.name.clone(),
                error: error.clone(),
                attempt: failures,
            });
            self.reconnecting = true;
            self.publish(VpnState::Reconnecting);
            last_error = Some(error);
            if self.selection.is_smart() {
                tried.push(selection);
            } else {
                // Next candidate, wrapping around once nothing else is left
                server_index = self
                    .next_server(&mut servers, server_index, &mut fallbacks_fetched)
                    .await
                    .unwrap_or(0);
                tried.clear();
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(AttemptOutcome::Cancelled),
                _ = tokio::time::sleep(policy.backoff(failures)) => {}
            }
        }
    }

    /// Index of the server after `current`. Once the resolver's candidates
    /// are used up, compatible fallbacks are fetched (once per attempt) and
    /// appended. `None` when nothing is left.
    async fn next_server(
        &self,
        servers: &mut Vec<Server>,
        current: usize,
        fallbacks_fetched: &mut bool,
    ) -> Option<usize> {
        let next = current + 1;
        if next < servers.len() {
            return Some(next);
        }
        if *fallbacks_fetched || self.intent.is_guest_hole() {
            return None;
        }
        *fallbacks_fetched = true;
        let exclude: Vec<String> = servers.iter().map(|s| s.id.clone()).collect();
        let fallbacks = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            r = tokio::time::timeout(
                self.shared.config.timeouts.discovery(),
                self.shared.resolver.fallbacks(&self.intent, &exclude),
            ) => r.unwrap_or_default(),
        };
        if fallbacks.is_empty() {
            debug!("No compatible fallback for {}", self.intent);
            return None;
        }
        let names: Vec<&str> = fallbacks.iter().map(|s| s.name.as_str()).collect();
        info!("Falling back to compatible server(s) {} for {}", names.join(", "), self.intent);
        servers.extend(fallbacks);
        Some(next)
    }

    fn no_compatible_server(&self) -> VpnError {
        VpnError::fatal(
            ErrorKind::NoCompatibleServer,
            format!("no {} entry reachable for {}", self.selection, self.intent),
        )
    }

    /// Candidate servers, best first. `None` when cancelled.
    async fn resolve(&self) -> Result<Option<Vec<Server>>, VpnError> {
        let shared = &self.shared;
        let lookup = async {
            match &self.intent {
                ConnectIntent::GuestHole { server_id } => shared
                    .resolver
                    .server_by_id(server_id)
                    .await
                    .map(|server| vec![server])
                    .ok_or_else(|| ResolveError::UnknownServer(server_id.clone())),
                intent => shared.resolver.resolve(intent).await,
            }
        };
        let resolved = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            r = tokio::time::timeout(shared.config.timeouts.discovery(), lookup) => r,
        };
        match resolved {
            Ok(Ok(servers)) if !servers.is_empty() => {
                debug!("{} candidate server(s) for {}", servers.len(), self.intent);
                Ok(Some(servers))
            }
            Ok(Ok(_)) => Err(VpnError::fatal(
                ErrorKind::NoCompatibleServer,
                format!("no server for {}", self.intent),
            )),
            Ok(Err(e)) => Err(VpnError::fatal(ErrorKind::NoCompatibleServer, e.to_string())),
            Err(_) => Err(VpnError::fatal(
                ErrorKind::NoCompatibleServer,
                "server lookup timed out",
            )),
        }
    }

    /// Credential for the session. `None` when cancelled.
    async fn credential(&self) -> Result<Option<Credential>, VpnError> {
        let Some(session) = &self.session else {
            return Err(VpnError::fatal(ErrorKind::AuthenticationFailure, "no session"));
        };
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(None),
            r = tokio::time::timeout(
                self.shared.config.timeouts.discovery(),
                self.shared.credentials.get_credential(session),
            ) => r,
        };
        match fetched {
            Ok(Ok(credential)) => Ok(Some(credential)),
            Ok(Err(e)) => Err(VpnError::fatal(ErrorKind::AuthenticationFailure, e.to_string())),
            Err(_) => Err(VpnError::fatal(
                ErrorKind::AuthenticationFailure,
                "credential service timed out",
            )),
        }
    }

    /// Ask the provider, falling back to static entries when the scan
    /// finds nothing
    async fn prepare(&self, server: &Server, tried: &[ProtocolSelection]) -> Option<Prepared> {
        let provider = &self.shared.provider;
        self.progress(VpnState::ScanningPorts);
        let scanned = provider
            .prepare(&self.selection, &self.intent, server, true, tried, &self.cancel)
            .await;
        if scanned.is_some() || self.cancel.is_cancelled() {
            return scanned;
        }
        debug!("Scan found nothing on {}, trying static entries", server.name);
        provider
            .prepare(&self.selection, &self.intent, server, false, tried, &self.cancel)
            .await
    }
}
