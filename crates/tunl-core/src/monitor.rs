//! Connection State Monitor
//!
//! Single source of truth for the current [`VpnState`]. Only the
//! connection manager publishes; everyone else subscribes.
//!
//! Each subscriber gets its own unbounded queue, seeded with the current
//! state, so late observers see where things stand and no observer ever
//! misses or reorders a transition.

use crate::intent::Trigger;
use crate::params::ConnectionParams;
use crate::server::Server;
use crate::state::{UnifiedState, VpnState};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Triggers kept for inspection
const TRIGGER_HISTORY: usize = 32;

/// Current state plus what it refers to
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub state: VpnState,
    /// Parameters of the established tunnel
    pub params: Option<ConnectionParams>,
    /// Server of the established tunnel
    pub server: Option<Server>,
}

/// A trigger and when it was received
#[derive(Debug, Clone)]
pub struct TriggerRecord {
    pub trigger: Trigger,
    pub at: SystemTime,
}

/// Receiving end of a subscription
pub type StateStream = mpsc::UnboundedReceiver<VpnState>;

#[derive(Default)]
struct Inner {
    status: Status,
    subscribers: Vec<mpsc::UnboundedSender<VpnState>>,
    triggers: VecDeque<TriggerRecord>,
}

/// Multicast holder of the current state
#[derive(Default)]
pub struct StateMonitor {
    inner: Mutex<Inner>,
}

impl StateMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the current status
    pub fn status(&self) -> Status {
        self.lock().status.clone()
    }

    /// Current state
    pub fn state(&self) -> VpnState {
        self.lock().status.state.clone()
    }

    /// Subscribe; the current state is delivered first
    pub fn subscribe(&self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let _ = tx.send(inner.status.state.clone());
        inner.subscribers.push(tx);
        rx
    }

    /// Publish a new state. Repeats of the current state are dropped.
    pub(crate) fn publish(&self, state: VpnState, params: Option<ConnectionParams>) {
        let mut inner = self.lock();
        let same_params = inner.status.params.as_ref().map(|p| p.id) == params.as_ref().map(|p| p.id);
        if inner.status.state == state && same_params {
            return;
        }
        info!("State: {} -> {}", inner.status.state, state);
        inner.status.server = params.as_ref().map(|p| p.server.clone());
        inner.status.params = params;
        inner.status.state = state.clone();
        // Delivery happens under the lock so publishers never interleave
        inner.subscribers.retain(|tx| tx.send(state.clone()).is_ok());
    }

    /// Remember why something was requested
    pub(crate) fn record_trigger(&self, trigger: Trigger) {
        debug!("Trigger: {}", trigger);
        let mut inner = self.lock();
        if inner.triggers.len() == TRIGGER_HISTORY {
            inner.triggers.pop_front();
        }
        inner.triggers.push_back(TriggerRecord {
            trigger,
            at: SystemTime::now(),
        });
    }

    /// Recent triggers, oldest first
    pub fn triggers(&self) -> Vec<TriggerRecord> {
        self.lock().triggers.iter().cloned().collect()
    }

    /// Most recent trigger
    pub fn last_trigger(&self) -> Option<Trigger> {
        self.lock().triggers.back().map(|r| r.trigger.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().status.state.is_connected()
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().status.state.is_disabled()
    }

    pub fn is_establishing_or_connected(&self) -> bool {
        self.lock().status.state.is_establishing_or_connected()
    }

    /// Coarse four-state view
    pub fn unified_state(&self) -> UnifiedState {
        self.lock().status.state.unified()
    }

    /// Live subscriber count
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    /// Wait until a state matches, returning it
    pub async fn wait_for(&self, mut predicate: impl FnMut(&VpnState) -> bool) -> VpnState {
        let mut stream = self.subscribe();
        while let Some(state) = stream.recv().await {
            if predicate(&state) {
                return state;
            }
        }
        // The monitor holds the sender side until it is dropped
        self.state()
    }
}
