//! tunl - VPN connection orchestration
//!
//! Turns a user's connect intent into an established tunnel and keeps it
//! there: resolves the intent against a server catalog, discovers which
//! protocol and port actually answer, drives a tunnel backend, and
//! recovers from failures by falling back, reconnecting, or surfacing an
//! error.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        ConnectionManager                       │
//! │  (actor: connect / disconnect / reconnect / restore / logout)  │
//! │                                                                │
//! │  ┌──────────────┐   ┌─────────────────┐   ┌─────────────────┐  │
//! │  │ServerResolver│──▶│ BackendProvider │──▶│   VpnBackend    │  │
//! │  │  (catalog)   │   │ (Smart / fixed) │   │ WG/OVPN/IKE/PT  │  │
//! │  └──────────────┘   └─────────────────┘   └────────┬────────┘  │
//! │                                                    │ status    │
//! │  ┌──────────────────┐      ┌──────────────┐        ▼           │
//! │  │ LivenessTracker  │─────▶│ StateMonitor │◀── forwarded       │
//! │  └──────────────────┘      └──────┬───────┘                    │
//! └───────────────────────────────────│────────────────────────────┘
//!                                     ▼ subscribers
//! ```
//!
//! # Features
//!
//! - **Smart protocol**: probes the configured protocols in priority
//!   order and connects through the first (or fastest) that answers
//! - **Fallback**: non-final failures retry with backoff, moving to the
//!   next protocol or server
//! - **Liveness**: consecutive failed control-channel checks trigger a
//!   reconnect
//! - **Guest hole**: short-lived tunnel for calls that need the API
//!   before login
//! - **Ordered state stream**: every subscriber sees every transition in
//!   publication order

pub mod backend;
mod catalog;
mod config;
mod credentials;
mod guest_hole;
mod history;
mod intent;
mod keys;
mod liveness;
mod manager;
mod monitor;
mod params;
mod protocol;
mod provider;
mod server;
mod state;

pub use backend::{PrepareRequest, VpnBackend};
pub use catalog::{CatalogError, ResolveError, ServerCatalog, ServerResolver, FALLBACK_SERVERS};
pub use config::{
    ConfigError, ConfigFormat, GuestHoleConfig, LivenessConfig, OrchestratorConfig, PortConfig,
    RetryPolicy, SmartConfig, Timeouts,
};
pub use credentials::{Credential, CredentialError, CredentialService, LocalCredentialStore, SessionId};
pub use guest_hole::{GuestHole, GuestHoleError};
pub use history::{ConnectionHistory, MemoryHistory, NoHistory};
pub use intent::{ConnectIntent, ServerFeature, Trigger};
pub use keys::{KeyError, KeyPair, PrivateKey, PublicKey};
pub use liveness::{LivenessTracker, TunnelHealth, Unreachable};
pub use manager::{ConnectionManager, ManagerError, ManagerEvent, RestoreOutcome};
pub use monitor::{StateMonitor, StateStream, Status, TriggerRecord};
pub use params::{compute_allowed_ips, Cidr, ConnectionParams, PrepareResult, ProTunPeer};
pub use protocol::{ProtocolError, ProtocolSelection, TransmissionProtocol, VpnProtocol};
pub use provider::{BackendProvider, Prepared};
pub use server::{ConnectingDomain, DomainProtocol, Server};
pub use state::{ErrorKind, UnifiedState, VpnError, VpnState};
