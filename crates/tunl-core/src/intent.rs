//! Connect intents and triggers
//!
//! A [`ConnectIntent`] says *what* to connect to, independent of protocol.
//! A [`Trigger`] says *why* a connect or disconnect was requested; it is
//! logged and kept in the monitor's history but never changes behavior.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Server feature flags an intent may require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerFeature {
    SecureCore,
    Tor,
    P2p,
    Streaming,
}

/// Abstract description of the desired destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConnectIntent {
    /// Fastest server in a country
    FastestInCountry {
        country: String,
        #[serde(default)]
        features: Vec<ServerFeature>,
    },
    /// Fastest server in a city
    FastestInCity {
        country: String,
        city: String,
        #[serde(default)]
        features: Vec<ServerFeature>,
    },
    /// A specific server
    Server { server_id: String },
    /// Secure core pair: enter in one country, exit in another
    SecureCore {
        entry_country: Option<String>,
        exit_country: String,
    },
    /// Dedicated gateway
    Gateway {
        name: String,
        server_id: Option<String>,
    },
    /// Purpose-restricted tunnel used only to unblock authentication
    GuestHole { server_id: String },
}

impl ConnectIntent {
    /// Fastest in country shortcut
    pub fn fastest_in(country: &str) -> Self {
        ConnectIntent::FastestInCountry {
            country: country.to_uppercase(),
            features: Vec::new(),
        }
    }

    /// Specific server shortcut
    pub fn server(server_id: &str) -> Self {
        ConnectIntent::Server {
            server_id: server_id.to_string(),
        }
    }

    /// Is this a guest hole connection?
    pub fn is_guest_hole(&self) -> bool {
        matches!(self, ConnectIntent::GuestHole { .. })
    }

    /// Features the chosen server must have
    pub fn required_features(&self) -> Vec<ServerFeature> {
        match self {
            ConnectIntent::FastestInCountry { features, .. }
            | ConnectIntent::FastestInCity { features, .. } => features.clone(),
            ConnectIntent::SecureCore { .. } => vec![ServerFeature::SecureCore],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for ConnectIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectIntent::FastestInCountry { country, .. } => write!(f, "fastest in {}", country),
            ConnectIntent::FastestInCity { country, city, .. } => {
                write!(f, "fastest in {} ({})", city, country)
            }
            ConnectIntent::Server { server_id } => write!(f, "server {}", server_id),
            ConnectIntent::SecureCore {
                entry_country,
                exit_country,
            } => match entry_country {
                Some(entry) => write!(f, "secure core {} >> {}", entry, exit_country),
                None => write!(f, "secure core >> {}", exit_country),
            },
            ConnectIntent::Gateway { name, .. } => write!(f, "gateway {}", name),
            ConnectIntent::GuestHole { server_id } => write!(f, "guest hole via {}", server_id),
        }
    }
}

/// Why a connect or disconnect was requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "kebab-case")]
pub enum Trigger {
    /// User pressed something
    User(String),
    /// User acted on a notification
    Notification(String),
    /// Managed auto-login connected on the user's behalf
    AutoLogin,
    /// Platform always-on relaunch
    AlwaysOn,
    /// Process restarted and restored the connection
    ProcessRestore(String),
    /// Connection manager fell back to another candidate
    Fallback(String),
    /// Full reconnection (settings changed, liveness lost)
    Reconnect(String),
    /// Guest hole opened or closed
    GuestHole,
    /// Session ended
    Logout,
    /// Anything else the system decided
    System(String),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::User(d) => write!(f, "user: {}", d),
            Trigger::Notification(d) => write!(f, "notification: {}", d),
            Trigger::AutoLogin => f.write_str("auto-login"),
            Trigger::AlwaysOn => f.write_str("always-on"),
            Trigger::ProcessRestore(d) => write!(f, "process restore: {}", d),
            Trigger::Fallback(d) => write!(f, "fallback: {}", d),
            Trigger::Reconnect(d) => write!(f, "reconnect: {}", d),
            Trigger::GuestHole => f.write_str("guest hole"),
            Trigger::Logout => f.write_str("logout"),
            Trigger::System(d) => write!(f, "system: {}", d),
        }
    }
}
