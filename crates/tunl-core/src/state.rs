//! Connection state machine types

use std::fmt;

/// Stable error kinds surfaced through [`VpnState::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No backend/candidate combination works. Never retried.
    NoCompatibleServer,
    /// Transient unreachability. Eligible for fallback.
    TransientUnreachable,
    /// Credentials rejected or unavailable. Needs a refresh first.
    AuthenticationFailure,
    /// No network transport available.
    NetworkUnavailable,
    /// Attempt superseded. Never user visible.
    Cancelled,
}

impl ErrorKind {
    /// Whether this kind of error ends the connection when reported
    pub fn is_final_by_default(&self) -> bool {
        matches!(
            self,
            ErrorKind::NoCompatibleServer | ErrorKind::AuthenticationFailure
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NoCompatibleServer => "no compatible server",
            ErrorKind::TransientUnreachable => "server unreachable",
            ErrorKind::AuthenticationFailure => "authentication failure",
            ErrorKind::NetworkUnavailable => "network unavailable",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error details carried by [`VpnState::Error`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnError {
    pub kind: ErrorKind,
    pub description: Option<String>,
    pub is_final: bool,
}

impl VpnError {
    /// Error with the kind's default finality
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            description: None,
            is_final: kind.is_final_by_default(),
        }
    }

    /// Final error
    pub fn fatal(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: Some(description.into()),
            is_final: true,
        }
    }

    /// Non-final error
    pub fn transient(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: Some(description.into()),
            is_final: false,
        }
    }

    /// Same error, marked final
    pub fn into_final(mut self) -> Self {
        self.is_final = true;
        self
    }
}

impl fmt::Display for VpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(d) = &self.description {
            write!(f, " ({})", d)?;
        }
        if self.is_final {
            f.write_str(" [final]")?;
        }
        Ok(())
    }
}

/// Tunnel lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VpnState {
    /// Off (initial, and terminal for "off")
    #[default]
    Disabled,
    /// Looking up candidates for the intent
    CheckingAvailability,
    /// Backends probing candidate ports
    ScanningPorts,
    /// Handshake in progress
    Connecting,
    /// Tunnel established
    Connected,
    /// Fallback or reconnection in progress
    Reconnecting,
    /// No network, resumes by itself
    WaitingForNetwork,
    /// Teardown in progress
    Disconnecting,
    /// Failure, terminal only when final
    Error(VpnError),
}

impl VpnState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Check if tunnel is off
    pub fn is_disabled(&self) -> bool {
        matches!(self, VpnState::Disabled)
    }

    /// Check if a connection is being established
    pub fn is_establishing(&self) -> bool {
        matches!(
            self,
            VpnState::CheckingAvailability
                | VpnState::ScanningPorts
                | VpnState::Connecting
                | VpnState::Reconnecting
                | VpnState::WaitingForNetwork
        ) || matches!(self, VpnState::Error(e) if !e.is_final)
    }

    /// Check if connected or on its way there
    pub fn is_establishing_or_connected(&self) -> bool {
        self.is_connected() || self.is_establishing()
    }

    /// Final error, if this is one
    pub fn final_error(&self) -> Option<&VpnError> {
        match self {
            VpnState::Error(e) if e.is_final => Some(e),
            _ => None,
        }
    }

    /// Collapse into the four states users see
    pub fn unified(&self) -> UnifiedState {
        match self {
            VpnState::Disabled => UnifiedState::Disconnected,
            VpnState::CheckingAvailability
            | VpnState::ScanningPorts
            | VpnState::Connecting
            | VpnState::Reconnecting
            | VpnState::WaitingForNetwork => UnifiedState::Connecting,
            VpnState::Connected => UnifiedState::Connected,
            VpnState::Disconnecting => UnifiedState::Disconnecting,
            VpnState::Error(e) if e.is_final => UnifiedState::Disconnected,
            VpnState::Error(_) => UnifiedState::Connecting,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            VpnState::Disabled => "Disabled",
            VpnState::CheckingAvailability => "CheckingAvailability",
            VpnState::ScanningPorts => "ScanningPorts",
            VpnState::Connecting => "Connecting",
            VpnState::Connected => "Connected",
            VpnState::Reconnecting => "Reconnecting",
            VpnState::WaitingForNetwork => "WaitingForNetwork",
            VpnState::Disconnecting => "Disconnecting",
            VpnState::Error(_) => "Error",
        }
    }
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VpnState::Error(e) => write!(f, "Error: {}", e),
            other => f.write_str(other.name()),
        }
    }
}

/// The four states presented to users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}
