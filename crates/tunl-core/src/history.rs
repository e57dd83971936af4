//! Connection history sink

use crate::intent::ConnectIntent;
use std::sync::Mutex;
use std::time::SystemTime;

/// Write-only record of connection attempts. Implementations must not block.
pub trait ConnectionHistory: Send + Sync {
    fn record_attempt(&self, intent: &ConnectIntent, at: SystemTime);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NoHistory;

impl ConnectionHistory for NoHistory {
    fn record_attempt(&self, _intent: &ConnectIntent, _at: SystemTime) {}
}

/// Keeps attempts in memory
#[derive(Debug, Default)]
pub struct MemoryHistory {
    attempts: Mutex<Vec<(ConnectIntent, SystemTime)>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded intents, oldest first
    pub fn intents(&self) -> Vec<ConnectIntent> {
        match self.attempts.lock() {
            Ok(list) => list.iter().map(|(i, _)| i.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl ConnectionHistory for MemoryHistory {
    fn record_attempt(&self, intent: &ConnectIntent, at: SystemTime) {
        if let Ok(mut list) = self.attempts.lock() {
            list.push((intent.clone(), at));
        }
    }
}
