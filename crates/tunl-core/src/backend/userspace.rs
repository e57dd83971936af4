//! Userspace WireGuard Engine
//!
//! WireGuard over a tokio UDP socket, without TUN devices or root.
//!
//! # Protocol Overview
//!
//! 1. **Handshake**: initiation (type 1, 148 bytes) answered by a response
//!    (type 2, at least 60 bytes) within the handshake timeout.
//! 2. **Keepalive**: empty transport messages (type 4) every keepalive
//!    interval; a session older than [`REKEY_AFTER`] is re-handshaked.
//! 3. **Control channel**: a keepalive answered by the peer counts as a
//!    successful ping.
//!
//! Payload encryption is left to the platform tunnel; this engine owns the
//! session lifecycle only.

use super::engine::{EngineConfig, EngineError, EngineStatus, TunnelEngine};
use crate::keys::{KeyPair, PublicKey};
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Message types
const MSG_INITIATION: u8 = 0x01;
const MSG_RESPONSE: u8 = 0x02;
const MSG_COOKIE_REPLY: u8 = 0x03;
const MSG_TRANSPORT: u8 = 0x04;

const INITIATION_LEN: usize = 148;
const MIN_RESPONSE_LEN: usize = 60;

/// Session age after which a new handshake is started
pub const REKEY_AFTER: Duration = Duration::from_secs(120);

/// Build a handshake initiation
///
/// Format (148 bytes):
/// - Type (1 byte): 0x01
/// - Reserved (3 bytes)
/// - Sender index (4 bytes, LE)
/// - Ephemeral public key (32 bytes)
/// - Encrypted static key (48 bytes)
/// - Encrypted timestamp (28 bytes)
/// - MAC1, MAC2 (16 bytes each)
pub fn handshake_initiation(sender_index: u32, ephemeral: &PublicKey) -> Vec<u8> {
    let mut msg = Vec::with_capacity(INITIATION_LEN);
    msg.push(MSG_INITIATION);
    msg.extend_from_slice(&[0, 0, 0]);
    msg.extend_from_slice(&sender_index.to_le_bytes());
    msg.extend_from_slice(ephemeral.as_bytes());
    msg.resize(INITIATION_LEN, 0);
    msg
}

/// Tunnel statistics
#[derive(Debug, Clone, Default)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Handshakes completed
    pub handshakes: u64,
    pub last_handshake: Option<Instant>,
    /// Last measured round trip
    pub rtt: Option<Duration>,
}

impl TunnelStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {} B ({} pkts), RX: {} B ({} pkts), handshakes: {}, RTT: {:?}",
            self.bytes_sent,
            self.packets_sent,
            self.bytes_received,
            self.packets_received,
            self.handshakes,
            self.rtt
        )
    }
}

/// Session established by a handshake
#[derive(Debug, Clone, Copy)]
struct Session {
    created_at: Instant,
    receiver_index: u32,
    tx_counter: u64,
}

/// State shared with the keepalive task
struct Shared {
    socket: Arc<UdpSocket>,
    /// Serializes request/response exchanges on the socket
    io: Mutex<()>,
    session: RwLock<Option<Session>>,
    stats: RwLock<TunnelStats>,
    status: watch::Sender<EngineStatus>,
    handshake_timeout: Duration,
}

impl Shared {
    async fn exchange(&self, msg: &[u8], timeout: Duration) -> Result<Vec<u8>, EngineError> {
        let _io = self.io.lock().await;
        let sent = self
            .socket
            .send(msg)
            .await
            .map_err(|e| EngineError::Socket(e.to_string()))?;
        {
            let mut stats = self.stats.write().await;
            stats.bytes_sent += sent as u64;
            stats.packets_sent += 1;
        }

        let mut buf = [0u8; 256];
        let n = match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(EngineError::Socket(e.to_string())),
            Err(_) => return Err(EngineError::HandshakeTimeout),
        };
        let mut stats = self.stats.write().await;
        stats.bytes_received += n as u64;
        stats.packets_received += 1;
        Ok(buf[..n].to_vec())
    }

    /// Run a handshake and install the new session
    async fn handshake(&self) -> Result<(), EngineError> {
        debug!("Initiating WireGuard handshake");
        let sender_index: u32 = rand::random();
        let ephemeral = KeyPair::generate();
        let init = handshake_initiation(sender_index, &ephemeral.public);

        let started = Instant::now();
        let response = self.exchange(&init, self.handshake_timeout).await?;
        let session = parse_response(&response)?;

        *self.session.write().await = Some(session);
        let mut stats = self.stats.write().await;
        stats.handshakes += 1;
        stats.last_handshake = Some(Instant::now());
        stats.rtt = Some(started.elapsed());
        debug!("Handshake completed in {:?}", started.elapsed());
        Ok(())
    }

    /// Build the next keepalive for the current session
    async fn keepalive_message(&self) -> Result<Vec<u8>, EngineError> {
        let mut session = self.session.write().await;
        let s = session.as_mut().ok_or(EngineError::NotConnected)?;
        let counter = s.tx_counter;
        s.tx_counter += 1;

        let mut msg = Vec::with_capacity(16);
        msg.push(MSG_TRANSPORT);
        msg.extend_from_slice(&[0, 0, 0]);
        msg.extend_from_slice(&s.receiver_index.to_le_bytes());
        msg.extend_from_slice(&counter.to_le_bytes());
        Ok(msg)
    }

    async fn needs_rekey(&self) -> bool {
        match *self.session.read().await {
            Some(s) => s.created_at.elapsed() > REKEY_AFTER,
            None => true,
        }
    }
}

fn parse_response(response: &[u8]) -> Result<Session, EngineError> {
    match response.first() {
        Some(&MSG_RESPONSE) if response.len() >= MIN_RESPONSE_LEN => {
            let mut index = [0u8; 4];
            index.copy_from_slice(&response[4..8]);
            Ok(Session {
                created_at: Instant::now(),
                receiver_index: u32::from_le_bytes(index),
                tx_counter: 0,
            })
        }
        Some(&MSG_RESPONSE) => Err(EngineError::HandshakeFailed("response too short".into())),
        Some(&MSG_COOKIE_REPLY) => Err(EngineError::HandshakeFailed("peer under load".into())),
        _ => Err(EngineError::HandshakeFailed("invalid message type".into())),
    }
}

/// Userspace WireGuard tunnel engine
pub struct UserspaceWireGuard {
    status: watch::Sender<EngineStatus>,
    shared: RwLock<Option<Arc<Shared>>>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    handshake_timeout: Duration,
}

impl UserspaceWireGuard {
    pub fn new(handshake_timeout: Duration) -> Self {
        let (status, _) = watch::channel(EngineStatus::Down);
        Self {
            status,
            shared: RwLock::new(None),
            keepalive_task: Mutex::new(None),
            handshake_timeout,
        }
    }

    /// Get statistics
    pub async fn stats(&self) -> TunnelStats {
        match &*self.shared.read().await {
            Some(shared) => shared.stats.read().await.clone(),
            None => TunnelStats::default(),
        }
    }
}

impl Default for UserspaceWireGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl TunnelEngine for UserspaceWireGuard {
    fn name(&self) -> &'static str {
        "wireguard-userspace"
    }

    async fn start(&self, config: EngineConfig) -> Result<(), EngineError> {
        self.stop().await;
        let peer = config.params.entry;
        if let Some(key) = &config.params.peer_public_key {
            PublicKey::from_base64(key).map_err(|e| EngineError::InvalidPeerKey(e.to_string()))?;
        }

        info!("Starting WireGuard tunnel to {}", peer);
        self.status.send_replace(EngineStatus::Connecting);

        let local: SocketAddr = if peer.is_ipv6() {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| EngineError::Socket(e.to_string()))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| EngineError::Socket(e.to_string()))?;
        if let Ok(addr) = socket.local_addr() {
            debug!("Bound to local port {}", addr.port());
        }

        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            io: Mutex::new(()),
            session: RwLock::new(None),
            stats: RwLock::new(TunnelStats::default()),
            status: self.status.clone(),
            handshake_timeout: self.handshake_timeout,
        });

        if let Err(e) = shared.handshake().await {
            self.status.send_replace(EngineStatus::Error(e.clone()));
            return Err(e);
        }

        *self.shared.write().await = Some(shared.clone());
        *self.keepalive_task.lock().await = Some(spawn_keepalive(shared, config.keepalive));
        self.status.send_replace(EngineStatus::Up);
        info!("WireGuard tunnel established");
        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.keepalive_task.lock().await.take() {
            task.abort();
        }
        if self.shared.write().await.take().is_some() {
            info!("Stopping WireGuard tunnel");
        }
        self.status.send_replace(EngineStatus::Down);
    }

    fn status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    async fn ping(&self, timeout: Duration) -> Result<Duration, EngineError> {
        let shared = self
            .shared
            .read()
            .await
            .clone()
            .ok_or(EngineError::NotConnected)?;
        let msg = shared.keepalive_message().await?;
        let started = Instant::now();
        shared
            .exchange(&msg, timeout)
            .await
            .map_err(|_| EngineError::ConnectionLost)?;
        let rtt = started.elapsed();
        shared.stats.write().await.rtt = Some(rtt);
        Ok(rtt)
    }
}

/// Send keepalives and rekey old sessions. A failed rekey is reported as an
/// engine error and retried on the next tick.
fn spawn_keepalive(shared: Arc<Shared>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;

            if shared.needs_rekey().await {
                match shared.handshake().await {
                    Ok(()) => {
                        shared.status.send_replace(EngineStatus::Up);
                    }
                    Err(e) => {
                        warn!("Rekey failed: {}", e);
                        shared.status.send_replace(EngineStatus::Error(e));
                        continue;
                    }
                }
            }

            let msg = match shared.keepalive_message().await {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            let _io = shared.io.lock().await;
            match shared.socket.send(&msg).await {
                Ok(n) => {
                    let mut stats = shared.stats.write().await;
                    stats.bytes_sent += n as u64;
                    stats.packets_sent += 1;
                }
                Err(e) => {
                    warn!("Keepalive failed: {}", e);
                    shared
                        .status
                        .send_replace(EngineStatus::Error(EngineError::Socket(e.to_string())));
                }
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Local WireGuard-ish responder: answers initiations and echoes
    /// transport messages
    pub async fn responder() -> (SocketAddr, JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                match buf[0] {
                    MSG_INITIATION if n == INITIATION_LEN => {
                        let mut reply = vec![0u8; 92];
                        reply[0] = MSG_RESPONSE;
                        reply[4..8].copy_from_slice(&7u32.to_le_bytes());
                        let _ = socket.send_to(&reply, from).await;
                    }
                    MSG_TRANSPORT => {
                        let _ = socket.send_to(&buf[..n], from).await;
                    }
                    _ => {}
                }
            }
        });
        (addr, task)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::responder;
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::intent::ConnectIntent;
    use crate::params::ConnectionParams;
    use crate::protocol::{ProtocolSelection, VpnProtocol};
    use crate::server::DomainProtocol;
    use crate::server::fixtures::{domain, server};

    fn config(entry: SocketAddr) -> EngineConfig {
        let d = domain("d", vec![DomainProtocol::all(VpnProtocol::WireGuard)]);
        let s = server("X", "CH", vec![d.clone()]);
        EngineConfig {
            params: ConnectionParams::new(
                &ConnectIntent::server("X"),
                &s,
                &d,
                ProtocolSelection::of(VpnProtocol::WireGuard),
                entry,
                &OrchestratorConfig::default(),
            ),
            keys: KeyPair::generate(),
            certificate: None,
            keepalive: Duration::from_secs(25),
        }
    }

    #[test]
    fn test_initiation_shape() {
        let msg = handshake_initiation(42, &KeyPair::generate().public);
        assert_eq!(msg.len(), INITIATION_LEN);
        assert_eq!(msg[0], MSG_INITIATION);
        assert_eq!(&msg[4..8], &42u32.to_le_bytes());
    }

    #[test]
    fn test_parse_response() {
        let mut ok = vec![0u8; 92];
        ok[0] = MSG_RESPONSE;
        ok[4..8].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(parse_response(&ok).unwrap().receiver_index, 9);

        assert!(parse_response(&[MSG_RESPONSE; 10]).is_err());
        let mut cookie = vec![0u8; 64];
        cookie[0] = MSG_COOKIE_REPLY;
        assert!(parse_response(&cookie).is_err());
    }

    #[tokio::test]
    async fn test_tunnel_handshake_and_ping() {
        let (addr, _task) = responder().await;
        let engine = UserspaceWireGuard::new(Duration::from_secs(2));
        let status = engine.status();

        engine.start(config(addr)).await.unwrap();
        assert_eq!(*status.borrow(), EngineStatus::Up);

        let rtt = engine.ping(Duration::from_secs(1)).await.unwrap();
        assert!(rtt < Duration::from_secs(1));

        let stats = engine.stats().await;
        assert_eq!(stats.handshakes, 1);
        assert!(stats.packets_received >= 2);

        engine.stop().await;
        assert_eq!(*status.borrow(), EngineStatus::Down);
        assert_eq!(engine.ping(Duration::from_millis(100)).await, Err(EngineError::NotConnected));
    }

    #[tokio::test]
    async fn test_tunnel_handshake_timeout() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let engine = UserspaceWireGuard::new(Duration::from_millis(100));

        let result = engine.start(config(silent.local_addr().unwrap())).await;
        assert_eq!(result, Err(EngineError::HandshakeTimeout));
        assert_eq!(
            *engine.status().borrow(),
            EngineStatus::Error(EngineError::HandshakeTimeout)
        );
    }

    #[tokio::test]
    async fn test_invalid_peer_key() {
        let (addr, _task) = responder().await;
        let engine = UserspaceWireGuard::default();
        let mut cfg = config(addr);
        cfg.params.peer_public_key = Some("nope".into());
        assert!(matches!(
            engine.start(cfg).await,
            Err(EngineError::InvalidPeerKey(_))
        ));
    }
}
