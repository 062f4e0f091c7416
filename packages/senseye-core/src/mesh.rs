//! The gossip mesh: mDNS peer discovery, TCP sessions, and belief flooding.
//!
//! Every node advertises itself via mDNS and both browses for peers and
//! accepts inbound connections on the same TCP port. To avoid two nodes
//! racing to open duplicate sockets to each other, connection initiation is
//! asymmetric: a node only dials a peer whose id is lexicographically
//! greater than its own, and only accepts inbound connections from peers
//! whose id is lexicographically smaller. Everyone else's connection
//! attempt is rejected, and the rejected side simply waits to be dialed.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mdns_sd::ServiceEvent;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use crate::mdns_advertise::{MdnsAdvertiser, SERVICE_TYPE};
use crate::model::Belief;
use crate::protocol::{FrameReader, FrameWriter, MeshMessage, ProtocolError};
use crate::runtime::TaskSpawner;

/// Base reconnect backoff.
pub const RECONNECT_BASE_SECS: f64 = 1.0;
/// Reconnect backoff ceiling.
pub const RECONNECT_MAX_SECS: f64 = 30.0;
/// How long `request_acoustic_ping` waits for a pong before giving up.
pub const ACOUSTIC_PING_TIMEOUT_SECS: u64 = 5;

/// Errors from the gossip mesh transport.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("failed to connect to peer: {0}")]
    Connect(String),
    #[error("mesh I/O error: {0}")]
    Io(String),
    #[error("peer connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("RPC timed out waiting for a response")]
    Timeout,
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<ProtocolError> for MeshError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Events the mesh surfaces to whatever is consuming it (the orchestrator).
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A fresh or relayed belief, already deduplicated by sequence number.
    Belief(Belief),
    /// A peer asked us to emit a chirp after `delay_s` so it can range us.
    AcousticPingRequested {
        from: String,
        request_id: String,
        delay_s: f64,
        sample_rate: u32,
        freq_start: f64,
        freq_end: f64,
        chirp_duration: f64,
    },
}

struct PeerHandle {
    outbound: mpsc::UnboundedSender<MeshMessage>,
}

/// The gossip mesh for one node: mDNS discovery, TCP sessions to every
/// known peer, sequence-numbered belief flooding, and acoustic ping RPCs.
pub struct PeerMesh {
    node_id: String,
    port: u16,
    peers: DashMap<String, PeerHandle>,
    last_sequence: DashMap<String, u64>,
    pending_pings: DashMap<String, oneshot::Sender<Result<(), String>>>,
    connecting: DashMap<String, ()>,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MeshEvent>>>,
    advertiser: Mutex<Option<MdnsAdvertiser>>,
    cancelled: AtomicU64,
    spawner: Arc<dyn TaskSpawner>,
}

impl PeerMesh {
    /// Creates a mesh that has not yet started listening or advertising.
    #[must_use]
    pub fn new(node_id: impl Into<String>, port: u16, spawner: Arc<dyn TaskSpawner>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            node_id: node_id.into(),
            port,
            peers: DashMap::new(),
            last_sequence: DashMap::new(),
            pending_pings: DashMap::new(),
            connecting: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            advertiser: Mutex::new(None),
            cancelled: AtomicU64::new(0),
            spawner,
        })
    }

    /// Takes ownership of the event stream. May only be called once; a
    /// second call returns `None`.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events_rx.lock().take()
    }

    fn is_stopped(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) != 0
    }

    /// Binds the TCP listener, registers mDNS advertisement, and starts
    /// browsing for peers. Background tasks run until [`Self::stop`] is
    /// called.
    pub async fn start(self: &Arc<Self>, advertise_ip: IpAddr) -> Result<(), MeshError> {
        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;

        let mesh = Arc::clone(self);
        self.spawner.spawn(async move {
            mesh.accept_loop(listener).await;
        });

        let advertiser = MdnsAdvertiser::new(&self.node_id, advertise_ip, self.port)
            .map_err(|e| MeshError::Io(e.to_string()))?;
        let daemon = advertiser.daemon().clone();
        *self.advertiser.lock() = Some(advertiser);

        let browse_rx = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| MeshError::Io(e.to_string()))?;
        let mesh = Arc::clone(self);
        self.spawner.spawn(async move {
            mesh.browse_loop(browse_rx).await;
        });

        Ok(())
    }

    /// Tears down every peer session and stops advertising/browsing.
    /// Idempotent.
    pub fn stop(&self) {
        self.cancelled.store(1, Ordering::SeqCst);
        self.peers.clear();
        if let Some(advertiser) = self.advertiser.lock().take() {
            advertiser.shutdown();
        }
        let ids: Vec<String> = self.pending_pings.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending_pings.remove(&id) {
                let _ = tx.send(Err("mesh stopped".into()));
            }
        }
    }

    /// Node ids of every peer with an active session.
    #[must_use]
    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Sends `belief` to every connected peer, dropping sessions whose
    /// outbound channel has gone away.
    pub fn broadcast_belief(&self, belief: &Belief) {
        let mut dead = Vec::new();
        for entry in self.peers.iter() {
            let message = MeshMessage::Belief {
                belief: belief.clone(),
            };
            if entry.value().outbound.send(message).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for peer_id in dead {
            self.peers.remove(&peer_id);
        }
    }

    /// Sends an acoustic pong back to `peer_id` for `request_id`.
    pub fn send_acoustic_pong(&self, peer_id: &str, request_id: String, ok: bool, error: Option<String>) {
        if let Some(entry) = self.peers.get(peer_id) {
            let _ = entry.outbound.send(MeshMessage::AcousticPong { request_id, ok, error });
        }
    }

    /// Asks `peer_id` to emit a chirp after `delay_s` and waits for its
    /// acknowledgement.
    pub async fn request_acoustic_ping(
        &self,
        peer_id: &str,
        delay_s: f64,
        sample_rate: u32,
        freq_start: f64,
        freq_end: f64,
        chirp_duration: f64,
    ) -> Result<(), MeshError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.insert(request_id.clone(), tx);

        let sent = self.peers.get(peer_id).map(|entry| {
            entry.outbound.send(MeshMessage::AcousticPing {
                request_id: request_id.clone(),
                delay_s,
                sample_rate,
                freq_start,
                freq_end,
                chirp_duration,
            })
        });

        if !matches!(sent, Some(Ok(()))) {
            self.pending_pings.remove(&request_id);
            return Err(MeshError::Closed);
        }

        match tokio::time::timeout(Duration::from_secs(ACOUSTIC_PING_TIMEOUT_SECS), rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(MeshError::Protocol(reason)),
            Ok(Err(_)) => Err(MeshError::Closed),
            Err(_) => {
                self.pending_pings.remove(&request_id);
                Err(MeshError::Timeout)
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.is_stopped() {
                return;
            }
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let mesh = Arc::clone(&self);
                    self.spawner.spawn(async move {
                        if let Err(e) = mesh.handle_incoming(stream).await {
                            log::debug!("[mesh] inbound session from {addr} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::warn!("[mesh] accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn browse_loop(self: Arc<Self>, rx: tokio_ext::ServiceEventStream) {
        while let Ok(event) = rx.recv_async().await {
            if self.is_stopped() {
                return;
            }
            let ServiceEvent::ServiceResolved(info) = event else {
                continue;
            };
            let Some(peer_id) = info.get_property_val_str("node_id").map(str::to_string) else {
                continue;
            };
            if peer_id == self.node_id {
                continue;
            }
            if peer_id.as_str() <= self.node_id.as_str() {
                // Smaller or equal ids never initiate; we wait to be dialed.
                continue;
            }
            if self.peers.contains_key(&peer_id) || self.connecting.contains_key(&peer_id) {
                continue;
            }
            let Some(addr) = info.get_addresses().iter().next().copied() else {
                continue;
            };
            let port = info.get_port();
            let mesh = Arc::clone(&self);
            self.connecting.insert(peer_id.clone(), ());
            self.spawner.spawn(async move {
                mesh.reconnect_loop(peer_id, addr, port).await;
            });
        }
    }

    async fn reconnect_loop(self: Arc<Self>, peer_id: String, addr: IpAddr, port: u16) {
        let mut backoff = RECONNECT_BASE_SECS;
        loop {
            if self.is_stopped() || self.peers.contains_key(&peer_id) {
                self.connecting.remove(&peer_id);
                return;
            }
            match TcpStream::connect((addr, port)).await {
                Ok(stream) => {
                    backoff = RECONNECT_BASE_SECS;
                    if let Err(e) = self.run_session(stream, Some(peer_id.clone())).await {
                        log::debug!("[mesh] session with {peer_id} ended: {e}");
                    }
                    if self.is_stopped() {
                        self.connecting.remove(&peer_id);
                        return;
                    }
                }
                Err(e) => {
                    log::debug!("[mesh] connect to {peer_id} at {addr}:{port} failed: {e}");
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
            backoff = (backoff * 2.0).min(RECONNECT_MAX_SECS);
        }
    }

    async fn handle_incoming(self: Arc<Self>, stream: TcpStream) -> Result<(), MeshError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let peer_id = match reader.read_message().await? {
            Some(MeshMessage::Announce { node_id }) => node_id,
            Some(_) => return Err(MeshError::Protocol("expected announce first".into())),
            None => return Err(MeshError::Closed),
        };

        if peer_id.as_str() >= self.node_id.as_str() {
            return Err(MeshError::Protocol(format!(
                "rejecting inbound connection from {peer_id}: expected smaller id than {}",
                self.node_id
            )));
        }
        if self.peers.contains_key(&peer_id) {
            return Err(MeshError::Protocol(format!("duplicate session from {peer_id}")));
        }

        let mut writer = FrameWriter::new(write_half);
        writer
            .write_message(&MeshMessage::Announce {
                node_id: self.node_id.clone(),
            })
            .await?;

        self.run_reader_writer(peer_id, reader, writer).await
    }

    async fn run_session(&self, stream: TcpStream, expected_peer_id: Option<String>) -> Result<(), MeshError> {
        let (read_half, write_half) = stream.into_split();
        let mut writer = FrameWriter::new(write_half);
        writer
            .write_message(&MeshMessage::Announce {
                node_id: self.node_id.clone(),
            })
            .await?;

        let mut reader = FrameReader::new(read_half);
        let peer_id = match reader.read_message().await? {
            Some(MeshMessage::Announce { node_id }) => node_id,
            Some(_) => return Err(MeshError::Protocol("expected announce first".into())),
            None => return Err(MeshError::Closed),
        };
        if let Some(expected) = expected_peer_id {
            if expected != peer_id {
                return Err(MeshError::Protocol(format!(
                    "announced id {peer_id} does not match discovered id {expected}"
                )));
            }
        }

        self.run_reader_writer(peer_id, reader, writer).await
    }

    async fn run_reader_writer<R, W>(
        &self,
        peer_id: String,
        mut reader: FrameReader<R>,
        mut writer: FrameWriter<W>,
    ) -> Result<(), MeshError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        self.peers.insert(peer_id.clone(), PeerHandle { outbound: outbound_tx });
        self.connecting.remove(&peer_id);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if writer.write_message(&message).await.is_err() {
                    break;
                }
            }
        });

        let result = loop {
            match reader.read_message().await {
                Ok(Some(message)) => self.dispatch(&peer_id, message),
                Ok(None) => break Ok(()),
                Err(ProtocolError::Malformed(reason)) => {
                    log::warn!("[mesh] malformed message from {peer_id}: {reason}");
                }
                Err(e) => break Err(e.into()),
            }
        };

        self.peers.remove(&peer_id);
        writer_task.abort();
        result
    }

    fn dispatch(&self, sender_id: &str, message: MeshMessage) {
        match message {
            MeshMessage::Announce { .. } => {}
            MeshMessage::Belief { belief } => self.handle_belief(sender_id, belief),
            MeshMessage::AcousticPing {
                request_id,
                delay_s,
                sample_rate,
                freq_start,
                freq_end,
                chirp_duration,
            } => {
                let _ = self.events_tx.send(MeshEvent::AcousticPingRequested {
                    from: sender_id.to_string(),
                    request_id,
                    delay_s,
                    sample_rate,
                    freq_start,
                    freq_end,
                    chirp_duration,
                });
            }
            MeshMessage::AcousticPong { request_id, ok, error } => {
                if let Some((_, tx)) = self.pending_pings.remove(&request_id) {
                    let _ = tx.send(if ok { Ok(()) } else { Err(error.unwrap_or_default()) });
                }
            }
        }
    }

    fn handle_belief(&self, sender_id: &str, mut belief: Belief) {
        let producer = belief.node_id.clone();
        let is_fresh = match self.last_sequence.get(&producer) {
            Some(last) => belief.sequence_number > *last,
            None => true,
        };
        if !is_fresh {
            return;
        }
        self.last_sequence.insert(producer, belief.sequence_number);

        let hop_count = belief.hop_count;
        let _ = self.events_tx.send(MeshEvent::Belief(belief.clone()));

        if hop_count == 0 {
            return;
        }
        belief.hop_count = hop_count - 1;
        let message = MeshMessage::Belief { belief };
        let mut dead = Vec::new();
        for entry in self.peers.iter() {
            if entry.key() == sender_id {
                continue;
            }
            if entry.value().outbound.send(message.clone()).is_err() {
                dead.push(entry.key().clone());
            }
        }
        for peer_id in dead {
            self.peers.remove(&peer_id);
        }
    }
}

/// Thin type alias so the mdns-sd receiver type doesn't leak its crate path
/// through every signature in this module.
mod tokio_ext {
    pub type ServiceEventStream = mdns_sd::Receiver<mdns_sd::ServiceEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_only_strictly_increasing_sequence_numbers() {
        let last_sequence: DashMap<String, u64> = DashMap::new();
        last_sequence.insert("node-a".to_string(), 5);
        let is_fresh = |seq: u64| match last_sequence.get("node-a") {
            Some(last) => seq > *last,
            None => true,
        };
        assert!(!is_fresh(5));
        assert!(!is_fresh(3));
        assert!(is_fresh(6));
    }

    #[test]
    fn connection_initiation_is_asymmetric_on_node_id() {
        let smaller = "node-a";
        let larger = "node-b";
        // The smaller id is the one expected to dial out.
        assert!(smaller < larger);
    }

    #[tokio::test]
    async fn request_acoustic_ping_times_out_against_an_unknown_peer() {
        let spawner: Arc<dyn TaskSpawner> = Arc::new(crate::runtime::TokioSpawner::current());
        let mesh = PeerMesh::new("node-a", 0, spawner);
        let result = mesh
            .request_acoustic_ping("node-b", 0.1, 48_000, 18_000.0, 22_000.0, 0.01)
            .await;
        assert!(matches!(result, Err(MeshError::Closed)));
    }
}
