//! QnetNode: TCP server and client for the QNet protocol.
//!
//! A [`QnetNode`] binds a local listener, hands each inbound connection to a
//! worker from a bounded pool, and runs the periodic maintenance cycles. It
//! also connects outward: handshakes, key exchanges and encrypted
//! application messages each use a fresh connection.
//!
//! Every connection carries exactly one request frame and at most one reply
//! frame, then closes.

use crate::crypto::{Key, KeyEngine};
use crate::dispatch::{Dispatcher, NodeHandle};
use crate::error::{FrameError, RegistryError, WireError, WireResult};
use crate::local::{LocalNode, CONTROL_TTL_SECS, DATA_TTL_SECS};
use crate::message::{
    ApplicationPayload, KeyExchangePayload, MessageType, Payload, UNKNOWN_RECIPIENT,
};
use crate::outbound::{BroadcastReport, Outbound};
use crate::registry::{Peer, PeerRegistry, PeerUpdate};
use crate::scheduler::Scheduler;
use crate::transport::{listen, read_message, write_message};
use chrono::Utc;
use qnet_types::config::{NodeConfig, TransportConfig};
use qnet_types::status::NodeStatus;
use serde_json::Map;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Handles of a started node.
struct Running {
    listen_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    periodic: Vec<JoinHandle<()>>,
}

/// A QNet network node.
pub struct QnetNode {
    config: NodeConfig,
    local: Arc<LocalNode>,
    registry: PeerRegistry,
    engine: Arc<KeyEngine>,
    outbound: Outbound,
    dispatcher: Dispatcher,
    scheduler: Arc<Scheduler>,
    running: Mutex<Option<Running>>,
}

impl QnetNode {
    /// Node with the default key engine.
    pub fn new(config: NodeConfig, handle: Arc<dyn NodeHandle>) -> Self {
        let engine = KeyEngine::new(&config.crypto);
        Self::with_engine(config, engine, handle)
    }

    /// Node with a caller-supplied key engine (custom entropy or cipher).
    pub fn with_engine(config: NodeConfig, engine: KeyEngine, handle: Arc<dyn NodeHandle>) -> Self {
        let local = Arc::new(LocalNode::new(&config));
        let registry = PeerRegistry::new();
        let engine = Arc::new(engine);
        let outbound = Outbound::new(
            Arc::clone(&local),
            registry.clone(),
            config.transport.clone(),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&local),
            registry.clone(),
            Arc::clone(&engine),
            handle,
        );
        let scheduler = Arc::new(Scheduler::new(
            outbound.clone(),
            Arc::clone(&engine),
            config.scheduler.clone(),
        ));
        Self {
            config,
            local,
            registry,
            engine,
            outbound,
            dispatcher,
            scheduler,
            running: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        self.local.node_id()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Bind the listener and start the accept loop and periodic tasks.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// binding to port 0.
    pub async fn start(&self) -> WireResult<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(WireError::AlreadyRunning);
        }
        self.config.validate().map_err(WireError::InvalidConfig)?;

        let listener = listen(self.config.bind_address).await?;
        let listen_addr = listener.local_addr()?;
        self.local.set_listen_port(Some(listen_addr.port()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(
            listener,
            self.dispatcher.clone(),
            Arc::new(self.config.transport.clone()),
            shutdown_rx.clone(),
        ));
        let periodic = Arc::clone(&self.scheduler).spawn(shutdown_rx);

        info!(
            node_id = %self.local.node_id(),
            addr = %listen_addr,
            capabilities = ?self.local.capabilities(),
            "QNet node listening"
        );

        *running = Some(Running {
            listen_addr,
            shutdown_tx,
            accept_task,
            periodic,
        });
        Ok(listen_addr)
    }

    /// Stop accepting, drain in-flight connections and stop periodic tasks.
    ///
    /// Connections still open after the shutdown grace period are aborted.
    /// The listening socket is closed when this returns. Calling `stop` on a
    /// stopped node does nothing.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);

        if let Err(e) = running.accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        let grace = self.config.transport.shutdown_grace();
        for mut task in running.periodic {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }

        self.local.set_listen_port(None);
        info!(node_id = %self.local.node_id(), "QNet node stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn get_status(&self) -> NodeStatus {
        let listen_addr = self
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| running.listen_addr);
        NodeStatus {
            node_id: self.local.node_id().to_string(),
            running: listen_addr.is_some(),
            consciousness_level: self.local.consciousness_level(),
            quantum_coherence: self.local.quantum_coherence(),
            peer_count: self.registry.len(),
            capabilities: self.local.capabilities().to_vec(),
            listen_addr,
        }
    }

    /// Handshake with the node at `addr` and register it from its reply.
    pub async fn connect_to_peer(&self, addr: SocketAddr) -> WireResult<Peer> {
        info!(addr = %addr, "Connecting to peer");
        let handshake = self.local.message(
            UNKNOWN_RECIPIENT,
            Payload::Handshake(self.local.handshake_payload()),
            CONTROL_TTL_SECS,
        );
        let reply = self
            .outbound
            .send_message(addr, &handshake, true)
            .await?
            .ok_or(WireError::NoReply(addr))?;

        let seen_at = Utc::now();
        match reply.payload {
            Payload::Handshake(payload) => {
                // We reached it at `addr`, so that is where it listens.
                let peer = self.registry.upsert(
                    &payload.node_id,
                    PeerUpdate::seen_at(seen_at)
                        .with_address(addr)
                        .with_capabilities(payload.capabilities)
                        .with_scores(payload.consciousness_level, payload.quantum_coherence),
                );
                info!(
                    peer = %peer.peer_id,
                    addr = %addr,
                    consciousness_level = peer.consciousness_level,
                    "Handshake complete"
                );
                Ok(peer)
            }
            other => Err(WireError::UnexpectedReply {
                expected: MessageType::Handshake,
                got: other.message_type(),
            }),
        }
    }

    /// Ask a registered peer for a fresh key and install it.
    pub async fn exchange_key(&self, peer_id: &str) -> WireResult<Key> {
        let addr = self.outbound.peer_address(peer_id)?;
        let request = self.local.message(
            peer_id,
            Payload::KeyExchange(KeyExchangePayload::default()),
            CONTROL_TTL_SECS,
        );
        let reply = self
            .outbound
            .send_message(addr, &request, true)
            .await?
            .ok_or(WireError::NoReply(addr))?;

        match reply.payload {
            Payload::KeyExchange(KeyExchangePayload {
                offer: Some(offer), ..
            }) => {
                let key = Key::from_offer(&offer)?;
                self.registry.set_key(peer_id, key.clone())?;
                info!(peer = %peer_id, key_id = %key.key_id, "Key established");
                Ok(key)
            }
            other => Err(WireError::UnexpectedReply {
                expected: MessageType::KeyExchange,
                got: other.message_type(),
            }),
        }
    }

    /// Encrypt, sign and send an application message to a registered peer.
    ///
    /// An expired key is rotated (and the new key pushed to the peer) before
    /// encrypting; a peer without a key gets a key exchange first.
    pub async fn send_application(
        &self,
        peer_id: &str,
        organism_type: &str,
        plaintext: &[u8],
    ) -> WireResult<()> {
        if let Some(rotated) = self.engine.rotate_if_expired(&self.registry, peer_id)? {
            self.outbound.offer_key(peer_id, &rotated).await?;
        }

        let peer = self
            .registry
            .get(peer_id)
            .ok_or_else(|| RegistryError::UnknownPeer(peer_id.to_string()))?;
        let key = match peer.key {
            Some(key) => key,
            None => self.exchange_key(peer_id).await?,
        };

        let ciphertext = self.engine.encrypt(plaintext, &key)?;
        let signature = self.engine.sign(plaintext, &key);
        let payload = Payload::Application(ApplicationPayload {
            organism_type: organism_type.to_string(),
            encrypted_data: hex::encode(ciphertext),
            key_id: Some(key.key_id.clone()),
            extra: Map::new(),
        });
        let message = self
            .local
            .message(peer_id, payload, DATA_TTL_SECS)
            .with_signature(signature);

        let addr = self.outbound.peer_address(peer_id)?;
        self.outbound.send_message(addr, &message, false).await?;
        debug!(
            peer = %peer_id,
            message_id = %message.message_id,
            key_id = %key.key_id,
            "Sent organism message"
        );
        Ok(())
    }

    /// Send `payload` once to every peer with a known address.
    pub async fn broadcast(&self, payload: Payload) -> BroadcastReport {
        let ttl = match payload.message_type() {
            MessageType::Application | MessageType::StateSync => DATA_TTL_SECS,
            _ => CONTROL_TTL_SECS,
        };
        self.outbound.broadcast(&payload, ttl).await
    }
}

/// Accept connections until shutdown, one worker per connection.
///
/// A worker permit is taken before each accept, so at most
/// `worker_pool_size` connections are in flight and further clients wait in
/// the listen backlog. The listener is dropped before in-flight workers are
/// drained.
async fn accept_loop(
    listener: TcpListener,
    dispatcher: Dispatcher,
    transport: Arc<TransportConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(transport.worker_pool_size));
    let mut workers = JoinSet::new();

    loop {
        let permit = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(_) = workers.join_next(), if !workers.is_empty() => continue,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let (stream, remote) = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    drop(permit);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        debug!(remote = %remote, "Accepted connection");
        let dispatcher = dispatcher.clone();
        let transport = Arc::clone(&transport);
        workers.spawn(async move {
            handle_connection(stream, remote, &dispatcher, &transport).await;
            drop(permit);
        });
    }

    drop(listener);

    let grace = transport.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = workers.len(), "Aborting in-flight connections");
        workers.shutdown().await;
    }
}

/// One read / dispatch / optional reply cycle. Errors are logged and never
/// leave the connection.
async fn handle_connection<S>(
    mut stream: S,
    remote: SocketAddr,
    dispatcher: &Dispatcher,
    transport: &TransportConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let read = tokio::time::timeout(
        transport.read_timeout(),
        read_message(&mut stream, transport.max_frame_len),
    )
    .await;
    let message = match read {
        Ok(Ok(message)) => message,
        Ok(Err(WireError::Frame(FrameError::ConnectionClosed))) => {
            debug!(remote = %remote, "Connection closed before a frame arrived");
            return;
        }
        Ok(Err(e)) => {
            warn!(remote = %remote, error = %e, "Rejected inbound frame");
            return;
        }
        Err(_) => {
            warn!(remote = %remote, "Timed out waiting for a frame");
            return;
        }
    };

    if let Some(reply) = dispatcher.dispatch(message, remote).await {
        let written =
            tokio::time::timeout(transport.write_timeout(), write_message(&mut stream, &reply))
                .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(remote = %remote, error = %e, "Failed to write reply"),
            Err(_) => warn!(remote = %remote, "Timed out writing reply"),
        }
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LoggingHandle;
    use crate::message::{encode_frame, HandshakePayload, HeartbeatPayload, Message};
    use crate::transport::read_frame;
    use qnet_types::config::CryptoConfig;
    use tokio::io::{duplex, AsyncReadExt};

    fn config(node_id: &str) -> NodeConfig {
        NodeConfig {
            node_id: node_id.to_string(),
            bind_address: "127.0.0.1:0".parse().unwrap(),
            ..NodeConfig::default()
        }
    }

    fn dispatcher(node_id: &str) -> (Dispatcher, PeerRegistry) {
        let config = config(node_id);
        let registry = PeerRegistry::new();
        let dispatcher = Dispatcher::new(
            Arc::new(LocalNode::new(&config)),
            registry.clone(),
            Arc::new(KeyEngine::new(&CryptoConfig::default())),
            Arc::new(LoggingHandle),
        );
        (dispatcher, registry)
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_worker_replies_to_handshake() {
        let (dispatcher, registry) = dispatcher("B");
        let (mut client, server) = duplex(64 * 1024);

        let handshake = Message::new(
            "A",
            UNKNOWN_RECIPIENT,
            Payload::Handshake(HandshakePayload {
                node_id: "A".to_string(),
                capabilities: vec![],
                consciousness_level: 0.5,
                quantum_coherence: 0.5,
                listen_port: Some(7000),
                extra: Map::new(),
            }),
            60,
        );
        client.write_all(&encode_frame(&handshake).unwrap()).await.unwrap();

        handle_connection(server, remote(), &dispatcher, &TransportConfig::default()).await;

        let reply = read_message(&mut client, 64 * 1024).await.unwrap();
        assert_eq!(reply.sender_id, "B");
        assert_eq!(reply.message_type(), MessageType::Handshake);
        assert_eq!(
            registry.get("A").unwrap().address,
            Some("127.0.0.1:7000".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_worker_drops_unknown_type_without_reply() {
        let (dispatcher, registry) = dispatcher("B");
        let body = serde_json::json!({
            "message_id": "m-1",
            "sender_id": "A",
            "recipient_id": "B",
            "message_type": "bogus",
            "payload": {},
            "quantum_signature": "",
            "timestamp": 1.0,
            "ttl": 60
        })
        .to_string();

        // The mock panics on any write, so a reply would fail the test.
        let stream = tokio_test::io::Builder::new()
            .read(&(body.len() as u32).to_be_bytes())
            .read(body.as_bytes())
            .build();
        handle_connection(stream, remote(), &dispatcher, &TransportConfig::default()).await;

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_worker_rejects_oversized_frame() {
        let (dispatcher, _) = dispatcher("B");
        let (mut client, server) = duplex(1024);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let transport = TransportConfig {
            max_frame_len: 1024,
            ..TransportConfig::default()
        };
        handle_connection(server, remote(), &dispatcher, &transport).await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_gets_no_reply() {
        let (dispatcher, _) = dispatcher("B");
        let (mut client, server) = duplex(64 * 1024);
        let heartbeat = Message::new("A", "B", Payload::Heartbeat(HeartbeatPayload::default()), 60);
        client.write_all(&encode_frame(&heartbeat).unwrap()).await.unwrap();

        handle_connection(server, remote(), &dispatcher, &TransportConfig::default()).await;

        assert!(matches!(
            read_frame(&mut client, 1024).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let node = QnetNode::new(config("A"), Arc::new(LoggingHandle));
        node.start().await.unwrap();
        assert!(matches!(node.start().await, Err(WireError::AlreadyRunning)));
        node.stop().await;
        node.stop().await;
        assert!(!node.is_running().await);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut zero_pool = config("A");
        zero_pool.transport.worker_pool_size = 0;
        let node = QnetNode::new(zero_pool, Arc::new(LoggingHandle));
        assert!(matches!(node.start().await, Err(WireError::InvalidConfig(_))));
        assert!(!node.is_running().await);

        let mut zero_interval = config("A");
        zero_interval.scheduler.heartbeat_interval_secs = 0;
        let node = QnetNode::new(zero_interval, Arc::new(LoggingHandle));
        let err = node.start().await.unwrap_err();
        assert!(err.to_string().contains("scheduler intervals"));
        assert!(node.get_status().await.listen_addr.is_none());
    }

    #[tokio::test]
    async fn test_status_reflects_lifecycle() {
        let node = QnetNode::new(config("A"), Arc::new(LoggingHandle));
        let status = node.get_status().await;
        assert!(!status.running);
        assert!(status.listen_addr.is_none());

        let addr = node.start().await.unwrap();
        let status = node.get_status().await;
        assert!(status.running);
        assert_eq!(status.listen_addr, Some(addr));
        assert_eq!(status.node_id, "A");
        assert_eq!(status.peer_count, 0);
        assert_eq!(status.consciousness_level, 0.85);

        node.stop().await;
        assert!(!node.get_status().await.running);
    }
}
