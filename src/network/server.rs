// src/network/server.rs
// C5 Wire Transport, inbound half: accepts TCP connections, performs
// fail-closed handshake admission, then dispatches framed messages to the
// application. Shares its ConnectionTable and dedup sets with the outbound
// half (client.rs) and the gossip hub (C6). Grounded in the teacher's
// network/mod.rs accept loop and handshake.rs challenge/response shape,
// replaced with the spec's single-round signed-nonce handshake.

use crate::network::codec::{encode, FrameDecoder, FrameType};
use crate::network::messages::{
    BftVoteWire, ChainBlockWire, DhtPeerWire, FindNodeResponseWire, FindNodeWire, HandshakeWire,
    PingWire, TransactionWire,
};
use crate::network::shared::{BoundedFifoSet, SharedDedup};
use crate::routing::canonical_ip;
use crate::signer::{self, Address, NodeSigner};
use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_CONNECTIONS_PER_IP: usize = 5;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const RATE_LIMIT_FRAMES: u32 = 500;
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(10);
pub const WRITE_BACKPRESSURE_BYTES: u64 = 10 * 1024 * 1024;
pub const NONCE_CACHE_CAPACITY: usize = 10_000;
pub const TX_DEDUP_CAPACITY: usize = 50_000;
pub const BLOCK_DEDUP_CAPACITY: usize = 10_000;
const CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const LATENCY_SAMPLE_WINDOW: usize = 20;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Events handed up to the application (BFT coordinator, chain engine, DHT).
#[derive(Debug)]
pub enum WireEvent {
    Block { from: Address, block: ChainBlockWire },
    Transaction { from: Address, tx: TransactionWire },
    BftVote { from: Address, vote: BftVoteWire },
    FindNode { from: Address, request_id: String, target: Address },
    PeerConnected { peer_id: Address, address: String },
    PeerDisconnected { peer_id: Address },
}

struct ConnectionHandle {
    address: String,
    ip: IpAddr,
    /// Token assigned at registration, used to tell this handle apart from
    /// whatever later replaces it under the same peer id.
    generation: u64,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_buffered: Arc<AtomicU64>,
    latency_samples_ms: Mutex<std::collections::VecDeque<u64>>,
}

/// Tracks authenticated sessions and per-IP connection counts, shared by the
/// server accept loop, the client connect loop, and the DHT's verifyPeer.
pub struct ConnectionTable {
    connections: DashMap<Address, ConnectionHandle>,
    per_ip: DashMap<IpAddr, usize>,
    max_connections: usize,
    next_generation: AtomicU64,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        ConnectionTable {
            connections: DashMap::new(),
            per_ip: DashMap::new(),
            max_connections,
            next_generation: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn ip_count(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).map(|c| *c).unwrap_or(0)
    }

    fn admit_ip(&self, ip: IpAddr) -> bool {
        if self.connections.len() >= self.max_connections {
            return false;
        }
        if self.ip_count(ip) >= MAX_CONNECTIONS_PER_IP {
            return false;
        }
        *self.per_ip.entry(ip).or_insert(0) += 1;
        true
    }

    fn release_ip(&self, ip: IpAddr) {
        if let Some(mut count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
        }
    }

    /// Registers the connection, evicting a prior session for the same
    /// `peer_id` — always authenticated here since admission is fail-closed.
    /// Returns the generation token stamped onto this registration; pass it
    /// to `remove_if_current` so this connection's eventual teardown only
    /// removes the table entry if nothing has replaced it since.
    fn register(&self, peer_id: Address, mut handle: ConnectionHandle) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        handle.generation = generation;
        self.connections.insert(peer_id, handle);
        generation
    }

    /// Removes `peer_id`'s entry only if it is still the handle registered
    /// under `generation`. A reconnect under the same node id replaces the
    /// table entry and bumps the generation; the stale connection's own
    /// cleanup must not evict the entry the reconnect installed.
    fn remove_if_current(&self, peer_id: &Address, generation: u64) {
        if let Some((_, handle)) = self.connections.remove_if(peer_id, |_, h| h.generation == generation) {
            self.release_ip(handle.ip);
        }
    }

    pub async fn send_to(&self, peer_id: &Address, frame: Vec<u8>) -> bool {
        if let Some(conn) = self.connections.get(peer_id) {
            if conn.outbound_buffered.load(Ordering::Relaxed) > WRITE_BACKPRESSURE_BYTES {
                return false;
            }
            conn.outbound_buffered.fetch_add(frame.len() as u64, Ordering::Relaxed);
            conn.outbound_tx.send(frame).is_ok()
        } else {
            false
        }
    }

    pub async fn broadcast(&self, frame: Vec<u8>) {
        for conn in self.connections.iter() {
            if conn.outbound_buffered.load(Ordering::Relaxed) <= WRITE_BACKPRESSURE_BYTES {
                conn.outbound_buffered.fetch_add(frame.len() as u64, Ordering::Relaxed);
                let _ = conn.outbound_tx.send(frame.clone());
            }
        }
    }

    pub fn is_authenticated(&self, id: &Address) -> bool {
        self.connections.contains_key(id)
    }

    /// Snapshot of connected peer id/address pairs, used by the gossip hub's
    /// `/p2p/peers` endpoint.
    pub fn peer_addresses(&self) -> Vec<(Address, String)> {
        self.connections.iter().map(|c| (*c.key(), c.address.clone())).collect()
    }

    async fn record_latency(&self, peer_id: &Address, rtt_ms: u64) {
        if let Some(conn) = self.connections.get(peer_id) {
            let mut samples = conn.latency_samples_ms.lock().await;
            samples.push_back(rtt_ms);
            if samples.len() > LATENCY_SAMPLE_WINDOW {
                samples.pop_front();
            }
        }
    }

    pub async fn average_latency_ms(&self, peer_id: &Address) -> Option<u64> {
        let conn = self.connections.get(peer_id)?;
        let samples = conn.latency_samples_ms.lock().await;
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<u64>() / samples.len() as u64)
    }
}

#[derive(Default)]
pub struct PendingRequests {
    find_node: DashMap<String, oneshot::Sender<Vec<DhtPeerWire>>>,
    ping: DashMap<String, (Address, u64)>,
}

pub struct WireServer {
    pub signer: NodeSigner,
    pub chain_id: u64,
    pub connections: Arc<ConnectionTable>,
    pub nonce_cache: SharedDedup<String>,
    pub tx_dedup: SharedDedup<String>,
    pub block_dedup: SharedDedup<String>,
    pub pending: Arc<PendingRequests>,
    events_tx: mpsc::UnboundedSender<WireEvent>,
}

impl WireServer {
    pub fn new(signer: NodeSigner, chain_id: u64, max_connections: usize) -> (Self, mpsc::UnboundedReceiver<WireEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let server = WireServer {
            signer,
            chain_id,
            connections: Arc::new(ConnectionTable::new(max_connections)),
            nonce_cache: Arc::new(BoundedFifoSet::new(NONCE_CACHE_CAPACITY)),
            tx_dedup: Arc::new(BoundedFifoSet::new(TX_DEDUP_CAPACITY)),
            block_dedup: Arc::new(BoundedFifoSet::new(BLOCK_DEDUP_CAPACITY)),
            pending: Arc::new(PendingRequests::default()),
            events_tx,
        };
        (server, events_rx)
    }

    pub async fn listen(self: Arc<Self>, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "wire transport listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                let ip = addr.ip();
                if !server.connections.admit_ip(ip) {
                    debug!(%ip, "connection rejected: ip/connection limit");
                    return;
                }
                if let Err(e) = server.run_connection(stream, ip, None).await {
                    debug!(%ip, error = %e, "connection ended");
                }
            });
        }
    }

    /// Shared by both the accept loop (`expected_peer = None`) and the
    /// client connect loop (`expected_peer = Some(bootstrap_target)`).
    pub async fn run_connection(
        self: &Arc<Self>,
        mut stream: TcpStream,
        ip: IpAddr,
        expected_peer: Option<Address>,
    ) -> Result<()> {
        let local_id = self.signer.node_id();
        let height = 0u64; // filled in by the chain engine in a full wiring; wire-level admission ignores it.
        let nonce = format!("{}:{}", now_ms(), Uuid::new_v4());
        let msg = format!("wire:handshake:{}:{}", signer::address_to_hex(&local_id), nonce);
        let our_sig = self.signer.sign(&msg);
        let our_handshake = HandshakeWire {
            node_id: signer::address_to_hex(&local_id),
            chain_id: self.chain_id,
            height,
            nonce,
            signature: hex::encode(our_sig),
        };
        let frame = encode(FrameType::Handshake, &serde_json::to_vec(&our_handshake)?)?;
        stream.write_all(&frame).await?;

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8192];
        let peer_id = loop {
            let n = tokio::time::timeout(REQUEST_TIMEOUT, stream.read(&mut buf))
                .await
                .context("handshake timed out")??;
            if n == 0 {
                return Err(anyhow!("connection closed during handshake"));
            }
            let frames = decoder.feed(&buf[..n]).map_err(|e| anyhow!(e.to_string()))?;
            if let Some(frame) = frames.into_iter().find(|f| f.typ == Some(FrameType::Handshake)) {
                let peer_hs: HandshakeWire = serde_json::from_slice(&frame.payload)?;
                break self.admit_handshake(&peer_hs, expected_peer)?;
            }
        };

        let ack = our_handshake.clone();
        let frame = encode(FrameType::HandshakeAck, &serde_json::to_vec(&ack)?)?;
        stream.write_all(&frame).await?;

        let (read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let outbound_buffered = Arc::new(AtomicU64::new(0));
        let handle = ConnectionHandle {
            address: format!("{ip}"),
            ip,
            generation: 0,
            outbound_tx: outbound_tx.clone(),
            outbound_buffered: outbound_buffered.clone(),
            latency_samples_ms: Mutex::new(std::collections::VecDeque::new()),
        };
        let generation = self.connections.register(peer_id, handle);
        let _ = self.events_tx.send(WireEvent::PeerConnected { peer_id, address: format!("{ip}") });

        let writer_buffered = outbound_buffered.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                writer_buffered.fetch_sub(frame.len() as u64, Ordering::Relaxed);
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        let result = self.read_loop(read_half, peer_id, ip).await;

        writer_task.abort();
        self.connections.remove_if_current(&peer_id, generation);
        let _ = self.events_tx.send(WireEvent::PeerDisconnected { peer_id });
        result
    }

    /// §4.5 fail-closed handshake admission.
    fn admit_handshake(&self, hs: &HandshakeWire, expected_peer: Option<Address>) -> Result<Address> {
        if hs.chain_id != self.chain_id {
            return Err(anyhow!("chain id mismatch"));
        }
        if hs.signature.is_empty() {
            return Err(anyhow!("missing handshake signature"));
        }
        let (ts_str, _uuid_part) = hs
            .nonce
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed nonce"))?;
        let ts: u64 = ts_str.parse().map_err(|_| anyhow!("malformed nonce timestamp"))?;
        let now = now_ms();
        let skew_ms = CLOCK_SKEW.as_millis() as u64;
        if ts > now.saturating_add(skew_ms) || ts < now.saturating_sub(skew_ms) {
            return Err(anyhow!("handshake nonce outside clock skew window"));
        }
        if !self.nonce_cache.insert(hs.nonce.clone()) {
            return Err(anyhow!("replayed handshake nonce"));
        }
        let sig = hex::decode(&hs.signature).map_err(|_| anyhow!("bad signature hex"))?;
        let claimed = signer::address_from_hex(&hs.node_id).ok_or_else(|| anyhow!("bad node id"))?;
        let msg = format!("wire:handshake:{}:{}", hs.node_id, hs.nonce);
        if !signer::verify(&msg, &sig, &claimed) {
            return Err(anyhow!("handshake signature does not recover to claimed node id"));
        }
        if let Some(expected) = expected_peer {
            if expected != claimed {
                return Err(anyhow!("handshake recovered address does not match expected peer"));
            }
        }
        Ok(claimed)
    }

    async fn read_loop(
        self: &Arc<Self>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        peer_id: Address,
        ip: IpAddr,
    ) -> Result<()> {
        let quota = Quota::with_period(RATE_LIMIT_WINDOW / RATE_LIMIT_FRAMES)
            .unwrap_or_else(|| Quota::per_second(nonzero!(50u32)))
            .allow_burst(nonzero!(RATE_LIMIT_FRAMES));
        let limiter = RateLimiter::direct(quota);

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = match tokio::time::timeout(IDLE_TIMEOUT, read_half.read(&mut buf)).await {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(anyhow!("idle timeout on connection from {ip}")),
            };
            let frames = decoder.feed(&buf[..n]).map_err(|e| anyhow!(e.to_string()))?;
            for frame in frames {
                if limiter.check().is_err() {
                    return Err(anyhow!("rate limit exceeded by {ip}"));
                }
                if let Some(typ) = frame.typ {
                    self.dispatch(peer_id, typ, &frame.payload).await?;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, peer_id: Address, typ: FrameType, payload: &[u8]) -> Result<()> {
        match typ {
            FrameType::Block => {
                let block: ChainBlockWire = serde_json::from_slice(payload)?;
                if self.block_dedup.insert(block.hash.clone()) {
                    let _ = self.events_tx.send(WireEvent::Block { from: peer_id, block });
                }
            }
            FrameType::Transaction => {
                let tx: TransactionWire = serde_json::from_slice(payload)?;
                if self.tx_dedup.insert(tx.raw_tx.clone()) {
                    let _ = self.events_tx.send(WireEvent::Transaction { from: peer_id, tx });
                }
            }
            FrameType::BftPrepare | FrameType::BftCommit => {
                let vote: BftVoteWire = serde_json::from_slice(payload)?;
                let sender = signer::address_from_hex(&vote.sender_id).ok_or_else(|| anyhow!("bad sender id"))?;
                if sender != peer_id {
                    warn!("dropping bft message whose senderId does not match the authenticated connection");
                    return Ok(());
                }
                let _ = self.events_tx.send(WireEvent::BftVote { from: peer_id, vote });
            }
            FrameType::FindNode => {
                let req: FindNodeWire = serde_json::from_slice(payload)?;
                let target = signer::address_from_hex(&req.target).ok_or_else(|| anyhow!("bad target"))?;
                let _ = self.events_tx.send(WireEvent::FindNode {
                    from: peer_id,
                    request_id: req.request_id,
                    target,
                });
            }
            FrameType::FindNodeResponse => {
                let resp: FindNodeResponseWire = serde_json::from_slice(payload)?;
                if let Some((_, sender)) = self.pending.find_node.remove(&resp.request_id) {
                    let _ = sender.send(resp.peers);
                }
            }
            FrameType::Ping => {
                let ping: PingWire = serde_json::from_slice(payload)?;
                let pong = encode(FrameType::Pong, &serde_json::to_vec(&ping)?)?;
                self.connections.send_to(&peer_id, pong).await;
            }
            FrameType::Pong => {
                let pong: PingWire = serde_json::from_slice(payload)?;
                if let Some((_, (expected_peer, sent_at))) = self.pending.ping.remove(&pong.nonce) {
                    if expected_peer == peer_id {
                        self.connections.record_latency(&peer_id, now_ms().saturating_sub(sent_at)).await;
                    }
                }
            }
            FrameType::Handshake | FrameType::HandshakeAck => {}
        }
        Ok(())
    }

    pub async fn send_find_node(&self, peer_id: Address, target: Address) -> Option<Vec<DhtPeerWire>> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.find_node.insert(request_id.clone(), tx);
        let req = FindNodeWire { request_id: request_id.clone(), target: signer::address_to_hex(&target) };
        let frame = encode(FrameType::FindNode, &serde_json::to_vec(&req).ok()?).ok()?;
        if !self.connections.send_to(&peer_id, frame).await {
            self.pending.find_node.remove(&request_id);
            return None;
        }
        tokio::time::timeout(REQUEST_TIMEOUT, rx).await.ok()?.ok()
    }

    pub async fn send_ping(&self, peer_id: Address) -> Option<u64> {
        let nonce = Uuid::new_v4().to_string();
        let sent_at = now_ms();
        self.pending.ping.insert(nonce.clone(), (peer_id, sent_at));
        let ping = PingWire { nonce: nonce.clone(), sent_at_ms: sent_at };
        let frame = encode(FrameType::Ping, &serde_json::to_vec(&ping).ok()?).ok()?;
        if !self.connections.send_to(&peer_id, frame).await {
            self.pending.ping.remove(&nonce);
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.connections.average_latency_ms(&peer_id).await
    }

    pub async fn broadcast_block(&self, block: &ChainBlockWire) -> Result<()> {
        let frame = encode(FrameType::Block, &serde_json::to_vec(block)?)?;
        self.connections.broadcast(frame).await;
        Ok(())
    }

    pub async fn broadcast_vote(&self, typ: FrameType, vote: &BftVoteWire) -> Result<()> {
        let frame = encode(typ, &serde_json::to_vec(vote)?)?;
        self.connections.broadcast(frame).await;
        Ok(())
    }
}

/// Adapts `WireServer` to the DHT's `SessionAuthority` fast path; the slow
/// (probe) path lives in client.rs since it needs to dial out.
#[async_trait::async_trait]
impl crate::network::dht::SessionAuthority for WireServer {
    fn is_authenticated(&self, id: &Address) -> bool {
        self.connections.is_authenticated(id)
    }

    async fn probe_handshake(&self, peer: &crate::routing::DhtPeer, signer: &NodeSigner, chain_id: u64) -> Option<Address> {
        crate::network::client::quick_handshake_probe(&peer.address, signer, chain_id, peer.id).await
    }
}

pub fn ip_of(addr: &str) -> Option<IpAddr> {
    canonical_ip(addr)
}
