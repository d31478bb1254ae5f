// src/network/client.rs
// C5 Wire Transport, outbound half: connects to bootstrap/discovered peers
// with exponential-backoff reconnect, and offers a one-shot handshake probe
// used by the DHT's verifyPeer fallback. Grounded in the teacher's
// record_failure_with_backoff/jitter pattern in network/mod.rs, replaced here
// with the `backoff` crate already carried in the dependency table.

use crate::network::codec::{encode, FrameDecoder, FrameType};
use crate::network::messages::HandshakeWire;
use crate::network::server::WireServer;
use crate::signer::{self, Address, NodeSigner};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};
use uuid::Uuid;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Maintains an outbound connection to `addr`, reconnecting with exponential
/// backoff (1s -> 30s cap) whenever the connection drops. Runs until the
/// process shuts down; intended to be spawned once per configured peer.
pub async fn maintain_connection(server: Arc<WireServer>, addr: String, expected_peer: Option<Address>) {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(RECONNECT_MIN)
        .with_max_interval(RECONNECT_MAX)
        .with_max_elapsed_time(None)
        .build();

    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                backoff.reset();
                let ip = stream.peer_addr().map(|a| a.ip()).unwrap_or_else(|_| "0.0.0.0".parse().unwrap());
                info!(%addr, "wire client connected");
                if let Err(e) = server.run_connection(stream, ip, expected_peer).await {
                    warn!(%addr, error = %e, "wire client connection ended");
                }
            }
            Err(e) => {
                warn!(%addr, error = %e, "wire client connect failed");
            }
        }
        let delay = backoff.next_backoff().unwrap_or(RECONNECT_MAX);
        tokio::time::sleep(delay).await;
    }
}

/// Opens a short-lived connection, performs the signed handshake, and
/// returns the peer's recovered address without registering it in the
/// connection table. Used by the DHT's `verifyPeer` fallback and by the
/// routing table's liveness probe.
pub async fn quick_handshake_probe(
    addr: &str,
    signer: &NodeSigner,
    chain_id: u64,
    expected_peer: Address,
) -> Option<Address> {
    let fut = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        let local_id = signer.node_id();
        let nonce = format!("{}:{}", now_ms(), Uuid::new_v4());
        let msg = format!("wire:handshake:{}:{}", signer::address_to_hex(&local_id), nonce);
        let sig = signer.sign(&msg);
        let hs = HandshakeWire {
            node_id: signer::address_to_hex(&local_id),
            chain_id,
            height: 0,
            nonce,
            signature: hex::encode(sig),
        };
        let frame = encode(FrameType::Handshake, &serde_json::to_vec(&hs).ok()?).ok()?;
        stream.write_all(&frame).await.ok()?;

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            let frames = decoder.feed(&buf[..n]).ok()?;
            for frame in frames {
                if matches!(frame.typ, Some(FrameType::Handshake) | Some(FrameType::HandshakeAck)) {
                    let peer_hs: HandshakeWire = serde_json::from_slice(&frame.payload).ok()?;
                    if peer_hs.chain_id != chain_id {
                        return None;
                    }
                    let claimed = signer::address_from_hex(&peer_hs.node_id)?;
                    if claimed != expected_peer {
                        return None;
                    }
                    let sig = hex::decode(&peer_hs.signature).ok()?;
                    let verify_msg = format!("wire:handshake:{}:{}", peer_hs.node_id, peer_hs.nonce);
                    if !signer::verify(&verify_msg, &sig, &claimed) {
                        return None;
                    }
                    return Some(claimed);
                }
            }
        }
    };

    tokio::time::timeout(PROBE_TIMEOUT, fut).await.unwrap_or_default()
}

pub fn canonicalize(addr: &str) -> Option<IpAddr> {
    crate::routing::canonical_ip(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::WireServer;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn probe_recovers_expected_peer_address() {
        let server_signer = NodeSigner::generate();
        let expected = server_signer.node_id();
        let (server, _events) = WireServer::new(server_signer, 7, 10);
        let server = Arc::new(server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = server.clone();
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let _ = accept_server.run_connection(stream, peer_addr.ip(), None).await;
        });

        let client_signer = NodeSigner::generate();
        let recovered = quick_handshake_probe(&addr.to_string(), &client_signer, 7, expected).await;
        assert_eq!(recovered, Some(expected));
    }

    #[tokio::test]
    async fn probe_rejects_chain_id_mismatch() {
        let server_signer = NodeSigner::generate();
        let expected = server_signer.node_id();
        let (server, _events) = WireServer::new(server_signer, 7, 10);
        let server = Arc::new(server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_server = server.clone();
        tokio::spawn(async move {
            let (stream, peer_addr) = listener.accept().await.unwrap();
            let _ = accept_server.run_connection(stream, peer_addr.ip(), None).await;
        });

        let client_signer = NodeSigner::generate();
        let recovered = quick_handshake_probe(&addr.to_string(), &client_signer, 999, expected).await;
        assert_eq!(recovered, None);
    }
}
