// src/network/messages.rs
// Wire JSON payload shapes for the ten frame types (spec §6). BigInt fields
// (height, chainId, weight, baseFee) are serialized as decimal strings and
// parsed back into numeric types by callers, per the Frame Codec contract.

use serde::{Deserialize, Serialize};

fn de_u64_from_str<'de, D>(d: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn se_u64_as_str<S>(v: &u64, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&v.to_string())
}

fn de_u128_from_str<'de, D>(d: D) -> Result<u128, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn se_u128_as_str<S>(v: &u128, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(&v.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeWire {
    pub node_id: String,
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub chain_id: u64,
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub height: u64,
    pub nonce: String,
    pub signature: String, // hex, "" for an unsigned probe
}

pub type HandshakeAckWire = HandshakeWire;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BftVoteWire {
    #[serde(rename = "type")]
    pub kind: String, // "prepare" | "commit"
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub height: u64,
    pub block_hash: String,
    pub sender_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionWire {
    pub raw_tx: String, // hex-encoded raw transaction bytes
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainBlockWire {
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub proposer: String,
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub timestamp_ms: u64,
    pub txs: Vec<String>, // hex-encoded raw tx bytes
    pub finalized: bool,
    pub bft_finalized: bool,
    #[serde(serialize_with = "se_u128_as_str", deserialize_with = "de_u128_from_str")]
    pub base_fee: u128,
    #[serde(serialize_with = "se_u128_as_str", deserialize_with = "de_u128_from_str")]
    pub cumulative_weight: u128,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtPeerWire {
    pub id: String,
    pub address: String,
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeWire {
    pub request_id: String,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeResponseWire {
    pub request_id: String,
    pub peers: Vec<DhtPeerWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingWire {
    pub nonce: String,
    #[serde(serialize_with = "se_u64_as_str", deserialize_with = "de_u64_from_str")]
    pub sent_at_ms: u64,
}

pub type PongWire = PingWire;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigint_fields_round_trip_as_decimal_strings() {
        let hs = HandshakeWire {
            node_id: "0xabc".into(),
            chain_id: 1337,
            height: 42,
            nonce: "1:uuid".into(),
            signature: "".into(),
        };
        let json = serde_json::to_string(&hs).unwrap();
        assert!(json.contains("\"1337\""));
        assert!(json.contains("\"42\""));
        let back: HandshakeWire = serde_json::from_str(&json).unwrap();
        assert_eq!(back.chain_id, 1337);
        assert_eq!(back.height, 42);
    }
}
