// src/signer.rs
// C1 Node Signer: deterministic secp256k1 sign/recover over a 32-byte digest
// of a caller-supplied UTF-8 string. Ethereum-style address derivation
// (keccak256(uncompressed pubkey)[12..]) gives the 20-byte NodeId.

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tiny_keccak::{Hasher, Keccak};
use tracing::{info, warn};

/// 20-byte address, recovered from a signature, used as NodeId throughout
/// the routing table and wire transport.
pub type Address = [u8; 20];

pub fn address_to_hex(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr))
}

pub fn address_from_hex(s: &str) -> Option<Address> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Some(out)
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

fn digest32(msg: &str) -> [u8; 32] {
    keccak256(msg.as_bytes())
}

fn address_from_verifying_key(vk: &VerifyingKey) -> Address {
    let uncompressed = vk.to_encoded_point(false);
    // Skip the leading 0x04 tag byte; hash the raw 64-byte (x||y) point.
    let hash = keccak256(&uncompressed.as_bytes()[1..]);
    let mut addr = [0u8; 20];
    addr.copy_from_slice(&hash[12..]);
    addr
}

/// Holds a secp256k1 keypair and exposes the Node Signer operations (§4.1).
/// No global state — multiple signers may coexist for test harnesses.
#[derive(Clone)]
pub struct NodeSigner {
    signing_key: SigningKey,
}

impl NodeSigner {
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        NodeSigner { signing_key }
    }

    pub fn generate() -> Self {
        NodeSigner {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Load a key with priority env-var > on-disk 0o600 file > freshly
    /// generated and persisted, mirroring the teacher's NodeIdentity
    /// load_or_create pattern.
    pub fn load_or_create(env_var: &str, path: &Path) -> anyhow::Result<Self> {
        if let Ok(hexkey) = std::env::var(env_var) {
            let bytes = hex::decode(hexkey.trim())?;
            let sk = SigningKey::from_slice(&bytes)?;
            info!("node signer loaded from {env_var}");
            return Ok(NodeSigner::from_signing_key(sk));
        }

        if path.exists() {
            let bytes = fs::read(path)?;
            let hexstr = String::from_utf8(bytes)?;
            let raw = hex::decode(hexstr.trim())?;
            let sk = SigningKey::from_slice(&raw)?;
            info!("node signer loaded from {}", path.display());
            return Ok(NodeSigner::from_signing_key(sk));
        }

        warn!(
            "no node key found in {env_var} or {} — generating a fresh one",
            path.display()
        );
        let signer = NodeSigner::generate();
        signer.persist(path)?;
        Ok(signer)
    }

    fn persist(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let hexkey = hex::encode(self.signing_key.to_bytes());
        let mut f = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        f.write_all(hexkey.as_bytes())?;
        f.set_permissions(fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// `recover` applied to any self-signed message yields the signer's identity.
    pub fn node_id(&self) -> Address {
        address_from_verifying_key(&VerifyingKey::from(&self.signing_key))
    }

    pub fn sign(&self, msg: &str) -> [u8; 65] {
        let digest = digest32(msg);
        let (sig, recid): (Signature, RecoveryId) = self
            .signing_key
            .sign_prehash_recoverable(&digest)
            .expect("signing over a fixed 32-byte digest cannot fail");
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        out
    }
}

/// Recover the signer address from a message + 65-byte signature. Stateless —
/// any signer or verifier in the system can call this.
pub fn recover(msg: &str, sig65: &[u8]) -> Option<Address> {
    if sig65.len() != 65 {
        return None;
    }
    let digest = digest32(msg);
    let sig = Signature::from_slice(&sig65[..64]).ok()?;
    let recid = RecoveryId::from_byte(sig65[64])?;
    let vk = VerifyingKey::recover_from_prehash(&digest, &sig, recid).ok()?;
    Some(address_from_verifying_key(&vk))
}

/// Case-insensitive verify: recovered address must equal `expected`.
pub fn verify(msg: &str, sig65: &[u8], expected: &Address) -> bool {
    match recover(msg, sig65) {
        Some(addr) => addr == *expected,
        None => false,
    }
}
