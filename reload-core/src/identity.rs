//! Node identity: overlay node ids and the overlay name hash carried in every header.

use std::fmt;

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Overlay node id. Fixed length per overlay (16..=20 bytes); the length is validated by the
/// codecs against the configured `node_id_length`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Bytes);

impl NodeId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        NodeId(bytes.into())
    }

    /// Random id of `len` bytes.
    pub fn random(len: usize) -> Self {
        let mut id = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut id);
        NodeId(Bytes::from(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        if s.len() % 2 != 0 {
            return Err(IdentityError::OddHexLength(s.len()));
        }
        let bytes = (0..s.len())
            .step_by(2)
            .map(|i| {
                s.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or(IdentityError::InvalidHex(i))
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Ok(NodeId(Bytes::from(bytes)))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        NodeId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Overlay identifier carried in the forwarding header: low 32 bits of SHA-256(overlay name).
pub fn overlay_hash(overlay_name: &str) -> u32 {
    let digest = Sha256::digest(overlay_name.as_bytes());
    let mut low = [0u8; 4];
    low.copy_from_slice(&digest[digest.len() - 4..]);
    u32::from_be_bytes(low)
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("hex string has odd length {0}")]
    OddHexLength(usize),
    #[error("invalid hex digit at offset {0}")]
    InvalidHex(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let id = NodeId::random(16);
        assert_eq!(id.len(), 16);
        let parsed = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            NodeId::from_hex("abc"),
            Err(IdentityError::OddHexLength(3))
        ));
        assert!(matches!(
            NodeId::from_hex("zz00"),
            Err(IdentityError::InvalidHex(0))
        ));
    }

    #[test]
    fn overlay_hash_is_stable() {
        let a = overlay_hash("chess.example.org");
        assert_eq!(a, overlay_hash("chess.example.org"));
        assert_ne!(a, overlay_hash("go.example.org"));
    }
}
