//! Hashing utilities for repoward
//!
//! - BLAKE3 vote fingerprints over the reference updates a node intends to apply
//! - Replica path derivation for new repositories

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque fingerprint of the result a participant intends to apply.
/// Two participants agree iff their fingerprints are byte-equal.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote(Vec<u8>);

impl Vote {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Fingerprint arbitrary bytes with BLAKE3
    pub fn of(data: &[u8]) -> Self {
        Self(blake3::hash(data).as_bytes().to_vec())
    }

    pub fn from_hex(s: &str) -> crate::Result<Self> {
        hex::decode(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidArgument(format!("invalid vote: {}", e)))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vote({})", self.to_hex())
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Physical location of a repository on every node of its virtual storage.
pub fn derive_replica_path(repository_id: u64) -> String {
    let digest = blake3::hash(repository_id.to_string().as_bytes()).to_hex();
    format!(
        "@cluster/repositories/{}/{}/{}",
        &digest[0..2],
        &digest[2..4],
        repository_id
    )
}
