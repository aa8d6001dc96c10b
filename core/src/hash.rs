use crate::error::Error;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn decode_hex(s: &str) -> Result<[u8; 32], Error> {
    let mut hash = [0; 32];
    if s.len() != 64 {
        return Err(Error::BadHash { value: s.into() });
    }
    hex::decode_to_slice(s, &mut hash).map_err(|_| Error::BadHash { value: s.into() })?;
    Ok(hash)
}

/// SHA-256 of the microdata of a concrete object, or of raw BLOB/CLOB bytes.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Hashes the given bytes.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(digest(bytes))
    }

    /// Returns the 64-char lowercase hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

impl From<Hash> for String {
    fn from(hash: Hash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for Hash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl AsRef<[u8; 32]> for Hash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex(s)?))
    }
}

/// SHA-256 of the id-microdata of a versioned object.
///
/// Deliberately a distinct type from [`Hash`]; the two hash namespaces never
/// mix, and there is no conversion between them.
#[derive(
    Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct IdHash([u8; 32]);

impl IdHash {
    pub fn new(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// Hashes the given id-microdata bytes.
    pub fn digest(bytes: &[u8]) -> Self {
        Self(digest(bytes))
    }

    /// Returns the 64-char lowercase hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<IdHash> for [u8; 32] {
    fn from(hash: IdHash) -> Self {
        hash.0
    }
}

impl From<IdHash> for String {
    fn from(hash: IdHash) -> Self {
        hash.to_hex()
    }
}

impl TryFrom<String> for IdHash {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl AsRef<[u8; 32]> for IdHash {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for IdHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for IdHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for IdHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(decode_hex(s)?))
    }
}
