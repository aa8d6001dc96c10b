use serde_json::json;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong in the data layer and the Chum protocol.
///
/// Every variant has a stable wire code of the form `ONE-<CODE><N>` and a
/// JSON details dictionary, which is what peers see in error frames.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Error {
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch { expected: String, computed: String },
    #[error("malformed microdata at byte {at}: {reason}")]
    MalformedMicrodata { at: usize, reason: String },
    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("value out of range at {path}: {value}")]
    ValueOutOfRange { path: String, value: String },
    #[error("not a hash: {value}")]
    BadHash { value: String },
    #[error("rejected object type {name}")]
    RejectedType { name: String },
    #[error("child consistency violation for {hash}: {reason}")]
    ChildConsistency { hash: String, reason: String },
    #[error("unknown recipe {name}")]
    RecipeUnknown { name: String },
    #[error("invalid recipe {name}: {reason}")]
    RecipeInvalid { name: String, reason: String },
    #[error("recipe {name} is already registered")]
    RecipeExists { name: String },
    #[error("crdt algorithm {algorithm} does not apply to {path}")]
    AlgorithmTypeMismatch { path: String, algorithm: String },
    #[error("no common history between {a} and {b}")]
    NoCommonHistory { a: String, b: String },
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    ProtocolMismatch { local: u32, remote: u32 },
    #[error("access denied for {hash}")]
    AccessDenied { hash: String },
    #[error("peer has no chum service registered")]
    PeerUnknownService,
    #[error("peer connection closed")]
    PeerClosed,
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    /// Constructs an [`Error::Internal`].
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Constructs an [`Error::MalformedMicrodata`].
    pub fn malformed(at: usize, reason: impl Into<String>) -> Self {
        Self::MalformedMicrodata {
            at,
            reason: reason.into(),
        }
    }

    /// Returns the stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::HashMismatch { .. } => "ONE-HASH1",
            Self::MalformedMicrodata { .. } => "ONE-MD1",
            Self::TypeMismatch { .. } => "ONE-TYPE1",
            Self::ValueOutOfRange { .. } => "ONE-RANGE1",
            Self::BadHash { .. } => "ONE-HASH2",
            Self::RejectedType { .. } => "ONE-REJ1",
            Self::ChildConsistency { .. } => "ONE-CHILD1",
            Self::RecipeUnknown { .. } => "ONE-RCP1",
            Self::RecipeInvalid { .. } => "ONE-RCP2",
            Self::RecipeExists { .. } => "ONE-RCP3",
            Self::AlgorithmTypeMismatch { .. } => "ONE-CRDT1",
            Self::NoCommonHistory { .. } => "ONE-HIST1",
            Self::ProtocolMismatch { .. } => "ONE-PROT1",
            Self::AccessDenied { .. } => "ONE-ACC1",
            Self::PeerUnknownService => "ONE-PEER1",
            Self::PeerClosed => "ONE-PEER2",
            Self::Internal { .. } => "ONE-INT1",
        }
    }

    /// Returns the details dictionary sent along with the code in wire form.
    pub fn details(&self) -> serde_json::Value {
        match self {
            Self::HashMismatch { expected, computed } => {
                json!({ "expected": expected, "computed": computed })
            }
            Self::MalformedMicrodata { at, reason } => json!({ "at": at, "reason": reason }),
            Self::TypeMismatch {
                path,
                expected,
                found,
            } => json!({ "path": path, "expected": expected, "found": found }),
            Self::ValueOutOfRange { path, value } => json!({ "path": path, "value": value }),
            Self::BadHash { value } => json!({ "value": value }),
            Self::RejectedType { name } => json!({ "name": name }),
            Self::ChildConsistency { hash, reason } => json!({ "hash": hash, "reason": reason }),
            Self::RecipeUnknown { name } => json!({ "name": name }),
            Self::RecipeInvalid { name, reason } => json!({ "name": name, "reason": reason }),
            Self::RecipeExists { name } => json!({ "name": name }),
            Self::AlgorithmTypeMismatch { path, algorithm } => {
                json!({ "path": path, "algorithm": algorithm })
            }
            Self::NoCommonHistory { a, b } => json!({ "a": a, "b": b }),
            Self::ProtocolMismatch { local, remote } => {
                json!({ "local": local, "remote": remote })
            }
            Self::AccessDenied { hash } => json!({ "hash": hash }),
            Self::PeerUnknownService | Self::PeerClosed => json!({}),
            Self::Internal { reason } => json!({ "reason": reason }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = Error::HashMismatch {
            expected: "00".into(),
            computed: "ff".into(),
        };
        assert_eq!(err.code(), "ONE-HASH1");
        assert_eq!(err.details()["expected"], "00");
    }
}
