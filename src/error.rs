//! Error types for the retrieval core.

use libp2p::PeerId;

use crate::crypto::Hash;
use crate::wire::RequestKind;

/// Peer registry mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A second connection for an identity that is already registered.
    #[error("peer {0} already registered")]
    AlreadyRegistered(PeerId),

    #[error("peer {0} not registered")]
    NotRegistered(PeerId),

    #[error("light peer limit of {0} reached")]
    Full(usize),
}

/// Reasons a distributor wait ends without a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DistributeError {
    #[error("cancelled while waiting for a peer")]
    Cancelled,

    #[error("deadline passed while waiting for a peer")]
    DeadlineExceeded,
}

/// Failure of the transport send primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("peer {0} unreachable")]
    Unreachable(PeerId),

    #[error("transport closed")]
    Closed,
}

/// A response that cannot be trusted.
///
/// Every variant is treated as misbehaviour of the answering peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("expected {expected:?} response, got {got:?}")]
    UnexpectedResponse { expected: RequestKind, got: RequestKind },

    #[error("expected {expected} items, got {got}")]
    CountMismatch { expected: usize, got: usize },

    #[error("{what} root mismatch: trusted {}, computed {}", hex::encode(.expected), hex::encode(.computed))]
    RootMismatch { what: &'static str, expected: Hash, computed: Hash },

    #[error("{what} hash mismatch")]
    HashMismatch { what: &'static str },

    #[error("malformed proof: {0}")]
    BadProof(&'static str),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Terminal outcome of a retrieval session other than success.
///
/// Cloned to every caller attached to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetrieveError {
    #[error("retrieval exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("retrieval deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    #[error("retrieval cancelled")]
    Cancelled,

    #[error("retrieval manager shut down")]
    Shutdown,
}

/// Errors surfaced to ODR callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OdrError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    /// The final check against the trusted root failed after retrieval
    /// already accepted the answer.
    #[error("verification failed: {0}")]
    VerificationFailed(ValidationError),

    #[error("no trusted {trie} root for section {section}")]
    NoTrustedRoot { trie: &'static str, section: u64 },

    #[error("block {} not known locally", hex::encode(.0))]
    UnknownBlock(Hash),

    /// Programming error on the caller side; never retried.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl OdrError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OdrError::Retrieve(RetrieveError::Cancelled))
    }
}

/// Errors from a [`crate::backend::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Odr(#[from] OdrError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for BackendError {
    fn from(e: anyhow::Error) -> Self {
        BackendError::Storage(format!("{e:#}"))
    }
}
