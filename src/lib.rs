// Light-client on-demand retrieval.
// A node holding only headers fetches state, receipts, code and helper-trie
// proofs from light servers and verifies them against roots it already trusts.

pub mod config;
pub mod crypto;
pub mod error;
pub mod types;
pub mod receipt;
pub mod trie;
pub mod wire;
pub mod storage;
pub mod metrics;
pub mod logging;
pub mod peers;
pub mod serverpool;
pub mod distributor;
pub mod retrieve;
pub mod odr;
pub mod bloom;
pub mod backend;
pub mod client;

pub use client::LightClient;
pub use crypto::{Address, Hash};
pub use error::{OdrError, RetrieveError, ValidationError};
pub use odr::{Odr, TrustedRoots};
pub use peers::{PeerCapabilities, PeerSet};
pub use receipt::{Receipt, ReceiptStatus};
pub use retrieve::{RequestSender, RetrievalManager, SessionState};
pub use serverpool::{Outcome, ServerPool};
pub use storage::Store;
pub use types::{Account, Body, BloomTrieRoot, ChtRoot, Header};
pub use wire::{Request, RequestKind, Response};
