//! Chain data the light client reasons about. Headers are trusted once the
//! local header chain accepts them; everything else is proven against a
//! root that one of those headers commits to.

use alloy_rlp::{Bytes, RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Hash};
use crate::trie;

/// Root of an empty commitment.
pub const EMPTY_ROOT: Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable, Serialize, Deserialize)]
pub struct Header {
    pub parent_hash: Hash,
    pub number: u64,
    pub timestamp: u64,
    pub state_root: Hash,
    pub tx_root: Hash,
    pub receipts_root: Hash,
}

impl Header {
    pub fn hash(&self) -> Hash {
        crypto::blake3_hash(&alloy_rlp::encode(self))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Body {
    pub transactions: Vec<Bytes>,
}

impl Body {
    pub fn tx_root(&self) -> Hash {
        let leaves: Vec<Hash> = self.transactions.iter().map(|tx| crypto::blake3_hash(tx)).collect();
        trie::ordered_root(&leaves)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    pub nonce: u64,
    pub balance: u128,
    pub storage_root: Hash,
    pub code_hash: Hash,
}

impl Account {
    pub fn has_code(&self) -> bool {
        self.code_hash != crypto::empty_code_hash()
    }
}

/// Trusted root of one canonical-hash-trie section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChtRoot {
    pub section: u64,
    pub root: Hash,
}

/// Trusted root of one bloom-trie section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomTrieRoot {
    pub section: u64,
    pub root: Hash,
}

/// CHT key of a block number.
pub fn cht_key(number: u64) -> [u8; 8] {
    number.to_be_bytes()
}

/// Bloom-trie key of a bloom bit within a section.
pub fn bloom_trie_key(bit: u16, section: u64) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[..2].copy_from_slice(&bit.to_be_bytes());
    key[2..].copy_from_slice(&section.to_be_bytes());
    key
}
