//! Binary Merkle commitments.
//!
//! Two shapes are used:
//!
//! * [`ordered_root`] commits to a list in order (block transactions,
//!   receipts). Verifiers always hold the whole list, so no proofs needed.
//! * [`KeyedTrie`] commits to a sorted key/value map (state, storage, CHT,
//!   bloom trie) and hands out inclusion and absence proofs that are checked
//!   against a trusted root with [`KeyedProof::verify`].
//!
//! At every level an odd trailing node is paired with itself.

use std::collections::BTreeMap;

use alloy_rlp::{Bytes, RlpDecodable, RlpEncodable};

use crate::crypto::{self, Hash};
use crate::error::ValidationError;
use crate::types::EMPTY_ROOT;

const COUNT_PREFIX: u8 = 0x02;

fn next_level(level: &[Hash]) -> Vec<Hash> {
    level
        .chunks(2)
        .map(|pair| match pair {
            [l, r] => crypto::node_hash(l, r),
            [single] => crypto::node_hash(single, single),
            _ => unreachable!("chunks(2) yields one or two items"),
        })
        .collect()
}

/// Build the root over `leaves` in the given order.
pub fn ordered_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return EMPTY_ROOT;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Sibling path for the leaf at `index`. Self-paired levels contribute no
/// sibling.
pub fn ordered_proof(leaves: &[Hash], index: usize) -> Option<Vec<Hash>> {
    if index >= leaves.len() {
        return None;
    }
    let mut path = Vec::new();
    let mut level = leaves.to_vec();
    let mut i = index;
    while level.len() > 1 {
        if i % 2 == 1 {
            path.push(level[i - 1]);
        } else if i + 1 < level.len() {
            path.push(level[i + 1]);
        }
        level = next_level(&level);
        i /= 2;
    }
    Some(path)
}

/// Fold a sibling path back up to the root. `None` when the path does not
/// fit a tree of `count` leaves.
pub fn compute_root(leaf: &Hash, index: u64, count: u64, path: &[Hash]) -> Option<Hash> {
    if count == 0 || index >= count {
        return None;
    }
    let mut h = *leaf;
    let mut i = index;
    let mut n = count;
    let mut siblings = path.iter();
    while n > 1 {
        h = if i % 2 == 1 {
            crypto::node_hash(siblings.next()?, &h)
        } else if i + 1 < n {
            crypto::node_hash(&h, siblings.next()?)
        } else {
            crypto::node_hash(&h, &h)
        };
        i /= 2;
        n = (n + 1) / 2;
    }
    if siblings.next().is_some() {
        return None;
    }
    Some(h)
}

fn commit_count(count: u64, tree_root: &Hash) -> Hash {
    let mut h = blake3::Hasher::new();
    h.update(&[COUNT_PREFIX]);
    h.update(&count.to_be_bytes());
    h.update(tree_root);
    *h.finalize().as_bytes()
}

/// One proven leaf of a keyed trie.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ProofLeaf {
    pub index: u64,
    pub key: Bytes,
    pub value: Bytes,
    pub siblings: Vec<Hash>,
}

/// Inclusion or absence proof for one key.
///
/// Inclusion carries the matching leaf. Absence carries the neighbouring
/// leaves that bracket the key, or the first/last leaf when the key sorts
/// outside the trie, or nothing for an empty trie.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct KeyedProof {
    pub count: u64,
    pub leaves: Vec<ProofLeaf>,
}

impl KeyedProof {
    /// Check the proof against `root` and return the value stored under
    /// `key`, or `None` if the trie proves it absent.
    pub fn verify(&self, root: &Hash, key: &[u8]) -> Result<Option<Bytes>, ValidationError> {
        if self.count == 0 {
            if !self.leaves.is_empty() {
                return Err(ValidationError::BadProof("leaves in an empty trie"));
            }
            if *root != EMPTY_ROOT {
                return Err(ValidationError::RootMismatch { what: "trie", expected: *root, computed: EMPTY_ROOT });
            }
            return Ok(None);
        }
        if self.leaves.is_empty() || self.leaves.len() > 2 {
            return Err(ValidationError::BadProof("unexpected number of leaves"));
        }

        for leaf in &self.leaves {
            let tree_root = compute_root(&crypto::leaf_hash(&leaf.key, &leaf.value), leaf.index, self.count, &leaf.siblings)
                .ok_or(ValidationError::BadProof("path does not fit leaf count"))?;
            let computed = commit_count(self.count, &tree_root);
            if computed != *root {
                return Err(ValidationError::RootMismatch { what: "trie", expected: *root, computed });
            }
        }

        let last = self.count - 1;
        match self.leaves.as_slice() {
            [leaf] if leaf.key.as_ref() == key => Ok(Some(leaf.value.clone())),
            [leaf] if leaf.index == 0 && key < leaf.key.as_ref() => Ok(None),
            [leaf] if leaf.index == last && key > leaf.key.as_ref() => Ok(None),
            [lo, hi] if hi.index == lo.index + 1 && lo.key.as_ref() < key && key < hi.key.as_ref() => Ok(None),
            _ => Err(ValidationError::BadProof("leaves do not prove the key")),
        }
    }
}

/// Sorted key/value commitment.
#[derive(Debug, Clone, Default)]
pub struct KeyedTrie {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    leaves: Vec<Hash>,
}

impl KeyedTrie {
    /// Build from entries in any order. Later duplicates replace earlier ones.
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        let sorted: BTreeMap<Vec<u8>, Vec<u8>> =
            entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = sorted.into_iter().collect();
        let leaves = entries.iter().map(|(k, v)| crypto::leaf_hash(k, v)).collect();
        Self { entries, leaves }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn root(&self) -> Hash {
        if self.entries.is_empty() {
            return EMPTY_ROOT;
        }
        commit_count(self.entries.len() as u64, &ordered_root(&self.leaves))
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.position(key).ok().map(|i| self.entries[i].1.as_slice())
    }

    fn position(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_slice().cmp(key))
    }

    fn proof_leaf(&self, index: usize) -> ProofLeaf {
        let (key, value) = &self.entries[index];
        ProofLeaf {
            index: index as u64,
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            siblings: ordered_proof(&self.leaves, index).unwrap_or_default(),
        }
    }

    /// Inclusion proof if `key` is present, absence proof otherwise.
    pub fn prove(&self, key: &[u8]) -> KeyedProof {
        let count = self.entries.len();
        let indices: Vec<usize> = match self.position(key) {
            _ if count == 0 => Vec::new(),
            Ok(i) => vec![i],
            Err(0) => vec![0],
            Err(pos) if pos == count => vec![count - 1],
            Err(pos) => vec![pos - 1, pos],
        };
        KeyedProof {
            count: count as u64,
            leaves: indices.into_iter().map(|i| self.proof_leaf(i)).collect(),
        }
    }
}
