//! Consensus receipt encoding.
//!
//! The first field of an encoded receipt is either a status marker or, for
//! blocks from before the status fork, the 32-byte intermediate state root.
//! The two forms are told apart purely by length and value:
//!
//! * empty string (`0x80`) - failed
//! * single byte `0x01` - successful
//! * 32-byte string - legacy post-state root
//!
//! Anything else is rejected.

use alloy_rlp::{BufMut, Bytes, Decodable, Encodable, Header, RlpDecodable, RlpEncodable};

use crate::crypto::{self, Address, Hash};
use crate::trie;

const STATUS_FAILED: &[u8] = &[];
const STATUS_SUCCESSFUL: &[u8] = &[0x01];

pub const BLOOM_BYTES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Failed,
    Successful,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Bytes,
}

/// Result of executing a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Intermediate state root; empty for post-fork receipts.
    pub post_state: Bytes,
    pub status: ReceiptStatus,
    pub cumulative_gas_used: u64,
    pub bloom: [u8; BLOOM_BYTES],
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Creates a barebone receipt. An empty `root` selects the status form.
    pub fn new(root: &[u8], failed: bool, cumulative_gas_used: u64) -> Self {
        Self {
            post_state: Bytes::copy_from_slice(root),
            status: if failed { ReceiptStatus::Failed } else { ReceiptStatus::Successful },
            cumulative_gas_used,
            bloom: [0u8; BLOOM_BYTES],
            logs: Vec::new(),
        }
    }

    /// The value stored in the first consensus field.
    pub fn status_encoding(&self) -> &[u8] {
        if self.post_state.is_empty() {
            match self.status {
                ReceiptStatus::Failed => STATUS_FAILED,
                ReceiptStatus::Successful => STATUS_SUCCESSFUL,
            }
        } else {
            &self.post_state
        }
    }

    fn payload_length(&self) -> usize {
        self.status_encoding().length()
            + self.cumulative_gas_used.length()
            + self.bloom.length()
            + self.logs.length()
    }

    /// Leaf committed to by the block's receipts root.
    pub fn leaf(&self) -> Hash {
        crypto::blake3_hash(&alloy_rlp::encode(self))
    }
}

impl Encodable for Receipt {
    fn encode(&self, out: &mut dyn BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        self.status_encoding().encode(out);
        self.cumulative_gas_used.encode(out);
        self.bloom.encode(out);
        self.logs.encode(out);
    }

    fn length(&self) -> usize {
        let payload = self.payload_length();
        payload + alloy_rlp::length_of_length(payload)
    }
}

impl Decodable for Receipt {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        let started = buf.len();

        let field = Header::decode(buf)?;
        if field.list {
            return Err(alloy_rlp::Error::UnexpectedList);
        }
        if buf.len() < field.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let (raw, rest) = buf.split_at(field.payload_length);
        *buf = rest;
        let (post_state, status) = match raw {
            [] => (Bytes::new(), ReceiptStatus::Failed),
            [0x01] => (Bytes::new(), ReceiptStatus::Successful),
            // legacy receipts do not commit to a status
            root if root.len() == 32 => (Bytes::copy_from_slice(root), ReceiptStatus::Failed),
            _ => return Err(alloy_rlp::Error::Custom("invalid receipt status")),
        };

        let cumulative_gas_used = u64::decode(buf)?;
        let bloom = <[u8; BLOOM_BYTES]>::decode(buf)?;
        let logs = Vec::<Log>::decode(buf)?;

        let consumed = started - buf.len();
        if consumed != header.payload_length {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: header.payload_length,
                got: consumed,
            });
        }
        Ok(Self { post_state, status, cumulative_gas_used, bloom, logs })
    }
}

/// Root committing to a block's receipts in order.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    let leaves: Vec<Hash> = receipts.iter().map(Receipt::leaf).collect();
    trie::ordered_root(&leaves)
}
