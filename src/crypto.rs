use blake3::Hasher;

/// A 32-byte digest used for block hashes, roots and code hashes.
pub type Hash = [u8; 32];

/// A 20-byte account address.
pub type Address = [u8; 20];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hashes arbitrary data with a domain-specific key for internal consistency.
pub fn blake3_hash(data: &[u8]) -> Hash {
    *Hasher::new_derive_key("unchained-light-v1").update(data).finalize().as_bytes()
}

/// Hash of a keyed trie leaf. The key length is mixed in so that
/// `(ab, c)` and `(a, bc)` never collide.
pub fn leaf_hash(key: &[u8], value: &[u8]) -> Hash {
    let mut h = Hasher::new();
    h.update(&[LEAF_PREFIX]);
    h.update(&(key.len() as u32).to_be_bytes());
    h.update(key);
    h.update(value);
    *h.finalize().as_bytes()
}

/// Hash of an interior node.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut h = Hasher::new();
    h.update(&[NODE_PREFIX]);
    h.update(left);
    h.update(right);
    *h.finalize().as_bytes()
}

/// Content hash of contract code.
pub fn code_hash(code: &[u8]) -> Hash {
    blake3_hash(code)
}

/// Code hash of an account without code.
pub fn empty_code_hash() -> Hash {
    code_hash(&[])
}

/// Trie key of an account in the state trie.
pub fn account_key(address: &Address) -> Hash {
    blake3_hash(address)
}

/// Trie key of a storage slot in an account's storage trie.
pub fn storage_key(slot: &Hash) -> Hash {
    blake3_hash(slot)
}
