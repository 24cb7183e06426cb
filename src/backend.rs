//! Chain data access for the API surface.
//!
//! A node runs with exactly one backend, chosen at startup. The full
//! backend reads everything from its own database and can answer
//! light-protocol requests for others; the light backend only holds headers
//! and trusted section roots and waits on ODR for the rest.

use std::sync::Arc;

use alloy_rlp::{Bytes, Decodable};
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::crypto::{self, Address, Hash};
use crate::error::BackendError;
use crate::odr::{Odr, TrustedRoots};
use crate::receipt::Receipt;
use crate::storage::{Store, CF_CHAIN, CF_TRIE};
use crate::trie::KeyedTrie;
use crate::types::{self, Account, BloomTrieRoot, Body, ChtRoot, Header, EMPTY_ROOT};
use crate::wire::{
    HashOrNumber, HeaderProof, HelperTrie, HelperTrieProof, HelperTrieQuery, ProofQuery, Request, Response,
};

const HEADER_PREFIX: u8 = b'h';
const CANONICAL_PREFIX: u8 = b'n';
const BODY_PREFIX: u8 = b'b';
const RECEIPTS_PREFIX: u8 = b'r';
const CODE_PREFIX: u8 = b'c';
const CHT_ROOT_PREFIX: u8 = b'C';
const BLOOM_ROOT_PREFIX: u8 = b'B';

/// Upper bound on headers served per range request.
const MAX_HEADERS_SERVED: u64 = 192;

fn chain_key(prefix: u8, id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + id.len());
    key.push(prefix);
    key.extend_from_slice(id);
    key
}

/// Local chain database: headers, block data, trie contents and the
/// trusted helper-trie roots.
pub struct ChainDb {
    store: Arc<Store>,
    cht_section_size: u64,
}

impl ChainDb {
    pub fn new(store: Arc<Store>, cht_section_size: u64) -> Self {
        Self { store, cht_section_size }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Store `header` and make it canonical for its number.
    pub fn put_header(&self, header: &Header) -> Result<Hash> {
        let hash = header.hash();
        self.store.put(CF_CHAIN, &chain_key(HEADER_PREFIX, &hash), header)?;
        self.store.put(CF_CHAIN, &chain_key(CANONICAL_PREFIX, &header.number.to_be_bytes()), &hash)?;
        Ok(hash)
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>> {
        self.store.get(CF_CHAIN, &chain_key(HEADER_PREFIX, hash))
    }

    pub fn canonical_hash(&self, number: u64) -> Result<Option<Hash>> {
        self.store.get(CF_CHAIN, &chain_key(CANONICAL_PREFIX, &number.to_be_bytes()))
    }

    pub fn header_by_number(&self, number: u64) -> Result<Option<Header>> {
        match self.canonical_hash(number)? {
            Some(hash) => self.header_by_hash(&hash),
            None => Ok(None),
        }
    }

    pub fn put_body(&self, hash: &Hash, body: &Body) -> Result<()> {
        let txs: Vec<Vec<u8>> = body.transactions.iter().map(|tx| tx.to_vec()).collect();
        self.store.put(CF_CHAIN, &chain_key(BODY_PREFIX, hash), &txs)
    }

    pub fn body(&self, hash: &Hash) -> Result<Option<Body>> {
        let txs: Option<Vec<Vec<u8>>> = self.store.get(CF_CHAIN, &chain_key(BODY_PREFIX, hash))?;
        Ok(txs.map(|txs| Body { transactions: txs.into_iter().map(Bytes::from).collect() }))
    }

    pub fn put_receipts(&self, hash: &Hash, receipts: &[Receipt]) -> Result<()> {
        let encoded: Vec<Vec<u8>> = receipts.iter().map(alloy_rlp::encode).collect();
        self.store.put(CF_CHAIN, &chain_key(RECEIPTS_PREFIX, hash), &encoded)
    }

    pub fn receipts(&self, hash: &Hash) -> Result<Option<Vec<Receipt>>> {
        let encoded: Option<Vec<Vec<u8>>> = self.store.get(CF_CHAIN, &chain_key(RECEIPTS_PREFIX, hash))?;
        let Some(encoded) = encoded else { return Ok(None) };
        let receipts = encoded
            .iter()
            .map(|raw| Receipt::decode(&mut raw.as_slice()).map_err(|e| anyhow::anyhow!("stored receipt: {e}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(receipts))
    }

    pub fn put_code(&self, code: &[u8]) -> Result<Hash> {
        let hash = crypto::code_hash(code);
        self.store.put(CF_CHAIN, &chain_key(CODE_PREFIX, &hash), &code.to_vec())?;
        Ok(hash)
    }

    pub fn code(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        if *hash == crypto::empty_code_hash() {
            return Ok(Some(Vec::new()));
        }
        self.store.get(CF_CHAIN, &chain_key(CODE_PREFIX, hash))
    }

    /// Store the contents of `trie` under its root.
    pub fn put_trie(&self, trie: &KeyedTrie) -> Result<Hash> {
        let root = trie.root();
        if root != EMPTY_ROOT {
            self.store.put(CF_TRIE, &root, &trie.entries().to_vec())?;
        }
        Ok(root)
    }

    pub fn trie(&self, root: &Hash) -> Result<Option<KeyedTrie>> {
        if *root == EMPTY_ROOT {
            return Ok(Some(KeyedTrie::default()));
        }
        let entries: Option<Vec<(Vec<u8>, Vec<u8>)>> = self.store.get(CF_TRIE, root)?;
        Ok(entries.map(KeyedTrie::new))
    }

    pub fn put_cht_root(&self, cht: ChtRoot) -> Result<()> {
        self.store.put(CF_CHAIN, &chain_key(CHT_ROOT_PREFIX, &cht.section.to_be_bytes()), &cht.root)
    }

    pub fn put_bloom_trie_root(&self, root: BloomTrieRoot) -> Result<()> {
        self.store.put(CF_CHAIN, &chain_key(BLOOM_ROOT_PREFIX, &root.section.to_be_bytes()), &root.root)
    }

    fn stored_root(&self, prefix: u8, section: u64) -> Result<Option<Hash>> {
        self.store.get(CF_CHAIN, &chain_key(prefix, &section.to_be_bytes()))
    }

    /// Index the canonical hashes of a complete section into a CHT and
    /// record its root as trusted.
    pub fn build_cht(&self, section: u64) -> Result<ChtRoot> {
        let start = section * self.cht_section_size;
        let mut entries = Vec::with_capacity(self.cht_section_size as usize);
        for number in start..start + self.cht_section_size {
            let hash = self
                .canonical_hash(number)?
                .with_context(|| format!("section {section} incomplete: no canonical block {number}"))?;
            entries.push((types::cht_key(number).to_vec(), hash.to_vec()));
        }
        let trie = KeyedTrie::new(entries);
        let cht = ChtRoot { section, root: self.put_trie(&trie)? };
        self.put_cht_root(cht)?;
        tracing::debug!(section, root = %hex::encode(cht.root), "CHT section indexed");
        Ok(cht)
    }

    /// Index per-bit bloom vectors of a section and record the root as trusted.
    pub fn build_bloom_trie(&self, section: u64, vectors: &[(u16, Vec<u8>)]) -> Result<BloomTrieRoot> {
        let trie = KeyedTrie::new(vectors.iter().map(|(bit, v)| (types::bloom_trie_key(*bit, section).to_vec(), v.clone())));
        let root = BloomTrieRoot { section, root: self.put_trie(&trie)? };
        self.put_bloom_trie_root(root)?;
        Ok(root)
    }

    pub fn cht_section_size(&self) -> u64 {
        self.cht_section_size
    }
}

impl TrustedRoots for ChainDb {
    fn cht_root(&self, section: u64) -> Option<ChtRoot> {
        match self.stored_root(CHT_ROOT_PREFIX, section) {
            Ok(root) => root.map(|root| ChtRoot { section, root }),
            Err(e) => {
                tracing::warn!(section, error = %e, "reading CHT root failed");
                None
            }
        }
    }

    fn bloom_trie_root(&self, section: u64) -> Option<BloomTrieRoot> {
        match self.stored_root(BLOOM_ROOT_PREFIX, section) {
            Ok(root) => root.map(|root| BloomTrieRoot { section, root }),
            Err(e) => {
                tracing::warn!(section, error = %e, "reading bloom trie root failed");
                None
            }
        }
    }
}

fn decode_account(raw: &[u8]) -> Result<Account> {
    Account::decode(&mut &raw[..]).map_err(|e| anyhow::anyhow!("stored account: {e}"))
}

/// Serves everything from the local database.
#[derive(Clone)]
pub struct FullBackend {
    db: Arc<ChainDb>,
}

impl FullBackend {
    pub fn new(db: Arc<ChainDb>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<ChainDb> {
        &self.db
    }

    pub fn header_by_number(&self, number: u64) -> Result<Option<Header>, BackendError> {
        Ok(self.db.header_by_number(number)?)
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>, BackendError> {
        Ok(self.db.header_by_hash(hash)?)
    }

    pub fn receipts(&self, header: &Header) -> Result<Vec<Receipt>, BackendError> {
        if header.receipts_root == EMPTY_ROOT {
            return Ok(Vec::new());
        }
        self.db.receipts(&header.hash())?.ok_or(BackendError::NotFound("receipts"))
    }

    pub fn account(&self, header: &Header, address: &Address) -> Result<Option<Account>, BackendError> {
        let state = self.db.trie(&header.state_root)?.ok_or(BackendError::NotFound("state trie"))?;
        match state.get(&crypto::account_key(address)) {
            Some(raw) => Ok(Some(decode_account(raw)?)),
            None => Ok(None),
        }
    }

    pub fn code(&self, code_hash: &Hash) -> Result<Bytes, BackendError> {
        let code = self.db.code(code_hash)?.ok_or(BackendError::NotFound("code"))?;
        Ok(Bytes::from(code))
    }

    /// Answer a light-protocol request. `None` when any requested item is
    /// missing locally.
    pub fn serve(&self, request: &Request) -> Option<Response> {
        match self.try_serve(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(kind = %request.kind(), error = %e, "serving request failed");
                None
            }
        }
    }

    fn try_serve(&self, request: &Request) -> Result<Option<Response>> {
        let response = match request {
            Request::BlockHeaders(q) => {
                let start = match q.origin {
                    HashOrNumber::Number(n) => n,
                    HashOrNumber::Hash(h) => match self.db.header_by_hash(&h)? {
                        Some(header) => header.number,
                        None => return Ok(None),
                    },
                };
                let step = q.skip.saturating_add(1);
                let mut headers = Vec::new();
                let mut number = Some(start);
                while let Some(n) = number {
                    if headers.len() as u64 >= q.amount.min(MAX_HEADERS_SERVED) {
                        break;
                    }
                    let Some(header) = self.db.header_by_number(n)? else { break };
                    headers.push(header);
                    number = if q.reverse { n.checked_sub(step) } else { n.checked_add(step) };
                }
                Response::BlockHeaders(headers)
            }
            Request::BlockBodies(hashes) => {
                let mut bodies = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    let Some(body) = self.db.body(hash)? else { return Ok(None) };
                    bodies.push(body);
                }
                Response::BlockBodies(bodies)
            }
            Request::Receipts(hashes) => {
                let mut lists = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    let Some(receipts) = self.db.receipts(hash)? else { return Ok(None) };
                    lists.push(receipts);
                }
                Response::Receipts(lists)
            }
            Request::Proofs(queries) => {
                let mut proofs = Vec::with_capacity(queries.len());
                for q in queries {
                    let Some(trie) = self.proof_trie(q)? else { return Ok(None) };
                    proofs.push(trie.prove(&q.key));
                }
                Response::Proofs(proofs)
            }
            Request::Code(queries) => {
                let mut blobs = Vec::with_capacity(queries.len());
                for q in queries {
                    let Some(code) = self.db.code(&q.code_hash)? else { return Ok(None) };
                    blobs.push(Bytes::from(code));
                }
                Response::Code(blobs)
            }
            Request::HeaderProofs(queries) => {
                let mut items = Vec::with_capacity(queries.len());
                for q in queries {
                    let Some(trie) = self.helper_trie(HelperTrie::Cht, q.section)? else { return Ok(None) };
                    let Some(header) = self.db.header_by_number(q.number)? else { return Ok(None) };
                    items.push(HeaderProof { header, proof: trie.prove(&types::cht_key(q.number)) });
                }
                Response::HeaderProofs(items)
            }
            Request::HelperTrieProofs(queries) => {
                let mut items = Vec::with_capacity(queries.len());
                for HelperTrieQuery { trie, section, key } in queries {
                    let Some(helper) = self.helper_trie(*trie, *section)? else { return Ok(None) };
                    let value = helper.get(key).map(Bytes::copy_from_slice).unwrap_or_default();
                    items.push(HelperTrieProof { value, proof: helper.prove(key) });
                }
                Response::HelperTrieProofs(items)
            }
        };
        Ok(Some(response))
    }

    fn proof_trie(&self, q: &ProofQuery) -> Result<Option<KeyedTrie>> {
        let Some(header) = self.db.header_by_hash(&q.block_hash)? else { return Ok(None) };
        let Some(state) = self.db.trie(&header.state_root)? else { return Ok(None) };
        if q.account_key.is_empty() {
            return Ok(Some(state));
        }
        let storage_root = match state.get(&q.account_key) {
            Some(raw) => decode_account(raw)?.storage_root,
            None => EMPTY_ROOT,
        };
        self.db.trie(&storage_root)
    }

    fn helper_trie(&self, kind: HelperTrie, section: u64) -> Result<Option<KeyedTrie>> {
        let root = match kind {
            HelperTrie::Cht => self.db.cht_root(section).map(|r| r.root),
            HelperTrie::BloomTrie => self.db.bloom_trie_root(section).map(|r| r.root),
        };
        match root {
            Some(root) => self.db.trie(&root),
            None => Ok(None),
        }
    }
}

/// Holds headers locally and retrieves everything else on demand.
#[derive(Clone)]
pub struct LightBackend {
    db: Arc<ChainDb>,
    odr: Odr,
}

impl LightBackend {
    pub fn new(db: Arc<ChainDb>, odr: Odr) -> Self {
        Self { db, odr }
    }

    pub fn odr(&self) -> &Odr {
        &self.odr
    }

    /// Local canonical header, or a CHT-proven one when only the section
    /// root is known.
    pub async fn header_by_number(&self, number: u64, cancel: &CancellationToken) -> Result<Option<Header>, BackendError> {
        if let Some(header) = self.db.header_by_number(number)? {
            return Ok(Some(header));
        }
        let section = number / self.odr.cht_section_size();
        let Some(cht) = self.db.cht_root(section) else { return Ok(None) };
        let header = self.odr.get_header_by_number(cht, number, cancel).await?;
        self.db.put_header(&header)?;
        Ok(Some(header))
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>, BackendError> {
        Ok(self.db.header_by_hash(hash)?)
    }

    pub async fn receipts(&self, header: &Header, cancel: &CancellationToken) -> Result<Vec<Receipt>, BackendError> {
        Ok(self.odr.get_receipts(header, cancel).await?)
    }

    pub async fn account(&self, header: &Header, address: &Address, cancel: &CancellationToken) -> Result<Option<Account>, BackendError> {
        Ok(self.odr.get_account(header, address, cancel).await?)
    }

    pub async fn code(&self, header: &Header, code_hash: &Hash, cancel: &CancellationToken) -> Result<Bytes, BackendError> {
        Ok(self.odr.get_code(header, code_hash, cancel).await?)
    }
}

/// The backend selected at startup.
#[derive(Clone)]
pub enum Backend {
    Full(FullBackend),
    Light(LightBackend),
}

impl Backend {
    pub fn is_light(&self) -> bool {
        matches!(self, Backend::Light(_))
    }

    pub async fn header_by_number(&self, number: u64, cancel: &CancellationToken) -> Result<Option<Header>, BackendError> {
        match self {
            Backend::Full(b) => b.header_by_number(number),
            Backend::Light(b) => b.header_by_number(number, cancel).await,
        }
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<Header>, BackendError> {
        match self {
            Backend::Full(b) => b.header_by_hash(hash),
            Backend::Light(b) => b.header_by_hash(hash),
        }
    }

    pub async fn receipts(&self, header: &Header, cancel: &CancellationToken) -> Result<Vec<Receipt>, BackendError> {
        match self {
            Backend::Full(b) => b.receipts(header),
            Backend::Light(b) => b.receipts(header, cancel).await,
        }
    }

    pub async fn account(&self, header: &Header, address: &Address, cancel: &CancellationToken) -> Result<Option<Account>, BackendError> {
        match self {
            Backend::Full(b) => b.account(header, address),
            Backend::Light(b) => b.account(header, address, cancel).await,
        }
    }

    pub async fn code(&self, header: &Header, code_hash: &Hash, cancel: &CancellationToken) -> Result<Bytes, BackendError> {
        match self {
            Backend::Full(b) => b.code(code_hash),
            Backend::Light(b) => b.code(header, code_hash, cancel).await,
        }
    }
}
