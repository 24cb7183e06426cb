//! On-demand retrieval.
//!
//! Each data kind is an [`OdrRequest`]: it knows how to phrase itself on the
//! wire and how to check an answer against the trusted root it was built
//! with. The same check runs twice, once per attempt inside the retrieval
//! loop (so a bad answer is retried on another peer) and once more on the
//! final answer before anything is handed back to the caller.

use std::ops::RangeInclusive;
use std::sync::Arc;

use alloy_rlp::{Bytes, Decodable};
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::crypto::{self, Address, Hash};
use crate::error::{OdrError, RetrieveError, ValidationError};
use crate::metrics;
use crate::receipt::{self, Receipt};
use crate::retrieve::{RetrievalManager, Validator};
use crate::types::{self, Account, BloomTrieRoot, Body, ChtRoot, Header, EMPTY_ROOT};
use crate::wire::{
    CodeQuery, HeaderProofQuery, HelperTrie, HelperTrieQuery, ProofQuery, Request, RequestKey, RequestKind,
    Response,
};

/// Source of trusted helper-trie roots, fed by the local header chain.
pub trait TrustedRoots: Send + Sync {
    fn cht_root(&self, section: u64) -> Option<ChtRoot>;
    fn bloom_trie_root(&self, section: u64) -> Option<BloomTrieRoot>;
}

/// A verifiable request for one kind of remote data.
pub trait OdrRequest: Clone + Send + Sync + 'static {
    type Output: Send;

    fn name(&self) -> &'static str;

    fn to_wire(&self) -> Request;

    /// Session key. Kinds whose trusted root is not implied by the wire
    /// request mix it in, so callers holding different roots never share a
    /// session.
    fn key(&self) -> RequestKey {
        self.to_wire().key()
    }

    /// Check `response` against the trusted root and extract the result.
    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError>;
}

/// How a client-visible ODR call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdrOutcome {
    Verified,
    VerificationFailed,
    Exhausted,
    Cancelled,
}

impl OdrOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            OdrOutcome::Verified => "verified",
            OdrOutcome::VerificationFailed => "verification_failed",
            OdrOutcome::Exhausted => "exhausted",
            OdrOutcome::Cancelled => "cancelled",
        }
    }

    fn of<T>(result: &Result<T, OdrError>) -> Self {
        match result {
            Ok(_) => OdrOutcome::Verified,
            Err(OdrError::VerificationFailed(_)) => OdrOutcome::VerificationFailed,
            Err(OdrError::Retrieve(RetrieveError::Cancelled | RetrieveError::Shutdown)) => OdrOutcome::Cancelled,
            Err(_) => OdrOutcome::Exhausted,
        }
    }
}

fn unexpected(expected: RequestKind, response: &Response) -> ValidationError {
    ValidationError::UnexpectedResponse { expected, got: response.kind() }
}

fn expect_items(expected: usize, got: usize) -> Result<(), ValidationError> {
    if expected != got {
        return Err(ValidationError::CountMismatch { expected, got });
    }
    Ok(())
}

/// Receipts of one block, checked against its receipts root.
#[derive(Debug, Clone)]
pub struct ReceiptsRequest {
    pub header: Header,
}

impl OdrRequest for ReceiptsRequest {
    type Output = Vec<Receipt>;

    fn name(&self) -> &'static str {
        "receipts"
    }

    fn to_wire(&self) -> Request {
        Request::Receipts(vec![self.header.hash()])
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::Receipts(lists) = response else {
            return Err(unexpected(RequestKind::Receipts, response));
        };
        expect_items(1, lists.len())?;
        let computed = receipt::receipts_root(&lists[0]);
        if computed != self.header.receipts_root {
            return Err(ValidationError::RootMismatch { what: "receipts", expected: self.header.receipts_root, computed });
        }
        Ok(lists[0].clone())
    }
}

/// Bodies of a batch of blocks, each checked against its transaction root.
#[derive(Debug, Clone)]
pub struct BodiesRequest {
    pub headers: Vec<Header>,
}

impl OdrRequest for BodiesRequest {
    type Output = Vec<Body>;

    fn name(&self) -> &'static str {
        "bodies"
    }

    fn to_wire(&self) -> Request {
        Request::BlockBodies(self.headers.iter().map(Header::hash).collect())
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::BlockBodies(bodies) = response else {
            return Err(unexpected(RequestKind::BlockBodies, response));
        };
        expect_items(self.headers.len(), bodies.len())?;
        for (header, body) in self.headers.iter().zip(bodies) {
            let computed = body.tx_root();
            if computed != header.tx_root {
                return Err(ValidationError::RootMismatch { what: "transactions", expected: header.tx_root, computed });
            }
        }
        Ok(bodies.clone())
    }
}

/// Identifies a trie at a block: the state trie, or an account's storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieId {
    pub block_hash: Hash,
    pub root: Hash,
    /// Empty for the state trie.
    pub account_key: Bytes,
}

impl TrieId {
    pub fn state(header: &Header) -> Self {
        Self { block_hash: header.hash(), root: header.state_root, account_key: Bytes::new() }
    }

    pub fn storage(header: &Header, address: &Address, account: &Account) -> Self {
        Self {
            block_hash: header.hash(),
            root: account.storage_root,
            account_key: Bytes::copy_from_slice(&crypto::account_key(address)),
        }
    }
}

/// Values (or proven absence) of a set of keys in one trie.
#[derive(Debug, Clone)]
pub struct TrieRequest {
    pub id: TrieId,
    pub keys: Vec<Bytes>,
}

impl OdrRequest for TrieRequest {
    type Output = Vec<Option<Bytes>>;

    fn name(&self) -> &'static str {
        "trie"
    }

    fn to_wire(&self) -> Request {
        Request::Proofs(
            self.keys
                .iter()
                .map(|key| ProofQuery {
                    block_hash: self.id.block_hash,
                    account_key: self.id.account_key.clone(),
                    key: key.clone(),
                })
                .collect(),
        )
    }

    fn key(&self) -> RequestKey {
        self.to_wire().key().anchored(&[self.id.root])
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::Proofs(proofs) = response else {
            return Err(unexpected(RequestKind::Proofs, response));
        };
        expect_items(self.keys.len(), proofs.len())?;
        self.keys.iter().zip(proofs).map(|(key, proof)| proof.verify(&self.id.root, key)).collect()
    }
}

/// Contract code by hash.
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub block_hash: Hash,
    pub code_hash: Hash,
}

impl OdrRequest for CodeRequest {
    type Output = Bytes;

    fn name(&self) -> &'static str {
        "code"
    }

    fn to_wire(&self) -> Request {
        Request::Code(vec![CodeQuery { block_hash: self.block_hash, code_hash: self.code_hash }])
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::Code(blobs) = response else {
            return Err(unexpected(RequestKind::Code, response));
        };
        expect_items(1, blobs.len())?;
        if crypto::code_hash(&blobs[0]) != self.code_hash {
            return Err(ValidationError::HashMismatch { what: "code" });
        }
        Ok(blobs[0].clone())
    }
}

/// A canonical header proven through the CHT.
#[derive(Debug, Clone)]
pub struct HeaderByNumberRequest {
    pub cht: ChtRoot,
    pub number: u64,
}

impl OdrRequest for HeaderByNumberRequest {
    type Output = Header;

    fn name(&self) -> &'static str {
        "header_proof"
    }

    fn to_wire(&self) -> Request {
        Request::HeaderProofs(vec![HeaderProofQuery { section: self.cht.section, number: self.number }])
    }

    fn key(&self) -> RequestKey {
        self.to_wire().key().anchored(&[self.cht.root])
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::HeaderProofs(items) = response else {
            return Err(unexpected(RequestKind::HeaderProofs, response));
        };
        expect_items(1, items.len())?;
        let item = &items[0];
        let hash = item
            .proof
            .verify(&self.cht.root, &types::cht_key(self.number))?
            .ok_or(ValidationError::BadProof("block number not in CHT"))?;
        if item.header.number != self.number || hash.as_ref() != item.header.hash() {
            return Err(ValidationError::HashMismatch { what: "header" });
        }
        Ok(item.header.clone())
    }
}

/// The canonical hash of a block number, straight from the CHT.
#[derive(Debug, Clone)]
pub struct ChtEntryRequest {
    pub cht: ChtRoot,
    pub number: u64,
}

impl OdrRequest for ChtEntryRequest {
    type Output = Hash;

    fn name(&self) -> &'static str {
        "cht"
    }

    fn to_wire(&self) -> Request {
        Request::HelperTrieProofs(vec![HelperTrieQuery {
            trie: HelperTrie::Cht,
            section: self.cht.section,
            key: Bytes::copy_from_slice(&types::cht_key(self.number)),
        }])
    }

    fn key(&self) -> RequestKey {
        self.to_wire().key().anchored(&[self.cht.root])
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::HelperTrieProofs(items) = response else {
            return Err(unexpected(RequestKind::HelperTrieProofs, response));
        };
        expect_items(1, items.len())?;
        let value = items[0]
            .proof
            .verify(&self.cht.root, &types::cht_key(self.number))?
            .ok_or(ValidationError::BadProof("block number not in CHT"))?;
        if value != items[0].value {
            return Err(ValidationError::BadProof("value differs from proven value"));
        }
        value.as_ref().try_into().map_err(|_| ValidationError::Decode("CHT value is not a hash".into()))
    }
}

/// One bloom bit vector per section, proven through the bloom trie.
#[derive(Debug, Clone)]
pub struct BloomBitsRequest {
    pub bit: u16,
    pub roots: Vec<BloomTrieRoot>,
}

impl OdrRequest for BloomBitsRequest {
    type Output = Vec<Bytes>;

    fn name(&self) -> &'static str {
        "bloom_bits"
    }

    fn to_wire(&self) -> Request {
        Request::HelperTrieProofs(
            self.roots
                .iter()
                .map(|r| HelperTrieQuery {
                    trie: HelperTrie::BloomTrie,
                    section: r.section,
                    key: Bytes::copy_from_slice(&types::bloom_trie_key(self.bit, r.section)),
                })
                .collect(),
        )
    }

    fn key(&self) -> RequestKey {
        let roots: Vec<Hash> = self.roots.iter().map(|r| r.root).collect();
        self.to_wire().key().anchored(&roots)
    }

    fn verify(&self, response: &Response) -> Result<Self::Output, ValidationError> {
        let Response::HelperTrieProofs(items) = response else {
            return Err(unexpected(RequestKind::HelperTrieProofs, response));
        };
        expect_items(self.roots.len(), items.len())?;
        self.roots
            .iter()
            .zip(items)
            .map(|(root, item)| {
                let key = types::bloom_trie_key(self.bit, root.section);
                let value = item
                    .proof
                    .verify(&root.root, &key)?
                    .ok_or(ValidationError::BadProof("bloom bits not in trie"))?;
                if value != item.value {
                    return Err(ValidationError::BadProof("value differs from proven value"));
                }
                Ok(value)
            })
            .collect()
    }
}

/// Client-facing retrieval API. Every returned value has been verified
/// against the trusted header or root passed in.
#[derive(Clone)]
pub struct Odr {
    retrieval: RetrievalManager,
    cht_section_size: u64,
    bloom_section_size: u64,
}

impl Odr {
    pub fn new(retrieval: RetrievalManager, cfg: &config::Odr) -> Self {
        Self { retrieval, cht_section_size: cfg.cht_section_size, bloom_section_size: cfg.bloom_section_size }
    }

    pub fn retrieval(&self) -> &RetrievalManager {
        &self.retrieval
    }

    pub fn cht_section_size(&self) -> u64 {
        self.cht_section_size
    }

    /// Bloom-trie sections covering blocks `first..=last`.
    pub fn bloom_sections(&self, first: u64, last: u64) -> Result<RangeInclusive<u64>, OdrError> {
        if first > last {
            return Err(OdrError::InvalidRequest("empty block range"));
        }
        Ok(first / self.bloom_section_size..=last / self.bloom_section_size)
    }

    /// Run `request` through the retrieval loop and re-verify the answer.
    pub async fn retrieve<R: OdrRequest>(&self, request: R, cancel: &CancellationToken) -> Result<R::Output, OdrError> {
        let name = request.name();
        metrics::ODR_REQUESTS.with_label_values(&[name]).inc();

        let checker = request.clone();
        let validator: Validator = Arc::new(move |_wire: &Request, response: &Response| checker.verify(response).map(|_| ()));

        let result = match self.retrieval.retrieve_keyed(request.key(), request.to_wire(), validator, cancel).await {
            Ok(response) => request.verify(&response).map_err(OdrError::VerificationFailed),
            Err(e) => Err(OdrError::from(e)),
        };

        let outcome = OdrOutcome::of(&result);
        metrics::ODR_OUTCOMES.with_label_values(&[outcome.as_str()]).inc();
        match &result {
            Err(OdrError::VerificationFailed(e)) => tracing::warn!(request = name, error = %e, "❌ Final verification failed"),
            Err(e) => tracing::debug!(request = name, outcome = outcome.as_str(), error = %e, "odr call failed"),
            Ok(_) => tracing::trace!(request = name, "odr call verified"),
        }
        result
    }

    /// Canonical header `number`, proven against the CHT section that holds it.
    pub async fn get_header_by_number(&self, cht: ChtRoot, number: u64, cancel: &CancellationToken) -> Result<Header, OdrError> {
        self.check_cht_section(&cht, number)?;
        self.retrieve(HeaderByNumberRequest { cht, number }, cancel).await
    }

    /// Canonical block hash of `number` from the CHT.
    pub async fn get_cht_entry(&self, cht: ChtRoot, number: u64, cancel: &CancellationToken) -> Result<Hash, OdrError> {
        self.check_cht_section(&cht, number)?;
        self.retrieve(ChtEntryRequest { cht, number }, cancel).await
    }

    fn check_cht_section(&self, cht: &ChtRoot, number: u64) -> Result<(), OdrError> {
        if number / self.cht_section_size != cht.section {
            return Err(OdrError::InvalidRequest("block number outside the CHT section"));
        }
        Ok(())
    }

    pub async fn get_bodies(&self, headers: &[Header], cancel: &CancellationToken) -> Result<Vec<Body>, OdrError> {
        if headers.iter().all(|h| h.tx_root == EMPTY_ROOT) {
            return Ok(vec![Body::default(); headers.len()]);
        }
        self.retrieve(BodiesRequest { headers: headers.to_vec() }, cancel).await
    }

    pub async fn get_receipts(&self, header: &Header, cancel: &CancellationToken) -> Result<Vec<Receipt>, OdrError> {
        if header.receipts_root == EMPTY_ROOT {
            return Ok(Vec::new());
        }
        self.retrieve(ReceiptsRequest { header: header.clone() }, cancel).await
    }

    pub async fn get_trie_entries(
        &self,
        id: TrieId,
        keys: &[Bytes],
        cancel: &CancellationToken,
    ) -> Result<Vec<Option<Bytes>>, OdrError> {
        if keys.is_empty() {
            return Err(OdrError::InvalidRequest("no trie keys"));
        }
        if id.root == EMPTY_ROOT {
            return Ok(vec![None; keys.len()]);
        }
        self.retrieve(TrieRequest { id, keys: keys.to_vec() }, cancel).await
    }

    pub async fn get_trie_entry(&self, id: TrieId, key: &[u8], cancel: &CancellationToken) -> Result<Option<Bytes>, OdrError> {
        let mut values = self.get_trie_entries(id, &[Bytes::copy_from_slice(key)], cancel).await?;
        Ok(values.pop().flatten())
    }

    /// Account at `address` in the state of `header`; `None` if proven absent.
    pub async fn get_account(&self, header: &Header, address: &Address, cancel: &CancellationToken) -> Result<Option<Account>, OdrError> {
        let raw = self.get_trie_entry(TrieId::state(header), &crypto::account_key(address), cancel).await?;
        raw.map(|bytes| {
            Account::decode(&mut bytes.as_ref()).map_err(|e| OdrError::VerificationFailed(ValidationError::Decode(e.to_string())))
        })
        .transpose()
    }

    /// Storage slot of an account; `None` for missing accounts and slots.
    pub async fn get_storage(
        &self,
        header: &Header,
        address: &Address,
        slot: &Hash,
        cancel: &CancellationToken,
    ) -> Result<Option<Bytes>, OdrError> {
        let Some(account) = self.get_account(header, address, cancel).await? else {
            return Ok(None);
        };
        self.get_trie_entry(TrieId::storage(header, address, &account), &crypto::storage_key(slot), cancel).await
    }

    pub async fn get_code(&self, header: &Header, code_hash: &Hash, cancel: &CancellationToken) -> Result<Bytes, OdrError> {
        if *code_hash == crypto::empty_code_hash() {
            return Ok(Bytes::new());
        }
        self.retrieve(CodeRequest { block_hash: header.hash(), code_hash: *code_hash }, cancel).await
    }

    /// Bloom bit vectors of `bit` for the sections of `roots`, in order.
    pub async fn get_bloom_bits(&self, bit: u16, roots: &[BloomTrieRoot], cancel: &CancellationToken) -> Result<Vec<Bytes>, OdrError> {
        if roots.is_empty() {
            return Ok(Vec::new());
        }
        self.retrieve(BloomBitsRequest { bit, roots: roots.to_vec() }, cancel).await
    }
}
