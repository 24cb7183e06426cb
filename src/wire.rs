//! Light-protocol request and response messages.
//!
//! Every message is an RLP list `[code, payload]`. Responses use the
//! request code plus one.

use std::collections::BTreeMap;
use std::fmt;

use alloy_rlp::{BufMut, Bytes, Decodable, Encodable, Header as RlpHeader, RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::crypto::{self, Hash};
use crate::receipt::Receipt;
use crate::trie::KeyedProof;
use crate::types::{Body, Header};

/// Correlation handle of one wire request.
pub type ReqId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestKind {
    BlockHeaders,
    BlockBodies,
    Receipts,
    Proofs,
    Code,
    HeaderProofs,
    HelperTrieProofs,
}

impl RequestKind {
    pub const ALL: [RequestKind; 7] = [
        RequestKind::BlockHeaders,
        RequestKind::BlockBodies,
        RequestKind::Receipts,
        RequestKind::Proofs,
        RequestKind::Code,
        RequestKind::HeaderProofs,
        RequestKind::HelperTrieProofs,
    ];

    pub fn request_code(self) -> u8 {
        match self {
            RequestKind::BlockHeaders => 0x02,
            RequestKind::BlockBodies => 0x04,
            RequestKind::Receipts => 0x06,
            RequestKind::Code => 0x0a,
            RequestKind::HeaderProofs => 0x0d,
            RequestKind::Proofs => 0x0f,
            RequestKind::HelperTrieProofs => 0x11,
        }
    }

    pub fn response_code(self) -> u8 {
        self.request_code() + 1
    }

    fn from_request_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.request_code() == code)
    }

    fn from_response_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.response_code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::BlockHeaders => "headers",
            RequestKind::BlockBodies => "bodies",
            RequestKind::Receipts => "receipts",
            RequestKind::Proofs => "proofs",
            RequestKind::Code => "code",
            RequestKind::HeaderProofs => "header_proofs",
            RequestKind::HelperTrieProofs => "helper_trie_proofs",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a header range: a 32-byte hash or a block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(Hash),
    Number(u64),
}

impl Encodable for HashOrNumber {
    fn encode(&self, out: &mut dyn BufMut) {
        match self {
            HashOrNumber::Hash(h) => h.encode(out),
            HashOrNumber::Number(n) => n.encode(out),
        }
    }

    fn length(&self) -> usize {
        match self {
            HashOrNumber::Hash(h) => h.length(),
            HashOrNumber::Number(n) => n.length(),
        }
    }
}

impl Decodable for HashOrNumber {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let mut peek = *buf;
        let header = RlpHeader::decode(&mut peek)?;
        if !header.list && header.payload_length == 32 {
            return Ok(HashOrNumber::Hash(<[u8; 32]>::decode(buf)?));
        }
        Ok(HashOrNumber::Number(u64::decode(buf)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HeadersQuery {
    pub origin: HashOrNumber,
    pub amount: u64,
    pub skip: u64,
    pub reverse: bool,
}

/// Proof of `key` in the state trie (empty `account_key`) or in the storage
/// trie of the account at `account_key`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ProofQuery {
    pub block_hash: Hash,
    pub account_key: Bytes,
    pub key: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct CodeQuery {
    pub block_hash: Hash,
    pub code_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HeaderProofQuery {
    pub section: u64,
    pub number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperTrie {
    Cht,
    BloomTrie,
}

impl HelperTrie {
    pub fn as_str(self) -> &'static str {
        match self {
            HelperTrie::Cht => "cht",
            HelperTrie::BloomTrie => "bloom trie",
        }
    }
}

impl Encodable for HelperTrie {
    fn encode(&self, out: &mut dyn BufMut) {
        (*self as u8).encode(out)
    }

    fn length(&self) -> usize {
        (*self as u8).length()
    }
}

impl Decodable for HelperTrie {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        match u8::decode(buf)? {
            0 => Ok(HelperTrie::Cht),
            1 => Ok(HelperTrie::BloomTrie),
            _ => Err(alloy_rlp::Error::Custom("unknown helper trie")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HelperTrieQuery {
    pub trie: HelperTrie,
    pub section: u64,
    pub key: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HeaderProof {
    pub header: Header,
    pub proof: KeyedProof,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct HelperTrieProof {
    pub value: Bytes,
    pub proof: KeyedProof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    BlockHeaders(HeadersQuery),
    BlockBodies(Vec<Hash>),
    Receipts(Vec<Hash>),
    Proofs(Vec<ProofQuery>),
    Code(Vec<CodeQuery>),
    HeaderProofs(Vec<HeaderProofQuery>),
    HelperTrieProofs(Vec<HelperTrieQuery>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    BlockHeaders(Vec<Header>),
    BlockBodies(Vec<Body>),
    Receipts(Vec<Vec<Receipt>>),
    Proofs(Vec<KeyedProof>),
    Code(Vec<Bytes>),
    HeaderProofs(Vec<HeaderProof>),
    HelperTrieProofs(Vec<HelperTrieProof>),
}

/// Deduplication key: identical requests share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub kind: RequestKind,
    pub digest: Hash,
}

impl RequestKey {
    /// Bind the key to trusted roots that are checked locally but never
    /// sent, so requests checked against different roots stay apart.
    pub fn anchored(self, roots: &[Hash]) -> Self {
        if roots.is_empty() {
            return self;
        }
        let mut data = Vec::with_capacity(32 * (roots.len() + 1));
        data.extend_from_slice(&self.digest);
        for root in roots {
            data.extend_from_slice(root);
        }
        RequestKey { kind: self.kind, digest: crypto::blake3_hash(&data) }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, hex::encode(&self.digest[..8]))
    }
}

fn message_length<T: Encodable>(code: u8, payload: &T) -> usize {
    code.length() + payload.length()
}

fn encode_message<T: Encodable>(code: u8, payload: &T, out: &mut dyn BufMut) {
    RlpHeader { list: true, payload_length: message_length(code, payload) }.encode(out);
    code.encode(out);
    payload.encode(out);
}

/// Reads the list header and code, returning the code and the payload slice.
fn decode_envelope<'a>(buf: &mut &'a [u8]) -> alloy_rlp::Result<(u8, &'a [u8])> {
    let header = RlpHeader::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if buf.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let (body, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    let mut body = body;
    let code = u8::decode(&mut body)?;
    Ok((code, body))
}

fn decode_payload<T: Decodable>(mut body: &[u8]) -> alloy_rlp::Result<T> {
    let value = T::decode(&mut body)?;
    if !body.is_empty() {
        return Err(alloy_rlp::Error::Custom("trailing bytes in message"));
    }
    Ok(value)
}

fn decode_exact<T: Decodable>(data: &[u8]) -> alloy_rlp::Result<T> {
    let mut buf = data;
    let value = T::decode(&mut buf)?;
    if !buf.is_empty() {
        return Err(alloy_rlp::Error::Custom("trailing bytes after message"));
    }
    Ok(value)
}

macro_rules! dispatch {
    ($value:expr, $enum:ident, |$code:ident, $payload:ident| $body:expr) => {
        match $value {
            $enum::BlockHeaders($payload) => { let $code = RequestKind::BlockHeaders; $body }
            $enum::BlockBodies($payload) => { let $code = RequestKind::BlockBodies; $body }
            $enum::Receipts($payload) => { let $code = RequestKind::Receipts; $body }
            $enum::Proofs($payload) => { let $code = RequestKind::Proofs; $body }
            $enum::Code($payload) => { let $code = RequestKind::Code; $body }
            $enum::HeaderProofs($payload) => { let $code = RequestKind::HeaderProofs; $body }
            $enum::HelperTrieProofs($payload) => { let $code = RequestKind::HelperTrieProofs; $body }
        }
    };
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        dispatch!(self, Request, |kind, _p| kind)
    }

    /// Number of items asked for, used for flow-control cost.
    pub fn items(&self) -> usize {
        match self {
            Request::BlockHeaders(q) => q.amount as usize,
            Request::BlockBodies(v) | Request::Receipts(v) => v.len(),
            Request::Proofs(v) => v.len(),
            Request::Code(v) => v.len(),
            Request::HeaderProofs(v) => v.len(),
            Request::HelperTrieProofs(v) => v.len(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey { kind: self.kind(), digest: crypto::blake3_hash(&alloy_rlp::encode(self)) }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    pub fn from_bytes(data: &[u8]) -> alloy_rlp::Result<Self> {
        decode_exact(data)
    }
}

impl Encodable for Request {
    fn encode(&self, out: &mut dyn BufMut) {
        dispatch!(self, Request, |kind, p| encode_message(kind.request_code(), p, out))
    }

    fn length(&self) -> usize {
        let payload = dispatch!(self, Request, |kind, p| message_length(kind.request_code(), p));
        payload + alloy_rlp::length_of_length(payload)
    }
}

impl Decodable for Request {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let (code, body) = decode_envelope(buf)?;
        let kind = RequestKind::from_request_code(code).ok_or(alloy_rlp::Error::Custom("unknown request code"))?;
        Ok(match kind {
            RequestKind::BlockHeaders => Request::BlockHeaders(decode_payload(body)?),
            RequestKind::BlockBodies => Request::BlockBodies(decode_payload(body)?),
            RequestKind::Receipts => Request::Receipts(decode_payload(body)?),
            RequestKind::Proofs => Request::Proofs(decode_payload(body)?),
            RequestKind::Code => Request::Code(decode_payload(body)?),
            RequestKind::HeaderProofs => Request::HeaderProofs(decode_payload(body)?),
            RequestKind::HelperTrieProofs => Request::HelperTrieProofs(decode_payload(body)?),
        })
    }
}

impl Response {
    pub fn kind(&self) -> RequestKind {
        dispatch!(self, Response, |kind, _p| kind)
    }

    pub fn items(&self) -> usize {
        dispatch!(self, Response, |_kind, p| p.len())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        alloy_rlp::encode(self)
    }

    pub fn from_bytes(data: &[u8]) -> alloy_rlp::Result<Self> {
        decode_exact(data)
    }
}

impl Encodable for Response {
    fn encode(&self, out: &mut dyn BufMut) {
        dispatch!(self, Response, |kind, p| encode_message(kind.response_code(), p, out))
    }

    fn length(&self) -> usize {
        let payload = dispatch!(self, Response, |kind, p| message_length(kind.response_code(), p));
        payload + alloy_rlp::length_of_length(payload)
    }
}

impl Decodable for Response {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let (code, body) = decode_envelope(buf)?;
        let kind = RequestKind::from_response_code(code).ok_or(alloy_rlp::Error::Custom("unknown response code"))?;
        Ok(match kind {
            RequestKind::BlockHeaders => Response::BlockHeaders(decode_payload(body)?),
            RequestKind::BlockBodies => Response::BlockBodies(decode_payload(body)?),
            RequestKind::Receipts => Response::Receipts(decode_payload(body)?),
            RequestKind::Proofs => Response::Proofs(decode_payload(body)?),
            RequestKind::Code => Response::Code(decode_payload(body)?),
            RequestKind::HeaderProofs => Response::HeaderProofs(decode_payload(body)?),
            RequestKind::HelperTrieProofs => Response::HelperTrieProofs(decode_payload(body)?),
        })
    }
}

/// Flow-control cost of one request kind: `base + per_item * items`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub base: u64,
    pub per_item: u64,
}

/// Costs advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTable(BTreeMap<RequestKind, Cost>);

impl Default for CostTable {
    fn default() -> Self {
        let table = [
            (RequestKind::BlockHeaders, Cost { base: 20, per_item: 5 }),
            (RequestKind::BlockBodies, Cost { base: 0, per_item: 40 }),
            (RequestKind::Receipts, Cost { base: 0, per_item: 50 }),
            (RequestKind::Proofs, Cost { base: 0, per_item: 60 }),
            (RequestKind::Code, Cost { base: 0, per_item: 30 }),
            (RequestKind::HeaderProofs, Cost { base: 0, per_item: 50 }),
            (RequestKind::HelperTrieProofs, Cost { base: 0, per_item: 50 }),
        ];
        CostTable(table.into_iter().collect())
    }
}

impl CostTable {
    pub fn with(mut self, kind: RequestKind, cost: Cost) -> Self {
        self.0.insert(kind, cost);
        self
    }

    pub fn get(&self, kind: RequestKind) -> Cost {
        self.0.get(&kind).copied().unwrap_or(Cost { base: 0, per_item: 0 })
    }

    pub fn request_cost(&self, request: &Request) -> u64 {
        let cost = self.get(request.kind());
        cost.base.saturating_add(cost.per_item.saturating_mul(request.items() as u64))
    }
}
