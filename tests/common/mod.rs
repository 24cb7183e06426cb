// Shared fixtures: a small chain served by FullBackend and a simulated
// network of light servers with scripted behaviour.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_rlp::Bytes;
use libp2p::{identity, PeerId};
use once_cell::sync::OnceCell;
use tempfile::TempDir;
use unchained_light::backend::{ChainDb, FullBackend};
use unchained_light::config;
use unchained_light::crypto::{self, Address, Hash};
use unchained_light::distributor::Distributor;
use unchained_light::error::SendError;
use unchained_light::odr::Odr;
use unchained_light::peers::{PeerCapabilities, PeerSet};
use unchained_light::receipt::{self, Log, Receipt};
use unchained_light::retrieve::{RequestSender, RetrievalManager, RetrieveConfig};
use unchained_light::serverpool::ServerPool;
use unchained_light::storage::Store;
use unchained_light::trie::KeyedTrie;
use unchained_light::types::{Account, BloomTrieRoot, Body, ChtRoot, Header, EMPTY_ROOT};
use unchained_light::wire::{ReqId, Request, Response};

pub const SECTION: u64 = 4;
pub const BLOCKS: u64 = 8;
pub const BLOOM_BITS: u16 = 4;

/// Deterministic peer identity.
pub fn peer_id(n: u8) -> PeerId {
    let mut seed = [n; 32];
    identity::Keypair::ed25519_from_bytes(&mut seed)
        .expect("valid ed25519 seed")
        .public()
        .to_peer_id()
}

pub fn odr_config() -> config::Odr {
    config::Odr {
        max_attempts: 3,
        attempt_timeout_ms: 300,
        request_timeout_ms: 5_000,
        bloom_workers: 2,
        bloom_batch: 2,
        cht_section_size: SECTION,
        bloom_section_size: SECTION,
    }
}

pub fn pool_config() -> config::Pool {
    config::Pool { seed: Some(7), ..config::Pool::default() }
}

pub struct Fixture {
    pub dir: TempDir,
    pub db: Arc<ChainDb>,
    pub full: FullBackend,
    pub headers: Vec<Header>,
    pub bodies: Vec<Body>,
    pub receipts: Vec<Vec<Receipt>>,
    pub rich: Address,
    pub plain: Address,
    pub missing: Address,
    pub rich_account: Account,
    pub plain_account: Account,
    pub code: Vec<u8>,
    pub slot: Hash,
    pub slot_value: Vec<u8>,
    pub cht: Vec<ChtRoot>,
    pub bloom: Vec<BloomTrieRoot>,
}

pub fn bloom_vector(bit: u16, section: u64) -> Vec<u8> {
    vec![(bit as u8).wrapping_mul(31) ^ section as u8; 8]
}

pub fn open_store(dir: &TempDir, name: &str) -> Arc<Store> {
    let path = dir.path().join(name);
    Arc::new(Store::open(path.to_str().expect("utf8 path")).expect("open store"))
}

pub fn fixture() -> Fixture {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let db = Arc::new(ChainDb::new(open_store(&dir, "full"), SECTION));

    let rich: Address = [0x11; 20];
    let plain: Address = [0x22; 20];
    let missing: Address = [0x33; 20];

    let code = b"\x60\x80\x60\x40\x52 light contract".to_vec();
    let code_hash = db.put_code(&code).expect("put code");

    let slot = [0x05u8; 32];
    let slot_value = b"stored value".to_vec();
    let storage = KeyedTrie::new(vec![
        (crypto::storage_key(&slot).to_vec(), slot_value.clone()),
        (crypto::storage_key(&[0x06u8; 32]).to_vec(), b"other".to_vec()),
        (crypto::storage_key(&[0x07u8; 32]).to_vec(), b"third".to_vec()),
    ]);
    let storage_root = db.put_trie(&storage).expect("put storage trie");

    let rich_account = Account { nonce: 7, balance: 1_000_000, storage_root, code_hash };
    let plain_account = Account { nonce: 1, balance: 42, storage_root: EMPTY_ROOT, code_hash: crypto::empty_code_hash() };
    let mut accounts = vec![
        (crypto::account_key(&rich).to_vec(), alloy_rlp::encode(&rich_account)),
        (crypto::account_key(&plain).to_vec(), alloy_rlp::encode(&plain_account)),
    ];
    for i in 0..5u8 {
        let filler = Account { nonce: i as u64, balance: i as u128, storage_root: EMPTY_ROOT, code_hash: crypto::empty_code_hash() };
        accounts.push((crypto::account_key(&[0x40 + i; 20]).to_vec(), alloy_rlp::encode(&filler)));
    }
    let state_root = db.put_trie(&KeyedTrie::new(accounts)).expect("put state trie");

    let mut headers = Vec::new();
    let mut bodies = Vec::new();
    let mut all_receipts = Vec::new();
    let mut parent = [0u8; 32];
    for number in 0..BLOCKS {
        let body = Body {
            transactions: vec![
                Bytes::from(format!("tx-{number}-a").into_bytes()),
                Bytes::from(format!("tx-{number}-b").into_bytes()),
            ],
        };
        let mut ok = Receipt::new(&[], false, 21_000 + number);
        ok.logs.push(Log { address: rich, topics: vec![[number as u8; 32]], data: Bytes::from_static(b"transfer") });
        let receipts = vec![ok, Receipt::new(&[], true, 42_000 + number), Receipt::new(&[0xabu8; 32], true, 63_000)];
        let header = Header {
            parent_hash: parent,
            number,
            timestamp: 1_700_000_000 + number * 12,
            state_root,
            tx_root: body.tx_root(),
            receipts_root: receipt::receipts_root(&receipts),
        };
        let hash = db.put_header(&header).expect("put header");
        db.put_body(&hash, &body).expect("put body");
        db.put_receipts(&hash, &receipts).expect("put receipts");
        parent = hash;
        headers.push(header);
        bodies.push(body);
        all_receipts.push(receipts);
    }

    let cht = (0..BLOCKS / SECTION).map(|s| db.build_cht(s).expect("build cht")).collect();
    let bloom = (0..BLOCKS / SECTION)
        .map(|s| {
            let vectors: Vec<(u16, Vec<u8>)> = (0..BLOOM_BITS).map(|bit| (bit, bloom_vector(bit, s))).collect();
            db.build_bloom_trie(s, &vectors).expect("build bloom trie")
        })
        .collect();

    Fixture {
        dir,
        full: FullBackend::new(db.clone()),
        db,
        headers,
        bodies,
        receipts: all_receipts,
        rich,
        plain,
        missing,
        rich_account,
        plain_account,
        code,
        slot,
        slot_value,
        cht,
        bloom,
    }
}

/// How a simulated light server treats requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Honest,
    /// Accepts requests and never answers.
    Silent,
    /// Answers with one byte of the payload flipped.
    Corrupt,
    /// Answers with well-formed data that does not match the trusted root.
    WrongRoot,
    /// Answers honestly after a delay.
    Slow(Duration),
    /// The transport refuses to send.
    Unreachable,
}

struct NetInner {
    server: FullBackend,
    behaviours: Mutex<HashMap<PeerId, Behaviour>>,
    sent: Mutex<Vec<(PeerId, ReqId, Request)>>,
    target: OnceCell<RetrievalManager>,
    busy: AtomicUsize,
    max_busy: AtomicUsize,
}

#[derive(Clone)]
pub struct MockNet {
    inner: Arc<NetInner>,
}

impl MockNet {
    pub fn new(server: FullBackend) -> Self {
        Self {
            inner: Arc::new(NetInner {
                server,
                behaviours: Mutex::new(HashMap::new()),
                sent: Mutex::new(Vec::new()),
                target: OnceCell::new(),
                busy: AtomicUsize::new(0),
                max_busy: AtomicUsize::new(0),
            }),
        }
    }

    /// Where responses are delivered.
    pub fn connect(&self, manager: RetrievalManager) {
        let _ = self.inner.target.set(manager);
    }

    pub fn set_behaviour(&self, peer: PeerId, behaviour: Behaviour) {
        self.inner.behaviours.lock().unwrap().insert(peer, behaviour);
    }

    pub fn sent(&self) -> Vec<(PeerId, ReqId, Request)> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn total_sent(&self) -> usize {
        self.inner.sent.lock().unwrap().len()
    }

    pub fn sent_to(&self, peer: &PeerId) -> usize {
        self.inner.sent.lock().unwrap().iter().filter(|(p, _, _)| p == peer).count()
    }

    /// Most wire requests that were being answered at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_busy.load(Ordering::SeqCst)
    }
}

impl RequestSender for MockNet {
    fn send(&self, peer: &PeerId, req_id: ReqId, request: &Request) -> Result<(), SendError> {
        let behaviour = self.inner.behaviours.lock().unwrap().get(peer).copied().unwrap_or(Behaviour::Honest);
        if behaviour == Behaviour::Unreachable {
            return Err(SendError::Unreachable(*peer));
        }
        self.inner.sent.lock().unwrap().push((*peer, req_id, request.clone()));
        if behaviour == Behaviour::Silent {
            return Ok(());
        }

        let inner = self.inner.clone();
        let peer = *peer;
        let request = request.clone();
        tokio::spawn(async move {
            let busy = inner.busy.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_busy.fetch_max(busy, Ordering::SeqCst);
            let delay = match behaviour {
                Behaviour::Slow(d) => d,
                _ => Duration::from_millis(5),
            };
            tokio::time::sleep(delay).await;
            inner.busy.fetch_sub(1, Ordering::SeqCst);

            let Some(response) = inner.server.serve(&request) else { return };
            let response = match behaviour {
                Behaviour::Corrupt => corrupt(response),
                Behaviour::WrongRoot => wrong_root(response),
                _ => response,
            };
            if let Some(target) = inner.target.get() {
                target.deliver(&peer, req_id, response);
            }
        });
        Ok(())
    }
}

fn flip(bytes: &Bytes) -> Bytes {
    let mut v = bytes.to_vec();
    match v.first_mut() {
        Some(b) => *b ^= 0x01,
        None => v.push(0x01),
    }
    Bytes::from(v)
}

/// Flip a single byte inside the payload.
pub fn corrupt(response: Response) -> Response {
    match response {
        Response::BlockHeaders(mut headers) => {
            if let Some(h) = headers.first_mut() {
                h.state_root[0] ^= 0x01;
            }
            Response::BlockHeaders(headers)
        }
        Response::BlockBodies(mut bodies) => {
            if let Some(tx) = bodies.first_mut().and_then(|b| b.transactions.first_mut()) {
                *tx = flip(tx);
            }
            Response::BlockBodies(bodies)
        }
        Response::Receipts(mut lists) => {
            if let Some(r) = lists.first_mut().and_then(|l| l.first_mut()) {
                r.bloom[0] ^= 0x01;
            }
            Response::Receipts(lists)
        }
        Response::Proofs(mut proofs) => {
            if let Some(leaf) = proofs.first_mut().and_then(|p| p.leaves.first_mut()) {
                leaf.value = flip(&leaf.value);
            }
            Response::Proofs(proofs)
        }
        Response::Code(mut blobs) => {
            if let Some(code) = blobs.first_mut() {
                *code = flip(code);
            }
            Response::Code(blobs)
        }
        Response::HeaderProofs(mut items) => {
            if let Some(item) = items.first_mut() {
                item.header.timestamp ^= 0x01;
            }
            Response::HeaderProofs(items)
        }
        Response::HelperTrieProofs(mut items) => {
            if let Some(item) = items.first_mut() {
                if let Some(leaf) = item.proof.leaves.first_mut() {
                    leaf.value = flip(&leaf.value);
                }
                item.value = flip(&item.value);
            }
            Response::HelperTrieProofs(items)
        }
    }
}

/// Replace receipts with a plausible list from some other block.
pub fn wrong_root(response: Response) -> Response {
    match response {
        Response::Receipts(lists) => {
            Response::Receipts(lists.iter().map(|_| vec![Receipt::new(&[], false, 1)]).collect())
        }
        other => corrupt(other),
    }
}

/// Retrieval stack over a simulated network.
pub struct Harness {
    pub fixture: Fixture,
    pub peers: Arc<PeerSet>,
    pub pool: Arc<ServerPool>,
    pub net: MockNet,
    pub retrieval: RetrievalManager,
    pub odr: Odr,
}

impl Harness {
    pub fn new(cfg: config::Odr) -> Self {
        let fixture = fixture();
        let peers = Arc::new(PeerSet::new());
        let pool = Arc::new(ServerPool::new(pool_config()));
        let net = MockNet::new(fixture.full.clone());
        let retrieval = RetrievalManager::new(
            Distributor::new(peers.clone()),
            pool.clone(),
            Arc::new(net.clone()),
            RetrieveConfig::from(&cfg),
        );
        net.connect(retrieval.clone());
        let odr = Odr::new(retrieval.clone(), &cfg);
        Self { fixture, peers, pool, net, retrieval, odr }
    }

    pub fn add_peer(&self, n: u8, behaviour: Behaviour) -> PeerId {
        self.add_peer_with(n, behaviour, PeerCapabilities::default())
    }

    pub fn add_peer_with(&self, n: u8, behaviour: Behaviour, caps: PeerCapabilities) -> PeerId {
        let id = peer_id(n);
        self.net.set_behaviour(id, behaviour);
        self.peers.register(id, caps).expect("register peer");
        self.pool.connected(id, None);
        id
    }
}
