//! Server Pool: the table of light servers we know about, connected or not.
//!
//! Scores live in `[0, 1]` and start at 0.5. Only verified service raises a
//! score; timeouts, disconnects and invalid responses lower it, invalid ones
//! by far the most. The table is bounded and persisted to the store so that
//! quality survives restarts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config;
use crate::storage::{Store, CF_SERVERPOOL};

pub const INITIAL_SCORE: f64 = 0.5;

const SUCCESS_GAIN: f64 = 0.1;
const TIMEOUT_KEEP: f64 = 0.8;
const DISCONNECT_KEEP: f64 = 0.9;
const INVALID_KEEP: f64 = 0.1;

/// What happened when a peer was asked to serve something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Timeout,
    Disconnected,
    Invalid,
}

impl Outcome {
    fn apply(self, score: f64) -> f64 {
        let next = match self {
            Outcome::Success => score + SUCCESS_GAIN * (1.0 - score),
            Outcome::Timeout => score * TIMEOUT_KEEP,
            Outcome::Disconnected => score * DISCONNECT_KEEP,
            Outcome::Invalid => score * INVALID_KEEP,
        };
        next.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub id: PeerId,
    pub addr: Option<Multiaddr>,
    pub score: f64,
    /// Unix seconds.
    pub last_seen: u64,
    pub last_success: Option<u64>,
    pub failures: u32,
    pub backoff: Duration,
    pub next_dial: Option<Instant>,
    pub connected: bool,
}

impl PoolEntry {
    fn new(id: PeerId, addr: Option<Multiaddr>) -> Self {
        Self {
            id,
            addr,
            score: INITIAL_SCORE,
            last_seen: unix_now(),
            last_success: None,
            failures: 0,
            backoff: Duration::ZERO,
            next_dial: None,
            connected: false,
        }
    }

    fn dialable(&self, now: Instant) -> bool {
        !self.connected && self.addr.is_some() && self.next_dial.map_or(true, |t| t <= now)
    }
}

/// On-disk form of a [`PoolEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: Vec<u8>,
    addr: Option<String>,
    score: f64,
    last_seen: u64,
    last_success: Option<u64>,
    failures: u32,
    backoff_secs: u64,
}

impl From<&PoolEntry> for StoredEntry {
    fn from(e: &PoolEntry) -> Self {
        Self {
            id: e.id.to_bytes(),
            addr: e.addr.as_ref().map(|a| a.to_string()),
            score: e.score,
            last_seen: e.last_seen,
            last_success: e.last_success,
            failures: e.failures,
            backoff_secs: e.backoff.as_secs(),
        }
    }
}

impl StoredEntry {
    fn into_entry(self) -> Result<PoolEntry> {
        let id = PeerId::from_bytes(&self.id).context("invalid peer id in server pool")?;
        let addr = match self.addr {
            Some(a) => Some(a.parse::<Multiaddr>().with_context(|| format!("invalid address {a}"))?),
            None => None,
        };
        Ok(PoolEntry {
            id,
            addr,
            score: self.score.clamp(0.0, 1.0),
            last_seen: self.last_seen,
            last_success: self.last_success,
            failures: self.failures,
            backoff: Duration::from_secs(self.backoff_secs),
            // restarts get a fresh dial attempt
            next_dial: None,
            connected: false,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Split `/.../p2p/<id>` into the peer id and the dialable address.
pub fn parse_bootnode(s: &str) -> Result<(PeerId, Multiaddr)> {
    let mut addr: Multiaddr = s.parse().with_context(|| format!("invalid multiaddr {s}"))?;
    match addr.pop() {
        Some(Protocol::P2p(id)) => Ok((id, addr)),
        _ => anyhow::bail!("bootnode {s} does not end in /p2p/<peer id>"),
    }
}

/// Read persisted entries without building a pool.
pub fn load_entries(store: &Store) -> Result<Vec<PoolEntry>> {
    let mut entries = Vec::new();
    for (key, stored) in store.iterate::<StoredEntry>(CF_SERVERPOOL)? {
        match stored.into_entry() {
            Ok(e) => entries.push(e),
            Err(e) => tracing::warn!(key = %hex::encode(&key), error = %e, "dropping bad server pool row"),
        }
    }
    Ok(entries)
}

pub struct ServerPool {
    entries: Mutex<HashMap<PeerId, PoolEntry>>,
    cfg: config::Pool,
    store: Option<Arc<Store>>,
    rng: Mutex<StdRng>,
}

impl ServerPool {
    /// In-memory pool with nothing persisted.
    pub fn new(cfg: config::Pool) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { entries: Mutex::new(HashMap::new()), cfg, store: None, rng: Mutex::new(rng) }
    }

    /// Pool backed by `store`, restored from what was saved last time.
    pub fn open(store: Arc<Store>, cfg: config::Pool) -> Result<Self> {
        let loaded = load_entries(&store)?;
        let mut pool = Self::new(cfg);
        {
            let entries = pool.entries.get_mut();
            for e in loaded {
                entries.insert(e.id, e);
            }
        }
        pool.store = Some(store);
        pool.evict_overflow(&mut pool.entries.lock());
        tracing::info!(entries = pool.len(), "✅ Server pool restored");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn score(&self, id: &PeerId) -> Option<f64> {
        self.entries.lock().get(id).map(|e| e.score)
    }

    pub fn entry(&self, id: &PeerId) -> Option<PoolEntry> {
        self.entries.lock().get(id).cloned()
    }

    /// All entries, best score first.
    pub fn entries(&self) -> Vec<PoolEntry> {
        let mut all: Vec<PoolEntry> = self.entries.lock().values().cloned().collect();
        sort_by_score(&mut all);
        all
    }

    /// Seed the pool with configured bootnodes. Returns how many were new.
    pub fn add_bootnodes(&self, bootnodes: &[String]) -> Result<usize> {
        let mut added = 0;
        for s in bootnodes {
            let (id, addr) = parse_bootnode(s)?;
            if self.add_candidate(id, addr) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Learn about a server, e.g. from peer exchange. Known entries only get
    /// their address refreshed.
    pub fn add_candidate(&self, id: PeerId, addr: Multiaddr) -> bool {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(&id) {
            e.addr = Some(addr);
            return false;
        }
        entries.insert(id, PoolEntry::new(id, Some(addr)));
        self.evict_overflow(&mut entries);
        entries.contains_key(&id)
    }

    pub fn connected(&self, id: PeerId, addr: Option<Multiaddr>) {
        let mut entries = self.entries.lock();
        let e = entries.entry(id).or_insert_with(|| PoolEntry::new(id, None));
        if addr.is_some() {
            e.addr = addr;
        }
        e.connected = true;
        e.backoff = Duration::ZERO;
        e.next_dial = None;
        e.last_seen = unix_now();
        self.evict_overflow(&mut entries);
    }

    pub fn disconnected(&self, id: &PeerId) {
        if let Some(e) = self.entries.lock().get_mut(id) {
            e.connected = false;
            e.last_seen = unix_now();
        }
    }

    /// Back off from a candidate whose dial failed; the wait doubles per
    /// consecutive failure up to the configured maximum.
    pub fn dial_failed(&self, id: &PeerId) {
        let base = Duration::from_secs(self.cfg.dial_backoff_base_secs);
        let max = Duration::from_secs(self.cfg.dial_backoff_max_secs);
        if let Some(e) = self.entries.lock().get_mut(id) {
            e.backoff = if e.backoff.is_zero() { base } else { (e.backoff * 2).min(max) };
            e.next_dial = Some(Instant::now() + e.backoff);
            e.failures = e.failures.saturating_add(1);
            tracing::debug!(peer = %id, backoff = ?e.backoff, "dial failed");
        }
    }

    /// Record how a peer served a request.
    pub fn report(&self, id: &PeerId, outcome: Outcome) {
        let mut entries = self.entries.lock();
        let e = entries.entry(*id).or_insert_with(|| PoolEntry::new(*id, None));
        let before = e.score;
        e.score = outcome.apply(e.score);
        e.last_seen = unix_now();
        match outcome {
            Outcome::Success => {
                e.last_success = Some(e.last_seen);
                e.failures = 0;
            }
            _ => e.failures = e.failures.saturating_add(1),
        }
        match outcome {
            Outcome::Invalid => tracing::warn!(peer = %id, before, after = e.score, "⚠️  Penalised for invalid response"),
            _ => tracing::trace!(peer = %id, ?outcome, before, after = e.score, "score updated"),
        }
        self.evict_overflow(&mut entries);
    }

    /// Candidates to dial next.
    ///
    /// Connected peers and peers in dial backoff are skipped. On average a
    /// share of `explore_ratio` of the slots goes to randomly picked
    /// lower-ranked candidates so that a peer with a bad past gets another
    /// chance; the remaining slots go to the best scores.
    pub fn suggest(&self, n: usize) -> Vec<(PeerId, Multiaddr)> {
        if n == 0 {
            return Vec::new();
        }
        let now = Instant::now();
        let mut candidates: Vec<PoolEntry> =
            self.entries.lock().values().filter(|e| e.dialable(now)).cloned().collect();
        sort_by_score(&mut candidates);

        let mut rng = self.rng.lock();
        // whole explore slots, plus one more with the leftover fraction as probability
        let share = n as f64 * self.cfg.explore_ratio;
        let mut explore = share.floor() as usize;
        if rng.gen_bool(share.fract()) {
            explore += 1;
        }
        let explore = explore.min(n);
        let top = (n - explore).min(candidates.len());
        let rest = candidates.split_off(top);
        let mut picked = candidates;
        picked.extend(rest.choose_multiple(&mut *rng, explore.min(rest.len())).cloned());

        picked.into_iter().filter_map(|e| e.addr.map(|a| (e.id, a))).collect()
    }

    fn evict_overflow(&self, entries: &mut HashMap<PeerId, PoolEntry>) {
        while entries.len() > self.cfg.max_entries {
            let victim = entries
                .values()
                .filter(|e| !e.connected)
                .min_by(|a, b| a.score.total_cmp(&b.score).then(a.last_seen.cmp(&b.last_seen)))
                .map(|e| e.id);
            match victim {
                Some(id) => {
                    entries.remove(&id);
                    tracing::debug!(peer = %id, "evicted from server pool");
                }
                None => break,
            }
        }
    }

    /// Persist the table, replacing what was stored before.
    pub fn save(&self) -> Result<usize> {
        let Some(store) = &self.store else { return Ok(0) };
        let snapshot: Vec<StoredEntry> = self.entries.lock().values().map(StoredEntry::from).collect();

        let mut batch = rocksdb::WriteBatch::default();
        let live: std::collections::HashSet<&[u8]> = snapshot.iter().map(|e| e.id.as_slice()).collect();
        for key in store.keys(CF_SERVERPOOL)? {
            if !live.contains(key.as_slice()) {
                store.batch_delete(&mut batch, CF_SERVERPOOL, &key)?;
            }
        }
        for e in &snapshot {
            store.batch_put(&mut batch, CF_SERVERPOOL, &e.id, e)?;
        }
        store.write_batch(batch).context("saving server pool")?;
        tracing::debug!(entries = snapshot.len(), "server pool saved");
        Ok(snapshot.len())
    }
}

fn sort_by_score(entries: &mut [PoolEntry]) {
    entries.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
}
