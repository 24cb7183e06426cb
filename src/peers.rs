//! Peer Registry.
//!
//! The registry is the single owner of connected light servers. Every other
//! component holds `Arc<Peer>` handles obtained from it and reserves work on
//! a peer through a [`PeerLease`], which keeps the outstanding-request count
//! within the advertised capacity and gives the slot back when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::RegistryError;
use crate::metrics;
use crate::serverpool::INITIAL_SCORE;
use crate::wire::{CostTable, RequestKind};

const INITIAL_LATENCY: Duration = Duration::from_millis(200);
const LATENCY_WEIGHT: f64 = 0.2;
const SCORE_FLOOR: f64 = 0.01;

/// What a server announced during the handshake.
#[derive(Debug, Clone)]
pub struct PeerCapabilities {
    pub serves: Vec<RequestKind>,
    /// Maximum concurrent requests we keep outstanding on this peer.
    pub capacity: usize,
    /// Flow-control buffer size, in cost units.
    pub buffer_limit: u64,
    /// Buffer recharge rate, in cost units per second.
    pub min_recharge: u64,
    pub costs: CostTable,
}

impl Default for PeerCapabilities {
    fn default() -> Self {
        Self {
            serves: RequestKind::ALL.to_vec(),
            capacity: 4,
            buffer_limit: 10_000,
            min_recharge: 1_000,
            costs: CostTable::default(),
        }
    }
}

impl PeerCapabilities {
    pub fn serves(&self, kind: RequestKind) -> bool {
        self.serves.contains(&kind)
    }
}

#[derive(Debug)]
struct FlowControl {
    credit: u64,
    updated: Instant,
}

#[derive(Debug)]
struct PeerStats {
    latency: Duration,
    /// Server pool score, mirrored here for selection.
    score: f64,
    flow: FlowControl,
}

/// Why a lease could not be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRefusal {
    /// Gone from the registry.
    Dead,
    /// All capacity slots are taken.
    Busy,
    /// Not enough flow credit; it will be after the given wait.
    Recharging(Duration),
    /// The request costs more than the whole buffer.
    TooExpensive,
}

#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    caps: PeerCapabilities,
    outstanding: AtomicUsize,
    alive: AtomicBool,
    stats: Mutex<PeerStats>,
}

impl Peer {
    fn new(id: PeerId, caps: PeerCapabilities) -> Self {
        let flow = FlowControl { credit: caps.buffer_limit, updated: Instant::now() };
        Self {
            id,
            caps,
            outstanding: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            stats: Mutex::new(PeerStats { latency: INITIAL_LATENCY, score: INITIAL_SCORE, flow }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn capabilities(&self) -> &PeerCapabilities {
        &self.caps
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn has_free_slot(&self) -> bool {
        self.outstanding() < self.caps.capacity
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn latency(&self) -> Duration {
        self.stats.lock().latency
    }

    /// Fold one observed round trip into the latency average.
    pub fn record_latency(&self, rtt: Duration) {
        let mut stats = self.stats.lock();
        stats.latency = stats.latency.mul_f64(1.0 - LATENCY_WEIGHT) + rtt.mul_f64(LATENCY_WEIGHT);
    }

    pub fn score(&self) -> f64 {
        self.stats.lock().score
    }

    pub fn set_score(&self, score: f64) {
        self.stats.lock().score = score.clamp(0.0, 1.0);
    }

    /// Estimated cost to serve a request of `cost` units, in milliseconds,
    /// weighted by the peer's track record: below the starting score the
    /// estimate grows with the square of the shortfall.
    pub fn estimated_cost(&self, cost: u64) -> u64 {
        let (latency, score) = {
            let stats = self.stats.lock();
            (stats.latency.as_millis() as u64, stats.score)
        };
        let load = latency.saturating_mul(self.outstanding() as u64 + 1);
        let base = load.saturating_add(cost.saturating_mul(1_000) / self.caps.min_recharge.max(1));
        let penalty = (INITIAL_SCORE / score.max(SCORE_FLOOR)).powi(2);
        (base as f64 * penalty).min(u64::MAX as f64) as u64
    }

    /// Current flow credit after recharge.
    pub fn credit(&self) -> u64 {
        let mut stats = self.stats.lock();
        self.recharge(&mut stats.flow, Instant::now());
        stats.flow.credit
    }

    fn recharge(&self, flow: &mut FlowControl, now: Instant) {
        let elapsed = now.saturating_duration_since(flow.updated);
        let gained = (elapsed.as_secs_f64() * self.caps.min_recharge as f64) as u64;
        if gained > 0 {
            flow.credit = flow.credit.saturating_add(gained).min(self.caps.buffer_limit);
            flow.updated = now;
        } else if flow.credit >= self.caps.buffer_limit {
            flow.updated = now;
        }
    }

    fn try_reserve_slot(&self) -> bool {
        let mut current = self.outstanding.load(Ordering::Acquire);
        loop {
            if current >= self.caps.capacity {
                return false;
            }
            match self.outstanding.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_slot(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    fn try_spend(&self, cost: u64) -> Result<(), LeaseRefusal> {
        if cost > self.caps.buffer_limit {
            return Err(LeaseRefusal::TooExpensive);
        }
        let mut stats = self.stats.lock();
        let now = Instant::now();
        self.recharge(&mut stats.flow, now);
        if stats.flow.credit >= cost {
            stats.flow.credit -= cost;
            return Ok(());
        }
        let missing = cost - stats.flow.credit;
        let wait = Duration::from_secs_f64(missing as f64 / self.caps.min_recharge.max(1) as f64);
        Err(LeaseRefusal::Recharging(wait.max(Duration::from_millis(1))))
    }
}

/// A reserved slot on a peer. Dropping it frees the slot and wakes anyone
/// waiting for capacity.
#[derive(Debug)]
pub struct PeerLease {
    peer: Arc<Peer>,
    available: Arc<Notify>,
}

impl PeerLease {
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn id(&self) -> &PeerId {
        self.peer.id()
    }
}

impl Drop for PeerLease {
    fn drop(&mut self) {
        self.peer.release_slot();
        self.available.notify_waiters();
    }
}

/// Connected light servers keyed by node identity.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    available: Arc<Notify>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: PeerId, caps: PeerCapabilities) -> Result<Arc<Peer>, RegistryError> {
        let peer = {
            let mut peers = self.peers.write();
            if peers.contains_key(&id) {
                return Err(RegistryError::AlreadyRegistered(id));
            }
            let peer = Arc::new(Peer::new(id, caps));
            peers.insert(id, peer.clone());
            metrics::LIGHT_PEERS.set(peers.len() as i64);
            peer
        };
        tracing::debug!(peer = %id, capacity = peer.caps.capacity, "registered light server");
        self.available.notify_waiters();
        Ok(peer)
    }

    /// Remove a peer. It is marked dead first so no new lease can be taken
    /// on it even through a handle obtained earlier.
    pub fn unregister(&self, id: &PeerId) -> Result<Arc<Peer>, RegistryError> {
        let peer = {
            let mut peers = self.peers.write();
            let peer = peers.remove(id).ok_or(RegistryError::NotRegistered(*id))?;
            peer.alive.store(false, Ordering::Release);
            metrics::LIGHT_PEERS.set(peers.len() as i64);
            peer
        };
        tracing::debug!(peer = %id, outstanding = peer.outstanding(), "unregistered light server");
        self.available.notify_waiters();
        Ok(peer)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// All registered peers ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Least loaded peer with a free slot, ties broken by id.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        self.snapshot()
            .into_iter()
            .filter(|p| p.has_free_slot())
            .min_by_key(|p| p.estimated_cost(0))
    }

    /// Overwrite the flow-credit estimate with the value the server reported.
    pub fn update_buffer(&self, id: &PeerId, credit: u64) -> bool {
        let Some(peer) = self.get(id) else { return false };
        {
            let mut stats = peer.stats.lock();
            stats.flow.credit = credit.min(peer.caps.buffer_limit);
            stats.flow.updated = Instant::now();
        }
        self.available.notify_waiters();
        true
    }

    /// Reserve one slot and `cost` units of flow credit on `peer`.
    pub fn try_lease(&self, peer: &Arc<Peer>, cost: u64) -> Result<PeerLease, LeaseRefusal> {
        if !peer.is_alive() {
            return Err(LeaseRefusal::Dead);
        }
        if !peer.try_reserve_slot() {
            return Err(LeaseRefusal::Busy);
        }
        if let Err(refusal) = peer.try_spend(cost) {
            peer.release_slot();
            return Err(refusal);
        }
        // unregister may have raced with the reservation
        if !peer.is_alive() {
            peer.release_slot();
            return Err(LeaseRefusal::Dead);
        }
        Ok(PeerLease { peer: peer.clone(), available: self.available.clone() })
    }

    /// Woken whenever a peer registers, unregisters, or frees a slot.
    pub fn available(&self) -> &Notify {
        &self.available
    }
}
