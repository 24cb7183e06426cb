use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, ChainDb, LightBackend};
use crate::bloom::BloomService;
use crate::config::Config;
use crate::distributor::Distributor;
use crate::error::RegistryError;
use crate::metrics;
use crate::odr::{Odr, TrustedRoots};
use crate::peers::{PeerCapabilities, PeerSet};
use crate::retrieve::{RequestSender, RetrievalManager, RetrieveConfig};
use crate::serverpool::ServerPool;
use crate::storage::Store;
use crate::wire::{ReqId, Response};

/// A light client: the retrieval core wired to a transport.
///
/// The transport feeds peer lifecycle events and responses in through the
/// `on_*` methods and [`LightClient::deliver`], and carries requests out
/// through the [`RequestSender`] it was built with.
pub struct LightClient {
    cfg: Config,
    peers: Arc<PeerSet>,
    pool: Arc<ServerPool>,
    retrieval: RetrievalManager,
    odr: Odr,
    chain: Arc<ChainDb>,
    backend: Backend,
    bloom: BloomService,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LightClient {
    /// Build all components. Must be called from within a tokio runtime.
    pub fn new(cfg: Config, store: Arc<Store>, sender: Arc<dyn RequestSender>) -> Result<Self> {
        cfg.validate()?;

        let pool = Arc::new(ServerPool::open(store.clone(), cfg.pool.clone()).context("opening server pool")?);
        let seeded = pool.add_bootnodes(&cfg.net.bootstrap).context("parsing bootnodes")?;
        if seeded > 0 {
            tracing::info!(bootnodes = seeded, "🔗 Seeded server pool");
        }

        let peers = Arc::new(PeerSet::new());
        let retrieval = RetrievalManager::new(
            Distributor::new(peers.clone()),
            pool.clone(),
            sender,
            RetrieveConfig::from(&cfg.odr),
        );
        let odr = Odr::new(retrieval.clone(), &cfg.odr);
        let chain = Arc::new(ChainDb::new(store, cfg.odr.cht_section_size));
        let backend = Backend::Light(LightBackend::new(chain.clone(), odr.clone()));
        let roots: Arc<dyn TrustedRoots> = chain.clone();
        let bloom = BloomService::start(odr.clone(), roots, cfg.odr.bloom_workers, cfg.odr.bloom_batch);

        if cfg.metrics.enabled {
            metrics::serve(cfg.metrics.clone())?;
        }

        let shutdown = CancellationToken::new();
        let persist = spawn_pool_persistence(
            pool.clone(),
            Duration::from_secs(cfg.pool.persist_interval_secs.max(1)),
            shutdown.clone(),
        );

        Ok(Self {
            cfg,
            peers,
            pool,
            retrieval,
            odr,
            chain,
            backend,
            bloom,
            shutdown,
            tasks: Mutex::new(vec![persist]),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    pub fn retrieval(&self) -> &RetrievalManager {
        &self.retrieval
    }

    pub fn odr(&self) -> &Odr {
        &self.odr
    }

    pub fn chain(&self) -> &Arc<ChainDb> {
        &self.chain
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn bloom(&self) -> &BloomService {
        &self.bloom
    }

    /// A handshake with a light server completed.
    pub fn on_peer_connected(&self, id: PeerId, addr: Option<Multiaddr>, caps: PeerCapabilities) -> Result<(), RegistryError> {
        if self.peers.len() >= self.cfg.net.max_light_peers {
            return Err(RegistryError::Full(self.cfg.net.max_light_peers));
        }
        let peer = self.peers.register(id, caps)?;
        self.pool.connected(id, addr);
        if let Some(score) = self.pool.score(&id) {
            peer.set_score(score);
        }
        tracing::info!(peer = %id, peers = self.peers.len(), "🤝 Light server connected");
        Ok(())
    }

    /// The connection to `id` is gone. Requests in flight on it are retried
    /// elsewhere.
    pub fn on_peer_disconnected(&self, id: &PeerId) {
        if self.peers.unregister(id).is_err() {
            return;
        }
        let failed = self.retrieval.peer_disconnected(id);
        self.pool.disconnected(id);
        tracing::info!(peer = %id, failed, "👋 Light server disconnected");
    }

    pub fn on_dial_failed(&self, id: &PeerId) {
        self.pool.dial_failed(id);
    }

    pub fn deliver(&self, peer: &PeerId, req_id: ReqId, response: Response) -> bool {
        self.retrieval.deliver(peer, req_id, response)
    }

    /// Candidates to dial, limited to the free light-peer slots.
    pub fn suggest_dials(&self, n: usize) -> Vec<(PeerId, Multiaddr)> {
        let free = self.cfg.net.max_light_peers.saturating_sub(self.peers.len());
        self.pool.suggest(n.min(free))
    }

    /// Stop background work, fail outstanding retrievals and persist the pool.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.retrieval.shutdown();
        self.bloom.stop().await;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        futures::future::join_all(tasks).await;
        let saved = self.pool.save().context("saving server pool on shutdown")?;
        tracing::info!(entries = saved, "👋 Light client stopped");
        Ok(())
    }
}

fn spawn_pool_persistence(pool: Arc<ServerPool>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(every);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {
                    if let Err(e) = pool.save() {
                        tracing::warn!(error = %e, "⚠️  Periodic server pool save failed");
                    }
                }
            }
        }
    })
}
