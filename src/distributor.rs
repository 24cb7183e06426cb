//! Request Distributor: picks the peer that serves a request next.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DistributeError;
use crate::peers::{LeaseRefusal, PeerLease, PeerSet};
use crate::wire::Request;

/// Result of a single non-blocking selection pass.
#[derive(Debug)]
pub enum Pick {
    Assigned(PeerLease),
    /// Some eligible peer is only short on flow credit.
    Recharging(Duration),
    Unavailable,
}

pub struct Distributor {
    peers: Arc<PeerSet>,
}

impl Distributor {
    pub fn new(peers: Arc<PeerSet>) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    /// One selection pass over the registry.
    ///
    /// Eligible peers are alive, not excluded, advertise the request kind and
    /// have a free slot. They are tried cheapest first; the peer id breaks ties.
    pub fn try_assign(&self, request: &Request, excluded: &HashSet<PeerId>) -> Pick {
        let kind = request.kind();
        let mut candidates: Vec<_> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|p| p.is_alive() && !excluded.contains(p.id()))
            .filter(|p| p.capabilities().serves(kind) && p.has_free_slot())
            .map(|p| {
                let cost = p.capabilities().costs.request_cost(request);
                (p.estimated_cost(cost), cost, p)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.id().cmp(b.2.id())));

        let mut recharge: Option<Duration> = None;
        for (_, cost, peer) in &candidates {
            match self.peers.try_lease(peer, *cost) {
                Ok(lease) => {
                    tracing::trace!(peer = %peer.id(), %kind, cost, "assigned request");
                    return Pick::Assigned(lease);
                }
                Err(LeaseRefusal::Recharging(wait)) => {
                    recharge = Some(recharge.map_or(wait, |w| w.min(wait)));
                }
                Err(LeaseRefusal::Busy | LeaseRefusal::Dead | LeaseRefusal::TooExpensive) => {}
            }
        }
        match recharge {
            Some(wait) => Pick::Recharging(wait),
            None => Pick::Unavailable,
        }
    }

    /// Assign a peer, suspending until one becomes eligible, `cancel` fires,
    /// or `deadline` passes.
    ///
    /// The wait is woken by registry changes and freed slots, or by a timer
    /// for the earliest flow-credit recharge.
    pub async fn distribute(
        &self,
        request: &Request,
        excluded: &HashSet<PeerId>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<PeerLease, DistributeError> {
        loop {
            // register interest before scanning so a release in between is not lost
            let notified = self.peers.available().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(DistributeError::Cancelled);
            }
            let recharge = match self.try_assign(request, excluded) {
                Pick::Assigned(lease) => return Ok(lease),
                Pick::Recharging(wait) => Some(wait),
                Pick::Unavailable => None,
            };
            if Instant::now() >= deadline {
                return Err(DistributeError::DeadlineExceeded);
            }
            tracing::trace!(kind = %request.kind(), ?recharge, "no eligible peer, waiting");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DistributeError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(DistributeError::DeadlineExceeded),
                _ = &mut notified => {}
                _ = sleep_for(recharge) => {}
            }
        }
    }
}

async fn sleep_for(wait: Option<Duration>) {
    match wait {
        Some(wait) => tokio::time::sleep(wait).await,
        None => std::future::pending().await,
    }
}
