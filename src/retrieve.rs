//! Retrieval Manager.
//!
//! One session drives one logical request to completion: assign a peer,
//! send, wait for the answer or the per-attempt timeout, validate, and try
//! the next peer when anything goes wrong. Sessions are keyed by
//! [`RequestKey`], so concurrent callers asking for the same thing share one
//! session and one set of wire requests.
//!
//! A session runs in its own task and lives as long as at least one caller
//! is waiting on it. When the last caller goes away (its token fires or its
//! future is dropped) the session is cancelled, which aborts the peer wait
//! or response wait and releases the peer lease.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::distributor::Distributor;
use crate::error::{DistributeError, RetrieveError, SendError, ValidationError};
use crate::metrics;
use crate::peers::Peer;
use crate::serverpool::{Outcome, ServerPool};
use crate::wire::{ReqId, Request, RequestKey, Response};

/// Transport seam: hands a request to the wire. The response comes back
/// later through [`RetrievalManager::deliver`] with the same `req_id`.
pub trait RequestSender: Send + Sync + 'static {
    fn send(&self, peer: &PeerId, req_id: ReqId, request: &Request) -> Result<(), SendError>;
}

/// Per-attempt response check supplied by the caller.
pub type Validator = Arc<dyn Fn(&Request, &Response) -> Result<(), ValidationError> + Send + Sync>;

pub type RetrieveResult = Result<Arc<Response>, RetrieveError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a peer.
    Pending,
    InFlight,
    Validating,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub request_timeout: Duration,
}

impl From<&config::Odr> for RetrieveConfig {
    fn from(cfg: &config::Odr) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            attempt_timeout: cfg.attempt_timeout(),
            request_timeout: cfg.request_timeout(),
        }
    }
}

struct Session {
    state: Mutex<SessionState>,
    tried: Mutex<Vec<PeerId>>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
    result: watch::Receiver<Option<RetrieveResult>>,
}

impl Session {
    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }
}

struct InFlight {
    peer: PeerId,
    reply: oneshot::Sender<Response>,
}

enum Attempt {
    Answered(Response),
    TimedOut,
    Dropped,
    Cancelled,
}

struct Inner {
    distributor: Distributor,
    pool: Arc<ServerPool>,
    sender: Arc<dyn RequestSender>,
    cfg: RetrieveConfig,
    sessions: Mutex<HashMap<RequestKey, Arc<Session>>>,
    in_flight: Mutex<HashMap<ReqId, InFlight>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Detaches a caller from its session on drop.
struct Attachment {
    inner: Arc<Inner>,
    session: Arc<Session>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        // under the sessions lock so a caller attaching concurrently never
        // joins a session that is being cancelled
        let _sessions = self.inner.sessions.lock();
        if self.session.waiters.fetch_sub(1, Ordering::AcqRel) == 1 && !self.session.state().is_terminal() {
            self.session.cancel.cancel();
        }
    }
}

#[derive(Clone)]
pub struct RetrievalManager {
    inner: Arc<Inner>,
}

impl RetrievalManager {
    pub fn new(distributor: Distributor, pool: Arc<ServerPool>, sender: Arc<dyn RequestSender>, cfg: RetrieveConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                distributor,
                pool,
                sender,
                cfg,
                sessions: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.inner.pool
    }

    pub fn distributor(&self) -> &Distributor {
        &self.inner.distributor
    }

    /// Retrieve a response for `request` that passes `validator`, sharing a
    /// session with identical wire requests.
    pub async fn retrieve(&self, request: Request, validator: Validator, cancel: &CancellationToken) -> RetrieveResult {
        let key = request.key();
        self.retrieve_keyed(key, request, validator, cancel).await
    }

    /// Like [`retrieve`](Self::retrieve) with an explicit session key.
    ///
    /// Attaches to a running session for `key` if there is one; in that case
    /// `validator` is not used, so `key` must cover everything `validator`
    /// checks against. Returns `Cancelled` as soon as `cancel` fires,
    /// independently of other callers on the same session.
    pub async fn retrieve_keyed(
        &self,
        key: RequestKey,
        request: Request,
        validator: Validator,
        cancel: &CancellationToken,
    ) -> RetrieveResult {
        if self.inner.shutdown.is_cancelled() {
            return Err(RetrieveError::Shutdown);
        }
        let attachment = self.attach(key, request, validator);
        let mut result = attachment.session.result.clone();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetrieveError::Cancelled),
            outcome = result.wait_for(Option::is_some) => match outcome {
                Ok(value) => value.clone().unwrap_or(Err(RetrieveError::Shutdown)),
                Err(_) => Err(RetrieveError::Shutdown),
            },
        }
    }

    fn attach(&self, key: RequestKey, request: Request, validator: Validator) -> Attachment {
        let mut sessions = self.inner.sessions.lock();
        if let Some(session) = sessions.get(&key) {
            if !session.cancel.is_cancelled() {
                session.waiters.fetch_add(1, Ordering::AcqRel);
                metrics::DEDUP_ATTACHES.inc();
                tracing::debug!(%key, "attached to running session");
                return Attachment { inner: self.inner.clone(), session: session.clone() };
            }
        }

        let (tx, rx) = watch::channel(None);
        let session = Arc::new(Session {
            state: Mutex::new(SessionState::Pending),
            tried: Mutex::new(Vec::new()),
            waiters: AtomicUsize::new(1),
            cancel: self.inner.shutdown.child_token(),
            result: rx,
        });
        sessions.insert(key, session.clone());
        metrics::ACTIVE_SESSIONS.set(sessions.len() as i64);

        let inner = self.inner.clone();
        let running = session.clone();
        tokio::spawn(async move {
            let result = inner.drive(&running, &request, &validator).await;
            inner.finish(key, &running, result, &tx);
        });
        Attachment { inner: self.inner.clone(), session }
    }

    /// Route a response to the attempt waiting for it. Responses with an
    /// unknown id, from the wrong peer, or for a finished attempt are
    /// dropped and `false` is returned.
    pub fn deliver(&self, peer: &PeerId, req_id: ReqId, response: Response) -> bool {
        let entry = {
            let mut in_flight = self.inner.in_flight.lock();
            match in_flight.get(&req_id) {
                Some(f) if f.peer == *peer => in_flight.remove(&req_id),
                Some(_) => {
                    tracing::debug!(%peer, req_id, "response from unexpected peer dropped");
                    None
                }
                None => None,
            }
        };
        match entry {
            Some(f) => f.reply.send(response).is_ok(),
            None => {
                tracing::trace!(%peer, req_id, "late or unknown response discarded");
                false
            }
        }
    }

    /// Fail every attempt in flight on `peer` right away.
    pub fn peer_disconnected(&self, peer: &PeerId) -> usize {
        let mut in_flight = self.inner.in_flight.lock();
        let before = in_flight.len();
        // dropping the reply sender wakes the attempt
        in_flight.retain(|_, f| f.peer != *peer);
        before - in_flight.len()
    }

    pub fn session_state(&self, key: &RequestKey) -> Option<SessionState> {
        self.inner.sessions.lock().get(key).map(|s| s.state())
    }

    /// Peers tried so far by the running session for `key`.
    pub fn tried_peers(&self, key: &RequestKey) -> Option<Vec<PeerId>> {
        self.inner.sessions.lock().get(key).map(|s| s.tried.lock().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Cancel every session. Waiting callers get `Shutdown`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Record an outcome in the server pool and carry the new score over to
    /// the registry, where the distributor reads it.
    fn report(&self, peer: &Peer, outcome: Outcome) {
        self.pool.report(peer.id(), outcome);
        if let Some(score) = self.pool.score(peer.id()) {
            peer.set_score(score);
        }
    }

    fn stop_reason(&self) -> RetrieveError {
        if self.shutdown.is_cancelled() {
            RetrieveError::Shutdown
        } else {
            RetrieveError::Cancelled
        }
    }

    async fn drive(&self, session: &Session, request: &Request, validator: &Validator) -> RetrieveResult {
        let deadline = Instant::now() + self.cfg.request_timeout;
        let cancel = &session.cancel;
        let kind = request.kind();
        let mut excluded: HashSet<PeerId> = HashSet::new();
        let mut attempts = 0u32;

        while attempts < self.cfg.max_attempts {
            session.set_state(SessionState::Pending);
            let lease = match self.distributor.distribute(request, &excluded, cancel, deadline).await {
                Ok(lease) => lease,
                Err(DistributeError::Cancelled) => return Err(self.stop_reason()),
                Err(DistributeError::DeadlineExceeded) => return Err(RetrieveError::DeadlineExceeded { attempts }),
            };
            let peer = *lease.id();
            excluded.insert(peer);
            session.tried.lock().push(peer);
            attempts += 1;

            let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (reply, response) = oneshot::channel();
            self.in_flight.lock().insert(req_id, InFlight { peer, reply });
            session.set_state(SessionState::InFlight);

            let sent_at = Instant::now();
            if let Err(e) = self.sender.send(&peer, req_id, request) {
                self.in_flight.lock().remove(&req_id);
                tracing::debug!(%peer, %kind, error = %e, "send failed");
                self.report(lease.peer(), Outcome::Disconnected);
                continue;
            }
            metrics::WIRE_REQUESTS.inc();
            metrics::IN_FLIGHT.inc();
            tracing::debug!(%peer, %kind, req_id, attempt = attempts, "request sent");

            let attempt_deadline = (sent_at + self.cfg.attempt_timeout).min(deadline);
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => Attempt::Cancelled,
                answer = response => match answer {
                    Ok(resp) => Attempt::Answered(resp),
                    Err(_) => Attempt::Dropped,
                },
                _ = tokio::time::sleep_until(attempt_deadline) => Attempt::TimedOut,
            };
            metrics::IN_FLIGHT.dec();
            self.in_flight.lock().remove(&req_id);

            match attempt {
                Attempt::Cancelled => return Err(self.stop_reason()),
                Attempt::TimedOut => {
                    metrics::TIMEOUTS.inc();
                    lease.peer().record_latency(self.cfg.attempt_timeout);
                    self.report(lease.peer(), Outcome::Timeout);
                    tracing::debug!(%peer, %kind, req_id, "request timed out");
                }
                Attempt::Dropped => {
                    self.report(lease.peer(), Outcome::Disconnected);
                    tracing::debug!(%peer, %kind, req_id, "peer dropped while request in flight");
                }
                Attempt::Answered(resp) => {
                    lease.peer().record_latency(sent_at.elapsed());
                    session.set_state(SessionState::Validating);
                    match validator(request, &resp) {
                        Ok(()) => {
                            self.report(lease.peer(), Outcome::Success);
                            return Ok(Arc::new(resp));
                        }
                        Err(e) => {
                            metrics::INVALID_RESPONSES.inc();
                            self.report(lease.peer(), Outcome::Invalid);
                            tracing::warn!(%peer, %kind, req_id, error = %e, "❌ Invalid response");
                        }
                    }
                }
            }
            drop(lease);

            if Instant::now() >= deadline {
                return Err(RetrieveError::DeadlineExceeded { attempts });
            }
        }
        Err(RetrieveError::Exhausted { attempts })
    }

    fn finish(&self, key: RequestKey, session: &Arc<Session>, result: RetrieveResult, tx: &watch::Sender<Option<RetrieveResult>>) {
        let mut sessions = self.sessions.lock();
        if sessions.get(&key).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&key);
        }
        metrics::ACTIVE_SESSIONS.set(sessions.len() as i64);
        match &result {
            Ok(_) => {
                metrics::VERIFIED.inc();
                session.set_state(SessionState::Done);
            }
            Err(e) => {
                metrics::RETRIEVAL_FAILURES.inc();
                session.set_state(SessionState::Failed);
                tracing::debug!(%key, error = %e, "session failed");
            }
        }
        tx.send_replace(Some(result));
    }
}
