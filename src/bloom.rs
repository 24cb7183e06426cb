//! Bloom-bit retrieval service.
//!
//! A fixed number of worker tasks drain one shared queue. Each request asks
//! for one bloom bit over a list of sections; the worker resolves the trusted
//! bloom-trie root of every section, fetches the vectors through ODR in
//! batches and replies with them in section order.

use std::sync::Arc;

use alloy_rlp::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{OdrError, RetrieveError};
use crate::odr::{Odr, TrustedRoots};
use crate::types::BloomTrieRoot;

pub type BloomReply = Result<Vec<Bytes>, OdrError>;

#[derive(Debug)]
pub struct BloomRequest {
    pub bit: u16,
    pub sections: Vec<u64>,
    pub reply: oneshot::Sender<BloomReply>,
}

type SharedQueue = Arc<AsyncMutex<mpsc::Receiver<BloomRequest>>>;

pub struct BloomService {
    odr: Odr,
    queue: Mutex<Option<mpsc::Sender<BloomRequest>>>,
    receiver: SharedQueue,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    stop: CancellationToken,
}

fn cancelled() -> OdrError {
    OdrError::Retrieve(RetrieveError::Cancelled)
}

impl BloomService {
    /// Start `workers` tasks, each fetching at most `batch` sections per wire request.
    pub fn start(odr: Odr, roots: Arc<dyn TrustedRoots>, workers: usize, batch: usize) -> Self {
        let workers = workers.max(1);
        let batch = batch.max(1);
        let (tx, rx) = mpsc::channel(workers * batch);
        let receiver: SharedQueue = Arc::new(AsyncMutex::new(rx));
        let stop = CancellationToken::new();

        let handles = (0..workers)
            .map(|worker| {
                let odr = odr.clone();
                let roots = roots.clone();
                let receiver = receiver.clone();
                let stop = stop.clone();
                tokio::spawn(async move { run_worker(worker, odr, roots, receiver, batch, stop).await })
            })
            .collect();
        tracing::debug!(workers, batch, "bloom service started");

        Self {
            odr,
            queue: Mutex::new(Some(tx)),
            receiver,
            workers: Mutex::new(handles),
            worker_count: workers,
            stop,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue a request and wait for its reply.
    pub async fn request(&self, bit: u16, sections: Vec<u64>) -> BloomReply {
        let Some(queue) = self.queue.lock().clone() else {
            return Err(cancelled());
        };
        let (reply, response) = oneshot::channel();
        if queue.send(BloomRequest { bit, sections, reply }).await.is_err() {
            return Err(cancelled());
        }
        response.await.unwrap_or_else(|_| Err(cancelled()))
    }

    /// Vectors of `bit` for every section overlapping blocks `first..=last`.
    pub async fn request_blocks(&self, bit: u16, first: u64, last: u64) -> BloomReply {
        let sections = self.odr.bloom_sections(first, last)?;
        self.request(bit, sections.collect()).await
    }

    /// Close the queue, stop the workers and answer anything still queued
    /// with `Cancelled`.
    pub async fn stop(&self) {
        self.queue.lock().take();
        self.stop.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        futures::future::join_all(handles).await;
        let mut rx = self.receiver.lock().await;
        rx.close();
        while let Ok(req) = rx.try_recv() {
            let _ = req.reply.send(Err(cancelled()));
        }
    }
}

async fn run_worker(
    worker: usize,
    odr: Odr,
    roots: Arc<dyn TrustedRoots>,
    receiver: SharedQueue,
    batch: usize,
    stop: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = receiver.lock().await;
            tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                req = rx.recv() => req,
            }
        };
        let Some(req) = next else { break };
        tracing::trace!(worker, bit = req.bit, sections = req.sections.len(), "serving bloom request");
        let result = serve(&odr, roots.as_ref(), req.bit, &req.sections, batch, &stop).await;
        let _ = req.reply.send(result);
    }
    tracing::trace!(worker, "bloom worker stopped");
}

async fn serve(
    odr: &Odr,
    roots: &dyn TrustedRoots,
    bit: u16,
    sections: &[u64],
    batch: usize,
    stop: &CancellationToken,
) -> BloomReply {
    let trusted: Vec<BloomTrieRoot> = sections
        .iter()
        .map(|&section| roots.bloom_trie_root(section).ok_or(OdrError::NoTrustedRoot { trie: "bloom trie", section }))
        .collect::<Result<_, _>>()?;

    let mut vectors = Vec::with_capacity(trusted.len());
    for chunk in trusted.chunks(batch) {
        vectors.extend(odr.get_bloom_bits(bit, chunk, stop).await?);
    }
    Ok(vectors)
}
