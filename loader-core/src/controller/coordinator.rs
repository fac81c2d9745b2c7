//! ``src/controller/coordinator.rs``
//! ============================================================================
//! # Fetch Coordinator
//!
//! Owns every in-flight remote request of a session:
//!
//! - at most one job per [`FetchKey`]; later submitters join as waiters
//! - jobs run on the blocking pool behind a bounded semaphore
//! - completions come back over a queue and are only *accepted* by the owning
//!   thread, which checks the generation captured at submission
//!
//! Cancelling a key forgets it, so a late completion no longer matches and is
//! dropped without effect.

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::thumbnail_cache::{ThumbnailHandle, ThumbnailKey};
use crate::error::{LoaderError, LoaderResult};
use crate::model::entity::PublishRecord;
use crate::model::tree::{NodeId, NodeSpec};
use crate::tasks::fetch_task::{FetchJob, spawn_fetch};

pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    Children,
    Publishes,
}

/// Dedup key: one in-flight request per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchKey {
    Node {
        tab: usize,
        node: NodeId,
        kind: FetchKind,
    },
    Thumbnail(ThumbnailKey),
}

impl FetchKey {
    #[must_use]
    pub const fn children(tab: usize, node: NodeId) -> Self {
        Self::Node {
            tab,
            node,
            kind: FetchKind::Children,
        }
    }

    #[must_use]
    pub const fn publishes(tab: usize, node: NodeId) -> Self {
        Self::Node {
            tab,
            node,
            kind: FetchKind::Publishes,
        }
    }

    const fn tab(&self) -> Option<usize> {
        match self {
            Self::Node { tab, .. } => Some(*tab),
            Self::Thumbnail(_) => None,
        }
    }
}

impl fmt::Display for FetchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { tab, node, kind } => write!(f, "tab{tab}/{node}/{kind:?}"),
            Self::Thumbnail(key) => write!(f, "thumbnail/{key}"),
        }
    }
}

/// What a worker produced.
#[derive(Debug, Clone)]
pub enum FetchPayload {
    Children(Vec<NodeSpec>),
    Publishes(Arc<Vec<PublishRecord>>),
    Thumbnail(ThumbnailHandle),
}

pub type FetchOutcome = LoaderResult<FetchPayload>;

/// Worker → owning thread message.
#[derive(Debug)]
pub struct Completion {
    pub key: FetchKey,
    pub generation: u64,
    pub outcome: Arc<FetchOutcome>,
}

/// Handle returned by [`FetchCoordinator::submit`].
#[derive(Debug)]
pub struct FetchTicket {
    pub key: FetchKey,
    pub generation: u64,
    /// The request joined one already in flight.
    pub joined: bool,
    receiver: oneshot::Receiver<Arc<FetchOutcome>>,
}

impl FetchTicket {
    /// Resolves once the owning thread accepts the completion. A cancelled
    /// request yields `Cancelled`.
    pub async fn wait(self) -> LoaderResult<Arc<FetchOutcome>> {
        self.receiver.await.map_err(|_| LoaderError::Cancelled)
    }

    /// Non-blocking poll.
    pub fn try_result(&mut self) -> Option<LoaderResult<Arc<FetchOutcome>>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(Ok(outcome)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(LoaderError::Cancelled)),
        }
    }
}

struct PendingFetch {
    generation: u64,
    waiters: Vec<oneshot::Sender<Arc<FetchOutcome>>>,
    token: CancellationToken,
}

pub struct FetchCoordinator {
    runtime: Handle,
    permits: Arc<Semaphore>,
    next_generation: u64,
    in_flight: AHashMap<FetchKey, PendingFetch>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl FetchCoordinator {
    #[must_use]
    pub fn new(runtime: Handle, max_workers: usize) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            next_generation: 1,
            in_flight: AHashMap::new(),
            completion_tx,
            completion_rx,
        }
    }

    /// Schedule `job` under `key`, or join the request already in flight.
    /// Returns immediately.
    pub fn submit<F>(&mut self, key: FetchKey, job: F) -> FetchTicket
    where
        F: FnOnce() -> FetchOutcome + Send + 'static,
    {
        let (tx, receiver) = oneshot::channel();

        if let Some(pending) = self.in_flight.get_mut(&key) {
            pending.waiters.push(tx);
            trace!(
                marker = "FETCH_COORDINATOR",
                operation_type = "fetch_joined",
                key = %key,
                waiters = pending.waiters.len(),
                "Joined in-flight fetch"
            );
            return FetchTicket {
                key,
                generation: pending.generation,
                joined: true,
                receiver,
            };
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let token = CancellationToken::new();

        spawn_fetch(
            &self.runtime,
            self.permits.clone(),
            token.clone(),
            key.clone(),
            generation,
            Box::new(job) as FetchJob,
            self.completion_tx.clone(),
        );

        debug!(
            marker = "FETCH_COORDINATOR",
            operation_type = "fetch_submitted",
            key = %key,
            generation,
            "Fetch submitted"
        );

        self.in_flight.insert(
            key.clone(),
            PendingFetch {
                generation,
                waiters: vec![tx],
                token,
            },
        );

        FetchTicket {
            key,
            generation,
            joined: false,
            receiver,
        }
    }

    /// Wait on a request already in flight without scheduling anything.
    pub fn join(&mut self, key: &FetchKey) -> Option<FetchTicket> {
        let pending = self.in_flight.get_mut(key)?;
        let (tx, receiver) = oneshot::channel();
        pending.waiters.push(tx);
        Some(FetchTicket {
            key: key.clone(),
            generation: pending.generation,
            joined: true,
            receiver,
        })
    }

    #[must_use]
    pub fn is_in_flight(&self, key: &FetchKey) -> bool {
        self.in_flight.contains_key(key)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Forget `key`. Its waiters observe `Cancelled`.
    pub fn cancel(&mut self, key: &FetchKey) -> bool {
        let Some(pending) = self.in_flight.remove(key) else {
            return false;
        };
        pending.token.cancel();
        debug!(
            marker = "FETCH_COORDINATOR",
            operation_type = "fetch_cancelled",
            key = %key,
            generation = pending.generation,
            "Fetch cancelled"
        );
        true
    }

    /// Cancel every key matching `predicate`; returns how many were dropped.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&FetchKey) -> bool) -> usize {
        let doomed: Vec<FetchKey> = self.in_flight.keys().filter(|k| predicate(*k)).cloned().collect();
        for key in &doomed {
            self.cancel(key);
        }
        doomed.len()
    }

    pub fn cancel_tab(&mut self, tab: usize) -> usize {
        self.cancel_where(|key| key.tab() == Some(tab))
    }

    /// Cancel every fetch for the given nodes of `tab`.
    pub fn cancel_nodes(&mut self, tab: usize, nodes: &[NodeId]) -> usize {
        if nodes.is_empty() {
            return 0;
        }
        self.cancel_where(|key| matches!(key, FetchKey::Node { tab: t, node, .. } if *t == tab && nodes.contains(node)))
    }

    pub fn cancel_all(&mut self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Match `completion` against the in-flight table. Returns the outcome
    /// only when the generation is current; waiters are notified with the
    /// same shared result.
    pub fn accept(&mut self, completion: Completion) -> Option<(FetchKey, Arc<FetchOutcome>)> {
        let Completion {
            key,
            generation,
            outcome,
        } = completion;

        match self.in_flight.get(&key) {
            Some(pending) if pending.generation == generation => {}
            _ => {
                debug!(
                    marker = "FETCH_COORDINATOR",
                    operation_type = "stale_completion",
                    key = %key,
                    generation,
                    "Dropping stale completion"
                );
                return None;
            }
        }

        let pending = self.in_flight.remove(&key)?;
        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
        Some((key, outcome))
    }

    /// Next queued completion without waiting.
    pub fn try_next(&mut self) -> Option<Completion> {
        self.completion_rx.try_recv().ok()
    }

    /// Wait for the next completion. `None` when nothing is in flight and
    /// the queue is empty.
    pub async fn next(&mut self) -> Option<Completion> {
        if let Some(completion) = self.try_next() {
            return Some(completion);
        }
        if self.in_flight.is_empty() {
            return None;
        }
        self.completion_rx.recv().await
    }
}

impl Drop for FetchCoordinator {
    fn drop(&mut self) {
        for pending in self.in_flight.values() {
            pending.token.cancel();
        }
    }
}

impl fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("in_flight", &self.in_flight.len())
            .field("available_workers", &self.permits.available_permits())
            .field("next_generation", &self.next_generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Gate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_job(calls: Arc<AtomicUsize>, gate: Arc<Gate>) -> impl FnOnce() -> FetchOutcome + Send + 'static {
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            gate.wait();
            Ok(FetchPayload::Publishes(Arc::new(Vec::new())))
        }
    }

    /// First accepted completion; stale ones are skipped.
    async fn drain_one(coordinator: &mut FetchCoordinator) -> Option<(FetchKey, Arc<FetchOutcome>)> {
        loop {
            let completion = tokio::time::timeout(Duration::from_secs(5), coordinator.next())
                .await
                .expect("completion in time")?;
            if let Some(accepted) = coordinator.accept(completion) {
                return Some(accepted);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_same_key_runs_once_and_shares_result() {
        let mut coordinator = FetchCoordinator::new(Handle::current(), 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Gate::closed());
        let key = FetchKey::publishes(0, NodeId(3));

        let first = coordinator.submit(key.clone(), counting_job(calls.clone(), gate.clone()));
        let second = coordinator.submit(key.clone(), counting_job(calls.clone(), gate.clone()));
        assert!(!first.joined);
        assert!(second.joined);
        assert_eq!(coordinator.in_flight_count(), 1);

        gate.open();
        let (accepted, _) = drain_one(&mut coordinator).await.unwrap();
        assert_eq!(accepted, key);

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancelled_completion_is_dropped() {
        let mut coordinator = FetchCoordinator::new(Handle::current(), 1);
        let gate = Arc::new(Gate::closed());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = FetchKey::children(1, NodeId(0));

        let ticket = coordinator.submit(key.clone(), counting_job(calls.clone(), gate.clone()));
        // Let the worker start so the late completion really arrives.
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(coordinator.cancel(&key));
        gate.open();

        let late = tokio::time::timeout(Duration::from_secs(5), coordinator.completion_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.accept(late).is_none());
        assert!(matches!(ticket.wait().await, Err(LoaderError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resubmission_after_cancel_gets_new_generation() {
        let mut coordinator = FetchCoordinator::new(Handle::current(), 1);
        let gate = Arc::new(Gate::closed());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = FetchKey::publishes(0, NodeId(1));

        let old = coordinator.submit(key.clone(), counting_job(calls.clone(), gate.clone()));
        coordinator.cancel(&key);
        let new = coordinator.submit(key.clone(), counting_job(calls.clone(), gate.clone()));
        assert!(new.generation > old.generation);
        assert!(!new.joined);

        gate.open();
        let accepted = drain_one(&mut coordinator).await;
        assert!(accepted.is_some());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cancel_tab_leaves_other_tabs() {
        let mut coordinator = FetchCoordinator::new(Handle::current(), 1);
        let gate = Arc::new(Gate::closed());
        let calls = Arc::new(AtomicUsize::new(0));

        coordinator.submit(FetchKey::children(0, NodeId(0)), counting_job(calls.clone(), gate.clone()));
        coordinator.submit(FetchKey::children(1, NodeId(0)), counting_job(calls.clone(), gate.clone()));
        coordinator.submit(FetchKey::Thumbnail("abc".into()), counting_job(calls, gate.clone()));

        assert_eq!(coordinator.cancel_tab(0), 1);
        assert_eq!(coordinator.in_flight_count(), 2);
        gate.open();
    }
}
