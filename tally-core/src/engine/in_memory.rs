//! An in-memory implementation of [`Engine`].
//!
//! This implementation emulates a group of ranks inside a single process, and
//! is useful for testing and debugging collective code without a cluster. It
//! uses asynchronous synchronization primitives to faithfully emulate the
//! rendezvous semantics of a real transport, and is well suited for a
//! multi-threaded asynchronous runtime.
//!
//! Every rank gets its own [`InMemoryEngine`]. All engines of an
//! [`InMemoryGroup`] share the same underlying state:
//! - The pending rounds. A round collects one contribution per rank and is
//!   completed by the last rank to arrive, which folds the contributions in
//!   rank order and publishes the outcome to the others. A rank that abandons
//!   a call deposits its failure instead of a contribution, and the round
//!   fails on every rank.
//! - The replay cache. The result of every completed round is kept, keyed by
//!   the checkpoint version and the position of the call since that checkpoint.
//!   Results older than the oldest checkpoint of the group are pruned.
//! - The durable checkpoint of every rank.
//!
//! Asking the group for a fresh engine of an existing rank emulates a restart
//! of that rank: the new engine starts counting calls from zero, and replays
//! cached results until it catches up with the rest of the group.
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, instrument, warn};

use super::{BytePrepare, Engine, ReduceCall};
use crate::{
    checkpoint::{CheckpointState, LazySnapshot, Restored},
    collective::Communicator,
    config::Config,
    error::CollectiveError,
    operation::OpTag,
    serializer::Serializer,
    wire::WireType,
};

/// Identifies a collective call: the checkpoint version it was issued under,
/// and its position among the calls issued since that checkpoint.
type CallKey = (u64, u64);

/// The outcome of a round, as seen by the ranks that did not complete it.
type Outcome = Option<std::result::Result<Bytes, String>>;

/// One rank's side of a collective call.
#[derive(Debug)]
enum Contribution {
    Reduce {
        bytes: Vec<u8>,
        elem_size: usize,
        count: usize,
        tags: Option<(WireType, OpTag)>,
    },
    Broadcast {
        root: usize,
        len: usize,
        payload: Option<Vec<u8>>,
    },
    Failed {
        message: String,
    },
}

struct Round {
    contributions: Mutex<Vec<Option<Contribution>>>,
    outcome: watch::Sender<Outcome>,
}

impl Round {
    fn new(world_size: usize) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            contributions: Mutex::new((0..world_size).map(|_| None).collect()),
            outcome,
        }
    }
}

/// A message relayed to the tracker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerMessage {
    pub rank: usize,
    pub message: String,
}

struct GroupState {
    world_size: usize,
    rounds: DashMap<CallKey, Arc<Round>>,
    replay: SkipMap<CallKey, Bytes>,
    checkpoints: DashMap<usize, CheckpointState>,
    tracker: Mutex<Vec<TrackerMessage>>,
}

impl GroupState {
    fn version(&self, rank: usize) -> u64 {
        self.checkpoints
            .get(&rank)
            .map_or(0, |state| state.version())
    }

    /// Drop cached results no restarted rank can ask for anymore.
    fn prune(&self) {
        let Some(oldest) = (0..self.world_size).map(|rank| self.version(rank)).min() else {
            return;
        };

        let mut pruned = 0usize;
        while let Some(entry) = self.replay.front() {
            if entry.key().0 >= oldest {
                break;
            }
            entry.remove();
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, oldest, "pruned replay cache");
        }
    }
}

/// A group of ranks emulated in memory.
///
/// ```
/// use tally::{engine::in_memory::InMemoryGroup, operation::Sum};
/// use anyhow::Result;
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let group = InMemoryGroup::new(4)?;
///     let sums = group
///         .run(|comm| async move {
///             let mut buf = [comm.rank() as i32];
///             comm.allreduce::<Sum, i32>(&mut buf, None).await?;
///             Ok(buf[0])
///         })
///         .await?;
///
///     assert_eq!(sums, vec![6; 4]);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryGroup {
    state: Arc<GroupState>,
    serializer: Serializer,
}

impl InMemoryGroup {
    /// Create a group of `world_size` ranks.
    pub fn new(world_size: usize) -> Result<Self> {
        Self::with_serializer(world_size, Serializer::default())
    }

    /// Create a group whose communicators use `serializer`.
    pub fn with_serializer(world_size: usize, serializer: Serializer) -> Result<Self> {
        if world_size == 0 {
            return Err(CollectiveError::EmptyGroup.into());
        }

        Ok(Self {
            state: Arc::new(GroupState {
                world_size,
                rounds: DashMap::new(),
                replay: SkipMap::new(),
                checkpoints: DashMap::new(),
                tracker: Mutex::new(Vec::new()),
            }),
            serializer,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::with_serializer(config.world_size, config.into())
    }

    pub fn world_size(&self) -> usize {
        self.state.world_size
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// A fresh engine for `rank`.
    ///
    /// If an engine for `rank` already took part in collective calls, the new
    /// engine behaves like a restarted process: it issues calls from the start
    /// of its last checkpoint, and receives cached results for the calls the
    /// group already completed.
    pub fn engine(&self, rank: usize) -> Result<InMemoryEngine> {
        if rank >= self.state.world_size {
            return Err(CollectiveError::RankOutOfRange {
                rank,
                world_size: self.state.world_size,
            }
            .into());
        }

        Ok(InMemoryEngine {
            rank,
            seq: AtomicU64::new(0),
            group: self.state.clone(),
        })
    }

    /// Fresh engines for every rank, in rank order.
    pub fn engines(&self) -> Vec<InMemoryEngine> {
        (0..self.state.world_size)
            .map(|rank| InMemoryEngine {
                rank,
                seq: AtomicU64::new(0),
                group: self.state.clone(),
            })
            .collect()
    }

    /// A communicator over a fresh engine for `rank`.
    pub fn communicator(&self, rank: usize) -> Result<Communicator<InMemoryEngine>> {
        Ok(Communicator::with_serializer(
            self.engine(rank)?,
            self.serializer,
        ))
    }

    /// Communicators over fresh engines for every rank, in rank order.
    pub fn communicators(&self) -> Vec<Communicator<InMemoryEngine>> {
        self.engines()
            .into_iter()
            .map(|engine| Communicator::with_serializer(engine, self.serializer))
            .collect()
    }

    /// Run `f` once per rank, each on its own task, and collect the results in
    /// rank order.
    ///
    /// Fails with the first error returned by any rank. The tasks of the
    /// remaining ranks are aborted.
    pub async fn run<F, Fut, T>(&self, f: F) -> Result<Vec<T>>
    where
        F: Fn(Communicator<InMemoryEngine>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handles = self
            .communicators()
            .into_iter()
            .map(|comm| tokio::spawn(f(comm)))
            .collect::<Vec<_>>();
        let aborts = handles
            .iter()
            .map(JoinHandle::abort_handle)
            .collect::<Vec<_>>();

        let result =
            futures::future::try_join_all(handles.into_iter().map(|task| async move { task.await? }))
                .await;
        if result.is_err() {
            for abort in &aborts {
                abort.abort();
            }
        }

        result
    }

    /// Messages relayed to the tracker so far, in arrival order.
    pub async fn tracker_log(&self) -> Vec<TrackerMessage> {
        self.state.tracker.lock().await.clone()
    }

    /// Number of results held by the replay cache.
    pub fn cached_results(&self) -> usize {
        self.state.replay.len()
    }
}

/// The engine of a single rank of an [`InMemoryGroup`].
pub struct InMemoryEngine {
    rank: usize,
    seq: AtomicU64,
    group: Arc<GroupState>,
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine")
            .field("rank", &self.rank)
            .field("world_size", &self.group.world_size)
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .finish()
    }
}

impl InMemoryEngine {
    fn next_call(&self) -> CallKey {
        (
            self.group.version(self.rank),
            self.seq.fetch_add(1, Ordering::SeqCst),
        )
    }

    fn cached(&self, key: CallKey) -> Option<Bytes> {
        self.group.replay.get(&key).map(|entry| entry.value().clone())
    }

    fn round(&self, key: CallKey) -> Arc<Round> {
        self.group
            .rounds
            .entry(key)
            .or_insert_with(|| Arc::new(Round::new(self.group.world_size)))
            .clone()
    }

    /// Deposit this rank's contribution to `round`. Returns every contribution
    /// of the round if this rank was the last to arrive.
    async fn deposit(&self, round: &Round, contribution: Contribution) -> Option<Vec<Contribution>> {
        let mut contributions = round.contributions.lock().await;
        contributions[self.rank] = Some(contribution);
        if contributions.iter().all(Option::is_some) {
            Some(contributions.iter_mut().filter_map(Option::take).collect())
        } else {
            None
        }
    }

    /// Publish the outcome of the round `key` to the ranks waiting on it.
    fn settle(&self, key: CallKey, round: &Round, result: &Result<Bytes>) {
        match result {
            Ok(bytes) => {
                self.group.replay.insert(key, bytes.clone());
                round.outcome.send_replace(Some(Ok(bytes.clone())));
            }
            Err(err) => {
                warn!(seq = key.1, "collective call failed: {err:#}");
                round.outcome.send_replace(Some(Err(format!("{err:#}"))));
            }
        }
        self.group.rounds.remove(&key);
    }

    /// Deposit this rank's contribution to the round `key`, and wait for the
    /// round's outcome.
    ///
    /// The last rank to arrive completes the round with `complete`, unless a
    /// rank abandoned it. Its own error is returned as is; the other ranks see
    /// it as [`CollectiveError::Aborted`].
    #[instrument(skip(self, contribution, complete), fields(rank = self.rank), level = "trace")]
    async fn rendezvous<F>(&self, key: CallKey, contribution: Contribution, complete: F) -> Result<Bytes>
    where
        F: FnOnce(Vec<Contribution>) -> Result<Bytes> + Send,
    {
        let round = self.round(key);
        let mut outcome = round.outcome.subscribe();

        if let Some(contributions) = self.deposit(&round, contribution).await {
            let result = match abandoned(key.1, &contributions) {
                Some(err) => Err(err.into()),
                None => complete(contributions),
            };
            self.settle(key, &round, &result);
            return result;
        }

        let outcome = outcome.wait_for(Option::is_some).await?.clone();
        match outcome {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(message)) => Err(CollectiveError::Aborted {
                seq: key.1,
                message,
            }
            .into()),
            None => Err(CollectiveError::Aborted {
                seq: key.1,
                message: "round closed without an outcome".to_string(),
            }
            .into()),
        }
    }

    /// Settle the round `key` with a failure of this rank, without waiting for
    /// the other ranks.
    ///
    /// Calls already completed by the group are left alone.
    async fn fail_call(&self, key: CallKey, message: String) {
        if self.cached(key).is_some() {
            return;
        }
        warn!(rank = self.rank, seq = key.1, "abandoning collective call: {message}");

        let round = self.round(key);
        let contribution = Contribution::Failed {
            message: message.clone(),
        };
        if let Some(contributions) = self.deposit(&round, contribution).await {
            let err = abandoned(key.1, &contributions).unwrap_or(CollectiveError::RankFailed {
                rank: self.rank,
                seq: key.1,
                message,
            });
            self.settle(key, &round, &Err(err.into()));
        }
    }

    /// Abandon the round `key` because of `err`, and hand `err` back.
    async fn abandon_call(&self, key: CallKey, err: anyhow::Error) -> anyhow::Error {
        self.fail_call(key, format!("{err:#}")).await;
        err
    }
}

/// The first rank that abandoned a round, if any.
fn abandoned(seq: u64, contributions: &[Contribution]) -> Option<CollectiveError> {
    contributions
        .iter()
        .enumerate()
        .find_map(|(rank, contribution)| match contribution {
            Contribution::Failed { message } => Some(CollectiveError::RankFailed {
                rank,
                seq,
                message: message.clone(),
            }),
            _ => None,
        })
}

/// Copy the result of call `seq` into `buf`.
fn fill(buf: &mut [u8], result: &[u8], seq: u64) -> Result<()> {
    if buf.len() != result.len() {
        return Err(CollectiveError::ResultSize {
            seq,
            result: result.len(),
            expected: buf.len(),
        }
        .into());
    }
    buf.copy_from_slice(result);
    Ok(())
}

/// Fold the contributions of a reduce round in rank order.
///
/// Every rank must agree with rank 0 on the shape of the call.
fn fold_reduce(seq: u64, call: ReduceCall<'_>, contributions: Vec<Contribution>) -> Result<Bytes> {
    let mismatch = |rank, what| CollectiveError::Mismatch { rank, seq, what };
    let mut contributions = contributions.into_iter().enumerate();

    let (mut acc, elem_size, count, tags) = match contributions.next() {
        Some((
            _,
            Contribution::Reduce {
                bytes,
                elem_size,
                count,
                tags,
            },
        )) => (bytes, elem_size, count, tags),
        _ => return Err(mismatch(0, "kind of call").into()),
    };
    for (rank, contribution) in contributions {
        let Contribution::Reduce {
            bytes,
            elem_size: their_elem_size,
            count: their_count,
            tags: their_tags,
        } = contribution
        else {
            return Err(mismatch(rank, "kind of call").into());
        };
        if their_elem_size != elem_size {
            return Err(mismatch(rank, "element size").into());
        }
        if their_count != count {
            return Err(mismatch(rank, "element count").into());
        }
        if their_tags != tags {
            return Err(mismatch(rank, "element type or operator").into());
        }
        (call.combine)(&bytes, &mut acc, elem_size)?;
    }

    Ok(acc.into())
}

/// Pick the root's payload out of a broadcast round.
///
/// Every rank must agree with rank 0 on the root and the buffer size.
fn resolve_broadcast(seq: u64, contributions: Vec<Contribution>) -> Result<Bytes> {
    let mismatch = |rank, what| CollectiveError::Mismatch { rank, seq, what };
    let mut shape = None;
    let mut result = None;

    for (rank, contribution) in contributions.into_iter().enumerate() {
        let Contribution::Broadcast { root, len, payload } = contribution else {
            return Err(mismatch(rank, "kind of call").into());
        };
        let (expected_root, expected_len) = *shape.get_or_insert((root, len));
        if root != expected_root {
            return Err(mismatch(rank, "root").into());
        }
        if len != expected_len {
            return Err(mismatch(rank, "buffer size").into());
        }
        if rank == root {
            result = payload;
        }
    }

    result.map(Bytes::from).ok_or_else(|| {
        CollectiveError::Aborted {
            seq,
            message: "the root contributed no payload".to_string(),
        }
        .into()
    })
}

#[async_trait]
impl Engine for InMemoryEngine {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn host_name(&self) -> String {
        format!("in-memory-{}", self.rank)
    }

    async fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        let key = self.next_call();
        if root >= self.group.world_size {
            let err = CollectiveError::RootOutOfRange {
                root,
                world_size: self.group.world_size,
            };
            return Err(self.abandon_call(key, err.into()).await);
        }

        if let Some(cached) = self.cached(key) {
            debug!(rank = self.rank, ?key, "replaying cached broadcast");
            return fill(buf, &cached, key.1);
        }

        let contribution = Contribution::Broadcast {
            root,
            len: buf.len(),
            payload: (self.rank == root).then(|| buf.to_vec()),
        };
        let result = self
            .rendezvous(key, contribution, move |contributions| {
                resolve_broadcast(key.1, contributions)
            })
            .await?;

        fill(buf, &result, key.1)
    }

    async fn allreduce(
        &self,
        buf: &mut [u8],
        call: ReduceCall<'_>,
        prepare: Option<BytePrepare<'_>>,
    ) -> Result<()> {
        let key = self.next_call();
        if call.elem_size.checked_mul(call.count) != Some(buf.len()) {
            let err = CollectiveError::BufferSize {
                actual: buf.len(),
                elem_size: call.elem_size,
                count: call.count,
            };
            return Err(self.abandon_call(key, err.into()).await);
        }

        if let Some(cached) = self.cached(key) {
            debug!(rank = self.rank, ?key, "replaying cached allreduce, prepare skipped");
            return fill(buf, &cached, key.1);
        }

        if let Some(prepare) = prepare {
            if let Err(err) = prepare(&mut *buf) {
                return Err(self.abandon_call(key, err).await);
            }
        }
        let contribution = Contribution::Reduce {
            bytes: buf.to_vec(),
            elem_size: call.elem_size,
            count: call.count,
            tags: call.tags,
        };
        let result = self
            .rendezvous(key, contribution, move |contributions| {
                fold_reduce(key.1, call, contributions)
            })
            .await?;

        fill(buf, &result, key.1)
    }

    async fn abandon(&self, reason: &str) -> Result<()> {
        let key = self.next_call();
        self.fail_call(key, reason.to_string()).await;
        Ok(())
    }

    async fn tracker_print(&self, msg: &str) -> Result<()> {
        info!(rank = self.rank, "{msg}");
        self.group.tracker.lock().await.push(TrackerMessage {
            rank: self.rank,
            message: msg.to_string(),
        });
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Restored>> {
        let state = self.group.checkpoints.get(&self.rank).map(|state| state.clone());
        self.seq.store(0, Ordering::SeqCst);

        match state {
            Some(state) => state.restore(),
            None => Ok(None),
        }
    }

    async fn checkpoint(&self, global: Bytes, local: Option<Bytes>) -> Result<u64> {
        let version = self
            .group
            .checkpoints
            .entry(self.rank)
            .or_default()
            .commit(global, local);
        self.seq.store(0, Ordering::SeqCst);
        self.group.prune();

        Ok(version)
    }

    async fn lazy_checkpoint(&self, global: Arc<dyn LazySnapshot>) -> Result<u64> {
        let version = self
            .group
            .checkpoints
            .entry(self.rank)
            .or_default()
            .commit_lazy(global);
        self.seq.store(0, Ordering::SeqCst);
        self.group.prune();

        Ok(version)
    }

    fn version_number(&self) -> u64 {
        self.group.version(self.rank)
    }
}
