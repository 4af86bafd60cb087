//! The transport engine interface.
//!
//! An [`Engine`] is the fault-tolerant layer underneath the typed collectives:
//! it knows the group topology, moves opaque byte buffers between ranks,
//! combines them with a caller-supplied function, and keeps the durable
//! checkpoint state used for recovery. Typed code never talks to it directly;
//! the [`Communicator`](crate::collective::Communicator) and the reducer
//! handles translate typed buffers into the byte-level calls defined here.
//!
//! # Replay
//! When a rank restarts after a failure, it re-executes the collective calls
//! made since its last checkpoint. An engine that still holds the result of
//! such a call copies the cached result into the buffer and skips the
//! [`BytePrepare`] step entirely. Otherwise the prepare step runs exactly once,
//! before any bytes leave the rank.
//!
//! # Abandoned calls
//! A rank whose local step fails before it contributes to a call, such as a
//! prepare step that returns an error or an object that cannot be encoded,
//! still settles the call with [`Engine::abandon`]. The call then fails on
//! every other rank with an error naming the abandoning rank, instead of
//! leaving them waiting for a contribution that never comes.
//!
//! Tally provides one engine out of the box,
//! [`InMemoryGroup`](in_memory::InMemoryGroup), which emulates a group of
//! ranks inside a single process.
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::{
    checkpoint::{LazySnapshot, Restored},
    operation::OpTag,
    wire::WireType,
};

/// A combine function over arrays of elements.
///
/// It is called with a source and a destination range of equal length, and
/// the size in bytes of one element. It folds every source element into the
/// matching destination element.
pub type CombineFn = dyn Fn(&[u8], &mut [u8], usize) -> Result<()> + Send + Sync;

/// A step that materializes the local contribution into the byte buffer about
/// to be reduced.
pub type BytePrepare<'a> = Box<dyn FnOnce(&mut [u8]) -> Result<()> + Send + 'a>;

/// The shape of an allreduce, as handed to an [`Engine`].
#[derive(Clone, Copy)]
pub struct ReduceCall<'a> {
    /// Size in bytes of one element.
    pub elem_size: usize,
    /// Number of elements in the buffer.
    pub count: usize,
    /// How two element arrays are combined.
    pub combine: &'a CombineFn,
    /// Element type and operator, for builtin reductions. Custom reductions
    /// have no tags.
    pub tags: Option<(WireType, OpTag)>,
}

impl std::fmt::Debug for ReduceCall<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceCall")
            .field("elem_size", &self.elem_size)
            .field("count", &self.count)
            .field("tags", &self.tags)
            .finish()
    }
}

/// A fault-tolerant transport engine.
///
/// Every collective method must be called by all ranks of the group in the
/// same order. Calls complete before they return.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Rank of this participant.
    fn rank(&self) -> usize;

    /// Number of participants in the group.
    fn world_size(&self) -> usize;

    /// Name of the host this participant runs on.
    fn host_name(&self) -> String;

    /// Copy `buf` from `root` into `buf` on every other rank.
    async fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()>;

    /// Combine `buf` across all ranks in place.
    ///
    /// `buf` holds `call.count` elements of `call.elem_size` bytes. `prepare`
    /// runs at most once, before any exchange, and not at all when the result
    /// of this call is replayed from cache.
    async fn allreduce(
        &self,
        buf: &mut [u8],
        call: ReduceCall<'_>,
        prepare: Option<BytePrepare<'_>>,
    ) -> Result<()>;

    /// Take part in the next collective call without contributing to it.
    ///
    /// The call fails on every rank; the others see `reason` along with this
    /// rank. Returns without waiting for the other ranks.
    async fn abandon(&self, reason: &str) -> Result<()>;

    /// Relay a message to the tracker.
    async fn tracker_print(&self, msg: &str) -> Result<()>;

    /// Read back the latest checkpoint of this rank, if any.
    async fn load_checkpoint(&self) -> Result<Option<Restored>>;

    /// Commit serialized models and return the new version.
    async fn checkpoint(&self, global: Bytes, local: Option<Bytes>) -> Result<u64>;

    /// Commit a global model by reference and return the new version.
    async fn lazy_checkpoint(&self, global: Arc<dyn LazySnapshot>) -> Result<u64>;

    /// Version of the last committed checkpoint.
    fn version_number(&self) -> u64;
}

#[async_trait]
impl<E: Engine + ?Sized> Engine for Arc<E> {
    fn rank(&self) -> usize {
        (**self).rank()
    }

    fn world_size(&self) -> usize {
        (**self).world_size()
    }

    fn host_name(&self) -> String {
        (**self).host_name()
    }

    async fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        (**self).broadcast(buf, root).await
    }

    async fn allreduce(
        &self,
        buf: &mut [u8],
        call: ReduceCall<'_>,
        prepare: Option<BytePrepare<'_>>,
    ) -> Result<()> {
        (**self).allreduce(buf, call, prepare).await
    }

    async fn abandon(&self, reason: &str) -> Result<()> {
        (**self).abandon(reason).await
    }

    async fn tracker_print(&self, msg: &str) -> Result<()> {
        (**self).tracker_print(msg).await
    }

    async fn load_checkpoint(&self) -> Result<Option<Restored>> {
        (**self).load_checkpoint().await
    }

    async fn checkpoint(&self, global: Bytes, local: Option<Bytes>) -> Result<u64> {
        (**self).checkpoint(global, local).await
    }

    async fn lazy_checkpoint(&self, global: Arc<dyn LazySnapshot>) -> Result<u64> {
        (**self).lazy_checkpoint(global).await
    }

    fn version_number(&self) -> u64 {
        (**self).version_number()
    }
}

/// Abandon the next call of `engine` because of `err`, and hand `err` back.
pub(crate) async fn abandon_with<E: Engine + ?Sized>(engine: &E, err: anyhow::Error) -> anyhow::Error {
    if let Err(abandon_err) = engine.abandon(&format!("{err:#}")).await {
        warn!(rank = engine.rank(), "failed to abandon collective call: {abandon_err:#}");
    }
    err
}

pub mod in_memory;
