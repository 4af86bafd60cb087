//! The typed collective API.
//!
//! A [`Communicator`] wraps one rank's [`Engine`] and exposes the operations
//! application code is written against:
//!
//! - Topology queries: [`Communicator::rank`], [`Communicator::world_size`],
//!   [`Communicator::processor_name`].
//! - Broadcasts of raw bytes, fixed-layout vectors, strings and serializable
//!   objects. Vectors and strings are resized on the receiving side to match
//!   the root.
//! - Builtin allreduces over the eight [`WireScalar`] types with the operators
//!   of [`crate::operation`]. User-defined element types go through the handles
//!   of [`crate::reducer`].
//! - Checkpointing: [`Communicator::checkpoint`],
//!   [`Communicator::lazy_checkpoint`], [`Communicator::load_checkpoint`] and
//!   [`Communicator::version_number`].
//!
//! Every collective must be called by all ranks of the group, in the same
//! order, with matching arguments. A call completes before it returns.
//!
//! # Recovery
//!
//! A program that wants to survive restarts calls
//! [`Communicator::load_checkpoint`] before its first collective. A return
//! value of 0 means nothing was ever committed and the program starts from
//! scratch; otherwise its models are restored and it resumes from the restored
//! version.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tally::{engine::in_memory::InMemoryGroup, operation::Sum};
//! use anyhow::Result;
//!
//! #[derive(Serialize, Deserialize, Default)]
//! struct Model {
//!     weights: Vec<f32>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let group = InMemoryGroup::new(2)?;
//!     group
//!         .run(|comm| async move {
//!             let mut model = Model::default();
//!             let start = comm.load_checkpoint(&mut model, None::<&mut ()>).await?;
//!             for _ in start..3 {
//!                 let mut grad = [1.0f32];
//!                 comm.allreduce::<Sum, f32>(&mut grad, None).await?;
//!                 model.weights.push(grad[0]);
//!                 comm.checkpoint(&model, None::<&()>).await?;
//!             }
//!             assert_eq!(comm.version_number(), 3);
//!             Ok(())
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::{
    checkpoint::LazyModel,
    engine::{abandon_with, Engine},
    error::CollectiveError,
    operation::Operator,
    reducer::{self, Prepare, ReduceHandle},
    serializer::{Serializable, Serializer},
    wire::{self, FixedLayout, WireScalar},
};

/// One rank's handle on the group.
pub struct Communicator<E> {
    engine: E,
    serializer: Serializer,
}

impl<E: Engine> std::fmt::Debug for Communicator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.engine.rank())
            .field("world_size", &self.engine.world_size())
            .field("serializer", &self.serializer)
            .finish()
    }
}

impl<E: Engine> Communicator<E> {
    pub fn new(engine: E) -> Self {
        Self::with_serializer(engine, Serializer::default())
    }

    pub fn with_serializer(engine: E, serializer: Serializer) -> Self {
        Self { engine, serializer }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Rank of this participant, in `0..world_size`.
    pub fn rank(&self) -> usize {
        self.engine.rank()
    }

    /// Number of participants in the group.
    pub fn world_size(&self) -> usize {
        self.engine.world_size()
    }

    /// Name of the host this participant runs on.
    pub fn processor_name(&self) -> String {
        self.engine.host_name()
    }

    fn check_root(&self, root: usize) -> Result<()> {
        let world_size = self.world_size();
        if root >= world_size {
            return Err(CollectiveError::RootOutOfRange { root, world_size }.into());
        }
        Ok(())
    }

    /// Copy `buf` from `root` to every rank. `buf` must have the same length
    /// everywhere.
    #[instrument(skip(self, buf), fields(rank = self.rank(), len = buf.len()), level = "debug")]
    pub async fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        self.check_root(root)?;
        self.engine.broadcast(buf, root).await
    }

    /// Copy `buf` from `root` to every rank, resizing receivers to the root's
    /// length.
    ///
    /// The length travels first, as a little-endian `u64`. The payload is only
    /// sent when it is non-empty.
    #[instrument(skip(self, buf), fields(rank = self.rank()), level = "debug")]
    pub async fn broadcast_vec<T: FixedLayout>(&self, buf: &mut Vec<T>, root: usize) -> Result<()> {
        self.check_root(root)?;

        let mut header = (buf.len() as u64).to_le_bytes();
        self.engine.broadcast(&mut header, root).await?;
        let declared = u64::from_le_bytes(header);
        let len = usize::try_from(declared).map_err(|_| CollectiveError::LengthOverflow(declared))?;

        if buf.len() != len {
            debug!(from = buf.len(), to = len, "resizing receive buffer");
            buf.resize_with(len, T::zeroed);
        }
        if len == 0 {
            return Ok(());
        }

        let mut bytes = wire::encode_all(buf);
        self.engine.broadcast(&mut bytes, root).await?;
        wire::decode_into(&bytes, buf);

        Ok(())
    }

    /// Copy a string from `root` to every rank.
    ///
    /// On failure the receiving string is left empty.
    pub async fn broadcast_string(&self, buf: &mut String, root: usize) -> Result<()> {
        let mut bytes = std::mem::take(buf).into_bytes();
        self.broadcast_vec(&mut bytes, root).await?;
        *buf = String::from_utf8(bytes).map_err(CollectiveError::from)?;

        Ok(())
    }

    /// Copy a serializable object from `root` to every rank.
    ///
    /// If the root fails to serialize the object, it abandons the broadcast
    /// and the call fails on every rank.
    pub async fn broadcast_object<T: Serializable>(&self, obj: &mut T, root: usize) -> Result<()> {
        self.check_root(root)?;

        let is_root = self.rank() == root;
        let mut bytes = if is_root {
            match self.serializer.to_bytes(&*obj) {
                Ok(bytes) => bytes,
                Err(err) => return Err(abandon_with(&self.engine, err).await),
            }
        } else {
            Vec::new()
        };
        self.broadcast_vec(&mut bytes, root).await?;
        if !is_root {
            *obj = self.serializer.from_bytes(&bytes)?;
        }

        Ok(())
    }

    /// Combine `buf` element-wise across all ranks with `Op`, in place.
    ///
    /// `prepare`, if given, fills in the local contribution right before the
    /// exchange. It is skipped when the result is replayed after a restart.
    #[instrument(skip(self, buf, prepare), fields(rank = self.rank(), count = buf.len(), op = %Op::TAG, ty = %T::TAG), level = "debug")]
    pub async fn allreduce<Op: Operator<T>, T: WireScalar>(
        &self,
        buf: &mut [T],
        prepare: Option<Prepare<'_, T>>,
    ) -> Result<()> {
        reducer::allreduce_fixed(&ReduceHandle::builtin::<Op, T>(), &self.engine, buf, prepare).await
    }

    /// Relay `msg` to the tracker.
    pub async fn tracker_print(&self, msg: impl AsRef<str>) -> Result<()> {
        self.engine.tracker_print(msg.as_ref()).await
    }

    /// Restore the models of the last checkpoint.
    ///
    /// Returns the restored version, or 0 if nothing was ever committed, in
    /// which case the models are left untouched. A local model is restored
    /// only if `local` is given and the checkpoint holds one.
    #[instrument(skip_all, fields(rank = self.rank()), level = "debug")]
    pub async fn load_checkpoint<G, L>(&self, global: &mut G, local: Option<&mut L>) -> Result<u64>
    where
        G: Serializable,
        L: Serializable,
    {
        let Some(restored) = self.engine.load_checkpoint().await? else {
            return Ok(0);
        };

        let restored_global: G = self.serializer.from_bytes(&restored.global)?;
        let restored_local = match (local.is_some(), &restored.local) {
            (true, Some(bytes)) => Some(self.serializer.from_bytes::<L>(bytes)?),
            _ => None,
        };
        *global = restored_global;
        if let (Some(local), Some(restored_local)) = (local, restored_local) {
            *local = restored_local;
        }
        debug!(version = restored.version, "restored checkpoint");

        Ok(restored.version)
    }

    /// Commit the models, bumping the version by one.
    ///
    /// Models are serialized before anything is committed; if serialization
    /// fails the previous checkpoint and version stay in place.
    #[instrument(skip_all, fields(rank = self.rank()), level = "debug")]
    pub async fn checkpoint<G, L>(&self, global: &G, local: Option<&L>) -> Result<()>
    where
        G: Serializable,
        L: Serializable,
    {
        let global = Bytes::from(self.serializer.to_bytes(global)?);
        let local = match local {
            Some(local) => Some(Bytes::from(self.serializer.to_bytes(local)?)),
            None => None,
        };
        self.engine.checkpoint(global, local).await?;

        Ok(())
    }

    /// Commit a global model by reference, bumping the version by one.
    ///
    /// The model must be identical on every rank. It is serialized only if a
    /// recovering rank reads the checkpoint back; mutate it through
    /// [`Arc::make_mut`] so the committed value stays intact.
    #[instrument(skip_all, fields(rank = self.rank()), level = "debug")]
    pub async fn lazy_checkpoint<G: Serializable>(&self, global: &Arc<G>) -> Result<()> {
        let snapshot = LazyModel::new(global.clone(), self.serializer);
        self.engine.lazy_checkpoint(Arc::new(snapshot)).await?;

        Ok(())
    }

    /// Version of the last committed checkpoint, 0 if none.
    pub fn version_number(&self) -> u64 {
        self.engine.version_number()
    }
}
