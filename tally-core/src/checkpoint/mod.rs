//! Checkpoint and version state.
//!
//! A [`CheckpointState`] records the last committed model state of a rank and
//! the version number that identifies it. The version starts at 0 and grows by
//! exactly one per successful commit, whether full or lazy. It is never
//! observable half-way through a commit: payloads are serialized before the
//! state is touched, so a failed serialization leaves the previous checkpoint
//! and its version in place.
//!
//! There are two kinds of commit:
//! - A full commit stores the serialized global model and, optionally, the
//!   serialized local model.
//! - A lazy commit stores a shared reference to a global model that the caller
//!   guarantees is identical on every rank, and no local model. Serialization
//!   is deferred until a recovering rank actually reads the checkpoint.
//!
//! The state is owned by whoever plays the engine's role of durable storage;
//! in this crate that is the
//! [`InMemoryGroup`](crate::engine::in_memory::InMemoryGroup). Application code
//! reaches it only through the [`Communicator`](crate::collective::Communicator)
//! checkpoint calls.
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use crate::serializer::{Serializable, Serializer};

/// A global model committed by reference, serialized only when read back.
pub trait LazySnapshot: Send + Sync {
    /// Serialize the referenced model.
    fn snapshot(&self) -> Result<Bytes>;
}

/// A shared model paired with the serializer used to snapshot it.
///
/// Mutating the model through [`Arc::make_mut`] while a lazy checkpoint holds
/// it clones the model first, so the checkpoint keeps seeing the committed
/// value.
pub struct LazyModel<G> {
    model: Arc<G>,
    serializer: Serializer,
}

impl<G> LazyModel<G> {
    pub fn new(model: Arc<G>, serializer: Serializer) -> Self {
        Self { model, serializer }
    }
}

impl<G: Serializable> LazySnapshot for LazyModel<G> {
    fn snapshot(&self) -> Result<Bytes> {
        Ok(self.serializer.to_bytes(self.model.as_ref())?.into())
    }
}

/// Which kind of commit produced the current checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointKind {
    Full,
    Lazy,
}

#[derive(Clone)]
enum Committed {
    Full {
        global: Bytes,
        local: Option<Bytes>,
    },
    Lazy(Arc<dyn LazySnapshot>),
}

/// A checkpoint read back for recovery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Restored {
    /// Version of the restored checkpoint.
    pub version: u64,
    /// Serialized global model.
    pub global: Bytes,
    /// Serialized local model, if one was committed.
    pub local: Option<Bytes>,
}

/// The committed checkpoint of one rank.
#[derive(Clone, Default)]
pub struct CheckpointState {
    version: u64,
    committed: Option<Committed>,
}

impl std::fmt::Debug for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointState")
            .field("version", &self.version)
            .field("kind", &self.kind())
            .finish()
    }
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Version of the last committed checkpoint, 0 if none.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Kind of the last committed checkpoint, if any.
    pub fn kind(&self) -> Option<CheckpointKind> {
        match self.committed {
            Some(Committed::Full { .. }) => Some(CheckpointKind::Full),
            Some(Committed::Lazy(_)) => Some(CheckpointKind::Lazy),
            None => None,
        }
    }

    /// Commit serialized models and return the new version.
    pub fn commit(&mut self, global: Bytes, local: Option<Bytes>) -> u64 {
        self.committed = Some(Committed::Full { global, local });
        self.bump(CheckpointKind::Full)
    }

    /// Commit a global model by reference and return the new version.
    pub fn commit_lazy(&mut self, global: Arc<dyn LazySnapshot>) -> u64 {
        self.committed = Some(Committed::Lazy(global));
        self.bump(CheckpointKind::Lazy)
    }

    fn bump(&mut self, kind: CheckpointKind) -> u64 {
        self.version += 1;
        debug!(version = self.version, ?kind, "checkpoint committed");
        self.version
    }

    /// Read the committed checkpoint back, serializing a lazy global model
    /// now. Returns `None` if nothing was ever committed.
    pub fn restore(&self) -> Result<Option<Restored>> {
        let restored = match &self.committed {
            None => return Ok(None),
            Some(Committed::Full { global, local }) => Restored {
                version: self.version,
                global: global.clone(),
                local: local.clone(),
            },
            Some(Committed::Lazy(model)) => Restored {
                version: self.version,
                global: model.snapshot()?,
                local: None,
            },
        };

        Ok(Some(restored))
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Weights(Vec<f32>);

    #[test]
    fn starts_empty_at_version_zero() {
        let state = CheckpointState::new();

        assert_eq!(state.version(), 0);
        assert_eq!(state.kind(), None);
        assert_eq!(state.restore().unwrap(), None);
    }

    #[test]
    fn every_commit_bumps_version_by_one() {
        let mut state = CheckpointState::new();
        let lazy: Arc<dyn LazySnapshot> = Arc::new(LazyModel::new(
            Arc::new(Weights(vec![1.0])),
            Serializer::Postcard,
        ));

        let mut versions = vec![];
        for i in 0..6u8 {
            let version = if i % 2 == 0 {
                state.commit(Bytes::from(vec![i]), None)
            } else {
                state.commit_lazy(lazy.clone())
            };
            versions.push(version);
            assert_eq!(state.version(), version);
        }

        assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn full_commit_restores_both_models() {
        let mut state = CheckpointState::new();
        state.commit(Bytes::from_static(b"global"), Some(Bytes::from_static(b"local")));

        assert_eq!(state.kind(), Some(CheckpointKind::Full));
        assert_eq!(
            state.restore().unwrap(),
            Some(Restored {
                version: 1,
                global: Bytes::from_static(b"global"),
                local: Some(Bytes::from_static(b"local")),
            })
        );
    }

    #[test]
    fn lazy_commit_serializes_on_restore() {
        let serializer = Serializer::Cbor;
        let mut model = Arc::new(Weights(vec![0.5, 1.5]));
        let mut state = CheckpointState::new();
        state.commit_lazy(Arc::new(LazyModel::new(model.clone(), serializer)));

        // Copy-on-write keeps the committed value intact.
        Arc::make_mut(&mut model).0.push(9.0);

        let restored = state.restore().unwrap().unwrap();
        assert_eq!(state.kind(), Some(CheckpointKind::Lazy));
        assert_eq!(restored.version, 1);
        assert_eq!(restored.local, None);
        assert_eq!(
            serializer.from_bytes::<Weights>(&restored.global).unwrap(),
            Weights(vec![0.5, 1.5])
        );
    }
}
