#![cfg_attr(docsrs, feature(doc_cfg))]

//! Typed collectives for fault-tolerant data-parallel programs.
//!
//! Tally lets a group of ranks running the same program agree on shared state
//! through two collectives, allreduce and broadcast, and survive the restart
//! of a rank through versioned checkpoints.
//!
//! Features:
//! - **Typed collectives**: Reduce buffers of the eight native wire scalars
//!   with [`Max`](crate::operation::Max), [`Min`](crate::operation::Min),
//!   [`Sum`](crate::operation::Sum) and [`BitOr`](crate::operation::BitOr), or
//!   bring your own element type.
//! - **Derived reductions**: `#[derive(FixedLayout, Reduce)]` turns a plain
//!   struct into a reducible element, field by field.
//! - **Serialized reductions**: Objects that are not flat memory are framed
//!   into fixed-size slots and reduced through serde.
//! - **Checkpoint versioning**: Every commit bumps a version number. A
//!   restarted rank restores its models and replays the collective calls it
//!   missed from cache, without recomputing its contributions.
//! - **Engine agnostic**: Tally is generic over its transport
//!   [`Engine`](crate::engine::Engine). Bring your own transport!
//!
//! # How to use Tally
//!
//! Every rank holds a [`Communicator`](crate::collective::Communicator) over
//! its engine. All ranks issue the same collective calls, in the same order.
//!
//! ```
//! use tally::{engine::in_memory::InMemoryGroup, operation::Sum};
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let group = InMemoryGroup::new(4)?;
//!     let totals = group
//!         .run(|comm| async move {
//!             let mut counts = [comm.rank() as u64, 1];
//!             comm.allreduce::<Sum, u64>(&mut counts, None).await?;
//!             Ok(counts)
//!         })
//!         .await?;
//!
//!     assert_eq!(totals, vec![[6, 4]; 4]);
//!     Ok(())
//! }
//! ```
//!
//! ## Lazy contributions
//!
//! Every allreduce accepts an optional prepare closure that fills in the local
//! contribution right before the exchange. When a restarted rank replays a
//! call whose result is still cached, the closure is skipped, so expensive
//! contributions are computed only once.
//!
//! ```
//! use tally::{engine::in_memory::InMemoryGroup, operation::Max};
//! use anyhow::Result;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let group = InMemoryGroup::new(2)?;
//!     let peaks = group
//!         .run(|comm| async move {
//!             let rank = comm.rank() as f64;
//!             let mut peak = [0.0f64];
//!             comm.allreduce::<Max, f64>(
//!                 &mut peak,
//!                 Some(Box::new(move |buf: &mut [f64]| buf[0] = rank * 10.0)),
//!             )
//!             .await?;
//!             Ok(peak[0])
//!         })
//!         .await?;
//!
//!     assert_eq!(peaks, vec![10.0, 10.0]);
//!     Ok(())
//! }
//! ```
//!
//! ## Custom element types
//!
//! See [`reducer`] for user-defined element types, and [`collective`] for
//! broadcasts and checkpointing.

extern crate self as tally;

pub mod checkpoint;
pub mod collective;
pub mod config;
pub mod engine;
pub mod error;
pub mod operation;
pub mod reducer;
pub mod serializer;
pub mod wire;
pub mod derive {
    pub use tally_derive::*;
}
pub use async_trait::async_trait;
pub use tracing;
