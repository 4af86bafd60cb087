//! Reusable reduction handles.
//!
//! The engine only understands byte buffers. The handles in this module bind
//! a typed combine rule to an element size once, and can then be invoked any
//! number of times to reduce typed buffers:
//!
//! - [`ReduceHandle`]: the untyped binding of a [`CombineFn`] and an element
//!   size, plus the wire/operator tags of builtin reductions.
//! - [`Reducer`]: reduces user-defined [`FixedLayout`] elements combined by
//!   their [`Reduce`] implementation.
//! - [`SerializeReducer`]: reduces elements that must be serialized to cross
//!   the wire.
//!
//! Typed buffers are copied into a scratch byte buffer element by element
//! inside the prepare step, reduced by the engine, and copied back out. When
//! the engine replays a cached result the prepare step, and therefore the
//! caller's own prepare closure, is skipped.
//!
//! # Example
//!
//! ```
//! use tally::{
//!     engine::in_memory::InMemoryGroup,
//!     operation::Reduce,
//!     reducer::Reducer,
//!     wire::FixedLayout,
//! };
//!
//! #[derive(FixedLayout, Reduce, Clone, Copy, Debug, PartialEq)]
//! struct Extent {
//!     #[reduce(min)]
//!     lo: f64,
//!     #[reduce(max)]
//!     hi: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let group = InMemoryGroup::new(3)?;
//!     let extents = group
//!         .run(|comm| async move {
//!             let reducer = Reducer::<Extent>::new();
//!             let x = comm.rank() as f64;
//!             let mut buf = [Extent { lo: x, hi: x }];
//!             reducer.allreduce(comm.engine(), &mut buf, None).await?;
//!             Ok(buf[0])
//!         })
//!         .await?;
//!
//!     assert!(extents.iter().all(|e| *e == Extent { lo: 0.0, hi: 2.0 }));
//!     Ok(())
//! }
//! ```
use std::{marker::PhantomData, sync::Arc};

use anyhow::Result;

use crate::{
    engine::{abandon_with, BytePrepare, CombineFn, Engine, ReduceCall},
    error::CollectiveError,
    operation::{OpTag, Operator, Reduce},
    wire::{self, FixedLayout, WireScalar, WireType},
};

/// A caller-supplied step that materializes the local contribution into the
/// buffer about to be reduced.
///
/// It runs at most once per call, before any exchange, and is skipped when the
/// engine replays a cached result.
pub type Prepare<'a, T> = Box<dyn FnOnce(&mut [T]) + Send + 'a>;

/// The binding of a combine function and an element size.
///
/// Cloning a handle is cheap; clones share the combine function.
#[derive(Clone)]
pub struct ReduceHandle {
    combine: Arc<CombineFn>,
    elem_size: usize,
    tags: Option<(WireType, OpTag)>,
}

impl std::fmt::Debug for ReduceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceHandle")
            .field("elem_size", &self.elem_size)
            .field("tags", &self.tags)
            .finish()
    }
}

impl ReduceHandle {
    /// Bind a custom combine function to elements of `elem_size` bytes.
    pub fn new<F>(combine: F, elem_size: usize) -> Self
    where
        F: Fn(&[u8], &mut [u8], usize) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            combine: Arc::new(combine),
            elem_size,
            tags: None,
        }
    }

    /// The handle of a builtin operator over a wire scalar.
    pub fn builtin<Op: Operator<T>, T: WireScalar>() -> Self {
        Self {
            combine: Arc::new(|src: &[u8], dst: &mut [u8], elem_size: usize| {
                combine_elements::<T, _>(src, dst, elem_size, Op::combine)
            }),
            elem_size: T::SIZE,
            tags: Some((T::TAG, Op::TAG)),
        }
    }

    /// The same combine function bound to a different element size.
    pub fn resized(&self, elem_size: usize) -> Self {
        Self {
            elem_size,
            ..self.clone()
        }
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn tags(&self) -> Option<(WireType, OpTag)> {
        self.tags
    }

    /// Reduce `count` elements held in `buf` across the group, in place.
    ///
    /// A buffer that does not hold `count` elements abandons the call.
    pub async fn allreduce<E: Engine + ?Sized>(
        &self,
        engine: &E,
        buf: &mut [u8],
        count: usize,
        prepare: Option<BytePrepare<'_>>,
    ) -> Result<()> {
        if let Err(err) = check_buffer(buf.len(), self.elem_size, count) {
            return Err(abandon_with(engine, err).await);
        }
        let call = ReduceCall {
            elem_size: self.elem_size,
            count,
            combine: self.combine.as_ref(),
            tags: self.tags,
        };

        engine.allreduce(buf, call, prepare).await
    }
}

fn check_buffer(actual: usize, elem_size: usize, count: usize) -> Result<()> {
    match elem_size.checked_mul(count) {
        Some(expected) if expected == actual => Ok(()),
        _ => Err(CollectiveError::BufferSize {
            actual,
            elem_size,
            count,
        }
        .into()),
    }
}

/// Fold every element of `src` into the matching element of `dst` with `f`.
///
/// This is how a scalar combine rule becomes a bulk array combine: both ranges
/// are walked in `T::SIZE` chunks, each element is copied out, combined, and
/// the result copied back into `dst`.
pub fn combine_elements<T, F>(src: &[u8], dst: &mut [u8], elem_size: usize, f: F) -> Result<()>
where
    T: FixedLayout,
    F: Fn(&mut T, &T),
{
    if elem_size != T::SIZE {
        return Err(CollectiveError::ElementSize {
            expected: T::SIZE,
            actual: elem_size,
        }
        .into());
    }
    if elem_size == 0 {
        return Ok(());
    }
    if src.len() != dst.len() || dst.len() % elem_size != 0 {
        return Err(CollectiveError::BufferSize {
            actual: src.len(),
            elem_size,
            count: dst.len() / elem_size,
        }
        .into());
    }

    for (src, dst) in src.chunks_exact(elem_size).zip(dst.chunks_exact_mut(elem_size)) {
        let mut acc = T::read_from(dst);
        f(&mut acc, &T::read_from(src));
        acc.write_to(dst);
    }

    Ok(())
}

/// Reduce a typed buffer through `handle`.
pub(crate) async fn allreduce_fixed<T, E>(
    handle: &ReduceHandle,
    engine: &E,
    buf: &mut [T],
    prepare: Option<Prepare<'_, T>>,
) -> Result<()>
where
    T: FixedLayout,
    E: Engine + ?Sized,
{
    let count = buf.len();
    let mut scratch = vec![0u8; T::SIZE * count];
    {
        let elems = &mut *buf;
        let stage: BytePrepare<'_> = Box::new(move |bytes: &mut [u8]| {
            if let Some(prepare) = prepare {
                prepare(&mut *elems);
            }
            wire::encode_into(elems, bytes);
            Ok(())
        });
        handle.allreduce(engine, &mut scratch, count, Some(stage)).await?;
    }
    wire::decode_into(&scratch, buf);

    Ok(())
}

/// A reusable reducer of user-defined fixed-layout elements.
pub struct Reducer<T> {
    handle: ReduceHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FixedLayout + Reduce> Reducer<T> {
    pub fn new() -> Self {
        Self {
            handle: ReduceHandle::new(
                |src: &[u8], dst: &mut [u8], elem_size: usize| {
                    combine_elements::<T, _>(src, dst, elem_size, T::reduce)
                },
                T::SIZE,
            ),
            _marker: PhantomData,
        }
    }

    /// Reduce `buf` across the group, in place.
    pub async fn allreduce<E: Engine + ?Sized>(
        &self,
        engine: &E,
        buf: &mut [T],
        prepare: Option<Prepare<'_, T>>,
    ) -> Result<()> {
        allreduce_fixed(&self.handle, engine, buf, prepare).await
    }

    pub fn handle(&self) -> &ReduceHandle {
        &self.handle
    }
}

impl<T: FixedLayout + Reduce> Default for Reducer<T> {
    fn default() -> Self {
        Self::new()
    }
}

mod serialize;
pub use serialize::SerializeReducer;

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        engine::in_memory::InMemoryGroup,
        operation::{BitOr, Max, Min, Sum},
    };

    async fn single_rank_identity<Op: Operator<T>, T: WireScalar>(values: Vec<T>) {
        let group = InMemoryGroup::new(1).unwrap();
        let expected = values.clone();
        let result = group
            .run(move |comm| {
                let mut buf = values.clone();
                async move {
                    comm.allreduce::<Op, T>(&mut buf, None).await?;
                    Ok(buf)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, vec![expected]);
    }

    macro_rules! identity_for {
        ($name:ident, $op:ty, $ty:ty, $values:expr) => {
            #[tokio::test]
            async fn $name() {
                single_rank_identity::<$op, $ty>($values).await;
            }
        };
    }

    identity_for!(identity_sum_i8, Sum, i8, vec![-3, 0, 127]);
    identity_for!(identity_max_u8, Max, u8, vec![0, 9, 255]);
    identity_for!(identity_min_i32, Min, i32, vec![i32::MIN, 5, -5]);
    identity_for!(identity_bit_or_u32, BitOr, u32, vec![0xF0, 0x0F, 0]);
    identity_for!(identity_sum_i64, Sum, i64, vec![i64::MAX, -1]);
    identity_for!(identity_bit_or_u64, BitOr, u64, vec![u64::MAX, 1 << 40]);
    identity_for!(identity_max_f32, Max, f32, vec![1.5, -0.25, 1e30]);
    identity_for!(identity_min_f64, Min, f64, vec![-1e-300, 0.0, 42.0]);

    #[tokio::test]
    async fn single_rank_identity_covers_every_operator() {
        single_rank_identity::<Sum, u32>(vec![1, 2, 3]).await;
        single_rank_identity::<Max, i8>(vec![-1, -2]).await;
        single_rank_identity::<Min, u64>(vec![7]).await;
        single_rank_identity::<BitOr, i64>(vec![-1, 0]).await;
        single_rank_identity::<Sum, f64>(vec![0.1, 0.2]).await;
    }

    #[tokio::test]
    async fn single_rank_identity_keeps_nan() {
        let group = InMemoryGroup::new(1).unwrap();
        let result = group
            .run(|comm| async move {
                let mut buf = [f32::NAN, 1.0];
                comm.allreduce::<Max, f32>(&mut buf, None).await?;
                Ok(buf)
            })
            .await
            .unwrap();

        assert!(result[0][0].is_nan());
        assert_eq!(result[0][1], 1.0);
    }

    #[derive(FixedLayout, Reduce, Clone, Copy, Debug, PartialEq)]
    struct Stats {
        #[reduce(sum)]
        count: u64,
        #[reduce(max)]
        peak: f64,
        #[reduce(bit_or)]
        flags: u32,
        #[reduce(skip)]
        origin: i8,
    }

    #[tokio::test]
    async fn reducer_combines_derived_fields() {
        let group = InMemoryGroup::new(3).unwrap();
        let result = group
            .run(|comm| async move {
                let rank = comm.rank();
                let reducer = Reducer::<Stats>::new();
                let mut buf = [Stats {
                    count: 1,
                    peak: rank as f64 * 1.5,
                    flags: 1 << rank,
                    origin: rank as i8,
                }];
                reducer.allreduce(comm.engine(), &mut buf, None).await?;
                Ok(buf[0])
            })
            .await
            .unwrap();

        // Rank 0 folds the others into its own contribution.
        for stats in result {
            assert_eq!(stats.count, 3);
            assert_eq!(stats.peak, 3.0);
            assert_eq!(stats.flags, 0b111);
            assert_eq!(stats.origin, 0);
        }
    }

    #[tokio::test]
    async fn prepare_fills_contribution_exactly_once() {
        let group = InMemoryGroup::new(2).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = group
            .run(move |comm| {
                let counter = counter.clone();
                async move {
                    let rank = comm.rank() as i32;
                    let mut buf = [0i32; 2];
                    comm.allreduce::<Sum, i32>(
                        &mut buf,
                        Some(Box::new(move |buf: &mut [i32]| {
                            counter.fetch_add(1, Ordering::SeqCst);
                            buf[0] = rank + 1;
                            buf[1] = 10 * (rank + 1);
                        })),
                    )
                    .await?;
                    Ok(buf)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, vec![[3, 30], [3, 30]]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn combine_rejects_foreign_element_size() {
        let mut dst = [0u8; 8];
        let err = combine_elements::<u32, _>(&[0u8; 8], &mut dst, 8, |_, _| {}).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::ElementSize {
                expected: 4,
                actual: 8
            })
        ));
    }

    #[test]
    fn combine_rejects_ranges_of_different_length() {
        let mut dst = [0u8; 8];
        let err = combine_elements::<u32, _>(&[0u8; 4], &mut dst, 4, |_, _| {}).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::BufferSize { .. })
        ));
    }

    #[test]
    fn combine_zips_elements() {
        let src = wire::encode_all(&[1u32, 2, 3]);
        let mut dst = wire::encode_all(&[10u32, 20, 30]);
        combine_elements::<u32, _>(&src, &mut dst, 4, <Sum as Operator<u32>>::combine).unwrap();

        let mut out = [0u32; 3];
        wire::decode_into(&dst, &mut out);
        assert_eq!(out, [11, 22, 33]);
    }

    #[tokio::test]
    async fn handle_rejects_misdeclared_count() {
        let group = InMemoryGroup::new(1).unwrap();
        let engine = group.engine(0).unwrap();
        let handle = ReduceHandle::builtin::<Sum, i32>();
        let mut buf = [0u8; 12];
        let err = handle.allreduce(&engine, &mut buf, 2, None).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::BufferSize {
                actual: 12,
                elem_size: 4,
                count: 2
            })
        ));
    }

    #[test]
    fn builtin_handle_carries_tags() {
        let handle = ReduceHandle::builtin::<Min, f64>();

        assert_eq!(handle.elem_size(), 8);
        assert_eq!(handle.tags(), Some((WireType::Double, OpTag::Min)));
        assert_eq!(handle.resized(16).elem_size(), 16);
        assert_eq!(Reducer::<Stats>::new().handle().tags(), None);
    }
}
