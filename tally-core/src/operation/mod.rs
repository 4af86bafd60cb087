//! Reduction operators.
//!
//! This module defines how elements are combined. Everything that flows
//! through an allreduce is combined pairwise by the engine, in whatever order
//! its topology dictates, so every combine rule must be associative and
//! commutative across the participating ranks.
//!
//! Key components of this module include:
//! ## [`Operator`]
//! The closed catalog of scalar combine rules: [`Max`], [`Min`], [`Sum`] and
//! [`BitOr`]. Each one carries an [`OpTag`] through [`OpKind`] so the engine
//! can be told which semantics apply without knowing the element type at the
//! call site.
//!
//! ## [`Reduce`]
//! Combine rule for user-defined [`FixedLayout`](crate::wire::FixedLayout)
//! types, reduced with a [`Reducer`](crate::reducer::Reducer). It can be
//! derived field by field.
//!
//! ## [`SerializableObject`]
//! Combine rule for types that are not flat memory, reduced with a
//! [`SerializeReducer`](crate::reducer::SerializeReducer).
//!
//! # Ordering of floating point values
//! [`Max`] and [`Min`] use the element type's [`PartialOrd`] with a strict
//! comparison and a conditional assignment, nothing more. NaN is not special
//! cased: a NaN already in the destination is never replaced, and a NaN source
//! never replaces the destination. The result of reducing NaNs therefore
//! depends on the order in which the engine combines contributions.
//!
//! # Example
//!
//! ```
//! use tally::operation::{Max, Operator, Sum};
//!
//! let mut acc = 3i32;
//! <Sum as Operator<i32>>::combine(&mut acc, &4);
//! assert_eq!(acc, 7);
//!
//! let mut best = 1.5f32;
//! <Max as Operator<f32>>::combine(&mut best, &0.5);
//! assert_eq!(best, 1.5);
//! ```
use serde::{Deserialize, Serialize};
pub use tally_derive::Reduce;

use crate::{serializer::Serializable, wire::WireScalar};

/// Operator tags understood by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpTag {
    Max,
    Min,
    Sum,
    BitOr,
}

impl std::fmt::Display for OpTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Max => write!(f, "max"),
            Self::Min => write!(f, "min"),
            Self::Sum => write!(f, "sum"),
            Self::BitOr => write!(f, "bit_or"),
        }
    }
}

/// An operator identifiable by the engine.
pub trait OpKind: Send + Sync + 'static {
    const TAG: OpTag;
}

/// An associative and commutative combine rule over elements of type `T`.
pub trait Operator<T>: OpKind {
    /// Fold `src` into `dst`.
    fn combine(dst: &mut T, src: &T);
}

/// Keeps the greater element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Max;

/// Keeps the lesser element.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Min;

/// Adds elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sum;

/// Bitwise OR of integer elements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitOr;

impl OpKind for Max {
    const TAG: OpTag = OpTag::Max;
}

impl OpKind for Min {
    const TAG: OpTag = OpTag::Min;
}

impl OpKind for Sum {
    const TAG: OpTag = OpTag::Sum;
}

impl OpKind for BitOr {
    const TAG: OpTag = OpTag::BitOr;
}

impl<T: WireScalar> Operator<T> for Max {
    #[inline]
    fn combine(dst: &mut T, src: &T) {
        if *dst < *src {
            *dst = *src;
        }
    }
}

impl<T: WireScalar> Operator<T> for Min {
    #[inline]
    fn combine(dst: &mut T, src: &T) {
        if *src < *dst {
            *dst = *src;
        }
    }
}

impl<T: WireScalar> Operator<T> for Sum {
    #[inline]
    fn combine(dst: &mut T, src: &T) {
        dst.accumulate(src);
    }
}

// Floats have no `BitOrAssign`, so `BitOr` over them does not compile.
impl<T: WireScalar + std::ops::BitOrAssign> Operator<T> for BitOr {
    #[inline]
    fn combine(dst: &mut T, src: &T) {
        *dst |= *src;
    }
}

/// Combine rule of a user-defined fixed-layout element.
///
/// ```
/// use tally::{operation::Reduce, wire::FixedLayout};
///
/// #[derive(FixedLayout, Reduce, Clone, Copy, Debug, PartialEq)]
/// struct Stats {
///     #[reduce(sum)]
///     count: u64,
///     #[reduce(max)]
///     peak: f64,
/// }
///
/// let mut a = Stats { count: 2, peak: 1.0 };
/// a.reduce(&Stats { count: 3, peak: 4.0 });
/// assert_eq!(a, Stats { count: 5, peak: 4.0 });
/// ```
pub trait Reduce {
    /// Fold `src` into `self`.
    fn reduce(&mut self, src: &Self);
}

impl<T: Reduce, const N: usize> Reduce for [T; N] {
    fn reduce(&mut self, src: &Self) {
        for (dst, src) in self.iter_mut().zip(src) {
            dst.reduce(src);
        }
    }
}

/// Combine rule of an element that must be serialized to cross the wire.
///
/// Saving and loading go through serde via the crate's
/// [`Serializer`](crate::serializer::Serializer). `max_nbytes` is the slot
/// budget the reduction was started with; a combined value whose encoding
/// outgrows it makes the reduction fail.
pub trait SerializableObject: Serializable {
    /// Fold `src` into `self`.
    fn reduce(&mut self, src: &Self, max_nbytes: usize);
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;

    use super::*;

    fn fold<Op: Operator<T>, T: WireScalar>(items: &[T]) -> T {
        let mut acc = items[0];
        for item in &items[1..] {
            Op::combine(&mut acc, item);
        }
        acc
    }

    fn assert_order_independent<Op: Operator<T>, T: WireScalar>(items: [T; 3]) {
        let [a, b, c] = items;
        let linear = fold::<Op, T>(&items);

        // (a . b) . c == a . (b . c)
        let mut left = a;
        Op::combine(&mut left, &b);
        Op::combine(&mut left, &c);
        let mut right_inner = b;
        Op::combine(&mut right_inner, &c);
        let mut right = a;
        Op::combine(&mut right, &right_inner);
        assert_eq!(left, right, "{:?} is not associative over {items:?}", Op::TAG);

        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let mut shuffled = items;
            shuffled.shuffle(&mut rng);
            assert_eq!(
                fold::<Op, T>(&shuffled),
                linear,
                "{:?} is not commutative over {shuffled:?}",
                Op::TAG
            );
        }
    }

    #[test]
    fn max_and_min_keep_extremes() {
        let mut x = 3i32;
        <Max as Operator<i32>>::combine(&mut x, &9);
        assert_eq!(x, 9);
        <Max as Operator<i32>>::combine(&mut x, &-1);
        assert_eq!(x, 9);

        let mut y = 3u64;
        <Min as Operator<u64>>::combine(&mut y, &9);
        assert_eq!(y, 3);
        <Min as Operator<u64>>::combine(&mut y, &1);
        assert_eq!(y, 1);
    }

    #[test]
    fn sum_and_bit_or_accumulate() {
        let mut x = 1.25f64;
        <Sum as Operator<f64>>::combine(&mut x, &2.0);
        assert_eq!(x, 3.25);

        let mut bits = 0b0101u8;
        <BitOr as Operator<u8>>::combine(&mut bits, &0b0011);
        assert_eq!(bits, 0b0111);
    }

    #[test]
    fn nan_follows_partial_ord() {
        let mut dst = f32::NAN;
        <Max as Operator<f32>>::combine(&mut dst, &1.0);
        assert!(dst.is_nan());

        let mut dst = 1.0f32;
        <Max as Operator<f32>>::combine(&mut dst, &f32::NAN);
        assert_eq!(dst, 1.0);

        let mut dst = f64::NAN;
        <Min as Operator<f64>>::combine(&mut dst, &-1.0);
        assert!(dst.is_nan());

        let mut dst = -1.0f64;
        <Min as Operator<f64>>::combine(&mut dst, &f64::NAN);
        assert_eq!(dst, -1.0);
    }

    #[test]
    fn operators_are_order_independent() {
        assert_order_independent::<Sum, i32>([5, -7, 11]);
        assert_order_independent::<Sum, u8>([200, 100, 17]);
        assert_order_independent::<Sum, i64>([i64::MAX, 1, -3]);
        assert_order_independent::<Max, f64>([0.5, -2.0, 9.75]);
        assert_order_independent::<Min, i8>([-3, 4, -128]);
        assert_order_independent::<Max, u32>([1, u32::MAX, 0]);
        assert_order_independent::<BitOr, u64>([0b1, 0b100, 0b1_0000]);
        assert_order_independent::<BitOr, i32>([-8, 3, 64]);
        // Dyadic rationals keep float addition exact.
        assert_order_independent::<Sum, f32>([0.5, 0.25, 2.0]);
    }

    #[test]
    fn tags_are_independent_of_element_type() {
        assert_eq!(<Max as OpKind>::TAG, OpTag::Max);
        assert_eq!(<Min as OpKind>::TAG, OpTag::Min);
        assert_eq!(<Sum as OpKind>::TAG, OpTag::Sum);
        assert_eq!(<BitOr as OpKind>::TAG, OpTag::BitOr);
    }

    #[test]
    fn arrays_reduce_elementwise() {
        #[derive(Clone, Copy, Debug, PartialEq)]
        struct Hits(u32);

        impl Reduce for Hits {
            fn reduce(&mut self, src: &Self) {
                self.0 += src.0;
            }
        }

        let mut acc = [Hits(1), Hits(2)];
        acc.reduce(&[Hits(10), Hits(20)]);
        assert_eq!(acc, [Hits(11), Hits(22)]);
    }
}
