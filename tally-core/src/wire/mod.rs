//! Element layouts and wire-type tags.
//!
//! The engine moves and combines opaque byte ranges. This module provides the
//! two pieces that let typed buffers cross that boundary safely:
//!
//! ## [`FixedLayout`]
//! A type with a fixed encoded byte size that can be copied into and out of a
//! byte slice of exactly that size. Elements are never reinterpreted in place;
//! they are copied out of a bounds-checked chunk, combined as owned values, and
//! copied back. This keeps byte buffers free of alignment requirements.
//!
//! ## [`WireScalar`]
//! The closed set of scalar types the engine understands natively. Each one
//! carries a [`WireType`] tag resolved at compile time through [`tag_of`].
//! The trait is sealed, so asking for the tag of any other type fails to
//! compile:
//!
//! ```compile_fail
//! tally::wire::tag_of::<u16>();
//! ```
//!
//! ```
//! use tally::wire::{tag_of, WireType};
//!
//! assert_eq!(tag_of::<i32>(), WireType::Int);
//! assert_eq!(tag_of::<f64>().size(), 8);
//! ```
use serde::{Deserialize, Serialize};
pub use tally_derive::FixedLayout;

/// Wire-level element types understood by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WireType {
    Char,
    UChar,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
}

impl WireType {
    /// Size in bytes of a single element.
    pub const fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Long | Self::ULong | Self::Double => 8,
        }
    }
}

impl std::fmt::Display for WireType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Char => write!(f, "char"),
            Self::UChar => write!(f, "uchar"),
            Self::Int => write!(f, "int"),
            Self::UInt => write!(f, "uint"),
            Self::Long => write!(f, "long"),
            Self::ULong => write!(f, "ulong"),
            Self::Float => write!(f, "float"),
            Self::Double => write!(f, "double"),
        }
    }
}

/// A type with a fixed-size byte encoding.
///
/// `read_from` and `write_to` are handed slices of exactly [`Self::SIZE`]
/// bytes and panic otherwise; callers slice buffers with
/// [`chunks_exact`](slice::chunks_exact) so the length always matches.
///
/// Use `#[derive(FixedLayout)]` to lay out a struct field by field.
pub trait FixedLayout: Sized + Send + Sync + 'static {
    /// Encoded size of one element, in bytes.
    const SIZE: usize;

    /// Copy an element out of `bytes`.
    fn read_from(bytes: &[u8]) -> Self;

    /// Copy this element into `bytes`.
    fn write_to(&self, bytes: &mut [u8]);

    /// The element whose encoding is all zeroes.
    fn zeroed() -> Self {
        Self::read_from(&vec![0; Self::SIZE])
    }
}

mod private {
    pub trait Sealed {}
}

/// One of the eight scalar types with a [`WireType`] tag.
pub trait WireScalar: FixedLayout + Copy + PartialOrd + std::fmt::Debug + private::Sealed {
    /// The wire tag of this type.
    const TAG: WireType;

    /// Add `src` into `self`. Integers wrap on overflow.
    fn accumulate(&mut self, src: &Self);
}

/// The wire tag of `T`.
pub const fn tag_of<T: WireScalar>() -> WireType {
    T::TAG
}

macro_rules! wire_scalar {
    ($($ty:ty => $tag:ident),* $(,)?; |$dst:ident, $src:ident| $accumulate:expr) => {$(
        impl private::Sealed for $ty {}

        impl FixedLayout for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_from(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }

            fn write_to(&self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_le_bytes());
            }
        }

        impl WireScalar for $ty {
            const TAG: WireType = WireType::$tag;

            fn accumulate(&mut self, src: &Self) {
                let ($dst, $src) = (self, *src);
                $accumulate
            }
        }
    )*};
}

wire_scalar! {
    i8 => Char,
    u8 => UChar,
    i32 => Int,
    u32 => UInt,
    i64 => Long,
    u64 => ULong;
    |dst, src| *dst = dst.wrapping_add(src)
}

wire_scalar! {
    f32 => Float,
    f64 => Double;
    |dst, src| *dst += src
}

impl<T: FixedLayout, const N: usize> FixedLayout for [T; N] {
    const SIZE: usize = T::SIZE * N;

    fn read_from(bytes: &[u8]) -> Self {
        std::array::from_fn(|i| T::read_from(&bytes[i * T::SIZE..(i + 1) * T::SIZE]))
    }

    fn write_to(&self, bytes: &mut [u8]) {
        encode_into(self, bytes);
    }
}

/// Encode `elems` into a freshly allocated byte buffer.
pub fn encode_all<T: FixedLayout>(elems: &[T]) -> Vec<u8> {
    let mut bytes = vec![0; T::SIZE * elems.len()];
    encode_into(elems, &mut bytes);
    bytes
}

/// Encode `elems` into `bytes`, which must hold `T::SIZE * elems.len()` bytes.
pub fn encode_into<T: FixedLayout>(elems: &[T], bytes: &mut [u8]) {
    if T::SIZE == 0 {
        return;
    }
    for (elem, chunk) in elems.iter().zip(bytes.chunks_exact_mut(T::SIZE)) {
        elem.write_to(chunk);
    }
}

/// Decode `bytes` into `elems`, overwriting them in place.
pub fn decode_into<T: FixedLayout>(bytes: &[u8], elems: &mut [T]) {
    if T::SIZE == 0 {
        elems.iter_mut().for_each(|elem| *elem = T::read_from(&[]));
        return;
    }
    for (elem, chunk) in elems.iter_mut().zip(bytes.chunks_exact(T::SIZE)) {
        *elem = T::read_from(chunk);
    }
}
