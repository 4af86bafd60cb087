//! Provides utilities for serialization and deserialization of data.
//!
//! This module abstracts away the underlying serialization libraries and
//! provides a unified interface for different serialization formats. It is
//! used in two places: checkpoint payloads, and the fixed-size slots a
//! [`SerializeReducer`](crate::reducer::SerializeReducer) packs objects into.
//!
//! # Features:
//! - **Serializable Trait**: A shorthand trait that encapsulates common
//!   serialization and deserialization behaviors.
//! - **Serializer Enum**: Provides a generic way to serialize and deserialize
//!   binary data. It supports multiple serialization formats and can be easily
//!   extended.
//! - **Slots**: [`Serializer::to_slot`] and [`Serializer::from_slot`] frame an
//!   encoding inside a byte slice of fixed size, so that a buffer of many
//!   objects can be moved and combined as opaque, uniformly sized elements.
//!
//! # Examples
//!
//! ```rust
//! use tally::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct MyData {
//!    field: String,
//! }
//!
//! let data = MyData { field: "Hello, World!".to_string() };
//! let mut slot = [0u8; 64];
//! Serializer::Cbor.to_slot(&data, &mut slot).unwrap();
//! let decoded: MyData = Serializer::Cbor.from_slot(&slot).unwrap();
//! assert_eq!(decoded, data);
//! ```

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::{
    config::{self, Config},
    error::CollectiveError,
};

/// Size of the length header at the start of every slot.
pub const SLOT_HEADER_SIZE: usize = std::mem::size_of::<u32>();

/// Represents a shorthand for common serialization and deserialization
/// behaviors.
///
/// This trait is designed to be used in asynchronous or threaded contexts,
/// hence the requirements for `Send`, `Sync`, and `Unpin`. As such, it's
/// recommended to use owned types for serialization and deserialization to
/// ensure compatibility with this trait.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// Provides a unified interface for serializing and deserializing binary data.
///
/// This enum abstracts away the underlying serialization libraries and offers
/// methods to serialize and deserialize data in different formats.
/// It can be easily extended to support additional serialization formats in the
/// future.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Serializes the given value into binary data using the specified format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
        }
    }

    /// Deserializes the given binary data into a value of the specified type
    /// using the specified format.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }

    /// Serializes `value` into `slot`.
    ///
    /// The slot starts with a little-endian `u32` holding the payload length,
    /// followed by the payload and zero padding. An encoding that does not fit
    /// fails with [`CollectiveError::EncodeOverflow`]; it is never truncated.
    #[instrument(skip(value, slot), fields(slot_size = slot.len()), level = "trace")]
    pub fn to_slot<T: Serialize + ?Sized>(&self, value: &T, slot: &mut [u8]) -> Result<()> {
        let available = payload_capacity(slot.len())?;
        let payload = self.to_bytes(value)?;
        if payload.len() > available {
            return Err(CollectiveError::EncodeOverflow {
                needed: payload.len() + SLOT_HEADER_SIZE,
                budget: slot.len(),
            }
            .into());
        }
        let header = u32::try_from(payload.len()).map_err(|_| CollectiveError::EncodeOverflow {
            needed: payload.len() + SLOT_HEADER_SIZE,
            budget: slot.len(),
        })?;

        let (head, body) = slot.split_at_mut(SLOT_HEADER_SIZE);
        head.copy_from_slice(&header.to_le_bytes());
        body[..payload.len()].copy_from_slice(&payload);
        body[payload.len()..].fill(0);
        Ok(())
    }

    /// Deserializes the value framed in `slot` by [`Serializer::to_slot`].
    ///
    /// A header that declares more bytes than the slot holds fails with
    /// [`CollectiveError::DecodeOverflow`].
    #[instrument(skip(slot), fields(slot_size = slot.len()), level = "trace")]
    pub fn from_slot<T: DeserializeOwned>(&self, slot: &[u8]) -> Result<T> {
        let available = payload_capacity(slot.len())?;
        let (head, body) = slot.split_at(SLOT_HEADER_SIZE);
        let mut header = [0u8; SLOT_HEADER_SIZE];
        header.copy_from_slice(head);
        let declared = u32::from_le_bytes(header) as usize;
        if declared > available {
            return Err(CollectiveError::DecodeOverflow {
                declared,
                available,
            }
            .into());
        }

        self.from_bytes(&body[..declared])
    }
}

fn payload_capacity(slot_size: usize) -> Result<usize> {
    slot_size
        .checked_sub(SLOT_HEADER_SIZE)
        .ok_or_else(|| {
            CollectiveError::SlotTooSmall {
                size: slot_size,
                header: SLOT_HEADER_SIZE,
            }
            .into()
        })
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Histogram {
        label: String,
        buckets: Vec<u32>,
    }

    fn histogram() -> Histogram {
        Histogram {
            label: "latency".to_string(),
            buckets: vec![1, 4, 9, 16],
        }
    }

    #[test]
    fn slot_round_trips_in_every_format() {
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            let mut slot = vec![0xAAu8; 128];
            serializer.to_slot(&histogram(), &mut slot).unwrap();
            let decoded: Histogram = serializer.from_slot(&slot).unwrap();
            assert_eq!(decoded, histogram(), "{serializer}");
        }
    }

    #[test]
    fn slot_is_zero_padded() {
        let mut slot = vec![0xAAu8; 64];
        Serializer::Postcard.to_slot(&7u8, &mut slot).unwrap();

        assert_eq!(&slot[..SLOT_HEADER_SIZE], &1u32.to_le_bytes());
        assert!(slot[SLOT_HEADER_SIZE + 1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn oversized_encoding_is_rejected() {
        let mut slot = vec![0u8; 8];
        let err = Serializer::Postcard
            .to_slot(&histogram(), &mut slot)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::EncodeOverflow { budget: 8, .. })
        ));
    }

    #[test]
    fn header_past_slot_end_is_rejected() {
        let mut slot = vec![0u8; 16];
        slot[..SLOT_HEADER_SIZE].copy_from_slice(&100u32.to_le_bytes());
        let err = Serializer::Cbor.from_slot::<Histogram>(&slot).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::DecodeOverflow {
                declared: 100,
                available: 12
            })
        ));
    }

    #[test]
    fn slot_without_room_for_header_is_rejected() {
        let mut slot = [0u8; 2];
        let err = Serializer::Postcard.to_slot(&1u8, &mut slot).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CollectiveError>(),
            Some(CollectiveError::SlotTooSmall { size: 2, .. })
        ));
    }
}
