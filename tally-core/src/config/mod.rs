//! Shared runtime configuration.
//!
//! This module introduces types to facilitate the configuration of a tally
//! group.
//!
//! # Features:
//! - [`Config`]: Represents the main configuration structure. It's adorned with
//!   [`clap`] attributes so binaries can flatten it into their own CLI.
//! - [`Serializer`]: Specifies the serialization format used for checkpoints
//!   and serialized reductions.
//!
//! # Usage:
//! The [`Config`] struct can be passed to
//! [`InMemoryGroup::from_config`](crate::engine::in_memory::InMemoryGroup::from_config)
//! to construct an emulated group, and converted into a
//! [`serializer::Serializer`](crate::serializer::Serializer).

use clap::{Args, ValueEnum};

const DEFAULT_WORLD_SIZE: usize = 4;
const HELP_HEADING: &str = "Tally options";

/// Represents the main configuration structure for a group.
#[derive(Args, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Config {
    /// Determines the serialization format to be used for checkpoints and
    /// serialized reductions.
    #[arg(long, short, help_heading = HELP_HEADING, value_enum, default_value_t = Serializer::Postcard)]
    pub serializer: Serializer,

    /// Specifies the number of ranks to emulate (in-memory engine only).
    #[arg(long, short = 'n', help_heading = HELP_HEADING, env = "TALLY_WORLD_SIZE", default_value_t = DEFAULT_WORLD_SIZE)]
    pub world_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serializer: Default::default(),
            world_size: DEFAULT_WORLD_SIZE,
        }
    }
}

/// Enumerates the available serialization formats.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum, Default)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}
