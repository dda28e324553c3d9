//! Partition assignment policy for the ratings table.
//!
//! Two schemes split the main ratings table into `N` horizontal partitions:
//!
//! * [`PartitionScheme::RoundRobin`] maps the record with 1-based ordinal `r`
//!   to partition `(r - 1) mod N`, see [`round_robin_partition_index()`].
//! * [`PartitionScheme::Range`] divides `[0, max_rating]` into `N` equal
//!   intervals, see [`range_partition_index()`] and [`RangePartitioning`].
//!
//! Everything in this crate is a pure computation. Persisting rows, building
//! partition tables and serializing concurrent writers is the job of the
//! catalog and ingest crates, which all route their decisions through here so
//! that a bulk rebuild and an incremental insert can never disagree.

mod manifest;
mod range;
mod round_robin;
mod scheme;
mod sequence;

pub use manifest::{Generation, PartitionSet};
pub use range::{RangeInterval, RangePartitioning, range_partition_index};
pub use round_robin::round_robin_partition_index;
pub use scheme::{PartitionScheme, UnknownSchemeError};
pub use sequence::OrdinalSequence;

/// The upper bound of the rating domain used when none is configured.
pub const MAX_RATING: f64 = 5.0;

/// Coarse classification of a [`PartitionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A precondition on the arguments does not hold.
    InvalidArgument,
    /// The rating lies outside the rating domain.
    OutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PartitionError {
    #[error("partition count must be at least 1, got {partition_count}")]
    InvalidPartitionCount { partition_count: u32 },

    #[error("ordinals start at 1, got 0")]
    ZeroOrdinal,

    #[error("maximum rating must be finite and positive, got {max_rating}")]
    InvalidMaxRating { max_rating: f64 },

    #[error("rating {rating} is outside [0, {max_rating}]")]
    OutOfRange { rating: f64, max_rating: f64 },
}

impl PartitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPartitionCount { .. }
            | Self::ZeroOrdinal
            | Self::InvalidMaxRating { .. } => ErrorKind::InvalidArgument,
            Self::OutOfRange { .. } => ErrorKind::OutOfRange,
        }
    }
}

pub type Result<T, E = PartitionError> = std::result::Result<T, E>;
