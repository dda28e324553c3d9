use std::{fmt::Display, num::NonZeroU32};

use serde::{Deserialize, Serialize};

use crate::{
    PartitionScheme, RangePartitioning, Result, range::RangeInterval,
    round_robin::round_robin_partition_index,
};

/// Version of a partition set. Every rebuild of a scheme produces a new,
/// strictly greater generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub const FIRST: Self = Self(1);

    pub fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The manifest of a built partition set.
///
/// Written by every bulk build and read by every incremental insert, so the
/// insert path assigns rows with exactly the partition count (and, for range
/// partitioning, the rating bound) that the build used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSet {
    pub scheme: PartitionScheme,
    /// The main table the partitions were built from.
    pub source_table: String,
    pub partition_count: NonZeroU32,
    pub generation: Generation,
    /// Upper bound of the rating domain. Only meaningful for
    /// [`PartitionScheme::Range`].
    pub max_rating: f64,
}

impl PartitionSet {
    /// The manifest for a fresh build, succeeding `previous` if one exists.
    pub fn rebuild(
        previous: Option<&Self>,
        scheme: PartitionScheme,
        source_table: impl Into<String>,
        partition_count: NonZeroU32,
        max_rating: f64,
    ) -> Self {
        Self {
            scheme,
            source_table: source_table.into(),
            partition_count,
            generation: previous.map_or(Generation::FIRST, |p| p.generation.next()),
            max_rating,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count.get()
    }

    /// Table names of every partition, in index order.
    pub fn partition_tables(&self) -> impl Iterator<Item = String> + use<> {
        let scheme = self.scheme;
        (0..self.partition_count()).map(move |i| scheme.table_name(i))
    }

    pub fn range_partitioning(&self) -> Result<RangePartitioning> {
        RangePartitioning::new(self.partition_count(), self.max_rating)
    }

    pub fn range_intervals(&self) -> Result<Vec<RangeInterval>> {
        Ok(self.range_partitioning()?.intervals().collect())
    }

    /// Partition index for a record, dispatching on the scheme.
    ///
    /// Range sets look only at `rating`; round-robin sets look only at the
    /// 1-based `ordinal`.
    pub fn assign(&self, ordinal: u64, rating: f64) -> Result<u32> {
        match self.scheme {
            PartitionScheme::Range => self.range_partitioning()?.index_of(rating),
            PartitionScheme::RoundRobin => {
                round_robin_partition_index(ordinal, self.partition_count())
            }
        }
    }
}
