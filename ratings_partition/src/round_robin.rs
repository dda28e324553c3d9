use crate::{PartitionError, Result};

/// Return the round-robin partition for the record at 1-based `ordinal`.
///
/// The record at ordinal `r` is placed in partition `(r - 1) mod
/// partition_count`, so the first record lands in partition 0 and a run of
/// `k` consecutive ordinals spreads across the partitions with no two
/// partitions differing by more than one record.
///
/// # Errors
///
/// Returns [`PartitionError::InvalidPartitionCount`] when `partition_count`
/// is 0 and [`PartitionError::ZeroOrdinal`] when `ordinal` is 0. Both are
/// [`ErrorKind::InvalidArgument`](crate::ErrorKind::InvalidArgument).
pub fn round_robin_partition_index(ordinal: u64, partition_count: u32) -> Result<u32> {
    if partition_count == 0 {
        return Err(PartitionError::InvalidPartitionCount { partition_count });
    }
    if ordinal == 0 {
        return Err(PartitionError::ZeroOrdinal);
    }

    // The remainder is strictly less than a u32 value.
    Ok(((ordinal - 1) % u64::from(partition_count)) as u32)
}
