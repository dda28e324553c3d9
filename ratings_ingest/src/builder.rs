use std::{
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, Instant},
};

use ratings_catalog::{Catalog, RatingsRepo, TableName, Transaction};
use ratings_partition::{PartitionError, PartitionScheme, PartitionSet, RangePartitioning};
use tracing::{info, warn};

use crate::{Error, Result, finish, partition_table};

/// Number of tables whose name starts with the partition prefix of
/// `scheme`.
///
/// This is a plain name match, so unrelated tables sharing the prefix are
/// counted as well. It is only trustworthy for partition sets that were
/// built without a manifest and never shared their prefix.
pub async fn count_partitions<R>(repo: &mut R, scheme: PartitionScheme) -> Result<usize>
where
    R: RatingsRepo + ?Sized,
{
    Ok(repo.list_tables_with_prefix(scheme.prefix()).await?.len())
}

/// Outcome of a bulk partition build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSummary {
    /// The manifest written by the build.
    pub partition_set: PartitionSet,
    /// Rows written to each partition, in index order.
    pub rows_per_partition: Vec<u64>,
    /// Partitions of an earlier, larger build that were dropped.
    pub dropped: Vec<String>,
    pub elapsed: Duration,
}

/// Splits a main table into a fresh set of partition tables.
///
/// A build replaces every partition of its scheme. Partitions of the scheme
/// that fall outside the new partition count are dropped, and the scheme's
/// manifest is advanced to a new generation, which rejects later inserts
/// that still expect the previous one.
#[derive(Debug, Clone)]
pub struct BulkPartitionBuilder {
    catalog: Arc<dyn Catalog>,
}

impl BulkPartitionBuilder {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Partition `source` by rating into `partition_count` equal slices of
    /// `[0, max_rating]`.
    ///
    /// Rows whose rating lies outside the domain are not copied to any
    /// partition.
    pub async fn range_partition(
        &self,
        source: &TableName,
        partition_count: u32,
        max_rating: f64,
    ) -> Result<BuildSummary> {
        let start = Instant::now();
        let partitioning = RangePartitioning::new(partition_count, max_rating)?;
        ensure_not_a_partition(PartitionScheme::Range, source)?;

        let mut txn = self.catalog.start_transaction().await?;
        let res = build_range(txn.as_mut(), source, &partitioning).await;
        let (partition_set, rows_per_partition, dropped) =
            finish(txn, "range partition", res).await?;

        let elapsed = start.elapsed();
        info!(
            %source,
            partitions = partition_count,
            max_rating,
            generation = %partition_set.generation,
            ?elapsed,
            "built range partitions"
        );
        Ok(BuildSummary {
            partition_set,
            rows_per_partition,
            dropped,
            elapsed,
        })
    }

    /// Deal the rows of `source` over `partition_count` partitions in turn.
    ///
    /// The row sequence of `source` is reset to its row count, so the next
    /// inserted row continues the rotation where the build left off.
    pub async fn round_robin_partition(
        &self,
        source: &TableName,
        partition_count: u32,
    ) -> Result<BuildSummary> {
        let start = Instant::now();
        let partition_count = NonZeroU32::new(partition_count)
            .ok_or(PartitionError::InvalidPartitionCount { partition_count })?;
        ensure_not_a_partition(PartitionScheme::RoundRobin, source)?;

        let mut txn = self.catalog.start_transaction().await?;
        let res = build_round_robin(txn.as_mut(), source, partition_count).await;
        let (partition_set, rows_per_partition, dropped) =
            finish(txn, "round robin partition", res).await?;

        let elapsed = start.elapsed();
        info!(
            %source,
            partitions = partition_count.get(),
            generation = %partition_set.generation,
            ?elapsed,
            "built round robin partitions"
        );
        Ok(BuildSummary {
            partition_set,
            rows_per_partition,
            dropped,
            elapsed,
        })
    }
}

type Built = (PartitionSet, Vec<u64>, Vec<String>);

/// Clearing partitions of a scheme would otherwise wipe its own source.
fn ensure_not_a_partition(scheme: PartitionScheme, source: &TableName) -> Result<()> {
    match scheme.index_from_table_name(source.as_str()) {
        Some(_) => Err(Error::SourceIsPartition {
            scheme,
            table: source.to_string(),
        }),
        None => Ok(()),
    }
}

async fn build_range(
    txn: &mut dyn Transaction,
    source: &TableName,
    partitioning: &RangePartitioning,
) -> Result<Built> {
    let scheme = PartitionScheme::Range;
    let previous = txn.lock_for_rebuild(scheme, source).await?;
    let source_rows = txn.row_count(source).await?;

    let mut rows_per_partition = Vec::with_capacity(partitioning.partition_count() as usize);
    for interval in partitioning.intervals() {
        let target = partition_table(scheme, interval.index())?;
        txn.create_table_if_not_exists(&target).await?;
        txn.clear_table(&target).await?;
        rows_per_partition.push(txn.fill_range_partition(source, &target, interval).await?);
    }

    let assigned = rows_per_partition.iter().sum::<u64>();
    if assigned < source_rows {
        warn!(
            %source,
            unassigned = source_rows - assigned,
            max_rating = partitioning.max_rating(),
            "rows with a rating outside the domain are in no partition"
        );
    }

    let dropped = drop_stale_partitions(txn, scheme, partitioning.partition_count()).await?;

    let partition_count = NonZeroU32::new(partitioning.partition_count())
        .ok_or(PartitionError::InvalidPartitionCount { partition_count: 0 })?;
    let set = PartitionSet::rebuild(
        previous.as_ref(),
        scheme,
        source.as_str(),
        partition_count,
        partitioning.max_rating(),
    );
    txn.put_partition_set(&set).await?;

    Ok((set, rows_per_partition, dropped))
}

async fn build_round_robin(
    txn: &mut dyn Transaction,
    source: &TableName,
    partition_count: NonZeroU32,
) -> Result<Built> {
    let scheme = PartitionScheme::RoundRobin;
    // fails on a missing source before touching any partition
    let previous = txn.lock_for_rebuild(scheme, source).await?;

    let mut targets = Vec::with_capacity(partition_count.get() as usize);
    for index in 0..partition_count.get() {
        let target = partition_table(scheme, index)?;
        txn.create_table_if_not_exists(&target).await?;
        txn.clear_table(&target).await?;
        targets.push(target);
    }
    let numbered = txn.fill_round_robin_partitions(source, &targets).await?;

    // ordinal r went to (r - 1) % n
    let n = u64::from(partition_count.get());
    let rows_per_partition = (0..n)
        .map(|i| numbered / n + u64::from(i < numbered % n))
        .collect::<Vec<_>>();

    let dropped = drop_stale_partitions(txn, scheme, partition_count.get()).await?;

    let set = PartitionSet::rebuild(
        previous.as_ref(),
        scheme,
        source.as_str(),
        partition_count,
        ratings_partition::MAX_RATING,
    );
    txn.put_partition_set(&set).await?;
    txn.set_last_ordinal(source, numbered).await?;

    Ok((set, rows_per_partition, dropped))
}

/// Drop partitions of `scheme` with an index of `partition_count` or more.
///
/// Tables that share the prefix without being partition tables are left
/// alone.
async fn drop_stale_partitions(
    txn: &mut dyn Transaction,
    scheme: PartitionScheme,
    partition_count: u32,
) -> Result<Vec<String>> {
    let mut dropped = vec![];
    for name in txn.list_tables_with_prefix(scheme.prefix()).await? {
        match scheme.index_from_table_name(&name) {
            Some(index) if index < partition_count => {}
            Some(index) => {
                txn.drop_table(&partition_table(scheme, index)?).await?;
                info!(table = %name, "dropped stale partition");
                dropped.push(name);
            }
            None => warn!(
                table = %name,
                prefix = scheme.prefix(),
                "table shares the partition prefix but is not a partition"
            ),
        }
    }
    Ok(dropped)
}
