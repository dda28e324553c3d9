use std::{num::NonZeroU32, sync::Arc};

use ratings_catalog::{Catalog, RatingRecord, RatingsRepo, TableName, Transaction};
use ratings_partition::{Generation, MAX_RATING, PartitionError, PartitionScheme, PartitionSet};
use tracing::{debug, info, warn};

use crate::{Error, Result, builder::count_partitions, finish, partition_table};

/// Where an inserted row was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub partition: u32,
    pub partition_table: String,
    /// Ordinal of the row in the main table.
    pub ordinal: u64,
    /// Generation of the partition set the row was assigned against.
    pub generation: Generation,
}

/// Adds single rows to a main table and to the partition the current
/// partition set assigns them to, in one transaction.
///
/// The partition set is read from its manifest and stays locked until the
/// insert commits, so a concurrent rebuild either completes before the
/// insert reads it or waits for the insert to finish.
#[derive(Debug, Clone)]
pub struct IncrementalInserter {
    catalog: Arc<dyn Catalog>,
}

impl IncrementalInserter {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Insert `record` into `table` and the range partition owning its
    /// rating.
    ///
    /// A rating outside the domain of the partition set is rejected with
    /// [`Error::RejectedRating`] and nothing is written.
    pub async fn range_insert(
        &self,
        table: &TableName,
        record: RatingRecord,
        expected: Option<Generation>,
    ) -> Result<InsertOutcome> {
        self.insert(PartitionScheme::Range, table, record, expected)
            .await
    }

    /// Insert `record` into `table` and into round-robin partition
    /// `(ordinal - 1) mod N`, where `ordinal` is the row's position in
    /// `table`.
    pub async fn round_robin_insert(
        &self,
        table: &TableName,
        record: RatingRecord,
        expected: Option<Generation>,
    ) -> Result<InsertOutcome> {
        self.insert(PartitionScheme::RoundRobin, table, record, expected)
            .await
    }

    async fn insert(
        &self,
        scheme: PartitionScheme,
        table: &TableName,
        record: RatingRecord,
        expected: Option<Generation>,
    ) -> Result<InsertOutcome> {
        let mut txn = self.catalog.start_transaction().await?;
        let res = insert(txn.as_mut(), scheme, table, record, expected).await;
        let outcome = finish(txn, "insert", res).await?;

        debug!(
            %table,
            %scheme,
            partition = outcome.partition,
            ordinal = outcome.ordinal,
            generation = %outcome.generation,
            "inserted rating"
        );
        Ok(outcome)
    }
}

async fn insert(
    txn: &mut dyn Transaction,
    scheme: PartitionScheme,
    table: &TableName,
    record: RatingRecord,
    expected: Option<Generation>,
) -> Result<InsertOutcome> {
    let set = current_partition_set(txn, scheme, table).await?;

    if let Some(expected) = expected {
        if expected != set.generation {
            return Err(Error::StaleGeneration {
                scheme,
                expected,
                actual: set.generation,
            });
        }
    }
    if set.source_table != table.as_str() {
        return Err(Error::SourceMismatch {
            scheme,
            table: table.to_string(),
            built_from: set.source_table,
        });
    }

    // A range assignment depends on the rating alone, so a rejected rating
    // is caught before anything is written.
    let range_partition = match scheme {
        PartitionScheme::Range => Some(
            set.range_partitioning()?
                .index_of(record.rating)
                .map_err(|e| match e {
                    PartitionError::OutOfRange { rating, max_rating } => {
                        Error::RejectedRating { rating, max_rating }
                    }
                    e => Error::Partition(e),
                })?,
        ),
        PartitionScheme::RoundRobin => None,
    };

    txn.append(table, record).await?;
    let ordinal = txn.next_ordinal(table).await?;
    let partition = match range_partition {
        Some(partition) => partition,
        None => set.assign(ordinal, record.rating)?,
    };

    let target = partition_table(scheme, partition)?;
    txn.append(&target, record).await?;

    Ok(InsertOutcome {
        partition,
        partition_table: target.into(),
        ordinal,
        generation: set.generation,
    })
}

/// The locked manifest of `scheme`.
///
/// Partition sets built without a manifest are adopted: their partition
/// count is discovered from the table names and recorded as generation 1.
async fn current_partition_set(
    txn: &mut dyn Transaction,
    scheme: PartitionScheme,
    table: &TableName,
) -> Result<PartitionSet> {
    if let Some(set) = txn.lock_partition_set(scheme).await? {
        return Ok(set);
    }

    // Serialize with rebuilds and other adopters, then look again.
    txn.lock_scheme(scheme).await?;
    if let Some(set) = txn.lock_partition_set(scheme).await? {
        return Ok(set);
    }

    let partition_count = discover_partition_count(txn, scheme).await?;
    let set = PartitionSet::rebuild(None, scheme, table.as_str(), partition_count, MAX_RATING);
    txn.put_partition_set(&set).await?;

    info!(
        %scheme,
        %table,
        partitions = partition_count.get(),
        "adopted partition set without manifest"
    );
    Ok(set)
}

/// Number of partitions `0..n` present for `scheme`.
///
/// Only names of the exact `<prefix><index>` form count. A gap in the
/// indices ends the count.
async fn discover_partition_count<R>(repo: &mut R, scheme: PartitionScheme) -> Result<NonZeroU32>
where
    R: RatingsRepo + ?Sized,
{
    let mut indices = repo
        .list_tables_with_prefix(scheme.prefix())
        .await?
        .iter()
        .filter_map(|name| scheme.index_from_table_name(name))
        .collect::<Vec<_>>();
    indices.sort_unstable();

    let contiguous = indices
        .iter()
        .enumerate()
        .take_while(|(position, index)| *position as u32 == **index)
        .count();

    let prefixed = count_partitions(repo, scheme).await?;
    if prefixed != contiguous {
        warn!(
            %scheme,
            prefixed,
            partitions = contiguous,
            "tables sharing the partition prefix do not form a partition set"
        );
    }

    u32::try_from(contiguous)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(Error::NoPartitions { scheme })
}
