//! An in-memory implementation of the catalog interface. Useful for testing,
//! or for runs that do not need the ratings to outlive the process.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use ratings_partition::{
    OrdinalSequence, PartitionScheme, PartitionSet, RangeInterval, round_robin_partition_index,
};
use snafu::ResultExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::{
    interface::{
        Catalog, Error, PartitionSnafu, RatingRecord, RatingsRepo, Result, Transaction,
    },
    table_name::TableName,
};

/// In-memory catalog.
///
/// Transactions are fully serialized: each holds the catalog lock from
/// [`Catalog::start_transaction()`] until it is committed, aborted or
/// dropped, and works on a private copy that replaces the shared state on
/// commit. A finalized transaction no longer holds the lock, even while it
/// is still alive.
#[derive(Default)]
pub struct MemCatalog {
    collections: Arc<Mutex<MemCollections>>,
}

impl MemCatalog {
    /// return new initialized `MemCatalog`
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemCatalog").finish_non_exhaustive()
    }
}

impl Display for MemCatalog {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Memory")
    }
}

#[derive(Default, Debug, Clone)]
struct MemCollections {
    tables: BTreeMap<TableName, Vec<RatingRecord>>,
    partition_sets: BTreeMap<PartitionScheme, PartitionSet>,
    sequences: BTreeMap<TableName, u64>,
}

impl MemCollections {
    fn table(&self, name: &TableName) -> Result<&Vec<RatingRecord>> {
        self.tables.get(name).ok_or_else(|| Error::TableNotFound {
            name: name.to_string(),
        })
    }

    fn table_mut(&mut self, name: &TableName) -> Result<&mut Vec<RatingRecord>> {
        self.tables.get_mut(name).ok_or_else(|| Error::TableNotFound {
            name: name.to_string(),
        })
    }
}

/// transaction bound to an in-memory catalog.
#[derive(Debug)]
pub struct MemTxn {
    /// `None` once committed or aborted.
    guard: Option<OwnedMutexGuard<MemCollections>>,
    stage: MemCollections,
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!("Dropping MemTxn w/o finalizing (commit or abort)");
        }
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn setup(&self) -> Result<()> {
        // nothing to do
        Ok(())
    }

    async fn start_transaction(&self) -> Result<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.collections).lock_owned().await;
        let stage = guard.clone();
        Ok(Box::new(MemTxn {
            guard: Some(guard),
            stage,
        }))
    }
}

#[async_trait]
impl Transaction for MemTxn {
    async fn commit(&mut self) -> Result<()> {
        let mut guard = self
            .guard
            .take()
            .expect("transaction already committed or aborted");
        *guard = std::mem::take(&mut self.stage);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        let guard = self
            .guard
            .take()
            .expect("transaction already committed or aborted");
        drop(guard);
        self.stage = MemCollections::default();
        Ok(())
    }
}

#[async_trait]
impl RatingsRepo for MemTxn {
    async fn create_table_if_not_exists(&mut self, table: &TableName) -> Result<()> {
        self.stage.tables.entry(table.clone()).or_default();
        Ok(())
    }

    async fn clear_table(&mut self, table: &TableName) -> Result<()> {
        self.stage.table_mut(table)?.clear();
        Ok(())
    }

    async fn drop_table(&mut self, table: &TableName) -> Result<()> {
        self.stage.tables.remove(table);
        Ok(())
    }

    async fn append(&mut self, table: &TableName, record: RatingRecord) -> Result<()> {
        self.stage.table_mut(table)?.push(record);
        Ok(())
    }

    async fn append_many(&mut self, table: &TableName, records: &[RatingRecord]) -> Result<()> {
        self.stage.table_mut(table)?.extend_from_slice(records);
        Ok(())
    }

    async fn row_count(&mut self, table: &TableName) -> Result<u64> {
        Ok(self.stage.table(table)?.len() as u64)
    }

    async fn scan(&mut self, table: &TableName) -> Result<Vec<RatingRecord>> {
        Ok(self.stage.table(table)?.clone())
    }

    async fn fill_range_partition(
        &mut self,
        source: &TableName,
        target: &TableName,
        interval: RangeInterval,
    ) -> Result<u64> {
        let rows = self
            .stage
            .table(source)?
            .iter()
            .filter(|r| interval.contains(r.rating))
            .copied()
            .collect::<Vec<_>>();
        let n = rows.len() as u64;
        self.stage.table_mut(target)?.extend(rows);
        Ok(n)
    }

    async fn fill_round_robin_partitions(
        &mut self,
        source: &TableName,
        targets: &[TableName],
    ) -> Result<u64> {
        let partition_count = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        round_robin_partition_index(1, partition_count).context(PartitionSnafu)?;

        let rows = self.stage.table(source)?.clone();
        let mut buckets = vec![Vec::new(); targets.len()];
        let ordinals = OrdinalSequence::default();
        for row in rows {
            let idx = round_robin_partition_index(ordinals.next(), partition_count)
                .context(PartitionSnafu)?;
            buckets[idx as usize].push(row);
        }

        for (target, bucket) in targets.iter().zip(buckets) {
            self.stage.table_mut(target)?.extend(bucket);
        }
        Ok(ordinals.last())
    }

    async fn list_tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .stage
            .tables
            .keys()
            .filter(|name| name.as_str().starts_with(prefix))
            .map(ToString::to_string)
            .collect())
    }

    async fn get_partition_set(&mut self, scheme: PartitionScheme) -> Result<Option<PartitionSet>> {
        Ok(self.stage.partition_sets.get(&scheme).cloned())
    }

    async fn lock_partition_set(
        &mut self,
        scheme: PartitionScheme,
    ) -> Result<Option<PartitionSet>> {
        // the transaction already holds the whole catalog
        self.get_partition_set(scheme).await
    }

    async fn put_partition_set(&mut self, set: &PartitionSet) -> Result<()> {
        self.stage.partition_sets.insert(set.scheme, set.clone());
        Ok(())
    }

    async fn lock_scheme(&mut self, _scheme: PartitionScheme) -> Result<()> {
        Ok(())
    }

    async fn lock_for_rebuild(
        &mut self,
        scheme: PartitionScheme,
        source: &TableName,
    ) -> Result<Option<PartitionSet>> {
        self.stage.table(source)?;
        self.get_partition_set(scheme).await
    }

    async fn next_ordinal(&mut self, table: &TableName) -> Result<u64> {
        let next = match self.stage.sequences.get(table) {
            Some(last) => last + 1,
            None => self.stage.table(table)?.len() as u64,
        };
        self.stage.sequences.insert(table.clone(), next);
        Ok(next)
    }

    async fn set_last_ordinal(&mut self, table: &TableName, last: u64) -> Result<()> {
        self.stage.sequences.insert(table.clone(), last);
        Ok(())
    }
}
