//! Traits and data objects for the ratings catalog.

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use ratings_partition::{PartitionError, PartitionScheme, PartitionSet, RangeInterval};
use snafu::Snafu;

use crate::table_name::{TableName, TableNameError};

#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Unhandled sqlx error: {source}"))]
    SqlxError { source: sqlx::Error },

    #[snafu(display("Failed to commit transaction: {source}"))]
    FailedToCommit { source: sqlx::Error },

    #[snafu(display("Failed to run catalog migrations: {source}"))]
    Migration { source: sqlx::migrate::MigrateError },

    #[snafu(display("table {name} not found"))]
    TableNotFound { name: String },

    #[snafu(display("{source}"))]
    InvalidTableName { source: TableNameError },

    #[snafu(display("stored {scheme} partition set is invalid: {reason}"))]
    InvalidPartitionSet {
        scheme: PartitionScheme,
        reason: String,
    },

    #[snafu(display("cannot assign partitions: {source}"))]
    Partition { source: PartitionError },
}

impl From<TableNameError> for Error {
    fn from(source: TableNameError) -> Self {
        Self::InvalidTableName { source }
    }
}

/// A specialized `Error` for catalog errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single rating of an item by a user.
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct RatingRecord {
    #[sqlx(rename = "userid")]
    pub user_id: i32,
    #[sqlx(rename = "movieid")]
    pub item_id: i32,
    pub rating: f64,
}

impl RatingRecord {
    pub fn new(user_id: i32, item_id: i32, rating: f64) -> Self {
        Self {
            user_id,
            item_id,
            rating,
        }
    }
}

/// A store of ratings tables, their partitions and partition-set manifests.
#[async_trait]
pub trait Catalog: Send + Sync + Debug + Display {
    /// Create the catalog's own bookkeeping objects. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Begin a transaction. Nothing written through it is visible to other
    /// transactions until [`Transaction::commit()`].
    async fn start_transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// A unit of work against a [`Catalog`].
///
/// Dropping a transaction without committing it discards its writes.
#[async_trait]
pub trait Transaction: RatingsRepo + Send + Sync + Debug {
    /// Make every write of this transaction visible.
    ///
    /// # Panics
    ///
    /// Panics if the transaction was already committed or aborted.
    async fn commit(&mut self) -> Result<()>;

    /// Discard every write of this transaction.
    ///
    /// # Panics
    ///
    /// Panics if the transaction was already committed or aborted.
    async fn abort(&mut self) -> Result<()>;
}

/// Operations on ratings tables and partition bookkeeping.
#[async_trait]
pub trait RatingsRepo: Send + Sync {
    /// Create `table` with the ratings columns unless it already exists.
    async fn create_table_if_not_exists(&mut self, table: &TableName) -> Result<()>;

    /// Remove every row from `table`.
    async fn clear_table(&mut self, table: &TableName) -> Result<()>;

    /// Drop `table` if it exists.
    async fn drop_table(&mut self, table: &TableName) -> Result<()>;

    async fn append(&mut self, table: &TableName, record: RatingRecord) -> Result<()>;

    async fn append_many(&mut self, table: &TableName, records: &[RatingRecord]) -> Result<()>;

    async fn row_count(&mut self, table: &TableName) -> Result<u64>;

    /// All rows of `table`, in storage order.
    async fn scan(&mut self, table: &TableName) -> Result<Vec<RatingRecord>>;

    /// Copy every row of `source` whose rating lies in `interval` into
    /// `target`, returning the number of rows copied.
    async fn fill_range_partition(
        &mut self,
        source: &TableName,
        target: &TableName,
        interval: RangeInterval,
    ) -> Result<u64>;

    /// Number the rows of `source` 1, 2, 3, ... in a single pass and copy
    /// the row with ordinal `r` into `targets[(r - 1) % targets.len()]`.
    ///
    /// Returns the number of rows numbered.
    async fn fill_round_robin_partitions(
        &mut self,
        source: &TableName,
        targets: &[TableName],
    ) -> Result<u64>;

    /// Names of all tables whose name starts with `prefix`, sorted.
    ///
    /// This is a plain name match: any unrelated table sharing the prefix is
    /// included.
    async fn list_tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>>;

    /// Read the manifest of `scheme` without locking it.
    async fn get_partition_set(&mut self, scheme: PartitionScheme) -> Result<Option<PartitionSet>>;

    /// Read the manifest of `scheme` and hold a shared lock on it until the
    /// transaction ends, so no rebuild can replace it in the meantime.
    async fn lock_partition_set(&mut self, scheme: PartitionScheme)
    -> Result<Option<PartitionSet>>;

    /// Insert or replace the manifest for `set.scheme`.
    async fn put_partition_set(&mut self, set: &PartitionSet) -> Result<()>;

    /// Take an exclusive, transaction-scoped lock on `scheme`.
    ///
    /// Serializes rebuilds, and the adoption of partition sets that have no
    /// manifest, against each other.
    async fn lock_scheme(&mut self, scheme: PartitionScheme) -> Result<()>;

    /// Prepare a rebuild of `scheme` from `source` and return the current
    /// manifest of `scheme`.
    ///
    /// Takes [`Self::lock_scheme()`], an exclusive lock on the manifest, and
    /// a lock on `source` that blocks appends to it. All of them are held
    /// until the transaction ends. Inserts already in flight finish first;
    /// inserts that start later wait and then read the rebuilt manifest and
    /// the reset row sequence.
    async fn lock_for_rebuild(
        &mut self,
        scheme: PartitionScheme,
        source: &TableName,
    ) -> Result<Option<PartitionSet>>;

    /// Atomically advance the row sequence of `table` and return the new
    /// ordinal.
    ///
    /// A table without a sequence starts from its current row count, which
    /// already includes rows appended earlier in this transaction.
    async fn next_ordinal(&mut self, table: &TableName) -> Result<u64>;

    /// Reset the row sequence of `table` so the next ordinal is `last + 1`.
    async fn set_last_ordinal(&mut self, table: &TableName, last: u64) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::{future::Future, num::NonZeroU32, sync::Arc};

    use assert_matches::assert_matches;
    use ratings_partition::{Generation, RangePartitioning};

    use super::*;

    fn table(name: &str) -> TableName {
        TableName::new(name).unwrap()
    }

    fn records() -> Vec<RatingRecord> {
        vec![
            RatingRecord::new(1, 10, 0.0),
            RatingRecord::new(1, 11, 1.0),
            RatingRecord::new(2, 10, 2.5),
            RatingRecord::new(2, 12, 3.0),
            RatingRecord::new(3, 10, 4.5),
            RatingRecord::new(3, 13, 5.0),
            RatingRecord::new(4, 14, 2.0),
        ]
    }

    pub(crate) async fn test_catalog<R, F>(clean_state: R)
    where
        R: Fn() -> F + Send + Sync,
        F: Future<Output = Arc<dyn Catalog>> + Send,
    {
        test_setup(clean_state().await).await;
        test_table_lifecycle(clean_state().await).await;
        test_missing_table(clean_state().await).await;
        test_abort_discards(clean_state().await).await;
        test_fill_range_partitions(clean_state().await).await;
        test_fill_round_robin_partitions(clean_state().await).await;
        test_list_tables_with_prefix(clean_state().await).await;
        test_partition_sets(clean_state().await).await;
        test_lock_for_rebuild(clean_state().await).await;
        test_row_sequence(clean_state().await).await;
        test_finalized_transaction_releases_catalog(clean_state().await).await;
    }

    async fn test_setup(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.expect("first setup");
        catalog.setup().await.expect("second setup is a no-op");
    }

    async fn test_table_lifecycle(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");

        let mut txn = catalog.start_transaction().await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        assert_eq!(txn.row_count(&ratings).await.unwrap(), 0);

        txn.append_many(&ratings, &records()).await.unwrap();
        txn.append(&ratings, RatingRecord::new(9, 99, 1.5))
            .await
            .unwrap();
        assert_eq!(txn.row_count(&ratings).await.unwrap(), 8);
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        let mut rows = txn.scan(&ratings).await.unwrap();
        rows.sort_by(|a, b| (a.user_id, a.item_id).cmp(&(b.user_id, b.item_id)));
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0], RatingRecord::new(1, 10, 0.0));
        assert_eq!(rows[7], RatingRecord::new(9, 99, 1.5));

        txn.clear_table(&ratings).await.unwrap();
        assert_eq!(txn.row_count(&ratings).await.unwrap(), 0);

        txn.drop_table(&ratings).await.unwrap();
        txn.drop_table(&ratings).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert!(
            txn.list_tables_with_prefix("ratings")
                .await
                .unwrap()
                .is_empty()
        );
        txn.abort().await.unwrap();
    }

    async fn test_missing_table(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let missing = table("no_such_table");

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_matches!(
            txn.row_count(&missing).await,
            Err(Error::TableNotFound { name }) if name == "no_such_table"
        );
        txn.abort().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_matches!(
            txn.append(&missing, RatingRecord::new(1, 1, 1.0)).await,
            Err(Error::TableNotFound { .. })
        );
        txn.abort().await.unwrap();
    }

    async fn test_abort_discards(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");

        let mut txn = catalog.start_transaction().await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        txn.append(&ratings, RatingRecord::new(1, 1, 1.0))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        txn.append_many(&ratings, &records()).await.unwrap();
        txn.create_table_if_not_exists(&table("range_part0"))
            .await
            .unwrap();
        txn.abort().await.unwrap();

        // dropping without commit discards too
        {
            let mut txn = catalog.start_transaction().await.unwrap();
            txn.append(&ratings, RatingRecord::new(2, 2, 2.0))
                .await
                .unwrap();
        }

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_eq!(txn.row_count(&ratings).await.unwrap(), 1);
        assert!(
            txn.list_tables_with_prefix("range_part")
                .await
                .unwrap()
                .is_empty()
        );
        txn.abort().await.unwrap();
    }

    async fn test_fill_range_partitions(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");
        let partitioning = RangePartitioning::new(5, 5.0).unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        txn.append_many(&ratings, &records()).await.unwrap();

        let mut total = 0;
        let mut per_partition = vec![];
        for interval in partitioning.intervals() {
            let target = table(&PartitionScheme::Range.table_name(interval.index()));
            txn.create_table_if_not_exists(&target).await.unwrap();
            total += txn
                .fill_range_partition(&ratings, &target, interval)
                .await
                .unwrap();

            let rows = txn.scan(&target).await.unwrap();
            assert!(rows.iter().all(|r| interval.contains(r.rating)));
            per_partition.push(rows.len());
        }
        txn.commit().await.unwrap();

        assert_eq!(total, records().len() as u64);
        // [0, 1] = {0.0, 1.0}; (1, 2] = {2.0}; (2, 3] = {2.5, 3.0};
        // (3, 4] = {}; (4, 5] = {4.5, 5.0}
        assert_eq!(per_partition, [2, 1, 2, 0, 2]);
    }

    async fn test_fill_round_robin_partitions(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");
        let targets = (0..3)
            .map(|i| table(&PartitionScheme::RoundRobin.table_name(i)))
            .collect::<Vec<_>>();

        let mut txn = catalog.start_transaction().await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        txn.append_many(&ratings, &records()).await.unwrap();
        for t in &targets {
            txn.create_table_if_not_exists(t).await.unwrap();
        }

        let numbered = txn
            .fill_round_robin_partitions(&ratings, &targets)
            .await
            .unwrap();
        assert_eq!(numbered, 7);

        let mut counts = vec![];
        let mut all = vec![];
        for t in &targets {
            let rows = txn.scan(t).await.unwrap();
            counts.push(rows.len());
            all.extend(rows);
        }
        txn.commit().await.unwrap();

        // 7 rows over 3 partitions
        assert_eq!(counts, [3, 2, 2]);

        // every source row landed in exactly one partition
        let key = |r: &RatingRecord| (r.user_id, r.item_id);
        let mut all = all.iter().map(key).collect::<Vec<_>>();
        all.sort();
        let mut want = records().iter().map(key).collect::<Vec<_>>();
        want.sort();
        assert_eq!(all, want);

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_matches!(
            txn.fill_round_robin_partitions(&ratings, &[]).await,
            Err(Error::Partition { .. })
        );
        txn.abort().await.unwrap();
    }

    async fn test_list_tables_with_prefix(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        for name in [
            "range_part0",
            "range_part1",
            "range_part_old",
            "rangexpart9",
            "rrobin_part0",
            "ratings",
        ] {
            txn.create_table_if_not_exists(&table(name)).await.unwrap();
        }
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_eq!(
            txn.list_tables_with_prefix("range_part").await.unwrap(),
            ["range_part0", "range_part1", "range_part_old"]
        );
        assert_eq!(
            txn.list_tables_with_prefix("rrobin_part").await.unwrap(),
            ["rrobin_part0"]
        );
        assert!(
            txn.list_tables_with_prefix("nothing")
                .await
                .unwrap()
                .is_empty()
        );
        txn.abort().await.unwrap();
    }

    async fn test_partition_sets(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert!(
            txn.get_partition_set(PartitionScheme::Range)
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            txn.lock_partition_set(PartitionScheme::RoundRobin)
                .await
                .unwrap()
                .is_none()
        );

        txn.lock_scheme(PartitionScheme::Range).await.unwrap();
        let first = PartitionSet::rebuild(
            None,
            PartitionScheme::Range,
            "ratings",
            NonZeroU32::new(3).unwrap(),
            5.0,
        );
        txn.put_partition_set(&first).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        let got = txn
            .lock_partition_set(PartitionScheme::Range)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, first);
        txn.abort().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        let second = PartitionSet::rebuild(
            Some(&first),
            PartitionScheme::Range,
            "other_ratings",
            NonZeroU32::new(7).unwrap(),
            10.0,
        );
        txn.put_partition_set(&second).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        let got = txn
            .get_partition_set(PartitionScheme::Range)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.generation, Generation::new(2));
        assert_eq!(got.partition_count(), 7);
        assert_eq!(got.source_table, "other_ratings");
        assert_eq!(got.max_rating, 10.0);
        assert!(
            txn.get_partition_set(PartitionScheme::RoundRobin)
                .await
                .unwrap()
                .is_none()
        );
        txn.abort().await.unwrap();
    }

    async fn test_lock_for_rebuild(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_matches!(
            txn.lock_for_rebuild(PartitionScheme::Range, &ratings).await,
            Err(Error::TableNotFound { name }) if name == "ratings"
        );
        txn.abort().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert!(
            txn.lock_for_rebuild(PartitionScheme::RoundRobin, &ratings)
                .await
                .unwrap()
                .is_none()
        );
        let set = PartitionSet::rebuild(
            None,
            PartitionScheme::RoundRobin,
            "ratings",
            NonZeroU32::new(2).unwrap(),
            5.0,
        );
        txn.put_partition_set(&set).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        let got = txn
            .lock_for_rebuild(PartitionScheme::RoundRobin, &ratings)
            .await
            .unwrap();
        assert_eq!(got, Some(set));
        txn.abort().await.unwrap();
    }

    async fn test_finalized_transaction_releases_catalog(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");
        let timeout = std::time::Duration::from_secs(5);

        let mut committed = catalog.start_transaction().await.unwrap();
        committed.create_table_if_not_exists(&ratings).await.unwrap();
        committed.commit().await.unwrap();

        // both finalized transactions stay alive until the end
        let mut aborted = tokio::time::timeout(timeout, catalog.start_transaction())
            .await
            .expect("committed transaction blocks new ones")
            .unwrap();
        aborted.append(&ratings, RatingRecord::new(1, 1, 1.0)).await.unwrap();
        aborted.abort().await.unwrap();

        let mut txn = tokio::time::timeout(timeout, catalog.start_transaction())
            .await
            .expect("aborted transaction blocks new ones")
            .unwrap();
        assert_eq!(txn.row_count(&ratings).await.unwrap(), 0);
        txn.abort().await.unwrap();

        drop(committed);
        drop(aborted);
    }

    async fn test_row_sequence(catalog: Arc<dyn Catalog>) {
        catalog.setup().await.unwrap();
        let ratings = table("ratings");

        // a table without a sequence starts from its row count
        let mut txn = catalog.start_transaction().await.unwrap();
        txn.create_table_if_not_exists(&ratings).await.unwrap();
        txn.append_many(&ratings, &records()).await.unwrap();
        txn.append(&ratings, RatingRecord::new(5, 5, 5.0))
            .await
            .unwrap();
        assert_eq!(txn.next_ordinal(&ratings).await.unwrap(), 8);
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_eq!(txn.next_ordinal(&ratings).await.unwrap(), 9);
        assert_eq!(txn.next_ordinal(&ratings).await.unwrap(), 10);
        txn.abort().await.unwrap();

        // the aborted advances are rolled back
        let mut txn = catalog.start_transaction().await.unwrap();
        assert_eq!(txn.next_ordinal(&ratings).await.unwrap(), 9);
        txn.set_last_ordinal(&ratings, 100).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = catalog.start_transaction().await.unwrap();
        assert_eq!(txn.next_ordinal(&ratings).await.unwrap(), 101);
        txn.commit().await.unwrap();
    }
}
