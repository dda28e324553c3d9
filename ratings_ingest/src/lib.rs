//! Loading ratings into a catalog, building partition sets from them, and
//! inserting single rows so they stay consistent with the last build.
//!
//! Each public operation runs in exactly one catalog transaction. It either
//! commits as a whole or is aborted, and the error that caused the abort is
//! returned to the caller.

use std::path::PathBuf;

use ratings_catalog::{TableName, Transaction};
use ratings_partition::{Generation, PartitionError, PartitionScheme};
use thiserror::Error;
use tracing::warn;

mod builder;
mod inserter;
mod loader;

pub use builder::{BuildSummary, BulkPartitionBuilder, count_partitions};
pub use inserter::{IncrementalInserter, InsertOutcome};
pub use loader::{LoadSummary, ParseRatingError, load_ratings, parse_rating_line};

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog error: {0}")]
    Catalog(#[from] ratings_catalog::Error),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("rating {rating} rejected: outside the rating domain [0, {max_rating}]")]
    RejectedRating { rating: f64, max_rating: f64 },

    #[error("{scheme} partition set is at generation {actual}, expected generation {expected}")]
    StaleGeneration {
        scheme: PartitionScheme,
        expected: Generation,
        actual: Generation,
    },

    #[error("{scheme} partitions were built from table {built_from}, not {table}")]
    SourceMismatch {
        scheme: PartitionScheme,
        table: String,
        built_from: String,
    },

    #[error("table {table} is itself a {scheme} partition and cannot be partitioned")]
    SourceIsPartition {
        scheme: PartitionScheme,
        table: String,
    },

    #[error("no {scheme} partitions exist; build them before inserting")]
    NoPartitions { scheme: PartitionScheme },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}:{line}: {source}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        source: ParseRatingError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Name of partition `index` of `scheme`.
fn partition_table(scheme: PartitionScheme, index: u32) -> Result<TableName> {
    TableName::new(scheme.table_name(index)).map_err(|e| ratings_catalog::Error::from(e).into())
}

/// Commit `txn` if `result` is a success, abort it otherwise.
async fn finish<T>(
    mut txn: Box<dyn Transaction>,
    operation: &'static str,
    result: Result<T>,
) -> Result<T> {
    match result {
        Ok(v) => {
            txn.commit().await?;
            Ok(v)
        }
        Err(e) => {
            warn!(%e, operation, "aborting transaction");
            if let Err(abort_error) = txn.abort().await {
                warn!(%abort_error, operation, "failed to abort transaction");
            }
            Err(e)
        }
    }
}
