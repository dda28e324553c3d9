//! Implementation of the `load` command.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use ratings_ingest::{BulkPartitionBuilder, load_ratings};
use ratings_partition::MAX_RATING;

use super::common::{CommonConfig, Result, TableConfig, print_build_summary};

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: CommonConfig,

    #[clap(flatten)]
    table_config: TableConfig,

    /// File of `UserID::MovieID::Rating::Timestamp` lines to load
    ///
    /// The table is created if needed and its previous contents replaced.
    #[clap(short = 'f', long = "file", action)]
    file_path: PathBuf,

    /// Build this many range partitions once the file is loaded
    #[clap(long = "range-partitions", action)]
    range_partitions: Option<u32>,

    /// Upper bound of the rating domain for `--range-partitions`
    #[clap(long = "max-rating", default_value_t = MAX_RATING, action)]
    max_rating: f64,

    /// Build this many round-robin partitions once the file is loaded
    #[clap(long = "round-robin-partitions", action)]
    round_robin_partitions: Option<u32>,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let catalog = config.common.catalog().await?;
    let table = &config.table_config.table;

    let summary = load_ratings(catalog.as_ref(), table, &config.file_path).await?;
    println!(
        "loaded {} ratings into {table} ({} lines skipped) in {}",
        summary.loaded,
        summary.skipped,
        humantime::format_duration(summary.elapsed),
    );

    let builder = BulkPartitionBuilder::new(Arc::clone(&catalog));
    if let Some(partitions) = config.range_partitions {
        let summary = builder
            .range_partition(table, partitions, config.max_rating)
            .await?;
        print_build_summary(&summary);
    }
    if let Some(partitions) = config.round_robin_partitions {
        let summary = builder.round_robin_partition(table, partitions).await?;
        print_build_summary(&summary);
    }

    Ok(())
}
