//! Implementation of the `insert` command.

use clap::Parser;
use ratings_catalog::RatingRecord;
use ratings_ingest::IncrementalInserter;
use ratings_partition::Generation;

use super::common::{CommonConfig, Result, SchemeArg, TableConfig};

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: CommonConfig,

    /// Partitioning scheme whose partitions receive the rating
    #[clap(value_enum, action)]
    scheme: SchemeArg,

    #[clap(flatten)]
    table_config: TableConfig,

    #[clap(short = 'u', long = "user", action)]
    user_id: i32,

    #[clap(short = 'i', long = "item", alias = "movie", action)]
    item_id: i32,

    #[clap(short = 'r', long = "rating", allow_negative_numbers = true, action)]
    rating: f64,

    /// Refuse the insert unless the partition set is at this generation
    ///
    /// Protects against writing into partitions that were rebuilt since the
    /// caller last looked at them.
    #[clap(long = "generation", action)]
    generation: Option<u64>,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let catalog = config.common.catalog().await?;
    let inserter = IncrementalInserter::new(catalog);
    let table = &config.table_config.table;
    let record = RatingRecord::new(config.user_id, config.item_id, config.rating);
    let expected = config.generation.map(Generation::new);

    let outcome = match config.scheme {
        SchemeArg::Range => inserter.range_insert(table, record, expected).await?,
        SchemeArg::RoundRobin => inserter.round_robin_insert(table, record, expected).await?,
    };
    println!(
        "inserted row {} of {table} into {} (generation {})",
        outcome.ordinal, outcome.partition_table, outcome.generation,
    );

    Ok(())
}
