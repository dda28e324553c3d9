//! Implementation of the `partition` command.

use clap::Parser;
use ratings_ingest::BulkPartitionBuilder;
use ratings_partition::MAX_RATING;

use super::common::{CommonConfig, Result, SchemeArg, TableConfig, print_build_summary};

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: CommonConfig,

    /// Partitioning scheme to rebuild
    #[clap(value_enum, action)]
    scheme: SchemeArg,

    #[clap(flatten)]
    table_config: TableConfig,

    /// Number of partitions to build
    #[clap(short = 'n', long = "partitions", action)]
    partitions: u32,

    /// Upper bound of the rating domain, range partitioning only
    #[clap(long = "max-rating", default_value_t = MAX_RATING, action)]
    max_rating: f64,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let catalog = config.common.catalog().await?;
    let builder = BulkPartitionBuilder::new(catalog);
    let table = &config.table_config.table;

    let summary = match config.scheme {
        SchemeArg::Range => {
            builder
                .range_partition(table, config.partitions, config.max_rating)
                .await?
        }
        SchemeArg::RoundRobin => builder.round_robin_partition(table, config.partitions).await?,
    };
    print_build_summary(&summary);

    Ok(())
}
