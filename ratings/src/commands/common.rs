use std::sync::Arc;

use clap::Parser;
use ratings_catalog::{Catalog, TableName};
use ratings_clap_blocks::{catalog_dsn::CatalogDsnConfig, logging::LoggingConfig};
use ratings_ingest::BuildSummary;
use ratings_partition::PartitionScheme;
use tracing::info;

const APP_NAME: &str = "ratings";

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error(transparent)]
    CatalogDsn(#[from] ratings_clap_blocks::catalog_dsn::Error),

    #[error(transparent)]
    Catalog(#[from] ratings_catalog::Error),

    #[error(transparent)]
    Ingest(#[from] ratings_ingest::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// Options shared by every command that touches the catalog.
#[derive(Debug, Parser)]
pub(crate) struct CommonConfig {
    #[clap(flatten)]
    pub(crate) catalog_dsn: CatalogDsnConfig,

    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,
}

impl CommonConfig {
    /// Connect to the configured catalog and make sure its bookkeeping
    /// tables exist.
    pub(crate) async fn catalog(&self) -> Result<Arc<dyn Catalog>> {
        let catalog = self.catalog_dsn.get_catalog(APP_NAME).await?;
        catalog.setup().await?;
        info!(%catalog, "catalog ready");
        Ok(catalog)
    }
}

/// Name of the ratings table a command works on.
#[derive(Debug, Parser)]
pub(crate) struct TableConfig {
    /// The main ratings table
    #[clap(
        short = 't',
        long = "table",
        env = "RATINGS_TABLE",
        default_value = "ratings",
        action
    )]
    pub(crate) table: TableName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum SchemeArg {
    /// Partition by rating into equal slices of the rating domain
    Range,
    /// Deal rows over the partitions in insertion order
    RoundRobin,
}

impl From<SchemeArg> for PartitionScheme {
    fn from(value: SchemeArg) -> Self {
        match value {
            SchemeArg::Range => Self::Range,
            SchemeArg::RoundRobin => Self::RoundRobin,
        }
    }
}

pub(crate) fn print_build_summary(summary: &BuildSummary) {
    let set = &summary.partition_set;
    println!(
        "built {} {} partitions of {} (generation {}) in {}",
        set.partition_count(),
        set.scheme,
        set.source_table,
        set.generation,
        humantime::format_duration(summary.elapsed),
    );
    for (table, rows) in set.partition_tables().zip(&summary.rows_per_partition) {
        println!("  {table}: {rows} rows");
    }
    for table in &summary.dropped {
        println!("  dropped stale partition {table}");
    }
}
