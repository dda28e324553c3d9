//! Implementation of the `inspect` command.

use clap::Parser;
use ratings_catalog::{TableName, Transaction};
use ratings_ingest::count_partitions;
use ratings_partition::PartitionScheme;

use super::common::{CommonConfig, Result};

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) common: CommonConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let catalog = config.common.catalog().await?;

    // read only, so the transaction is always rolled back
    let mut txn = catalog.start_transaction().await?;
    let res = inspect(txn.as_mut()).await;
    txn.abort().await?;
    res
}

async fn inspect(txn: &mut dyn Transaction) -> Result<()> {
    for scheme in PartitionScheme::ALL {
        let found = count_partitions(&mut *txn, scheme).await?;

        let Some(set) = txn.get_partition_set(scheme).await? else {
            println!("{scheme}: no partition set, {found} {}* tables", scheme.prefix());
            continue;
        };

        println!(
            "{scheme}: {} partitions of {}, generation {}, max rating {}",
            set.partition_count(),
            set.source_table,
            set.generation,
            set.max_rating,
        );
        for name in set.partition_tables() {
            let table = TableName::new(name.as_str()).map_err(ratings_catalog::Error::from)?;
            let rows = txn.row_count(&table).await?;
            println!("  {name}: {rows} rows");
        }
        if found != set.partition_count() as usize {
            println!(
                "  warning: {found} {}* tables present, the partition set names {}",
                scheme.prefix(),
                set.partition_count(),
            );
        }
    }

    Ok(())
}
