//! A Postgres backed implementation of the Catalog

use std::{
    fmt::Display,
    num::NonZeroU32,
    str::FromStr,
    time::Duration,
};

use async_trait::async_trait;
use ratings_partition::{
    Generation, PartitionScheme, PartitionSet, RangeInterval, round_robin_partition_index,
};
use snafu::ResultExt;
use sqlx::{
    ConnectOptions, Executor, PgConnection, Postgres, QueryBuilder,
    migrate::Migrator,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::{debug, info};

use crate::{
    interface::{
        Catalog, Error, FailedToCommitSnafu, MigrationSnafu, PartitionSnafu, RatingRecord,
        RatingsRepo, Result, SqlxSnafu, Transaction,
    },
    table_name::TableName,
};

static MIGRATOR: Migrator = sqlx::migrate!();

/// SQLSTATE raised when a statement names a table that does not exist.
const UNDEFINED_TABLE: &str = "42P01";

/// Rows per multi-row `INSERT` issued by [`RatingsRepo::append_many()`].
///
/// Each row binds 3 parameters; Postgres allows at most 65535 per statement.
const APPEND_BATCH_SIZE: usize = 5_000;

/// Postgres connection options.
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// Application name.
    ///
    /// This will be reported to postgres.
    pub app_name: String,

    /// Schema holding the ratings tables, their partitions and the catalog
    /// bookkeeping. Created by [`Catalog::setup()`] if missing.
    pub schema_name: String,

    /// DSN.
    pub dsn: String,

    /// Maximum number of concurrent connections.
    pub max_conns: u32,

    /// Set the amount of time to attempt connecting to the database.
    pub connect_timeout: Duration,

    /// Set a maximum idle duration for individual connections.
    pub idle_timeout: Duration,
}

impl PostgresConnectionOptions {
    /// Default value for [`schema_name`](Self::schema_name).
    pub const DEFAULT_SCHEMA_NAME: &'static str = "ratings";

    /// Default value for [`max_conns`](Self::max_conns).
    pub const DEFAULT_MAX_CONNS: u32 = 10;

    /// Default value for [`connect_timeout`](Self::connect_timeout).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

    /// Default value for [`idle_timeout`](Self::idle_timeout).
    pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for PostgresConnectionOptions {
    fn default() -> Self {
        Self {
            app_name: String::from("ratings"),
            schema_name: String::from(Self::DEFAULT_SCHEMA_NAME),
            dsn: String::new(),
            max_conns: Self::DEFAULT_MAX_CONNS,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Self::DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// PostgreSQL catalog.
#[derive(Debug)]
pub struct PostgresCatalog {
    pool: sqlx::Pool<Postgres>,
    // Connection options for display
    options: PostgresConnectionOptions,
}

impl PostgresCatalog {
    /// Connect to the catalog store.
    pub async fn connect(options: PostgresConnectionOptions) -> Result<Self> {
        // The schema name is spliced into `SET search_path`.
        TableName::new(options.schema_name.as_str())?;

        let pool = new_pool(&options).await.context(SqlxSnafu)?;
        Ok(Self { pool, options })
    }

    fn schema_name(&self) -> &str {
        &self.options.schema_name
    }
}

impl Display for PostgresCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            // Do not include dsn in log as it may have credentials
            // that should not end up in the log
            "Postgres(dsn=OMITTED, schema_name='{}')",
            self.schema_name()
        )
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn setup(&self) -> Result<()> {
        let create_schema = format!("CREATE SCHEMA IF NOT EXISTS {};", self.schema_name());
        self.pool
            .execute(create_schema.as_str())
            .await
            .context(SqlxSnafu)?;

        MIGRATOR.run(&self.pool).await.context(MigrationSnafu)?;
        debug!(schema_name = %self.schema_name(), "catalog migrations applied");
        Ok(())
    }

    async fn start_transaction(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.context(SqlxSnafu)?;
        Ok(Box::new(PostgresTxn { tx: Some(tx) }))
    }
}

/// Creates a new [`sqlx::Pool`] from a database config.
async fn new_pool(options: &PostgresConnectionOptions) -> Result<sqlx::Pool<Postgres>, sqlx::Error> {
    // sqlx exposes some options as pool options, while other options are available as connection options.
    let connect_options = PgConnectOptions::from_str(&options.dsn)?
        // the default is INFO, which is frankly surprising.
        .log_statements(log::LevelFilter::Trace);

    let app_name = options.app_name.clone();
    let app_name2 = options.app_name.clone(); // just to log below
    let schema_name = options.schema_name.clone();
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(options.max_conns)
        .acquire_timeout(options.connect_timeout)
        .idle_timeout(options.idle_timeout)
        .test_before_acquire(true)
        .after_connect(move |c, _meta| {
            let app_name = app_name.to_owned();
            let schema_name = schema_name.to_owned();
            Box::pin(async move {
                // Tag the connection with the provided application name, while allowing it to
                // be override from the connection string (aka DSN).
                let current_application_name: String =
                    sqlx::query_scalar("SELECT current_setting('application_name');")
                        .fetch_one(&mut *c)
                        .await?;
                if current_application_name.is_empty() {
                    sqlx::query("SELECT set_config('application_name', $1, false);")
                        .bind(&*app_name)
                        .execute(&mut *c)
                        .await?;
                }
                let search_path_query = format!("SET search_path TO {schema_name},public;");
                c.execute(sqlx::query(&search_path_query)).await?;

                // Ensure explicit timezone selection, instead of deferring to
                // the server value.
                c.execute("SET timezone = 'UTC';").await?;
                Ok(())
            })
        })
        .connect_with(connect_options)
        .await?;

    info!(application_name=%app_name2, "connected to ratings catalog");
    Ok(pool)
}

/// Map a driver error, turning "relation does not exist" into
/// [`Error::TableNotFound`].
fn map_err(e: sqlx::Error) -> Error {
    if let Some(db_err) = e.as_database_error() {
        if db_err.code().as_deref() == Some(UNDEFINED_TABLE) {
            // relation "<name>" does not exist
            let name = db_err.message().split('"').nth(1).unwrap_or_default();
            return Error::TableNotFound {
                name: name.to_string(),
            };
        }
    }
    Error::SqlxError { source: e }
}

/// transaction for [`PostgresCatalog`].
pub struct PostgresTxn {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl std::fmt::Debug for PostgresTxn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTxn")
            .field("finalized", &self.tx.is_none())
            .finish_non_exhaustive()
    }
}

impl PostgresTxn {
    fn conn(&mut self) -> &mut PgConnection {
        self.tx
            .as_deref_mut()
            .expect("transaction already committed or aborted")
    }

    fn take(&mut self) -> sqlx::Transaction<'static, Postgres> {
        self.tx
            .take()
            .expect("transaction already committed or aborted")
    }
}

#[async_trait]
impl Transaction for PostgresTxn {
    async fn commit(&mut self) -> Result<()> {
        self.take().commit().await.context(FailedToCommitSnafu)
    }

    async fn abort(&mut self) -> Result<()> {
        self.take().rollback().await.context(SqlxSnafu)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PartitionSetRow {
    scheme: String,
    source_table: String,
    partition_count: i32,
    generation: i64,
    max_rating: f64,
}

impl PartitionSetRow {
    fn into_partition_set(self, scheme: PartitionScheme) -> Result<PartitionSet> {
        let invalid = |reason: String| Error::InvalidPartitionSet { scheme, reason };

        if self.scheme != scheme.as_str() {
            return Err(invalid(format!("stored scheme is {:?}", self.scheme)));
        }
        let partition_count = u32::try_from(self.partition_count)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| invalid(format!("partition count {}", self.partition_count)))?;
        let generation = u64::try_from(self.generation)
            .map_err(|_| invalid(format!("generation {}", self.generation)))?;

        Ok(PartitionSet {
            scheme,
            source_table: self.source_table,
            partition_count,
            generation: Generation::new(generation),
            max_rating: self.max_rating,
        })
    }
}

#[async_trait]
impl RatingsRepo for PostgresTxn {
    async fn create_table_if_not_exists(&mut self, table: &TableName) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} \
            (userid INTEGER, movieid INTEGER, rating DOUBLE PRECISION);"
        );
        self.conn().execute(sql.as_str()).await.map_err(map_err)?;
        Ok(())
    }

    async fn clear_table(&mut self, table: &TableName) -> Result<()> {
        let sql = format!("DELETE FROM {table};");
        self.conn().execute(sql.as_str()).await.map_err(map_err)?;
        Ok(())
    }

    async fn drop_table(&mut self, table: &TableName) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {table};");
        self.conn().execute(sql.as_str()).await.map_err(map_err)?;
        Ok(())
    }

    async fn append(&mut self, table: &TableName, record: RatingRecord) -> Result<()> {
        let sql = format!("INSERT INTO {table} (userid, movieid, rating) VALUES ($1, $2, $3);");
        sqlx::query(&sql)
            .bind(record.user_id) // $1
            .bind(record.item_id) // $2
            .bind(record.rating) // $3
            .execute(self.conn())
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn append_many(&mut self, table: &TableName, records: &[RatingRecord]) -> Result<()> {
        for chunk in records.chunks(APPEND_BATCH_SIZE) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} (userid, movieid, rating) "
            ));
            builder.push_values(chunk, |mut b, r| {
                b.push_bind(r.user_id)
                    .push_bind(r.item_id)
                    .push_bind(r.rating);
            });
            builder
                .build()
                .execute(self.conn())
                .await
                .map_err(map_err)?;
        }
        Ok(())
    }

    async fn row_count(&mut self, table: &TableName) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {table};");
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(self.conn())
            .await
            .map_err(map_err)?;
        Ok(count as u64)
    }

    async fn scan(&mut self, table: &TableName) -> Result<Vec<RatingRecord>> {
        let sql = format!("SELECT userid, movieid, rating FROM {table};");
        sqlx::query_as::<_, RatingRecord>(&sql)
            .fetch_all(self.conn())
            .await
            .map_err(map_err)
    }

    async fn fill_range_partition(
        &mut self,
        source: &TableName,
        target: &TableName,
        interval: RangeInterval,
    ) -> Result<u64> {
        let lower_op = if interval.lower_inclusive() { ">=" } else { ">" };
        let sql = format!(
            r#"
INSERT INTO {target} (userid, movieid, rating)
SELECT userid, movieid, rating
FROM {source}
WHERE rating {lower_op} $1 AND rating <= $2;
            "#
        );
        let res = sqlx::query(&sql)
            .bind(interval.lower()) // $1
            .bind(interval.upper()) // $2
            .execute(self.conn())
            .await
            .map_err(map_err)?;
        Ok(res.rows_affected())
    }

    async fn fill_round_robin_partitions(
        &mut self,
        source: &TableName,
        targets: &[TableName],
    ) -> Result<u64> {
        let partition_count = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        round_robin_partition_index(1, partition_count).context(PartitionSnafu)?;

        // Number the rows exactly once. Evaluating ROW_NUMBER() per partition
        // is free to number the rows differently each time.
        let conn = self.conn();
        (&mut *conn)
            .execute("DROP TABLE IF EXISTS pg_temp.rrobin_snapshot;")
            .await
            .map_err(map_err)?;
        let snapshot = format!(
            r#"
CREATE TEMPORARY TABLE rrobin_snapshot ON COMMIT DROP AS
SELECT userid, movieid, rating, ROW_NUMBER() OVER () AS ordinal
FROM {source};
            "#
        );
        let numbered = (&mut *conn)
            .execute(snapshot.as_str())
            .await
            .map_err(map_err)?
            .rows_affected();

        for (index, target) in targets.iter().enumerate() {
            let sql = format!(
                r#"
INSERT INTO {target} (userid, movieid, rating)
SELECT userid, movieid, rating
FROM pg_temp.rrobin_snapshot
WHERE (ordinal - 1) % $1 = $2;
                "#
            );
            sqlx::query(&sql)
                .bind(i64::from(partition_count)) // $1
                .bind(index as i64) // $2
                .execute(&mut *conn)
                .await
                .map_err(map_err)?;
        }

        Ok(numbered)
    }

    async fn list_tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
SELECT table_name::text
FROM information_schema.tables
WHERE table_schema = current_schema()
  AND table_type = 'BASE TABLE'
  AND left(table_name::text, length($1)) = $1
ORDER BY table_name::text COLLATE "C";
            "#,
        )
        .bind(prefix) // $1
        .fetch_all(self.conn())
        .await
        .context(SqlxSnafu)
    }

    async fn get_partition_set(&mut self, scheme: PartitionScheme) -> Result<Option<PartitionSet>> {
        let row = sqlx::query_as::<_, PartitionSetRow>(
            r#"
SELECT scheme, source_table, partition_count, generation, max_rating
FROM partition_set
WHERE scheme = $1;
            "#,
        )
        .bind(scheme.as_str()) // $1
        .fetch_optional(self.conn())
        .await
        .context(SqlxSnafu)?;

        row.map(|r| r.into_partition_set(scheme)).transpose()
    }

    async fn lock_partition_set(
        &mut self,
        scheme: PartitionScheme,
    ) -> Result<Option<PartitionSet>> {
        let row = sqlx::query_as::<_, PartitionSetRow>(
            r#"
SELECT scheme, source_table, partition_count, generation, max_rating
FROM partition_set
WHERE scheme = $1
FOR SHARE;
            "#,
        )
        .bind(scheme.as_str()) // $1
        .fetch_optional(self.conn())
        .await
        .context(SqlxSnafu)?;

        row.map(|r| r.into_partition_set(scheme)).transpose()
    }

    async fn put_partition_set(&mut self, set: &PartitionSet) -> Result<()> {
        let invalid = |reason: String| Error::InvalidPartitionSet {
            scheme: set.scheme,
            reason,
        };
        let partition_count = i32::try_from(set.partition_count())
            .map_err(|_| invalid(format!("partition count {}", set.partition_count())))?;
        let generation = i64::try_from(set.generation.get())
            .map_err(|_| invalid(format!("generation {}", set.generation)))?;

        sqlx::query(
            r#"
INSERT INTO partition_set (scheme, source_table, partition_count, generation, max_rating)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (scheme) DO UPDATE
SET source_table = EXCLUDED.source_table,
    partition_count = EXCLUDED.partition_count,
    generation = EXCLUDED.generation,
    max_rating = EXCLUDED.max_rating;
            "#,
        )
        .bind(set.scheme.as_str()) // $1
        .bind(&set.source_table) // $2
        .bind(partition_count) // $3
        .bind(generation) // $4
        .bind(set.max_rating) // $5
        .execute(self.conn())
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }

    async fn lock_scheme(&mut self, scheme: PartitionScheme) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1));")
            .bind(format!("ratings_partition:{scheme}")) // $1
            .execute(self.conn())
            .await
            .context(SqlxSnafu)?;
        Ok(())
    }

    async fn lock_for_rebuild(
        &mut self,
        scheme: PartitionScheme,
        source: &TableName,
    ) -> Result<Option<PartitionSet>> {
        self.lock_scheme(scheme).await?;

        // conflicts with the FOR SHARE taken by inserts
        let row = sqlx::query_as::<_, PartitionSetRow>(
            r#"
SELECT scheme, source_table, partition_count, generation, max_rating
FROM partition_set
WHERE scheme = $1
FOR UPDATE;
            "#,
        )
        .bind(scheme.as_str()) // $1
        .fetch_optional(self.conn())
        .await
        .context(SqlxSnafu)?;

        // SHARE conflicts with the ROW EXCLUSIVE lock every append takes
        let sql = format!("LOCK TABLE {source} IN SHARE MODE;");
        self.conn().execute(sql.as_str()).await.map_err(map_err)?;

        row.map(|r| r.into_partition_set(scheme)).transpose()
    }

    async fn next_ordinal(&mut self, table: &TableName) -> Result<u64> {
        let advanced = sqlx::query_scalar::<_, i64>(
            r#"
UPDATE row_sequence
SET last_ordinal = last_ordinal + 1
WHERE source_table = $1
RETURNING last_ordinal;
            "#,
        )
        .bind(table.as_str()) // $1
        .fetch_optional(self.conn())
        .await
        .context(SqlxSnafu)?;
        if let Some(ordinal) = advanced {
            return Ok(ordinal as u64);
        }

        // First ordinal handed out for this table. A concurrent writer may
        // create the row first, in which case its value is advanced instead.
        let sql = format!(
            r#"
INSERT INTO row_sequence (source_table, last_ordinal)
VALUES ($1, (SELECT COUNT(*) FROM {table}))
ON CONFLICT (source_table) DO UPDATE
SET last_ordinal = row_sequence.last_ordinal + 1
RETURNING last_ordinal;
            "#
        );
        let ordinal = sqlx::query_scalar::<_, i64>(&sql)
            .bind(table.as_str()) // $1
            .fetch_one(self.conn())
            .await
            .map_err(map_err)?;
        Ok(ordinal as u64)
    }

    async fn set_last_ordinal(&mut self, table: &TableName, last: u64) -> Result<()> {
        let last = i64::try_from(last).unwrap_or(i64::MAX);
        sqlx::query(
            r#"
INSERT INTO row_sequence (source_table, last_ordinal)
VALUES ($1, $2)
ON CONFLICT (source_table) DO UPDATE
SET last_ordinal = EXCLUDED.last_ordinal;
            "#,
        )
        .bind(table.as_str()) // $1
        .bind(last) // $2
        .execute(self.conn())
        .await
        .context(SqlxSnafu)?;
        Ok(())
    }
}

/// Helpers for tests that run against a live Postgres.
#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use rand::Rng;

    pub(crate) const TEST_DSN_ENV: &str = "TEST_RATINGS_CATALOG_DSN";

    /// Helper macro to skip tests if TEST_INTEGRATION and TEST_RATINGS_CATALOG_DSN environment
    /// variables are not set.
    macro_rules! maybe_skip_integration {
        ($panic_msg:expr) => {{
            dotenvy::dotenv().ok();

            let required_vars = [crate::postgres::test_utils::TEST_DSN_ENV];
            let unset_vars: Vec<_> = required_vars
                .iter()
                .filter_map(|&name| match std::env::var(name) {
                    Ok(_) => None,
                    Err(_) => Some(name),
                })
                .collect();
            let unset_var_names = unset_vars.join(", ");

            let force = std::env::var("TEST_INTEGRATION");

            if force.is_ok() && !unset_var_names.is_empty() {
                panic!(
                    "TEST_INTEGRATION is set, \
                            but variable(s) {} need to be set",
                    unset_var_names
                );
            } else if force.is_err() {
                eprintln!(
                    "skipping Postgres integration test - set {}TEST_INTEGRATION to run",
                    if unset_var_names.is_empty() {
                        String::new()
                    } else {
                        format!("{} and ", unset_var_names)
                    }
                );

                let panic_msg: &'static str = $panic_msg;
                if !panic_msg.is_empty() {
                    panic!("{}", panic_msg);
                }

                return;
            }
        }};
        () => {
            maybe_skip_integration!("")
        };
    }

    pub(crate) use maybe_skip_integration;

    /// Connect to the test database using a fresh, randomly named schema.
    pub(crate) async fn setup_db() -> PostgresCatalog {
        // create a random schema for this particular pool
        let schema_name = {
            // use scope to make it clear to clippy / rust that `rng` is
            // not carried past await points
            let mut rng = rand::thread_rng();
            (&mut rng)
                .sample_iter(rand::distributions::Alphanumeric)
                .filter(|c| c.is_ascii_alphabetic())
                .take(20)
                .map(|c| char::from(c).to_ascii_lowercase())
                .collect::<String>()
        };

        let dsn = std::env::var(TEST_DSN_ENV).unwrap();
        let options = PostgresConnectionOptions {
            app_name: String::from("test"),
            schema_name,
            dsn,
            max_conns: 3,
            ..Default::default()
        };
        let pg = PostgresCatalog::connect(options)
            .await
            .expect("failed to connect catalog");
        pg.setup().await.expect("failed to initialise database");
        pg
    }
}
