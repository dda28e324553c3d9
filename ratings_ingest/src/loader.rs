use std::{
    path::Path,
    time::{Duration, Instant},
};

use ratings_catalog::{Catalog, RatingRecord, TableName, Transaction};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::{debug, info};

use crate::{Error, Result, finish};

/// Separator between the fields of a ratings file line.
const FIELD_SEPARATOR: &str = "::";

/// Records buffered before they are appended to the main table.
const LOAD_BATCH_SIZE: usize = 10_000;

/// A line of a ratings file that has all its fields but cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseRatingError {
    #[error("invalid user id {value:?}")]
    InvalidUserId { value: String },

    #[error("invalid movie id {value:?}")]
    InvalidItemId { value: String },

    #[error("invalid rating {value:?}")]
    InvalidRating { value: String },
}

/// Outcome of [`load_ratings()`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSummary {
    /// Records written to the main table.
    pub loaded: u64,
    /// Non-blank lines ignored because they have fewer than four fields.
    pub skipped: u64,
    pub elapsed: Duration,
}

/// Parse one `UserID::MovieID::Rating::Timestamp` line.
///
/// Returns `None` for lines without a record, which are blank lines and
/// lines with fewer than four fields. The timestamp is not interpreted.
pub fn parse_rating_line(line: &str) -> Option<Result<RatingRecord, ParseRatingError>> {
    let mut fields = line.trim().split(FIELD_SEPARATOR);
    let (user, item, rating, _timestamp) =
        (fields.next()?, fields.next()?, fields.next()?, fields.next()?);

    Some(parse_fields(user.trim(), item.trim(), rating.trim()))
}

fn parse_fields(user: &str, item: &str, rating: &str) -> Result<RatingRecord, ParseRatingError> {
    let user_id = user
        .parse()
        .map_err(|_| ParseRatingError::InvalidUserId {
            value: user.to_string(),
        })?;
    let item_id = item
        .parse()
        .map_err(|_| ParseRatingError::InvalidItemId {
            value: item.to_string(),
        })?;
    let rating = rating
        .parse::<f64>()
        .ok()
        .filter(|r| r.is_finite())
        .ok_or_else(|| ParseRatingError::InvalidRating {
            value: rating.to_string(),
        })?;

    Ok(RatingRecord::new(user_id, item_id, rating))
}

/// Replace the contents of `table` with the ratings in the file at `path`.
///
/// The table is created if it does not exist and emptied if it does. Its row
/// sequence is reset to the number of records loaded, so the next appended
/// row gets the following ordinal.
///
/// # Errors
///
/// Fails without changing the catalog if the file cannot be read or a line
/// with four fields does not decode.
pub async fn load_ratings(
    catalog: &dyn Catalog,
    table: &TableName,
    path: &Path,
) -> Result<LoadSummary> {
    let start = Instant::now();
    let file = File::open(path).await.map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut txn = catalog.start_transaction().await?;
    let res = load(txn.as_mut(), table, path, file).await;
    let (loaded, skipped) = finish(txn, "load ratings", res).await?;

    let summary = LoadSummary {
        loaded,
        skipped,
        elapsed: start.elapsed(),
    };
    info!(%table, loaded, skipped, elapsed = ?summary.elapsed, "loaded ratings");
    Ok(summary)
}

async fn load(
    txn: &mut dyn Transaction,
    table: &TableName,
    path: &Path,
    file: File,
) -> Result<(u64, u64)> {
    txn.create_table_if_not_exists(table).await?;
    txn.clear_table(table).await?;

    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut lines = BufReader::new(file).lines();
    let mut batch = Vec::with_capacity(LOAD_BATCH_SIZE);
    let mut loaded = 0;
    let mut skipped = 0;
    let mut line_number = 0;
    while let Some(line) = lines.next_line().await.map_err(io_err)? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }

        match parse_rating_line(&line) {
            Some(Ok(record)) => batch.push(record),
            Some(Err(source)) => {
                return Err(Error::Parse {
                    path: path.to_path_buf(),
                    line: line_number,
                    source,
                });
            }
            None => {
                debug!(line = line_number, "skipping line with fewer than 4 fields");
                skipped += 1;
            }
        }

        if batch.len() == LOAD_BATCH_SIZE {
            txn.append_many(table, &batch).await?;
            loaded += batch.len() as u64;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        txn.append_many(table, &batch).await?;
        loaded += batch.len() as u64;
    }

    txn.set_last_ordinal(table, loaded).await?;
    Ok((loaded, skipped))
}
