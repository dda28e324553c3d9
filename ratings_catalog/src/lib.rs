//! The ratings catalog: the main ratings tables, their partition tables, and
//! the bookkeeping that keeps incremental inserts consistent with the last
//! bulk partition build.
//!
//! Two implementations of [`interface::Catalog`] are provided:
//!
//! * [`postgres::PostgresCatalog`] stores everything in a PostgreSQL schema.
//! * [`mem::MemCatalog`] keeps everything in memory. It is useful for tests
//!   and for short-lived runs that do not need persistence.

pub mod interface;
pub mod mem;
pub mod postgres;
mod table_name;

pub use interface::{Catalog, Error, RatingRecord, RatingsRepo, Result, Transaction};
pub use table_name::{TableName, TableNameError};
