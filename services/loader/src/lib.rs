//! Loader - incremental upsert of indicator series into the warehouse
//!
//! Responsibilities:
//! - Land each series' normalized batch in a staging relation
//! - Upsert staging into the partitioned final relation by (reference_date, series_code)
//! - Drop staging after a successful merge, keep it after a failed one
//! - Run every configured series independently and report the aggregate outcome
//!
//! CRITICAL: IDEMPOTENT
//! Re-running the same window must leave the final relations exactly as a
//! single run would. Rows outside the window are never touched.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod staging;
pub mod warehouse;

pub use config::{Catalog, Config, Destination, Selection, Settings};
pub use coordinator::{
    Indicator, RetryDisposition, RunCoordinator, RunReport, SeriesOutcome, SeriesState, Stage,
};
pub use error::{ConfigError, LoadError, WarehouseError};
pub use merge::{RowsAffected, UpsertMerger};
pub use staging::StagingWriter;
pub use warehouse::{MemoryWarehouse, PgWarehouse, RelationRef, TableSchema, Warehouse};
