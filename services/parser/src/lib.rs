//! Parser - turns raw statistical records into canonical rows
//!
//! Responsibilities:
//! - Define the canonical data model shared by every service
//! - Normalize period codes and locale-formatted values
//! - Validate each source family's record shape once, up front
//! - Project records into the fixed output schema, counting bad rows
//!
//! Nothing in this crate performs I/O.

pub mod decode;
pub mod model;
pub mod normalize;
pub mod project;

pub use decode::{decode, BcbRecord, IbgeRecord, ProjectError, SourceRecords};
pub use model::{distinct_dates, Batch, DateRange, NormalizedRow, PeriodKind, RawRecord, SeriesMeta, SourceFamily};
pub use normalize::{classify_value, normalize, parse_day_date, parse_period, parse_value, ValueToken};
pub use project::{project, Projection, ProjectionReport, AGGREGATE_ROOT_LOCALITY};
