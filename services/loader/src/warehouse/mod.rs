//! Warehouse abstraction
//!
//! The load path only needs five operations from the storage engine: make
//! sure a namespace exists, replace a staging relation, create the final
//! relation once, merge staging into final by key, and drop a relation.

use async_trait::async_trait;
use parser::{NormalizedRow, SourceFamily};
use std::fmt;

use crate::error::WarehouseError;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryWarehouse, Operation};
pub use postgres::PgWarehouse;

/// Day-granularity partition column of every relation.
pub const PARTITION_FIELD: &str = "reference_date";

/// Natural key of every relation.
pub const KEY_FIELDS: [&str; 2] = ["reference_date", "series_code"];

/// Clustering columns of the final relations.
pub const CLUSTER_FIELDS: [&str; 1] = ["series_code"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Date,
    Integer,
    Float64,
    Text,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Date => "DATE",
            ColumnType::Integer => "BIGINT",
            ColumnType::Float64 => "DOUBLE PRECISION",
            ColumnType::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub description: &'static str,
}

const CORE_COLUMNS: [Column; 3] = [
    Column {
        name: "reference_date",
        ty: ColumnType::Date,
        description: "Reference date of the observation",
    },
    Column {
        name: "series_code",
        ty: ColumnType::Integer,
        description: "Numeric code of the series",
    },
    Column {
        name: "value",
        ty: ColumnType::Float64,
        description: "Observed value on the reference date",
    },
];

const DESCRIPTIVE_COLUMNS: [Column; 5] = [
    Column {
        name: "unit",
        ty: ColumnType::Text,
        description: "Unit of measure",
    },
    Column {
        name: "locality_code",
        ty: ColumnType::Text,
        description: "Territorial unit code",
    },
    Column {
        name: "locality_name",
        ty: ColumnType::Text,
        description: "Territorial unit name",
    },
    Column {
        name: "display_name",
        ty: ColumnType::Text,
        description: "Human-readable series name",
    },
    Column {
        name: "indicator_code",
        ty: ColumnType::Text,
        description: "Upstream aggregate code",
    },
];

/// Fixed column layout of a staging or final relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    columns: Vec<Column>,
}

impl TableSchema {
    /// `reference_date, series_code, value`
    pub fn core() -> Self {
        Self {
            columns: CORE_COLUMNS.to_vec(),
        }
    }

    /// Core columns plus unit, locality and naming columns.
    pub fn descriptive() -> Self {
        Self {
            columns: CORE_COLUMNS.iter().chain(&DESCRIPTIVE_COLUMNS).copied().collect(),
        }
    }

    pub fn for_family(family: SourceFamily) -> Self {
        if family.is_descriptive() {
            Self::descriptive()
        } else {
            Self::core()
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    /// Every column outside the natural key.
    pub fn value_fields(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .map(|c| c.name)
            .filter(|n| !KEY_FIELDS.contains(n))
            .collect()
    }

    pub fn is_descriptive(&self) -> bool {
        self.columns.len() > CORE_COLUMNS.len()
    }
}

/// A relation inside a dataset (schema).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationRef {
    pub dataset: String,
    pub table: String,
}

impl RelationRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for RelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// Storage engine operations used by the staging writer and upsert merger.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the dataset if absent. Idempotent.
    async fn ensure_dataset(&self, dataset: &str, location: &str) -> Result<(), WarehouseError>;

    /// Replace the full contents of `relation` with `rows`, creating it
    /// (partitioned by day on `reference_date`) if needed.
    async fn write_staging(
        &self,
        relation: &RelationRef,
        rows: &[NormalizedRow],
        schema: &TableSchema,
    ) -> Result<u64, WarehouseError>;

    /// Create the final relation if absent. An existing relation is left as is.
    async fn create_final_if_absent(
        &self,
        relation: &RelationRef,
        schema: &TableSchema,
        partition_field: &str,
        cluster_fields: &[&str],
    ) -> Result<(), WarehouseError>;

    /// Upsert the distinct rows of `staging` into `target` by `key_fields`,
    /// updating `value_fields` on match. Returns rows inserted plus updated.
    async fn merge(
        &self,
        staging: &RelationRef,
        target: &RelationRef,
        key_fields: &[&str],
        value_fields: &[&str],
    ) -> Result<u64, WarehouseError>;

    /// Drop `relation`. Dropping a missing relation succeeds.
    async fn delete_relation(&self, relation: &RelationRef) -> Result<(), WarehouseError>;
}

/// Identifiers are interpolated into SQL, so only a conservative subset is
/// accepted: lowercase ASCII, digits and `_`, starting with a letter.
pub fn validate_identifier(name: &str, max_len: usize) -> Result<(), WarehouseError> {
    let mut chars = name.chars();
    let starts_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if starts_ok && rest_ok && name.len() <= max_len {
        Ok(())
    } else {
        Err(WarehouseError::InvalidIdentifier(name.to_string()))
    }
}
