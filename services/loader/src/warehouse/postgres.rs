//! PostgreSQL warehouse
//!
//! Datasets are schemas. Staging and final tables are list-partitioned on
//! `reference_date` with one partition per day, created on demand, so merges
//! over a lookback window only touch the partitions the window covers.

use async_trait::async_trait;
use chrono::NaiveDate;
use parser::{distinct_dates, NormalizedRow};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::debug;

use super::{validate_identifier, RelationRef, TableSchema, Warehouse, PARTITION_FIELD};
use crate::error::WarehouseError;

/// PostgreSQL's identifier limit.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Leaves room for the `_pYYYYMMDD` partition and `_cluster_idx` suffixes.
const MAX_TABLE_NAME_LEN: usize = 50;

const SCHEMA_EXISTS_SQL: &str = "SELECT EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)";

/// Bound to the quoted `"dataset"."table"` name.
const RELATION_EXISTS_SQL: &str = "SELECT to_regclass($1) IS NOT NULL";

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(db_url: &str) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;
        Ok(Self { pool })
    }

    async fn schema_exists(&self, dataset: &str) -> Result<bool, WarehouseError> {
        let exists = sqlx::query_scalar::<_, bool>(SCHEMA_EXISTS_SQL)
            .bind(dataset)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn relation_exists(&self, relation: &RelationRef) -> Result<bool, WarehouseError> {
        let exists = sqlx::query_scalar::<_, bool>(RELATION_EXISTS_SQL)
            .bind(qualified(relation)?)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn staged_dates(&self, staging: &RelationRef) -> Result<Vec<NaiveDate>, WarehouseError> {
        let sql = format!(
            "SELECT DISTINCT {PARTITION_FIELD} FROM {} ORDER BY 1",
            qualified(staging)?
        );
        let rows: Vec<(NaiveDate,)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

// =============================================================================
// SQL builders
// =============================================================================

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// `"dataset"."table"`, after validating both parts.
fn qualified(relation: &RelationRef) -> Result<String, WarehouseError> {
    validate_identifier(&relation.dataset, MAX_IDENTIFIER_LEN)?;
    validate_identifier(&relation.table, MAX_TABLE_NAME_LEN)?;
    Ok(format!("{}.{}", quote(&relation.dataset), quote(&relation.table)))
}

fn literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn create_schema_sql(dataset: &str) -> Result<String, WarehouseError> {
    validate_identifier(dataset, MAX_IDENTIFIER_LEN)?;
    Ok(format!("CREATE SCHEMA IF NOT EXISTS {}", quote(dataset)))
}

fn comment_schema_sql(dataset: &str, location: &str) -> Result<String, WarehouseError> {
    validate_identifier(dataset, MAX_IDENTIFIER_LEN)?;
    Ok(format!(
        "COMMENT ON SCHEMA {} IS {}",
        quote(dataset),
        literal(&format!("location: {location}"))
    ))
}

/// Partitioned table DDL. The final table carries the natural key as its
/// primary key; staging tables accept duplicates.
fn create_table_sql(
    relation: &RelationRef,
    schema: &TableSchema,
    partition_field: &str,
    primary_key: Option<&[&str]>,
) -> Result<String, WarehouseError> {
    validate_identifier(partition_field, MAX_IDENTIFIER_LEN)?;
    let mut defs: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| {
            let not_null = if super::KEY_FIELDS.contains(&c.name) { " NOT NULL" } else { "" };
            format!("{} {}{}", c.name, c.ty.sql(), not_null)
        })
        .collect();
    if let Some(key) = primary_key {
        for field in key {
            validate_identifier(field, MAX_IDENTIFIER_LEN)?;
        }
        defs.push(format!("PRIMARY KEY ({})", key.join(", ")));
    }
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({}) PARTITION BY LIST ({partition_field})",
        qualified(relation)?,
        defs.join(", ")
    ))
}

fn comment_column_sql(
    relation: &RelationRef,
    column: &str,
    description: &str,
) -> Result<String, WarehouseError> {
    validate_identifier(column, MAX_IDENTIFIER_LEN)?;
    Ok(format!(
        "COMMENT ON COLUMN {}.{} IS {}",
        qualified(relation)?,
        column,
        literal(description)
    ))
}

fn partition_name(relation: &RelationRef, date: NaiveDate) -> String {
    format!("{}_p{}", relation.table, date.format("%Y%m%d"))
}

fn create_partition_sql(relation: &RelationRef, date: NaiveDate) -> Result<String, WarehouseError> {
    let parent = qualified(relation)?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {}.{} PARTITION OF {parent} FOR VALUES IN ('{}')",
        quote(&relation.dataset),
        quote(&partition_name(relation, date)),
        date.format("%Y-%m-%d")
    ))
}

fn cluster_index_sql(relation: &RelationRef, cluster_fields: &[&str]) -> Result<String, WarehouseError> {
    for field in cluster_fields {
        validate_identifier(field, MAX_IDENTIFIER_LEN)?;
    }
    Ok(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote(&format!("{}_cluster_idx", relation.table)),
        qualified(relation)?,
        cluster_fields.join(", ")
    ))
}

fn array_cast(ty: super::ColumnType) -> &'static str {
    match ty {
        super::ColumnType::Date => "date[]",
        super::ColumnType::Integer => "bigint[]",
        super::ColumnType::Float64 => "float8[]",
        super::ColumnType::Text => "text[]",
    }
}

/// One INSERT for the whole batch: each column is bound as an array and
/// zipped back into rows by `UNNEST`.
fn insert_unnest_sql(relation: &RelationRef, schema: &TableSchema) -> Result<String, WarehouseError> {
    let columns = schema.column_names().join(", ");
    let arrays: Vec<String> = schema
        .columns()
        .iter()
        .enumerate()
        .map(|(i, c)| format!("${}::{}", i + 1, array_cast(c.ty)))
        .collect();
    Ok(format!(
        "INSERT INTO {} ({columns}) SELECT * FROM UNNEST({})",
        qualified(relation)?,
        arrays.join(", ")
    ))
}

fn merge_sql(
    staging: &RelationRef,
    target: &RelationRef,
    key_fields: &[&str],
    value_fields: &[&str],
) -> Result<String, WarehouseError> {
    if key_fields.is_empty() {
        return Err(WarehouseError::Rejected("merge needs at least one key field".to_string()));
    }
    for field in key_fields.iter().chain(value_fields) {
        validate_identifier(field, MAX_IDENTIFIER_LEN)?;
    }

    let all: Vec<&str> = key_fields.iter().chain(value_fields).copied().collect();
    let on = key_fields
        .iter()
        .map(|f| format!("t.{f} = s.{f}"))
        .collect::<Vec<_>>()
        .join(" AND ");
    let insert_values = all.iter().map(|f| format!("s.{f}")).collect::<Vec<_>>().join(", ");

    let mut sql = format!(
        "MERGE INTO {} AS t USING (SELECT DISTINCT {} FROM {}) AS s ON {on}",
        qualified(target)?,
        all.join(", "),
        qualified(staging)?
    );
    if !value_fields.is_empty() {
        let set = value_fields
            .iter()
            .map(|f| format!("{f} = s.{f}"))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {set}"));
    }
    sql.push_str(&format!(
        " WHEN NOT MATCHED THEN INSERT ({}) VALUES ({insert_values})",
        all.join(", ")
    ));
    Ok(sql)
}

fn drop_table_sql(relation: &RelationRef) -> Result<String, WarehouseError> {
    Ok(format!("DROP TABLE IF EXISTS {} CASCADE", qualified(relation)?))
}

fn text_column(rows: &[NormalizedRow], get: impl Fn(&NormalizedRow) -> &Option<String>) -> Vec<Option<String>> {
    rows.iter().map(|r| get(r).clone()).collect()
}

fn bind_column<'q>(
    query: Query<'q, Postgres, PgArguments>,
    column: &str,
    rows: &[NormalizedRow],
) -> Result<Query<'q, Postgres, PgArguments>, WarehouseError> {
    let query = match column {
        "reference_date" => query.bind(rows.iter().map(|r| r.reference_date).collect::<Vec<_>>()),
        "series_code" => query.bind(rows.iter().map(|r| r.series_code).collect::<Vec<_>>()),
        "value" => query.bind(rows.iter().map(|r| r.value).collect::<Vec<_>>()),
        "unit" => query.bind(text_column(rows, |r| &r.unit)),
        "locality_code" => query.bind(text_column(rows, |r| &r.locality_code)),
        "locality_name" => query.bind(text_column(rows, |r| &r.locality_name)),
        "display_name" => query.bind(text_column(rows, |r| &r.display_name)),
        "indicator_code" => query.bind(text_column(rows, |r| &r.indicator_code)),
        other => {
            return Err(WarehouseError::Rejected(format!("no binding for column {other}")))
        }
    };
    Ok(query)
}

// =============================================================================
// Warehouse implementation
// =============================================================================

#[async_trait]
impl Warehouse for PgWarehouse {
    /// An existing schema is left alone, whoever owns it.
    async fn ensure_dataset(&self, dataset: &str, location: &str) -> Result<(), WarehouseError> {
        let create = create_schema_sql(dataset)?;
        if self.schema_exists(dataset).await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&create).execute(&mut *tx).await?;
        sqlx::query(&comment_schema_sql(dataset, location)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(dataset, location, "schema created");
        Ok(())
    }

    async fn write_staging(
        &self,
        relation: &RelationRef,
        rows: &[NormalizedRow],
        schema: &TableSchema,
    ) -> Result<u64, WarehouseError> {
        let table = qualified(relation)?;
        let dates = distinct_dates(rows);

        let mut tx = self.pool.begin().await?;

        sqlx::query(&create_table_sql(relation, schema, PARTITION_FIELD, None)?)
            .execute(&mut *tx)
            .await?;
        for date in &dates {
            sqlx::query(&create_partition_sql(relation, *date)?)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!("TRUNCATE {table}"))
            .execute(&mut *tx)
            .await?;

        let sql = insert_unnest_sql(relation, schema)?;
        let mut query = sqlx::query(&sql);
        for column in schema.column_names() {
            query = bind_column(query, column, rows)?;
        }
        let written = query.execute(&mut *tx).await?.rows_affected();

        tx.commit().await?;
        debug!(relation = %relation, rows = written, partitions = dates.len(), "staging replaced");
        Ok(written)
    }

    async fn create_final_if_absent(
        &self,
        relation: &RelationRef,
        schema: &TableSchema,
        partition_field: &str,
        cluster_fields: &[&str],
    ) -> Result<(), WarehouseError> {
        let key = super::KEY_FIELDS;
        if self.relation_exists(relation).await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&create_table_sql(relation, schema, partition_field, Some(&key[..]))?)
            .execute(&mut *tx)
            .await?;
        if !cluster_fields.is_empty() {
            sqlx::query(&cluster_index_sql(relation, cluster_fields)?)
                .execute(&mut *tx)
                .await?;
        }
        for column in schema.columns() {
            sqlx::query(&comment_column_sql(relation, column.name, column.description)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(relation = %relation, "final table created");
        Ok(())
    }

    async fn merge(
        &self,
        staging: &RelationRef,
        target: &RelationRef,
        key_fields: &[&str],
        value_fields: &[&str],
    ) -> Result<u64, WarehouseError> {
        let sql = merge_sql(staging, target, key_fields, value_fields)?;
        let dates = self.staged_dates(staging).await?;

        let mut tx = self.pool.begin().await?;
        for date in &dates {
            sqlx::query(&create_partition_sql(target, *date)?)
                .execute(&mut *tx)
                .await?;
        }
        let affected = sqlx::query(&sql).execute(&mut *tx).await?.rows_affected();
        tx.commit().await?;

        debug!(staging = %staging, final_relation = %target, partitions = dates.len(), affected, "merge committed");
        Ok(affected)
    }

    async fn delete_relation(&self, relation: &RelationRef) -> Result<(), WarehouseError> {
        sqlx::query(&drop_table_sql(relation)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
