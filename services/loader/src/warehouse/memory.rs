//! In-process warehouse used by `--dry-run` and the tests.
//!
//! Mirrors the PostgreSQL semantics that matter to the load path: datasets
//! must exist before relations are written, staging writes replace the whole
//! relation, merges distinct the staging rows and upsert them by key.

use async_trait::async_trait;
use parser::NormalizedRow;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{RelationRef, TableSchema, Warehouse, KEY_FIELDS};
use crate::error::WarehouseError;

/// Warehouse operation, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnsureDataset,
    WriteStaging,
    CreateFinal,
    Merge,
    Delete,
}

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: Vec<NormalizedRow>,
}

#[derive(Debug, Default)]
struct State {
    datasets: BTreeMap<String, String>,
    tables: BTreeMap<RelationRef, Table>,
    /// Keyed by dataset name for `EnsureDataset`, table name otherwise.
    failures: HashMap<(Operation, String), String>,
}

impl State {
    fn check_failure(&self, op: Operation, name: &str) -> Result<(), WarehouseError> {
        match self.failures.get(&(op, name.to_string())) {
            Some(reason) => Err(WarehouseError::Rejected(reason.clone())),
            None => Ok(()),
        }
    }

    fn require_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        if self.datasets.contains_key(dataset) {
            Ok(())
        } else {
            Err(WarehouseError::NotFound(dataset.to_string()))
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic in another test thread must not hide this warehouse's contents.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `op` fail on the named table (or dataset) until cleared.
    pub fn fail_on(&self, op: Operation, name: &str, reason: &str) {
        self.lock()
            .failures
            .insert((op, name.to_string()), reason.to_string());
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn has_dataset(&self, dataset: &str) -> bool {
        self.lock().datasets.contains_key(dataset)
    }

    pub fn exists(&self, relation: &RelationRef) -> bool {
        self.lock().tables.contains_key(relation)
    }

    /// Rows of a relation ordered by key, `None` when it does not exist.
    pub fn rows(&self, relation: &RelationRef) -> Option<Vec<NormalizedRow>> {
        self.lock().tables.get(relation).map(|t| {
            let mut rows = t.rows.clone();
            rows.sort_by_key(NormalizedRow::key);
            rows
        })
    }

    pub fn relations(&self) -> Vec<RelationRef> {
        self.lock().tables.keys().cloned().collect()
    }
}

/// Drop the columns a core relation does not have.
fn fit_to_schema(row: &NormalizedRow, schema: &TableSchema) -> NormalizedRow {
    if schema.is_descriptive() {
        row.clone()
    } else {
        NormalizedRow::core(row.reference_date, row.series_code, row.value)
    }
}

fn assign_field(
    target: &mut NormalizedRow,
    source: &NormalizedRow,
    field: &str,
) -> Result<(), WarehouseError> {
    match field {
        "value" => target.value = source.value,
        "unit" => target.unit = source.unit.clone(),
        "locality_code" => target.locality_code = source.locality_code.clone(),
        "locality_name" => target.locality_name = source.locality_name.clone(),
        "display_name" => target.display_name = source.display_name.clone(),
        "indicator_code" => target.indicator_code = source.indicator_code.clone(),
        other => {
            return Err(WarehouseError::Rejected(format!(
                "column {other} cannot be updated"
            )))
        }
    }
    Ok(())
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_dataset(&self, dataset: &str, location: &str) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        state.check_failure(Operation::EnsureDataset, dataset)?;
        state
            .datasets
            .entry(dataset.to_string())
            .or_insert_with(|| location.to_string());
        Ok(())
    }

    async fn write_staging(
        &self,
        relation: &RelationRef,
        rows: &[NormalizedRow],
        schema: &TableSchema,
    ) -> Result<u64, WarehouseError> {
        let mut state = self.lock();
        state.check_failure(Operation::WriteStaging, &relation.table)?;
        state.require_dataset(&relation.dataset)?;

        let rows: Vec<NormalizedRow> = rows.iter().map(|r| fit_to_schema(r, schema)).collect();
        let written = rows.len() as u64;
        state.tables.insert(
            relation.clone(),
            Table {
                schema: schema.clone(),
                rows,
            },
        );
        Ok(written)
    }

    async fn create_final_if_absent(
        &self,
        relation: &RelationRef,
        schema: &TableSchema,
        _partition_field: &str,
        _cluster_fields: &[&str],
    ) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        state.check_failure(Operation::CreateFinal, &relation.table)?;
        state.require_dataset(&relation.dataset)?;
        state.tables.entry(relation.clone()).or_insert_with(|| Table {
            schema: schema.clone(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn merge(
        &self,
        staging: &RelationRef,
        target: &RelationRef,
        key_fields: &[&str],
        value_fields: &[&str],
    ) -> Result<u64, WarehouseError> {
        if key_fields != KEY_FIELDS {
            return Err(WarehouseError::Rejected(format!(
                "unsupported merge key {key_fields:?}"
            )));
        }

        let mut state = self.lock();
        state.check_failure(Operation::Merge, &target.table)?;

        let source = state
            .tables
            .get(staging)
            .ok_or_else(|| WarehouseError::NotFound(staging.to_string()))?;

        let mut distinct: Vec<NormalizedRow> = Vec::with_capacity(source.rows.len());
        for row in &source.rows {
            if !distinct.contains(row) {
                distinct.push(row.clone());
            }
        }

        let mut seen = std::collections::HashSet::new();
        for row in &distinct {
            if !seen.insert(row.key()) {
                return Err(WarehouseError::DuplicateKey {
                    relation: staging.to_string(),
                    key: format!("({}, {})", row.reference_date, row.series_code),
                });
            }
        }

        let final_table = state
            .tables
            .get_mut(target)
            .ok_or_else(|| WarehouseError::NotFound(target.to_string()))?;

        // Validate every field before touching the target so a bad column
        // list leaves it unchanged.
        let sample = NormalizedRow::core(chrono::NaiveDate::MIN, 0, None);
        for field in value_fields {
            assign_field(&mut sample.clone(), &sample, field)?;
        }

        let mut affected = 0u64;
        for row in distinct {
            let row = fit_to_schema(&row, &final_table.schema);
            match final_table.rows.iter_mut().find(|r| r.key() == row.key()) {
                Some(existing) => {
                    for field in value_fields {
                        assign_field(existing, &row, field)?;
                    }
                }
                None => final_table.rows.push(row),
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_relation(&self, relation: &RelationRef) -> Result<(), WarehouseError> {
        let mut state = self.lock();
        state.check_failure(Operation::Delete, &relation.table)?;
        state.tables.remove(relation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn rel(table: &str) -> RelationRef {
        RelationRef::new("ds", table)
    }

    async fn warehouse_with_final() -> MemoryWarehouse {
        let wh = MemoryWarehouse::new();
        wh.ensure_dataset("ds", "local").await.unwrap();
        wh.create_final_if_absent(&rel("f"), &TableSchema::core(), "reference_date", &["series_code"])
            .await
            .unwrap();
        wh
    }

    #[tokio::test]
    async fn test_write_requires_dataset() {
        let wh = MemoryWarehouse::new();
        let rows = vec![NormalizedRow::core(date(2024, 1, 1), 11, Some(1.0))];
        let err = wh
            .write_staging(&rel("s"), &rows, &TableSchema::core())
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_staging_write_replaces_contents() {
        let wh = warehouse_with_final().await;
        let first = vec![
            NormalizedRow::core(date(2024, 1, 1), 11, Some(1.0)),
            NormalizedRow::core(date(2024, 1, 2), 11, Some(2.0)),
        ];
        let second = vec![NormalizedRow::core(date(2024, 1, 3), 11, Some(3.0))];

        wh.write_staging(&rel("s"), &first, &TableSchema::core()).await.unwrap();
        wh.write_staging(&rel("s"), &second, &TableSchema::core()).await.unwrap();

        assert_eq!(wh.rows(&rel("s")).unwrap(), second);
    }

    #[tokio::test]
    async fn test_core_schema_drops_descriptive_fields() {
        let wh = warehouse_with_final().await;
        let mut row = NormalizedRow::core(date(2024, 1, 1), 11, Some(1.0));
        row.unit = Some("%".to_string());
        wh.write_staging(&rel("s"), &[row], &TableSchema::core()).await.unwrap();
        assert_eq!(wh.rows(&rel("s")).unwrap()[0].unit, None);
    }

    #[tokio::test]
    async fn test_merge_collapses_identical_rows() {
        let wh = warehouse_with_final().await;
        let row = NormalizedRow::core(date(2024, 1, 1), 11, Some(1.0));
        wh.write_staging(&rel("s"), &[row.clone(), row.clone()], &TableSchema::core())
            .await
            .unwrap();

        let affected = wh.merge(&rel("s"), &rel("f"), &KEY_FIELDS, &["value"]).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(wh.rows(&rel("f")).unwrap(), vec![row]);
    }

    #[tokio::test]
    async fn test_merge_rejects_conflicting_duplicates() {
        let wh = warehouse_with_final().await;
        let rows = vec![
            NormalizedRow::core(date(2024, 1, 1), 11, Some(1.0)),
            NormalizedRow::core(date(2024, 1, 1), 11, Some(2.0)),
        ];
        wh.write_staging(&rel("s"), &rows, &TableSchema::core()).await.unwrap();

        let err = wh.merge(&rel("s"), &rel("f"), &KEY_FIELDS, &["value"]).await.unwrap_err();
        assert!(matches!(err, WarehouseError::DuplicateKey { .. }));
        assert!(wh.rows(&rel("f")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_unknown_value_field_leaves_target_untouched() {
        let wh = warehouse_with_final().await;
        let rows = vec![NormalizedRow::core(date(2024, 1, 1), 11, Some(1.0))];
        wh.write_staging(&rel("s"), &rows, &TableSchema::core()).await.unwrap();

        assert!(wh.merge(&rel("s"), &rel("f"), &KEY_FIELDS, &["valor"]).await.is_err());
        assert!(wh.rows(&rel("f")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_merge_missing_staging_is_not_found() {
        let wh = warehouse_with_final().await;
        let err = wh.merge(&rel("s"), &rel("f"), &KEY_FIELDS, &["value"]).await.unwrap_err();
        assert!(matches!(err, WarehouseError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_and_delete() {
        let wh = warehouse_with_final().await;
        wh.fail_on(Operation::Delete, "f", "permission denied");
        assert!(wh.delete_relation(&rel("f")).await.is_err());
        assert!(wh.exists(&rel("f")));

        wh.clear_failures();
        wh.delete_relation(&rel("f")).await.unwrap();
        wh.delete_relation(&rel("f")).await.unwrap();
        assert!(!wh.exists(&rel("f")));
    }
}
