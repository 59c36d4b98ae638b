//! Upsert merger: reconciles a staging relation into its final relation.

use tracing::info;

use crate::config::Destination;
use crate::error::LoadError;
use crate::warehouse::{RelationRef, TableSchema, Warehouse, CLUSTER_FIELDS, KEY_FIELDS, PARTITION_FIELD};

/// Rows inserted plus rows updated by one merge.
pub type RowsAffected = u64;

pub struct UpsertMerger<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    destination: &'a Destination,
    schema: &'a TableSchema,
}

impl<'a, W: Warehouse + ?Sized> UpsertMerger<'a, W> {
    pub fn new(warehouse: &'a W, destination: &'a Destination, schema: &'a TableSchema) -> Self {
        Self {
            warehouse,
            destination,
            schema,
        }
    }

    /// Create the final relation if needed, then upsert staging into it by
    /// `(reference_date, series_code)`. Final rows outside the staged keys are
    /// never touched.
    ///
    /// `Ok` means the staging relation may be discarded. On error it must be
    /// kept for inspection.
    pub async fn merge(&self, staging_name: &str, final_name: &str) -> Result<RowsAffected, LoadError> {
        let staging = RelationRef::new(&self.destination.dataset, staging_name);
        let target = RelationRef::new(&self.destination.dataset, final_name);

        self.warehouse
            .create_final_if_absent(&target, self.schema, PARTITION_FIELD, &CLUSTER_FIELDS)
            .await
            .map_err(|source| LoadError::FinalTableUnavailable {
                relation: target.to_string(),
                source,
            })?;

        let value_fields = self.schema.value_fields();
        let affected = self
            .warehouse
            .merge(&staging, &target, &KEY_FIELDS, &value_fields)
            .await
            .map_err(|source| LoadError::MergeFailed {
                staging: staging.to_string(),
                target: target.to_string(),
                source,
            })?;

        info!(relation = %target, affected, "merge complete");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::StagingWriter;
    use crate::warehouse::{MemoryWarehouse, Operation};
    use chrono::NaiveDate;
    use parser::{Batch, NormalizedRow};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn destination() -> Destination {
        Destination {
            dataset: "dados_publicos_ibge".to_string(),
            location: "southamerica-east1".to_string(),
        }
    }

    fn ibge_row(day: u32, value: Option<f64>, unit: &str) -> NormalizedRow {
        let mut row = NormalizedRow::core(date(day), 63, value);
        row.unit = Some(unit.to_string());
        row.locality_name = Some("Brasil".to_string());
        row
    }

    #[tokio::test]
    async fn test_merge_updates_descriptive_fields() {
        let wh = MemoryWarehouse::new();
        let dest = destination();
        let schema = TableSchema::descriptive();
        let writer = StagingWriter::new(&wh, &dest, &schema);
        let merger = UpsertMerger::new(&wh, &dest, &schema);

        let first: Batch = vec![ibge_row(1, Some(0.5), "%")].into_iter().collect();
        writer.write(&first, "ibge_ipca_staging").await.unwrap();
        merger.merge("ibge_ipca_staging", "ibge_ipca").await.unwrap();

        let second: Batch = vec![ibge_row(1, Some(0.6), "pp")].into_iter().collect();
        writer.write(&second, "ibge_ipca_staging").await.unwrap();
        let affected = merger.merge("ibge_ipca_staging", "ibge_ipca").await.unwrap();

        assert_eq!(affected, 1);
        let rows = wh.rows(&RelationRef::new("dados_publicos_ibge", "ibge_ipca")).unwrap();
        assert_eq!(rows, vec![ibge_row(1, Some(0.6), "pp")]);
    }

    #[tokio::test]
    async fn test_empty_staging_merges_nothing() {
        let wh = MemoryWarehouse::new();
        let dest = destination();
        let schema = TableSchema::descriptive();
        let writer = StagingWriter::new(&wh, &dest, &schema);
        let merger = UpsertMerger::new(&wh, &dest, &schema);

        let first: Batch = vec![ibge_row(1, Some(0.5), "%"), ibge_row(2, None, "%")]
            .into_iter()
            .collect();
        writer.write(&first, "ibge_ipca_staging").await.unwrap();
        merger.merge("ibge_ipca_staging", "ibge_ipca").await.unwrap();
        let before = wh.rows(&RelationRef::new("dados_publicos_ibge", "ibge_ipca")).unwrap();

        wh.write_staging(&writer.relation("ibge_ipca_staging"), &[], &schema)
            .await
            .unwrap();
        let affected = merger.merge("ibge_ipca_staging", "ibge_ipca").await.unwrap();

        assert_eq!(affected, 0);
        let after = wh.rows(&RelationRef::new("dados_publicos_ibge", "ibge_ipca")).unwrap();
        assert_eq!(after, before);
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_final_creation_failure() {
        let wh = MemoryWarehouse::new();
        let dest = destination();
        let schema = TableSchema::descriptive();
        wh.ensure_dataset(&dest.dataset, &dest.location).await.unwrap();
        wh.fail_on(Operation::CreateFinal, "ibge_ipca", "permission denied");

        let err = UpsertMerger::new(&wh, &dest, &schema)
            .merge("ibge_ipca_staging", "ibge_ipca")
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::FinalTableUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_merge_without_staging_fails() {
        let wh = MemoryWarehouse::new();
        let dest = destination();
        let schema = TableSchema::descriptive();
        wh.ensure_dataset(&dest.dataset, &dest.location).await.unwrap();

        let err = UpsertMerger::new(&wh, &dest, &schema)
            .merge("ibge_ipca_staging", "ibge_ipca")
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::MergeFailed { .. }));
        // The final relation is still created.
        assert!(wh.exists(&RelationRef::new("dados_publicos_ibge", "ibge_ipca")));
    }
}
