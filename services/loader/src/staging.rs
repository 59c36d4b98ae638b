//! Staging writer: lands one run's batch in a transient relation.

use parser::Batch;
use tracing::{debug, info};

use crate::config::Destination;
use crate::error::LoadError;
use crate::warehouse::{RelationRef, TableSchema, Warehouse};

pub struct StagingWriter<'a, W: Warehouse + ?Sized> {
    warehouse: &'a W,
    destination: &'a Destination,
    schema: &'a TableSchema,
}

impl<'a, W: Warehouse + ?Sized> StagingWriter<'a, W> {
    pub fn new(warehouse: &'a W, destination: &'a Destination, schema: &'a TableSchema) -> Self {
        Self {
            warehouse,
            destination,
            schema,
        }
    }

    pub fn relation(&self, target_name: &str) -> RelationRef {
        RelationRef::new(&self.destination.dataset, target_name)
    }

    /// Replace the contents of `target_name` with `batch`.
    ///
    /// An empty batch returns immediately without touching the warehouse, so
    /// rows left in the relation by an earlier failed run stay in place. The
    /// caller must not merge after an empty write.
    pub async fn write(&self, batch: &Batch, target_name: &str) -> Result<(), LoadError> {
        if batch.is_empty() {
            debug!(relation = target_name, "empty batch, staging left as is");
            return Ok(());
        }

        let dataset = &self.destination.dataset;
        self.warehouse
            .ensure_dataset(dataset, &self.destination.location)
            .await
            .map_err(|source| LoadError::DatasetUnavailable {
                dataset: dataset.clone(),
                source,
            })?;

        let relation = self.relation(target_name);
        let written = self
            .warehouse
            .write_staging(&relation, batch.rows(), self.schema)
            .await
            .map_err(|source| LoadError::StagingWriteFailed {
                relation: relation.to_string(),
                source,
            })?;

        info!(relation = %relation, rows = written, "staging written");
        Ok(())
    }

    /// Drop the staging relation. Only called after a successful merge.
    pub async fn discard(&self, target_name: &str) -> Result<(), LoadError> {
        let relation = self.relation(target_name);
        self.warehouse
            .delete_relation(&relation)
            .await
            .map_err(|source| LoadError::CleanupFailed {
                relation: relation.to_string(),
                source,
            })
    }
}
