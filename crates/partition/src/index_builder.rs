//! Backfill of a new secondary index
//!
//! Walks the partition's rows from the persisted resume cursor in batches and
//! proposes one BuildIndex command per batch, so a build interrupted by a restart or
//! a leader change continues where the last applied batch left off.

use crate::command::{BuildIndexCommand, Command};
use crate::error::{ReplicaError, Result};
use crate::replica::PartitionReplica;
use std::sync::Arc;

pub struct IndexBuilder {
    replica: Arc<PartitionReplica>,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new(replica: Arc<PartitionReplica>) -> Self {
        let batch_size = replica.config().build_index_batch_size.max(1);
        Self {
            replica,
            batch_size,
        }
    }

    /// Build `index_id`, started in catalog version `required_catalog_version`.
    /// Returns how many rows were submitted.
    pub async fn build(&self, index_id: u32, required_catalog_version: u32) -> Result<usize> {
        let partition_id = self.replica.partition_id();
        let creation_catalog_version = self
            .replica
            .catalog()
            .catalog(required_catalog_version)
            .and_then(|catalog| catalog.index(index_id).map(|index| index.creation_catalog_version))
            .ok_or(ReplicaError::UnknownIndex(index_id))?;

        tracing::info!(
            "[{}] Start building the index {} (catalog versions {}..{})",
            partition_id,
            index_id,
            creation_catalog_version,
            required_catalog_version
        );

        let mut submitted = 0;
        while let Some(next) = self.replica.storage().next_row_id_to_build(index_id)? {
            let row_ids = self.replica.storage().row_ids_from(&next, self.batch_size)?;
            let finish = row_ids.len() < self.batch_size;
            submitted += row_ids.len();

            self.replica
                .propose(Command::BuildIndex(BuildIndexCommand {
                    index_id,
                    row_ids,
                    finish,
                    creation_catalog_version,
                    required_catalog_version,
                }))
                .await?;

            if finish {
                break;
            }
        }

        Ok(submitted)
    }
}
