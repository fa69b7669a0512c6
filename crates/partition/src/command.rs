//! Replicated partition commands
//!
//! Commands are proposed by the primary replica, ordered by the replication log and
//! applied by every replica's [`PartitionListener`](crate::PartitionListener).
//! Every command except [`Command::BuildIndex`] carries the safe time assigned by
//! the primary at proposal.

use serde::{Deserialize, Serialize};
use shardline_common::{BinaryRow, NodeId, PartitionId, RowId, TransactionId};
use shardline_hlc::HybridTimestamp;

/// Write (or remove) one row on behalf of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCommand {
    pub tx_id: TransactionId,
    pub commit_partition: PartitionId,
    pub row_id: RowId,
    /// `None` removes the row.
    pub row: Option<BinaryRow>,
    /// One-phase write: committed at the command's safe time.
    pub full: bool,
    pub tx_coordinator_id: Option<NodeId>,
    pub safe_time: HybridTimestamp,
}

/// Write several rows of one transaction in a single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAllCommand {
    pub tx_id: TransactionId,
    pub commit_partition: PartitionId,
    pub rows: Vec<(RowId, Option<BinaryRow>)>,
    pub full: bool,
    pub tx_coordinator_id: Option<NodeId>,
    pub safe_time: HybridTimestamp,
}

/// Persist the outcome of a transaction in its commit partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishTxCommand {
    pub tx_id: TransactionId,
    pub commit: bool,
    pub commit_timestamp: Option<HybridTimestamp>,
    pub partitions: Vec<PartitionId>,
    pub safe_time: HybridTimestamp,
}

/// Commit or abort every write intent of a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteIntentSwitchCommand {
    pub tx_id: TransactionId,
    pub commit: bool,
    pub commit_timestamp: Option<HybridTimestamp>,
    pub safe_time: HybridTimestamp,
}

/// Advance safe time on an idle partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeTimeSyncCommand {
    pub safe_time: HybridTimestamp,
}

/// Add a batch of existing rows to an index under construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildIndexCommand {
    pub index_id: u32,
    pub row_ids: Vec<RowId>,
    /// Last batch of the build.
    pub finish: bool,
    /// Catalog version that registered the index.
    pub creation_catalog_version: u32,
    /// Catalog version that started the build.
    pub required_catalog_version: u32,
}

/// A replicated partition command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Update(UpdateCommand),
    UpdateAll(UpdateAllCommand),
    FinishTx(FinishTxCommand),
    WriteIntentSwitch(WriteIntentSwitchCommand),
    SafeTimeSync(SafeTimeSyncCommand),
    BuildIndex(BuildIndexCommand),
}

impl Command {
    /// Safe time carried by the command, if it carries one.
    pub fn safe_time(&self) -> Option<HybridTimestamp> {
        match self {
            Command::Update(cmd) => Some(cmd.safe_time),
            Command::UpdateAll(cmd) => Some(cmd.safe_time),
            Command::FinishTx(cmd) => Some(cmd.safe_time),
            Command::WriteIntentSwitch(cmd) => Some(cmd.safe_time),
            Command::SafeTimeSync(cmd) => Some(cmd.safe_time),
            Command::BuildIndex(_) => None,
        }
    }

    /// Copy of the command stamped with a new safe time.
    pub fn with_safe_time(mut self, safe_time: HybridTimestamp) -> Self {
        match &mut self {
            Command::Update(cmd) => cmd.safe_time = safe_time,
            Command::UpdateAll(cmd) => cmd.safe_time = safe_time,
            Command::FinishTx(cmd) => cmd.safe_time = safe_time,
            Command::WriteIntentSwitch(cmd) => cmd.safe_time = safe_time,
            Command::SafeTimeSync(cmd) => cmd.safe_time = safe_time,
            Command::BuildIndex(_) => {}
        }
        self
    }

    /// Whether applying the command advances the partition safe time.
    ///
    /// Two-phase updates only leave intents behind, so readers at their safe time
    /// would have nothing new to see.
    pub fn propagates_safe_time(&self) -> bool {
        match self {
            Command::Update(cmd) => cmd.full,
            Command::UpdateAll(cmd) => cmd.full,
            Command::FinishTx(_) | Command::WriteIntentSwitch(_) | Command::SafeTimeSync(_) => {
                true
            }
            Command::BuildIndex(_) => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Update(_) => "Update",
            Command::UpdateAll(_) => "UpdateAll",
            Command::FinishTx(_) => "FinishTx",
            Command::WriteIntentSwitch(_) => "WriteIntentSwitch",
            Command::SafeTimeSync(_) => "SafeTimeSync",
            Command::BuildIndex(_) => "BuildIndex",
        }
    }

    /// Serialize for the replication log
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes).map_err(|e| e.to_string())?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        ciborium::de::from_reader(bytes).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(full: bool) -> Command {
        Command::Update(UpdateCommand {
            tx_id: TransactionId::new(HybridTimestamp::new(1, 0)),
            commit_partition: PartitionId::new(1, 0),
            row_id: RowId::lowest(0),
            row: Some(BinaryRow::from_value("v")),
            full,
            tx_coordinator_id: Some(NodeId::new("n1")),
            safe_time: HybridTimestamp::new(2, 0),
        })
    }

    #[test]
    fn test_safe_time_stamping() {
        let command = update(false).with_safe_time(HybridTimestamp::new(7, 3));
        assert_eq!(command.safe_time(), Some(HybridTimestamp::new(7, 3)));

        let build = Command::BuildIndex(BuildIndexCommand {
            index_id: 1,
            row_ids: vec![],
            finish: true,
            creation_catalog_version: 1,
            required_catalog_version: 2,
        });
        assert_eq!(build.clone().with_safe_time(HybridTimestamp::MAX), build);
        assert_eq!(build.safe_time(), None);
    }

    #[test]
    fn test_safe_time_propagation() {
        assert!(!update(false).propagates_safe_time());
        assert!(update(true).propagates_safe_time());
        assert!(
            Command::SafeTimeSync(SafeTimeSyncCommand {
                safe_time: HybridTimestamp::MIN
            })
            .propagates_safe_time()
        );
    }

    #[test]
    fn test_log_encoding() {
        let command = update(true);
        let decoded = Command::decode(&command.encode().unwrap()).unwrap();
        assert_eq!(decoded, command);
        assert!(Command::decode(&[0xff, 0x00]).is_err());
    }
}
