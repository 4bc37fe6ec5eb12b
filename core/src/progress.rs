//! Progress reporting types for resize transactions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phases of a resize transaction. `FilesystemResized` and
/// `PartitionTableUpdated` swap order depending on direction: a shrink must
/// resize the filesystem before the table entry, a grow the other way
/// around.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResizePhase {
    Pending,
    Validating,
    BackupConfirmed,
    TransactionOpen,
    FilesystemResized,
    PartitionTableUpdated,
    Verifying,
    RollingBack,
    Committed,
    RolledBack,
    Failed,
}

impl ResizePhase {
    pub fn display_name(&self) -> &'static str {
        match self {
            ResizePhase::Pending => "Pending",
            ResizePhase::Validating => "Validating",
            ResizePhase::BackupConfirmed => "Backup confirmed",
            ResizePhase::TransactionOpen => "Transaction open",
            ResizePhase::FilesystemResized => "Filesystem resized",
            ResizePhase::PartitionTableUpdated => "Partition table updated",
            ResizePhase::Verifying => "Verifying",
            ResizePhase::RollingBack => "Rolling back",
            ResizePhase::Committed => "Committed",
            ResizePhase::RolledBack => "Rolled back",
            ResizePhase::Failed => "Failed",
        }
    }

    /// Whether the transaction is finished once this phase is reached
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResizePhase::Committed | ResizePhase::RolledBack | ResizePhase::Failed
        )
    }
}

/// One progress update, emitted at every phase boundary. Percentages are
/// monotonically non-decreasing within a transaction; rollback events hold
/// the last forward percentage rather than regressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub transaction_id: Uuid,
    pub partition_id: String,
    pub phase: ResizePhase,
    /// Overall progress percentage (0-100)
    pub percent: f32,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases() {
        assert!(ResizePhase::Committed.is_terminal());
        assert!(ResizePhase::RolledBack.is_terminal());
        assert!(ResizePhase::Failed.is_terminal());
        assert!(!ResizePhase::Verifying.is_terminal());
        assert!(!ResizePhase::RollingBack.is_terminal());
    }
}
