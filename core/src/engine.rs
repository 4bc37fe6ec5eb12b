//! Resize transaction engine
//!
//! Executes one validated `ResizeOperation` as an ordered, checkpointed
//! sequence of phases and rolls back on any failure. The ordering
//! constraint is the central correctness invariant: a shrink resizes the
//! filesystem before the partition table entry (the table must never
//! truncate live filesystem data), a grow updates the table first (the
//! filesystem has nothing to claim until the entry is extended). This
//! holds no matter which external tool does the actual work.
//!
//! Checkpoints are plain data records (phase plus the pre-image needed to
//! reverse it) appended as phases complete and replayed in reverse by a
//! single rollback executor. A transaction that reaches Committed or
//! RolledBack is discarded; retrying requires validating a new operation
//! against a fresh snapshot.

use crate::config::EngineConfig;
use crate::progress::{ProgressEvent, ResizePhase};
use crate::snapshot::{PartitionSnapshot, SnapshotProvider};
use crate::validator::{PreflightCheck, ResizeDirection, ResizeOperation};
use crate::PartwiseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A partition's physical location on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start_offset: u64,
    pub size: u64,
}

/// External operations the engine sequences. Each call is opaque and
/// asynchronous, returns ok or a failure with captured diagnostic output,
/// and is treated as at-most-once: resize tools are not generally safe to
/// re-invoke blindly after a partial failure, so the engine never retries
/// a phase automatically.
#[async_trait::async_trait]
pub trait PartitionToolkit: Send + Sync {
    async fn resize_filesystem(
        &self,
        partition: &PartitionSnapshot,
        target_size: u64,
    ) -> Result<(), PartwiseError>;

    async fn update_partition_table_entry(
        &self,
        partition: &PartitionSnapshot,
        new_extent: Extent,
    ) -> Result<(), PartwiseError>;

    async fn unmount(&self, partition: &PartitionSnapshot) -> Result<(), PartwiseError>;

    async fn remount(&self, partition: &PartitionSnapshot) -> Result<(), PartwiseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
    Failed,
}

/// Pre-image record for one completed phase, appended in execution order
/// and only ever appended. Rollback replays the list in reverse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Checkpoint {
    Unmounted,
    FilesystemResized { previous_size: u64 },
    PartitionTableUpdated { previous_extent: Extent },
}

/// Cooperative cancellation flag. Honored while the transaction is still
/// Pending or Validating; after that the engine finishes the in-flight
/// phase (resize tools are not safely interruptible mid-write) and rolls
/// back at the next phase boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Caller's acknowledgement that data at risk has been backed up.
    /// Required whenever a shrink touches a partition with nonzero used
    /// space; the engine refuses to open the transaction without it.
    pub backup_acknowledged: bool,
    pub cancel: Option<CancelHandle>,
}

/// Identity of an operation as the audit layer sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub operation_id: Uuid,
    pub partition_id: String,
    pub device_path: String,
    pub direction: ResizeDirection,
    pub size_before: u64,
    pub size_requested: u64,
    pub preflight: Vec<PreflightCheck>,
}

impl From<&ResizeOperation> for OperationDescriptor {
    fn from(op: &ResizeOperation) -> Self {
        Self {
            operation_id: op.id,
            partition_id: op.partition.id.clone(),
            device_path: op.partition.device_path.clone(),
            direction: op.direction,
            size_before: op.partition.total_size,
            size_requested: op.safe_size,
            preflight: op.preflight.clone(),
        }
    }
}

/// Phase-transition notifications broadcast by the engine. Observers (the
/// audit reporter, UIs) subscribe; a lagging or absent observer never
/// blocks execution.
#[derive(Debug, Clone)]
pub enum EngineNotice {
    Started {
        transaction_id: Uuid,
        descriptor: OperationDescriptor,
        timestamp: DateTime<Utc>,
    },
    Phase(ProgressEvent),
    Finished {
        transaction_id: Uuid,
        status: TransactionStatus,
        final_size: Option<u64>,
        diagnostics: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

/// Terminal result of one transaction
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    /// Phase whose failure ended the forward run, if any
    pub failed_phase: Option<ResizePhase>,
    /// Captured output from failed phases and rollback activity
    pub diagnostics: Vec<String>,
    /// Size reported by the post-operation snapshot when committed
    pub final_size: Option<u64>,
}

#[derive(Debug, Clone)]
struct Reservation {
    disk_id: String,
    start: u64,
    end: u64,
}

/// Removes the reservation when the transaction finishes, including on
/// early error returns.
struct RegistryGuard {
    registry: Arc<Mutex<HashMap<String, Reservation>>>,
    key: String,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove(&self.key);
    }
}

struct TxContext {
    transaction_id: Uuid,
    partition_id: String,
    last_percent: f32,
    checkpoints: Vec<Checkpoint>,
    diagnostics: Vec<String>,
}

#[derive(Clone)]
pub struct ResizeEngine {
    config: EngineConfig,
    toolkit: Arc<dyn PartitionToolkit>,
    snapshots: Arc<dyn SnapshotProvider>,
    registry: Arc<Mutex<HashMap<String, Reservation>>>,
    notices: broadcast::Sender<EngineNotice>,
}

impl ResizeEngine {
    pub fn new(
        config: EngineConfig,
        toolkit: Arc<dyn PartitionToolkit>,
        snapshots: Arc<dyn SnapshotProvider>,
    ) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            config,
            toolkit,
            snapshots,
            registry: Arc::new(Mutex::new(HashMap::new())),
            notices,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to phase-transition notifications. Any number of
    /// observers may subscribe; events are never sent while the engine
    /// holds a lock.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineNotice> {
        self.notices.subscribe()
    }

    /// Execute a validated resize as a checkpointed transaction.
    ///
    /// Returns `Err(OperationInProgress)` immediately if the partition (or
    /// an overlapping extent on the same disk) already has an in-flight
    /// transaction. Any run that starts terminates in Committed,
    /// RolledBack, or Failed, reported in the outcome.
    pub async fn execute(
        &self,
        operation: ResizeOperation,
        options: ExecuteOptions,
    ) -> Result<TransactionOutcome, PartwiseError> {
        let _guard = self.reserve(&operation)?;

        let transaction_id = Uuid::new_v4();
        let mut ctx = TxContext {
            transaction_id,
            partition_id: operation.partition.id.clone(),
            last_percent: 0.0,
            checkpoints: Vec::new(),
            diagnostics: Vec::new(),
        };

        self.notify(EngineNotice::Started {
            transaction_id,
            descriptor: OperationDescriptor::from(&operation),
            timestamp: Utc::now(),
        });
        tracing::info!(
            partition = %operation.partition.device_path,
            from = operation.partition.total_size,
            to = operation.safe_size,
            direction = ?operation.direction,
            %transaction_id,
            "resize transaction started"
        );

        let (status, failed_phase, final_size) =
            match self.run_phases(&operation, &options, &mut ctx).await {
                Ok(final_size) => {
                    self.emit(&mut ctx, ResizePhase::Committed, 100.0, "Resize committed");
                    (TransactionStatus::Committed, None, Some(final_size))
                }
                Err((phase, error)) => {
                    tracing::warn!(
                        phase = phase.display_name(),
                        %error,
                        %transaction_id,
                        "phase failed, rolling back"
                    );
                    ctx.diagnostics
                        .push(format!("{}: {}", phase.display_name(), error));
                    let status = self.roll_back(&operation, &mut ctx).await;
                    (status, Some(phase), None)
                }
            };

        self.notify(EngineNotice::Finished {
            transaction_id,
            status,
            final_size,
            diagnostics: ctx.diagnostics.clone(),
            timestamp: Utc::now(),
        });

        Ok(TransactionOutcome {
            transaction_id,
            status,
            failed_phase,
            diagnostics: ctx.diagnostics,
            final_size,
        })
    }

    async fn run_phases(
        &self,
        op: &ResizeOperation,
        options: &ExecuteOptions,
        ctx: &mut TxContext,
    ) -> Result<u64, (ResizePhase, PartwiseError)> {
        // Validating (5%): the snapshot used for validation may be stale;
        // re-check against the disk as it is now.
        self.emit(
            ctx,
            ResizePhase::Validating,
            5.0,
            format!(
                "Re-validating {} against a fresh snapshot",
                op.partition.device_path
            ),
        );
        if is_cancelled(options) {
            return Err((ResizePhase::Validating, PartwiseError::Cancelled));
        }

        let fresh = self
            .snapshots
            .get_disk_snapshot(&op.disk_id)
            .await
            .map_err(|e| (ResizePhase::Validating, e))?;
        let current = fresh
            .partition(&op.partition.id)
            .ok_or_else(|| {
                (
                    ResizePhase::Validating,
                    PartwiseError::NotFound(format!(
                        "partition {} disappeared from {}",
                        op.partition.id, op.disk_id
                    )),
                )
            })?
            .clone();
        if current.total_size != op.partition.total_size
            || current.start_offset != op.partition.start_offset
        {
            return Err((
                ResizePhase::Validating,
                PartwiseError::InvalidArgument(
                    "disk layout changed since validation; validate again against a fresh snapshot"
                        .to_string(),
                ),
            ));
        }
        if op.direction == ResizeDirection::Grow {
            let available = fresh.unallocated_after(&current);
            if op.safe_size - current.total_size > available {
                return Err((ResizePhase::Validating, PartwiseError::NoAdjacentSpace {
                    available,
                }));
            }
        }

        // BackupConfirmed (15%): shrinking a partition that holds data is
        // only allowed once the caller has acknowledged a backup.
        let data_at_risk =
            op.direction == ResizeDirection::Shrink && current.used_space.unwrap_or(0) > 0;
        if data_at_risk && !options.backup_acknowledged {
            return Err((
                ResizePhase::BackupConfirmed,
                PartwiseError::InvalidArgument(
                    "backup acknowledgement required: partition holds data a failed shrink could destroy"
                        .to_string(),
                ),
            ));
        }
        self.emit(
            ctx,
            ResizePhase::BackupConfirmed,
            15.0,
            if data_at_risk {
                "Backup acknowledged by caller"
            } else {
                "No data at risk, backup not required"
            },
        );
        if is_cancelled(options) {
            return Err((ResizePhase::BackupConfirmed, PartwiseError::Cancelled));
        }

        // TransactionOpen (20%): take the partition offline if the
        // filesystem cannot resize in the requested direction while
        // mounted. Checkpointed so rollback remounts it.
        let online_ok = match op.direction {
            ResizeDirection::Grow => current.filesystem.supports_online_grow(),
            ResizeDirection::Shrink => current.filesystem.supports_online_shrink(),
        };
        if current.is_mounted && !online_ok {
            self.call_tool(
                ResizePhase::TransactionOpen,
                self.toolkit.unmount(&current),
            )
            .await
            .map_err(|e| (ResizePhase::TransactionOpen, e))?;
            ctx.checkpoints.push(Checkpoint::Unmounted);
        }
        self.emit(
            ctx,
            ResizePhase::TransactionOpen,
            20.0,
            "Transaction open, checkpointing enabled",
        );

        let previous_extent = Extent {
            start_offset: current.start_offset,
            size: current.total_size,
        };
        let new_extent = Extent {
            start_offset: current.start_offset,
            size: op.safe_size,
        };

        match op.direction {
            ResizeDirection::Shrink => {
                self.call_tool(
                    ResizePhase::FilesystemResized,
                    self.toolkit.resize_filesystem(&current, op.safe_size),
                )
                .await
                .map_err(|e| (ResizePhase::FilesystemResized, e))?;
                ctx.checkpoints.push(Checkpoint::FilesystemResized {
                    previous_size: current.total_size,
                });
                self.emit(
                    ctx,
                    ResizePhase::FilesystemResized,
                    60.0,
                    format!("Filesystem shrunk to {} bytes", op.safe_size),
                );
                if is_cancelled(options) {
                    return Err((ResizePhase::FilesystemResized, PartwiseError::Cancelled));
                }

                self.call_tool(
                    ResizePhase::PartitionTableUpdated,
                    self.toolkit
                        .update_partition_table_entry(&current, new_extent),
                )
                .await
                .map_err(|e| (ResizePhase::PartitionTableUpdated, e))?;
                ctx.checkpoints
                    .push(Checkpoint::PartitionTableUpdated { previous_extent });
                self.emit(
                    ctx,
                    ResizePhase::PartitionTableUpdated,
                    90.0,
                    "Partition table entry shrunk",
                );
            }
            ResizeDirection::Grow => {
                self.call_tool(
                    ResizePhase::PartitionTableUpdated,
                    self.toolkit
                        .update_partition_table_entry(&current, new_extent),
                )
                .await
                .map_err(|e| (ResizePhase::PartitionTableUpdated, e))?;
                ctx.checkpoints
                    .push(Checkpoint::PartitionTableUpdated { previous_extent });
                self.emit(
                    ctx,
                    ResizePhase::PartitionTableUpdated,
                    60.0,
                    "Partition table entry extended",
                );
                if is_cancelled(options) {
                    return Err((ResizePhase::PartitionTableUpdated, PartwiseError::Cancelled));
                }

                self.call_tool(
                    ResizePhase::FilesystemResized,
                    self.toolkit.resize_filesystem(&current, op.safe_size),
                )
                .await
                .map_err(|e| (ResizePhase::FilesystemResized, e))?;
                ctx.checkpoints.push(Checkpoint::FilesystemResized {
                    previous_size: current.total_size,
                });
                self.emit(
                    ctx,
                    ResizePhase::FilesystemResized,
                    90.0,
                    format!("Filesystem grown to {} bytes", op.safe_size),
                );
            }
        }

        // Verifying (95%): trust the snapshot, not the tools' exit codes.
        self.emit(
            ctx,
            ResizePhase::Verifying,
            95.0,
            "Verifying reported partition size",
        );
        let after = self
            .snapshots
            .get_disk_snapshot(&op.disk_id)
            .await
            .map_err(|e| (ResizePhase::Verifying, e))?;
        let reported = after
            .partition(&op.partition.id)
            .ok_or_else(|| {
                (
                    ResizePhase::Verifying,
                    PartwiseError::NotFound(format!(
                        "partition {} missing from post-operation snapshot",
                        op.partition.id
                    )),
                )
            })?
            .total_size;
        if reported.abs_diff(op.safe_size) > self.config.verify_tolerance_bytes {
            return Err((ResizePhase::Verifying, PartwiseError::VerificationMismatch {
                expected: op.safe_size,
                actual: reported,
            }));
        }

        // Remount on the success path; a failure here is reported but does
        // not undo a verified resize.
        if ctx
            .checkpoints
            .iter()
            .any(|c| matches!(c, Checkpoint::Unmounted))
        {
            if let Err(e) = self
                .call_tool(ResizePhase::Verifying, self.toolkit.remount(&current))
                .await
            {
                tracing::warn!(%e, "remount after committed resize failed");
                ctx.diagnostics.push(format!("remount failed: {}", e));
            }
        }

        Ok(reported)
    }

    /// Replay the checkpoint list in reverse, restoring each pre-image. A
    /// compensating action that fails leaves the disk in an unknown state:
    /// the transaction ends Failed and nothing further is attempted.
    async fn roll_back(&self, op: &ResizeOperation, ctx: &mut TxContext) -> TransactionStatus {
        if ctx.checkpoints.is_empty() {
            self.emit(
                ctx,
                ResizePhase::RolledBack,
                ctx.last_percent,
                "No changes were made to the disk",
            );
            return TransactionStatus::RolledBack;
        }

        self.emit(
            ctx,
            ResizePhase::RollingBack,
            ctx.last_percent,
            format!("Rolling back {} checkpoint(s)", ctx.checkpoints.len()),
        );

        let checkpoints: Vec<Checkpoint> = ctx.checkpoints.iter().rev().cloned().collect();
        for checkpoint in checkpoints {
            let result = match checkpoint {
                Checkpoint::PartitionTableUpdated { previous_extent } => {
                    self.call_tool(
                        ResizePhase::RollingBack,
                        self.toolkit
                            .update_partition_table_entry(&op.partition, previous_extent),
                    )
                    .await
                }
                Checkpoint::FilesystemResized { previous_size } => {
                    self.call_tool(
                        ResizePhase::RollingBack,
                        self.toolkit.resize_filesystem(&op.partition, previous_size),
                    )
                    .await
                }
                Checkpoint::Unmounted => {
                    self.call_tool(ResizePhase::RollingBack, self.toolkit.remount(&op.partition))
                        .await
                }
            };
            if let Err(error) = result {
                tracing::error!(
                    %error,
                    partition = %op.partition.device_path,
                    "rollback failed; disk state requires manual intervention"
                );
                ctx.diagnostics
                    .push(format!("rollback failed: {}", error));
                self.emit(
                    ctx,
                    ResizePhase::Failed,
                    ctx.last_percent,
                    "Rollback failed; manual intervention required",
                );
                return TransactionStatus::Failed;
            }
        }

        self.emit(
            ctx,
            ResizePhase::RolledBack,
            ctx.last_percent,
            "All checkpoints reverted",
        );
        TransactionStatus::RolledBack
    }

    /// Register the partition in the in-flight set. At most one transaction
    /// per partition; extent overlap on the same disk is also rejected.
    fn reserve(&self, op: &ResizeOperation) -> Result<RegistryGuard, PartwiseError> {
        let start = op.partition.start_offset;
        let end = start + op.partition.total_size.max(op.safe_size);

        let mut registry = self.registry.lock().unwrap();
        if registry.contains_key(&op.partition.id) {
            return Err(PartwiseError::OperationInProgress(op.partition.id.clone()));
        }
        for (other_id, r) in registry.iter() {
            if r.disk_id == op.disk_id && r.start < end && start < r.end {
                return Err(PartwiseError::OperationInProgress(other_id.clone()));
            }
        }
        registry.insert(
            op.partition.id.clone(),
            Reservation {
                disk_id: op.disk_id.clone(),
                start,
                end,
            },
        );
        Ok(RegistryGuard {
            registry: Arc::clone(&self.registry),
            key: op.partition.id.clone(),
        })
    }

    async fn call_tool<F>(&self, phase: ResizePhase, fut: F) -> Result<(), PartwiseError>
    where
        F: Future<Output = Result<(), PartwiseError>>,
    {
        match tokio::time::timeout(self.config.phase_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(PartwiseError::Timeout(phase.display_name().to_string())),
        }
    }

    fn emit(&self, ctx: &mut TxContext, phase: ResizePhase, percent: f32, message: impl Into<String>) {
        let percent = percent.max(ctx.last_percent);
        ctx.last_percent = percent;
        let event = ProgressEvent {
            transaction_id: ctx.transaction_id,
            partition_id: ctx.partition_id.clone(),
            phase,
            percent,
            message: message.into(),
            timestamp: Utc::now(),
        };
        tracing::debug!(
            phase = phase.display_name(),
            percent,
            "resize progress"
        );
        self.notify(EngineNotice::Phase(event));
    }

    fn notify(&self, notice: EngineNotice) {
        // No receivers is fine; observers are optional.
        let _ = self.notices.send(notice);
    }
}

fn is_cancelled(options: &ExecuteOptions) -> bool {
    options
        .cancel
        .as_ref()
        .map(|c| c.is_cancelled())
        .unwrap_or(false)
}
