//! Progress forwarding and audit recording
//!
//! The reporter observes the engine's notification stream and produces two
//! outputs: a live `ProgressEvent` stream for UI consumption and one
//! append-only audit record per finished transaction. It has no decision
//! authority: it never blocks or alters engine behavior.

use crate::engine::{EngineNotice, OperationDescriptor, TransactionStatus};
use crate::progress::ProgressEvent;
use crate::PartwiseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Durable record of one finished transaction. The on-disk encoding is the
/// sink's concern; every field here must survive it losslessly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub transaction_id: Uuid,
    pub operation_id: Uuid,
    pub partition_id: String,
    pub device_path: String,
    pub direction: crate::validator::ResizeDirection,
    pub size_before: u64,
    pub size_requested: u64,
    /// Size reported by the post-operation snapshot; absent unless committed
    pub size_after: Option<u64>,
    /// Every pre-flight check the validator ran for this operation
    pub preflight: Vec<crate::validator::PreflightCheck>,
    pub status: TransactionStatus,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub duration_ms: i64,
    /// Captured diagnostic output from failed phases and rollback
    pub diagnostics: Vec<String>,
}

/// Append-only destination for audit records
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), PartwiseError>;
}

struct PendingAudit {
    descriptor: OperationDescriptor,
    started: DateTime<Utc>,
}

/// Consumes `EngineNotice`s, re-broadcasts the per-phase `ProgressEvent`s,
/// and appends an audit record when a transaction reaches a terminal state.
pub struct AuditReporter {
    sink: Arc<dyn AuditSink>,
    progress: broadcast::Sender<ProgressEvent>,
    pending: HashMap<Uuid, PendingAudit>,
}

impl AuditReporter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        let (progress, _) = broadcast::channel(256);
        Self {
            sink,
            progress,
            pending: HashMap::new(),
        }
    }

    /// Live progress stream for UI consumers
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Drive the reporter until the engine side of the channel closes.
    /// Typically spawned: `tokio::spawn(reporter.run(engine.subscribe()))`.
    pub async fn run(mut self, mut notices: broadcast::Receiver<EngineNotice>) {
        loop {
            match notices.recv().await {
                Ok(notice) => self.handle(notice).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "audit reporter lagged behind engine notices");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Process one notification. Exposed separately so callers that drain
    /// the channel themselves (tests, the CLI) can still build records.
    pub async fn handle(&mut self, notice: EngineNotice) {
        match notice {
            EngineNotice::Started {
                transaction_id,
                descriptor,
                timestamp,
            } => {
                self.pending.insert(
                    transaction_id,
                    PendingAudit {
                        descriptor,
                        started: timestamp,
                    },
                );
            }
            EngineNotice::Phase(event) => {
                let _ = self.progress.send(event);
            }
            EngineNotice::Finished {
                transaction_id,
                status,
                final_size,
                diagnostics,
                timestamp,
            } => {
                let Some(pending) = self.pending.remove(&transaction_id) else {
                    tracing::warn!(%transaction_id, "finished notice for unknown transaction");
                    return;
                };
                let record = AuditRecord {
                    transaction_id,
                    operation_id: pending.descriptor.operation_id,
                    partition_id: pending.descriptor.partition_id,
                    device_path: pending.descriptor.device_path,
                    direction: pending.descriptor.direction,
                    size_before: pending.descriptor.size_before,
                    size_requested: pending.descriptor.size_requested,
                    size_after: final_size,
                    preflight: pending.descriptor.preflight,
                    status,
                    started: pending.started,
                    finished: timestamp,
                    duration_ms: (timestamp - pending.started).num_milliseconds(),
                    diagnostics,
                };
                tracing::info!(
                    %transaction_id,
                    status = ?record.status,
                    duration_ms = record.duration_ms,
                    "transaction finished"
                );
                if let Err(e) = self.sink.append(record).await {
                    tracing::error!(%e, "failed to append audit record");
                }
            }
        }
    }
}
