pub mod config;
pub mod engine;
pub mod error;
pub mod planner;
pub mod progress;
pub mod reporter;
pub mod snapshot;
pub mod test_utils;
pub mod validator;

pub use config::EngineConfig;
pub use engine::{
    CancelHandle, Checkpoint, EngineNotice, ExecuteOptions, Extent, OperationDescriptor,
    PartitionToolkit, ResizeEngine, TransactionOutcome, TransactionStatus,
};
pub use error::PartwiseError;
pub use planner::{
    create_reallocation_plan, format_bytes, ReallocationPlan, ReallocationStep, SourceAction,
    SourcePartitionPlan, StepActionType,
};
pub use progress::{ProgressEvent, ResizePhase};
pub use reporter::{AuditRecord, AuditReporter, AuditSink};
pub use snapshot::{
    DiskSnapshot, FilesystemKind, PartitionFlag, PartitionSnapshot, SnapshotProvider,
};
pub use validator::{
    validate_resize, PreflightCheck, ResizeDirection, ResizeOperation,
};
