//! Mock collaborators for safe testing - NEVER touch real hardware
//!
//! `SimulatedEnvironment` stands in for both external seams the engine
//! depends on: it serves disk snapshots and applies toolkit operations to
//! an in-memory disk, with scriptable failures and delays for exercising
//! rollback, timeout, and concurrency paths. Also used by the CLI's
//! `simulate` command.

use crate::engine::{Extent, PartitionToolkit};
use crate::reporter::{AuditRecord, AuditSink};
use crate::snapshot::{
    DiskSnapshot, FilesystemKind, PartitionSnapshot, SnapshotProvider,
};
use crate::PartwiseError;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

pub const GB: u64 = 1024 * 1024 * 1024;

pub fn mock_partition(
    id: &str,
    device_path: &str,
    start: u64,
    size: u64,
    used: Option<u64>,
) -> PartitionSnapshot {
    PartitionSnapshot {
        id: id.to_string(),
        disk_id: "mock-disk-0".to_string(),
        device_path: device_path.to_string(),
        label: None,
        number: 1,
        start_offset: start,
        total_size: size,
        used_space: used,
        filesystem: FilesystemKind::Ext4,
        flags: vec![],
        mount_point: None,
        is_mounted: false,
    }
}

pub fn mock_disk(total_size: u64, partitions: Vec<PartitionSnapshot>) -> DiskSnapshot {
    DiskSnapshot {
        id: "mock-disk-0".to_string(),
        device_path: "mock://disk/0".to_string(),
        model: "Mock Disk".to_string(),
        total_size,
        alignment_unit: 4096,
        partitions,
    }
}

/// In-memory disk plus scriptable toolkit behavior.
///
/// Failures are scripted per operation name and 1-based call index, so a
/// test can let a forward phase succeed and fail the same operation again
/// during rollback.
pub struct SimulatedEnvironment {
    disk: Mutex<DiskSnapshot>,
    calls: Mutex<Vec<String>>,
    counters: Mutex<HashMap<String, usize>>,
    failures: Mutex<HashSet<(String, usize)>>,
    delays: Mutex<HashMap<String, Duration>>,
    /// Applied to partition sizes on table updates; lets tests force a
    /// verification mismatch
    size_skew: Mutex<i64>,
    filesystem_sizes: Mutex<HashMap<String, u64>>,
}

impl SimulatedEnvironment {
    pub fn new(disk: DiskSnapshot) -> Self {
        Self {
            disk: Mutex::new(disk),
            calls: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            size_skew: Mutex::new(0),
            filesystem_sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the nth (1-based) invocation of the named operation
    pub fn fail_call(&self, operation: &str, nth: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert((operation.to_string(), nth));
    }

    /// Delay every invocation of the named operation
    pub fn set_delay(&self, operation: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(operation.to_string(), delay);
    }

    /// Skew partition sizes recorded by table updates, forcing the
    /// engine's verification to disagree with the requested size
    pub fn set_size_skew(&self, skew: i64) {
        *self.size_skew.lock().unwrap() = skew;
    }

    /// Ordered log of toolkit invocations, as "operation partition_id"
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn current_disk(&self) -> DiskSnapshot {
        self.disk.lock().unwrap().clone()
    }

    pub fn filesystem_size(&self, partition_id: &str) -> Option<u64> {
        self.filesystem_sizes
            .lock()
            .unwrap()
            .get(partition_id)
            .copied()
    }

    /// Record the call, apply any scripted delay, then fail if scripted.
    /// Side effects happen after this returns, so a timed-out call leaves
    /// no trace on the simulated disk.
    async fn begin(&self, operation: &str, partition_id: &str) -> Result<(), PartwiseError> {
        let nth = {
            let mut counters = self.counters.lock().unwrap();
            let n = counters.entry(operation.to_string()).or_insert(0);
            *n += 1;
            self.calls
                .lock()
                .unwrap()
                .push(format!("{} {}", operation, partition_id));
            *n
        };

        let delay = self.delays.lock().unwrap().get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .failures
            .lock()
            .unwrap()
            .contains(&(operation.to_string(), nth))
        {
            return Err(PartwiseError::ExternalToolFailure {
                phase: operation.to_string(),
                output: format!("injected failure on call {} of {}", nth, operation),
            });
        }
        Ok(())
    }

    fn with_partition<F>(&self, partition_id: &str, f: F) -> Result<(), PartwiseError>
    where
        F: FnOnce(&mut PartitionSnapshot),
    {
        let mut disk = self.disk.lock().unwrap();
        let partition = disk
            .partitions
            .iter_mut()
            .find(|p| p.id == partition_id)
            .ok_or_else(|| PartwiseError::NotFound(format!("partition {}", partition_id)))?;
        f(partition);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PartitionToolkit for SimulatedEnvironment {
    async fn resize_filesystem(
        &self,
        partition: &PartitionSnapshot,
        target_size: u64,
    ) -> Result<(), PartwiseError> {
        self.begin("resize_filesystem", &partition.id).await?;
        self.filesystem_sizes
            .lock()
            .unwrap()
            .insert(partition.id.clone(), target_size);
        Ok(())
    }

    async fn update_partition_table_entry(
        &self,
        partition: &PartitionSnapshot,
        new_extent: Extent,
    ) -> Result<(), PartwiseError> {
        self.begin("update_partition_table_entry", &partition.id)
            .await?;
        let skew = *self.size_skew.lock().unwrap();
        self.with_partition(&partition.id, |p| {
            p.start_offset = new_extent.start_offset;
            p.total_size = new_extent.size.saturating_add_signed(skew);
        })
    }

    async fn unmount(&self, partition: &PartitionSnapshot) -> Result<(), PartwiseError> {
        self.begin("unmount", &partition.id).await?;
        self.with_partition(&partition.id, |p| p.is_mounted = false)
    }

    async fn remount(&self, partition: &PartitionSnapshot) -> Result<(), PartwiseError> {
        self.begin("remount", &partition.id).await?;
        self.with_partition(&partition.id, |p| p.is_mounted = true)
    }
}

#[async_trait::async_trait]
impl SnapshotProvider for SimulatedEnvironment {
    async fn get_disk_snapshot(&self, disk_id: &str) -> Result<DiskSnapshot, PartwiseError> {
        let disk = self.disk.lock().unwrap().clone();
        if disk.id != disk_id {
            return Err(PartwiseError::NotFound(format!("disk {}", disk_id)));
        }
        Ok(disk)
    }
}

/// Audit sink that keeps records in memory for assertions
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<(), PartwiseError> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}
