use crate::PartwiseError;
use serde::{Deserialize, Serialize};

/// Filesystem type of a partition, as reported by the enumeration layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FilesystemKind {
    Ntfs,
    Ext4,
    Fat32,
    ExFat,
    Unknown,
}

impl FilesystemKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            FilesystemKind::Ntfs => "NTFS",
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Fat32 => "FAT32",
            FilesystemKind::ExFat => "exFAT",
            FilesystemKind::Unknown => "Unknown",
        }
    }

    /// Whether resize operations are supported at all for this filesystem
    pub fn supports_resize(&self) -> bool {
        matches!(self, FilesystemKind::Ntfs | FilesystemKind::Ext4)
    }

    /// Whether the filesystem can be grown while mounted
    pub fn supports_online_grow(&self) -> bool {
        matches!(self, FilesystemKind::Ntfs | FilesystemKind::Ext4)
    }

    /// Whether the filesystem can be shrunk while mounted. NTFS shrink via
    /// ntfsresize and ext4 shrink via resize2fs both require the volume
    /// offline.
    pub fn supports_online_shrink(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartitionFlag {
    Boot,
    System,
    Efi,
    Hidden,
    ReadOnly,
}

/// Read-only description of one partition at a point in time.
///
/// Produced fresh by the enumeration collaborator before every planning or
/// validation call; never mutated. Re-snapshot after any state-changing
/// operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub id: String,
    pub disk_id: String,
    /// Device path (e.g. "/dev/sda2" on Linux, "E:" on Windows)
    pub device_path: String,
    pub label: Option<String>,
    /// Partition number (1-based)
    pub number: u32,
    /// Start offset in bytes from the beginning of the disk
    pub start_offset: u64,
    /// Total size in bytes
    pub total_size: u64,
    /// Used space in bytes, if the enumeration layer could determine it
    pub used_space: Option<u64>,
    pub filesystem: FilesystemKind,
    pub flags: Vec<PartitionFlag>,
    pub mount_point: Option<String>,
    pub is_mounted: bool,
}

impl PartitionSnapshot {
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.total_size
    }

    /// System, boot, and EFI partitions are excluded from automatic
    /// reallocation without explicit override.
    pub fn is_protected(&self) -> bool {
        self.flags.iter().any(|f| {
            matches!(
                f,
                PartitionFlag::Boot | PartitionFlag::System | PartitionFlag::Efi
            )
        })
    }

    /// Display label, falling back to the device path
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.device_path)
    }
}

/// Immutable view of a disk and its partitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub id: String,
    pub device_path: String,
    pub model: String,
    /// Total size in bytes
    pub total_size: u64,
    /// Boundary (bytes) partition offsets must conform to, commonly 4096
    pub alignment_unit: u64,
    /// Partitions, expected sorted by start offset
    pub partitions: Vec<PartitionSnapshot>,
}

impl DiskSnapshot {
    pub fn partition(&self, partition_id: &str) -> Option<&PartitionSnapshot> {
        self.partitions.iter().find(|p| p.id == partition_id)
    }

    /// Partitions whose start offset is at or past the given offset,
    /// sorted by physical position.
    pub fn partitions_after(&self, offset: u64) -> Vec<&PartitionSnapshot> {
        let mut after: Vec<_> = self
            .partitions
            .iter()
            .filter(|p| p.start_offset >= offset)
            .collect();
        after.sort_by_key(|p| p.start_offset);
        after
    }

    /// Length in bytes of the unallocated region immediately following the
    /// given partition, bounded by the next partition or the end of the disk.
    pub fn unallocated_after(&self, partition: &PartitionSnapshot) -> u64 {
        let end = partition.end_offset();
        let next_start = self
            .partitions
            .iter()
            .filter(|p| p.start_offset >= end && p.id != partition.id)
            .map(|p| p.start_offset)
            .min()
            .unwrap_or(self.total_size);
        next_start.saturating_sub(end)
    }

    /// Check the structural invariants the rest of the engine relies on.
    pub fn validate(&self) -> Result<(), PartwiseError> {
        for p in &self.partitions {
            if let Some(used) = p.used_space {
                if used > p.total_size {
                    return Err(PartwiseError::InvalidArgument(format!(
                        "partition {}: used space {} exceeds total size {}",
                        p.id, used, p.total_size
                    )));
                }
            }
            if p.end_offset() > self.total_size {
                return Err(PartwiseError::InvalidArgument(format!(
                    "partition {}: extent ends at {} past disk size {}",
                    p.id,
                    p.end_offset(),
                    self.total_size
                )));
            }
        }
        let mut sorted: Vec<_> = self.partitions.iter().collect();
        sorted.sort_by_key(|p| p.start_offset);
        for pair in sorted.windows(2) {
            if pair[0].end_offset() > pair[1].start_offset {
                return Err(PartwiseError::InvalidArgument(format!(
                    "partitions {} and {} overlap",
                    pair[0].id, pair[1].id
                )));
            }
        }
        Ok(())
    }
}

/// External collaborator that enumerates disks. The engine re-reads through
/// this seam at transaction open and during verification, so implementations
/// must return the current layout, not a cached one.
#[async_trait::async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn get_disk_snapshot(&self, disk_id: &str) -> Result<DiskSnapshot, PartwiseError>;
}
