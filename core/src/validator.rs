//! Pre-flight validation of a single resize request
//!
//! Every check must pass before a `ResizeOperation` is handed to the
//! transaction engine; the first failure short-circuits with a typed
//! reason. Validation reads only the snapshot and touches no real state,
//! so a rejected request can be corrected and retried immediately.

use crate::config::EngineConfig;
use crate::snapshot::{DiskSnapshot, FilesystemKind, PartitionSnapshot};
use crate::PartwiseError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeDirection {
    Grow,
    Shrink,
}

/// Outcome of one pre-flight check, kept on the operation so the audit
/// record can replay exactly what was verified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

/// A validated resize request, consumed exactly once by the transaction
/// engine. Never reused across attempts: a retry validates a new instance
/// against a fresh snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeOperation {
    pub id: Uuid,
    pub disk_id: String,
    /// Snapshot of the partition at validation time
    pub partition: PartitionSnapshot,
    /// Size the caller asked for (bytes)
    pub requested_size: u64,
    /// Size the engine will actually apply; see [`validate_resize`]
    pub safe_size: u64,
    pub direction: ResizeDirection,
    pub filesystem: FilesystemKind,
    pub preflight: Vec<PreflightCheck>,
}

impl ResizeOperation {
    pub fn current_size(&self) -> u64 {
        self.partition.total_size
    }
}

fn align_up(value: u64, unit: u64) -> u64 {
    value.div_ceil(unit) * unit
}

fn nearest_aligned(value: u64, unit: u64) -> u64 {
    let down = value / unit * unit;
    let up = down + unit;
    if value - down <= up - value && down > 0 {
        down
    } else {
        up
    }
}

/// Decide whether resizing `partition_id` to `target_size` bytes is safe to
/// attempt.
///
/// Checks, in order: existence, protection (overridable), shrink floor
/// (used space plus the configured safety margin), grow ceiling (adjacent
/// unallocated space), mount state against the filesystem's online-resize
/// capability, and alignment. On success the returned operation carries a
/// "safe size": for shrink the larger of the request and the computed
/// floor, for grow the smaller of the request and the adjacent bound.
pub fn validate_resize(
    disk: &DiskSnapshot,
    partition_id: &str,
    target_size: u64,
    override_protected: bool,
    config: &EngineConfig,
) -> Result<ResizeOperation, PartwiseError> {
    let mut preflight = Vec::new();

    // Check 1: existence
    let partition = disk
        .partition(partition_id)
        .ok_or_else(|| PartwiseError::NotFound(format!("partition {}", partition_id)))?;
    preflight.push(PreflightCheck {
        name: "exists".to_string(),
        passed: true,
        detail: format!("{} present in snapshot of {}", partition_id, disk.id),
    });

    if target_size == 0 {
        return Err(PartwiseError::InvalidArgument(
            "target size must be greater than zero".to_string(),
        ));
    }
    if target_size == partition.total_size {
        return Err(PartwiseError::InvalidArgument(format!(
            "target size equals current size ({} bytes)",
            target_size
        )));
    }
    if !partition.filesystem.supports_resize() {
        return Err(PartwiseError::InvalidArgument(format!(
            "resize not supported for {} filesystems",
            partition.filesystem.display_name()
        )));
    }

    // Check 2: protection
    if partition.is_protected() && !override_protected {
        return Err(PartwiseError::ProtectedPartition(format!(
            "{} carries system/boot/EFI flags",
            partition.device_path
        )));
    }
    preflight.push(PreflightCheck {
        name: "protection".to_string(),
        passed: true,
        detail: if partition.is_protected() {
            "protected, caller override supplied".to_string()
        } else {
            "not a protected partition".to_string()
        },
    });

    let direction = if target_size > partition.total_size {
        ResizeDirection::Grow
    } else {
        ResizeDirection::Shrink
    };

    let alignment = if disk.alignment_unit > 0 {
        disk.alignment_unit
    } else {
        config.alignment_unit
    };

    // Check 3 (shrink): floor at used space plus the safety margin, aligned
    // up so the floor itself is a valid target. The margin is applied in
    // integer math (per-mille) so the floor is exact for round inputs.
    let mut safe_size = target_size;
    if direction == ResizeDirection::Shrink {
        let used = partition.used_space.unwrap_or(0);
        let margin_milli = (config.safety_margin * 1000.0).round() as u128;
        let floor = used as u128 + (used as u128 * margin_milli).div_ceil(1000);
        let min_safe = align_up(floor as u64, alignment);
        if target_size < min_safe {
            return Err(PartwiseError::InsufficientSpace {
                min_safe_size: min_safe,
            });
        }
        safe_size = target_size.max(min_safe);
        preflight.push(PreflightCheck {
            name: "shrink_floor".to_string(),
            passed: true,
            detail: format!("minimum safe size {} bytes", min_safe),
        });
    }

    // Check 4 (grow): the extra space must exist unallocated right after
    // the partition.
    if direction == ResizeDirection::Grow {
        let available = disk.unallocated_after(partition);
        if target_size - partition.total_size > available {
            return Err(PartwiseError::NoAdjacentSpace { available });
        }
        safe_size = target_size.min(partition.total_size + available);
        preflight.push(PreflightCheck {
            name: "adjacent_space".to_string(),
            passed: true,
            detail: format!("{} bytes unallocated after partition", available),
        });
    }

    // Check 5: mount state vs. the filesystem's online-resize capability
    let online_ok = match direction {
        ResizeDirection::Grow => partition.filesystem.supports_online_grow(),
        ResizeDirection::Shrink => partition.filesystem.supports_online_shrink(),
    };
    if partition.is_mounted && !online_ok {
        return Err(PartwiseError::ResourceBusy(format!(
            "{} is mounted and {} does not support online {}",
            partition.device_path,
            partition.filesystem.display_name(),
            match direction {
                ResizeDirection::Grow => "grow",
                ResizeDirection::Shrink => "shrink",
            }
        )));
    }
    preflight.push(PreflightCheck {
        name: "mount_state".to_string(),
        passed: true,
        detail: if partition.is_mounted {
            "mounted, online resize supported".to_string()
        } else {
            "not mounted".to_string()
        },
    });

    // Check 6: alignment of the resulting end offset, the boundary the
    // resize moves. Suggest the nearest valid size, never round silently.
    // The suggestion is derived from the end offset so it stays usable on
    // a retry even when the partition starts off-grid.
    let end_offset = partition.start_offset + target_size;
    if end_offset % alignment != 0 {
        let suggested_size =
            nearest_aligned(end_offset, alignment).saturating_sub(partition.start_offset);
        return Err(PartwiseError::AlignmentError { suggested_size });
    }
    preflight.push(PreflightCheck {
        name: "alignment".to_string(),
        passed: true,
        detail: format!("end offset aligned to {} bytes", alignment),
    });

    Ok(ResizeOperation {
        id: Uuid::new_v4(),
        disk_id: disk.id.clone(),
        partition: partition.clone(),
        requested_size: target_size,
        safe_size,
        direction,
        filesystem: partition.filesystem,
        preflight,
    })
}
