//! Space reallocation planning
//!
//! Given a target partition that needs more room, work out which of its
//! neighbors must be sacrificed and produce an ordered, human-reviewable
//! plan. Planning is a pure computation over a disk snapshot: no side
//! effects, safe to call speculatively to preview different sizes.
//!
//! Workflow the plan describes (C: is full, E: sits behind it):
//! 1. User backs up E:'s data
//! 2. Delete E: entirely
//! 3. Expand C: into the freed space

use crate::snapshot::DiskSnapshot;
use crate::PartwiseError;
use serde::{Deserialize, Serialize};

/// Plan for reallocating space from neighboring partitions to a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReallocationPlan {
    /// The partition that needs more space (e.g., C:)
    pub target_partition_id: String,

    /// The partition(s) that will be deleted to free space
    pub source_partitions: Vec<SourcePartitionPlan>,

    /// Total space that will become available to the target (bytes)
    pub total_space_freed: u64,

    /// New size for the target partition after reallocation (bytes)
    pub target_new_size: u64,

    /// Steps the user must follow, numbered 1..n with no gaps
    pub steps: Vec<ReallocationStep>,

    /// Warnings about this operation
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePartitionPlan {
    pub partition_id: String,
    pub partition_label: String,
    pub current_size: u64,
    pub used_space: Option<u64>,
    pub action: SourceAction,
}

/// What happens to a source partition. Position relative to the target
/// decides this, never user preference. Partial shrink-and-relocate would
/// require partition moving, which is a separate capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceAction {
    DeleteEntirely,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReallocationStep {
    pub step_number: usize,
    pub title: String,
    pub description: String,
    pub action_type: StepActionType,
    pub can_automate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepActionType {
    /// User must do this manually
    UserManual,
    /// App guides but user confirms each action
    AppAssistedManual,
    /// App can do this automatically
    AppAutomated,
}

/// Analyze the disk layout and produce a reallocation plan for growing the
/// target partition by `desired_additional_space` bytes.
///
/// The walk starts immediately after the target's end offset and consumes
/// whole adjacent partitions until enough space is freed. It stops early at
/// a protected partition or a non-adjacent gap; in that case the plan is
/// still returned with `total_space_freed` below the request and a warning
/// noting the shortfall, so the caller can decide whether a partial plan is
/// worth executing.
pub fn create_reallocation_plan(
    disk: &DiskSnapshot,
    target_partition_id: &str,
    desired_additional_space: u64,
) -> Result<ReallocationPlan, PartwiseError> {
    if desired_additional_space == 0 {
        return Err(PartwiseError::InvalidArgument(
            "desired additional space must be greater than zero".to_string(),
        ));
    }

    let target = disk.partition(target_partition_id).ok_or_else(|| {
        PartwiseError::NotFound(format!("partition {}", target_partition_id))
    })?;

    let mut source_partitions = Vec::new();
    let mut warnings = Vec::new();
    let mut total_freed = 0u64;

    // Walk partitions in physical order starting right after the target.
    // `cursor` tracks the end of the region freed so far.
    let mut cursor = target.end_offset();
    let mut walk_stopped = false;

    for partition in disk.partitions_after(target.end_offset()) {
        if total_freed >= desired_additional_space {
            break;
        }

        if partition.start_offset > cursor {
            // Unallocated gap: the region up to the next partition is
            // usable as-is, but nothing past it can be reached.
            total_freed += partition.start_offset - cursor;
            walk_stopped = true;
            break;
        }

        if partition.is_protected() {
            warnings.push(format!(
                "Stopped at protected partition {} ({}): system, boot, and EFI \
                 partitions are never reallocated automatically.",
                partition.device_path,
                partition.display_label()
            ));
            walk_stopped = true;
            break;
        }

        let used = partition.used_space.unwrap_or(0);
        if used > 0 {
            warnings.push(format!(
                "Partition {} ({}) contains {} of data. Back up this data before proceeding!",
                partition.device_path,
                partition.display_label(),
                format_bytes(used)
            ));
        }

        source_partitions.push(SourcePartitionPlan {
            partition_id: partition.id.clone(),
            partition_label: partition.display_label().to_string(),
            current_size: partition.total_size,
            used_space: partition.used_space,
            action: SourceAction::DeleteEntirely,
        });

        total_freed += partition.total_size;
        cursor = partition.end_offset();
    }

    // Trailing unallocated space up to the end of the disk counts too,
    // unless the walk already hit a gap or a protected partition.
    if !walk_stopped && total_freed < desired_additional_space {
        total_freed += disk.total_size.saturating_sub(cursor);
    }

    if total_freed < desired_additional_space {
        warnings.push(format!(
            "Only {} of the requested {} can be freed by deleting {} partition(s).",
            format_bytes(total_freed),
            format_bytes(desired_additional_space),
            source_partitions.len()
        ));
    }

    let granted = desired_additional_space.min(total_freed);
    let target_new_size = target.total_size + granted;

    // Build the step list: backup warning first, then one delete per
    // source, then the expansion itself.
    let mut steps = Vec::new();
    let mut step_number = 1;

    let needs_backup = source_partitions
        .iter()
        .any(|s| s.used_space.unwrap_or(0) > 0);
    if needs_backup {
        let labels: Vec<&str> = source_partitions
            .iter()
            .filter(|s| s.used_space.unwrap_or(0) > 0)
            .map(|s| s.partition_label.as_str())
            .collect();
        steps.push(ReallocationStep {
            step_number,
            title: "Back up your data".to_string(),
            description: format!(
                "The following partitions will be deleted: {}. Back up any important data now!",
                labels.join(", ")
            ),
            action_type: StepActionType::UserManual,
            can_automate: false,
        });
        step_number += 1;
    }

    for source in &source_partitions {
        steps.push(ReallocationStep {
            step_number,
            title: format!("Delete partition {}", source.partition_label),
            description: format!(
                "Delete {} (frees {} of space)",
                source.partition_label,
                format_bytes(source.current_size)
            ),
            action_type: StepActionType::AppAssistedManual,
            can_automate: true,
        });
        step_number += 1;
    }

    steps.push(ReallocationStep {
        step_number,
        title: format!("Expand {}", target.device_path),
        description: format!(
            "Expand {} from {} to {} (+{})",
            target.device_path,
            format_bytes(target.total_size),
            format_bytes(target_new_size),
            format_bytes(granted)
        ),
        action_type: StepActionType::AppAutomated,
        can_automate: true,
    });

    Ok(ReallocationPlan {
        target_partition_id: target_partition_id.to_string(),
        source_partitions,
        total_space_freed: total_freed,
        target_new_size,
        steps,
        warnings,
    })
}

/// Format bytes to a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }

    let base = 1024_f64;
    let exp = (bytes as f64).log(base).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let value = bytes as f64 / base.powi(exp as i32);

    format!("{:.2} {}", value, UNITS[exp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{FilesystemKind, PartitionFlag, PartitionSnapshot};

    const GB: u64 = 1024 * 1024 * 1024;

    fn part(
        id: &str,
        device: &str,
        label: &str,
        start: u64,
        size: u64,
        used: Option<u64>,
        flags: Vec<PartitionFlag>,
    ) -> PartitionSnapshot {
        PartitionSnapshot {
            id: id.to_string(),
            disk_id: "disk-0".to_string(),
            device_path: device.to_string(),
            label: Some(label.to_string()),
            number: 1,
            start_offset: start,
            total_size: size,
            used_space: used,
            filesystem: FilesystemKind::Ntfs,
            flags,
            mount_point: Some(device.to_string()),
            is_mounted: true,
        }
    }

    /// [C: 50GB full][E: 20GB, 5GB used][F: 30GB]
    fn three_partition_disk() -> DiskSnapshot {
        DiskSnapshot {
            id: "disk-0".to_string(),
            device_path: "\\\\.\\PhysicalDrive0".to_string(),
            model: "Test Disk".to_string(),
            total_size: 100 * GB,
            alignment_unit: 4096,
            partitions: vec![
                part("part-c", "C:", "System", 0, 50 * GB, Some(50 * GB), vec![]),
                part("part-e", "E:", "Data", 50 * GB, 20 * GB, Some(5 * GB), vec![]),
                part("part-f", "F:", "Media", 70 * GB, 30 * GB, Some(0), vec![]),
            ],
        }
    }

    #[test]
    fn frees_only_what_is_needed() {
        let disk = three_partition_disk();
        let plan = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();

        // E alone covers the 15 GB request; F stays untouched.
        assert_eq!(plan.source_partitions.len(), 1);
        assert_eq!(plan.source_partitions[0].partition_id, "part-e");
        assert_eq!(plan.source_partitions[0].action, SourceAction::DeleteEntirely);
        assert_eq!(plan.total_space_freed, 20 * GB);
        assert_eq!(plan.target_new_size, 65 * GB);

        // Backup warning mentioning E, then delete E, then expand C.
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].action_type, StepActionType::UserManual);
        assert!(plan.steps[0].description.contains("Data"));
        assert_eq!(plan.steps[1].action_type, StepActionType::AppAssistedManual);
        assert_eq!(plan.steps[2].action_type, StepActionType::AppAutomated);

        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("5.00 GB"));
    }

    #[test]
    fn step_numbers_are_contiguous_from_one() {
        let disk = three_partition_disk();
        let plan = create_reallocation_plan(&disk, "part-c", 35 * GB).unwrap();
        for (i, step) in plan.steps.iter().enumerate() {
            assert_eq!(step.step_number, i + 1);
        }
    }

    #[test]
    fn consumes_multiple_partitions_when_needed() {
        let disk = three_partition_disk();
        let plan = create_reallocation_plan(&disk, "part-c", 35 * GB).unwrap();

        assert_eq!(plan.source_partitions.len(), 2);
        assert_eq!(plan.total_space_freed, 50 * GB);
        assert_eq!(plan.target_new_size, 85 * GB);
        // backup + 2 deletes + expand
        assert_eq!(plan.steps.len(), 4);
    }

    #[test]
    fn backup_step_precedes_every_delete() {
        let disk = three_partition_disk();
        let plan = create_reallocation_plan(&disk, "part-c", 35 * GB).unwrap();

        let backup_pos = plan
            .steps
            .iter()
            .position(|s| s.action_type == StepActionType::UserManual)
            .expect("backup step present");
        for (i, step) in plan.steps.iter().enumerate() {
            if step.action_type == StepActionType::AppAssistedManual {
                assert!(backup_pos < i);
            }
        }
    }

    #[test]
    fn no_backup_step_when_sources_are_empty() {
        let mut disk = three_partition_disk();
        disk.partitions[1].used_space = Some(0);
        let plan = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();

        assert!(plan.warnings.is_empty());
        assert_eq!(plan.steps.len(), 2); // delete E + expand C
        assert_eq!(plan.steps[0].action_type, StepActionType::AppAssistedManual);
    }

    #[test]
    fn planning_is_idempotent() {
        let disk = three_partition_disk();
        let a = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();
        let b = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shortfall_is_reported_not_fatal() {
        let disk = three_partition_disk();
        // More than the whole disk can provide.
        let plan = create_reallocation_plan(&disk, "part-c", 80 * GB).unwrap();

        assert_eq!(plan.total_space_freed, 50 * GB);
        assert_eq!(plan.target_new_size, 100 * GB); // capped to freed space
        assert!(plan
            .warnings
            .iter()
            .any(|w| w.contains("of the requested")));
    }

    #[test]
    fn walk_stops_at_protected_partition() {
        let mut disk = three_partition_disk();
        disk.partitions[1].flags = vec![PartitionFlag::Efi];
        let plan = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();

        assert!(plan.source_partitions.is_empty());
        assert_eq!(plan.total_space_freed, 0);
        assert_eq!(plan.target_new_size, 50 * GB);
        assert!(plan.warnings.iter().any(|w| w.contains("protected")));
    }

    #[test]
    fn walk_stops_at_non_adjacent_gap() {
        // [C: 50GB][gap: 5GB][F: 30GB], F unreachable across the gap
        let disk = DiskSnapshot {
            id: "disk-0".to_string(),
            device_path: "/dev/sda".to_string(),
            model: "Test Disk".to_string(),
            total_size: 100 * GB,
            alignment_unit: 4096,
            partitions: vec![
                part("part-c", "C:", "System", 0, 50 * GB, Some(50 * GB), vec![]),
                part("part-f", "F:", "Media", 55 * GB, 30 * GB, Some(GB), vec![]),
            ],
        };
        let plan = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();

        assert!(plan.source_partitions.is_empty());
        assert_eq!(plan.total_space_freed, 5 * GB); // the gap itself
        assert_eq!(plan.target_new_size, 55 * GB);
        assert!(plan.warnings.iter().any(|w| w.contains("requested")));
    }

    #[test]
    fn trailing_free_space_yields_trivial_plan() {
        let disk = DiskSnapshot {
            id: "disk-0".to_string(),
            device_path: "/dev/sda".to_string(),
            model: "Test Disk".to_string(),
            total_size: 100 * GB,
            alignment_unit: 4096,
            partitions: vec![part(
                "part-c",
                "C:",
                "System",
                0,
                50 * GB,
                Some(40 * GB),
                vec![],
            )],
        };
        let plan = create_reallocation_plan(&disk, "part-c", 15 * GB).unwrap();

        assert!(plan.source_partitions.is_empty());
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.target_new_size, 65 * GB);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].action_type, StepActionType::AppAutomated);
    }

    #[test]
    fn unknown_target_is_not_found() {
        let disk = three_partition_disk();
        let err = create_reallocation_plan(&disk, "part-x", GB).unwrap_err();
        assert!(matches!(err, PartwiseError::NotFound(_)));
    }

    #[test]
    fn zero_request_is_invalid() {
        let disk = three_partition_disk();
        let err = create_reallocation_plan(&disk, "part-c", 0).unwrap_err();
        assert!(matches!(err, PartwiseError::InvalidArgument(_)));
    }

    #[test]
    fn format_bytes_picks_sensible_units() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(20 * GB), "20.00 GB");
    }
}
