use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunable parameters for validation and execution.
///
/// The safety margin and alignment unit vary by filesystem and platform, so
/// they are configuration rather than constants. The alignment unit here is
/// only a fallback; a disk snapshot that reports its own alignment wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fraction of used space reserved for filesystem metadata and unmovable
    /// files when shrinking (0.10 = 10%)
    pub safety_margin: f64,

    /// Fallback alignment boundary in bytes when the disk does not report one
    pub alignment_unit: u64,

    /// Upper bound on any single external tool invocation. A hung resize
    /// tool is treated as a phase failure and rolled back.
    pub phase_timeout: Duration,

    /// Allowed difference between the requested size and the size reported
    /// by the post-operation snapshot
    pub verify_tolerance_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            safety_margin: 0.10,
            alignment_unit: 4096,
            phase_timeout: Duration::from_secs(15 * 60),
            verify_tolerance_bytes: 4096,
        }
    }
}
