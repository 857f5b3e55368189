//! Resource ceilings for sandboxed execution

use serde::{Deserialize, Serialize};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Resource ceilings applied to a single execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock ceiling, enforced by every strategy
    #[serde(with = "humantime_serde")]
    pub max_execution_time: Duration,

    /// CPU time ceiling
    #[serde(with = "humantime_serde")]
    pub max_cpu_time: Duration,

    /// Memory ceiling in bytes (address space for isolated processes)
    pub max_memory: u64,

    /// Open file descriptor ceiling
    pub max_open_files: u64,

    /// Process/thread ceiling (isolated process and container strategies)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::restricted()
    }
}

impl ResourceLimits {
    /// Ceilings for untrusted code under the tightest policy
    pub fn strict() -> Self {
        Self {
            max_execution_time: Duration::from_secs(10),
            max_cpu_time: Duration::from_secs(5),
            max_memory: 128 * MIB,
            max_open_files: 16,
            max_processes: Some(16),
        }
    }

    pub fn restricted() -> Self {
        Self {
            max_execution_time: Duration::from_secs(30),
            max_cpu_time: Duration::from_secs(15),
            max_memory: 256 * MIB,
            max_open_files: 64,
            max_processes: None,
        }
    }

    pub fn permissive() -> Self {
        Self {
            max_execution_time: Duration::from_secs(60),
            max_cpu_time: Duration::from_secs(30),
            max_memory: 512 * MIB,
            max_open_files: 256,
            max_processes: None,
        }
    }

    /// Generous ceilings for local development
    pub fn development() -> Self {
        Self {
            max_execution_time: Duration::from_secs(300),
            max_cpu_time: Duration::from_secs(300),
            max_memory: 1024 * MIB,
            max_open_files: 1024,
            max_processes: None,
        }
    }

    /// CPU ceiling in whole seconds, rounded up (what `RLIMIT_CPU` accepts)
    pub fn cpu_seconds(&self) -> u64 {
        let secs = self.max_cpu_time.as_secs();
        if self.max_cpu_time.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs.max(1)
        }
    }

    pub fn cpu_millis(&self) -> u64 {
        u64::try_from(self.max_cpu_time.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.max_execution_time, Duration::from_secs(30));
        assert_eq!(limits.max_memory, 256 * MIB);
    }

    #[test]
    fn test_strict_limits() {
        let limits = ResourceLimits::strict();
        assert_eq!(limits.max_execution_time, Duration::from_secs(10));
        assert_eq!(limits.max_cpu_time, Duration::from_secs(5));
        assert_eq!(limits.max_memory, 128 * MIB);
        assert_eq!(limits.max_open_files, 16);
    }

    #[test]
    fn test_presets_grow_monotonically() {
        let presets = [
            ResourceLimits::strict(),
            ResourceLimits::restricted(),
            ResourceLimits::permissive(),
            ResourceLimits::development(),
        ];
        for pair in presets.windows(2) {
            assert!(pair[0].max_execution_time <= pair[1].max_execution_time);
            assert!(pair[0].max_memory <= pair[1].max_memory);
            assert!(pair[0].max_open_files <= pair[1].max_open_files);
        }
    }

    #[test]
    fn test_cpu_seconds_rounds_up() {
        let mut limits = ResourceLimits::strict();
        limits.max_cpu_time = Duration::from_millis(1500);
        assert_eq!(limits.cpu_seconds(), 2);
        limits.max_cpu_time = Duration::from_millis(200);
        assert_eq!(limits.cpu_seconds(), 1);
        limits.max_cpu_time = Duration::from_secs(3);
        assert_eq!(limits.cpu_seconds(), 3);
    }
}
