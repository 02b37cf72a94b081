//! Host resource snapshot for the public status endpoint.
//!
//! Only coarse, non-identifying numbers are reported: memory totals, CPU
//! core count, load averages and process uptime.

use serde::Serialize;
use std::time::Duration;
use sysinfo::System;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryInfo {
    pub total_mb: u64,
    pub free_mb: u64,
    /// Used memory as a percentage (0-100).
    pub used_percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuInfo {
    pub cores: usize,
    pub load_avg_1m: f64,
    pub load_avg_5m: f64,
    /// Global CPU usage as a percentage (0-100).
    pub usage_percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub memory: MemoryInfo,
    pub cpu: CpuInfo,
    /// Process uptime in seconds.
    pub uptime: u64,
}

/// Gather current host resource usage.
///
/// CPU usage may read 0 on the first call because sysinfo computes it from
/// deltas between refreshes. Load averages are 0 on platforms without them.
#[must_use]
pub fn gather_system_snapshot(uptime: Duration) -> SystemSnapshot {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let total_memory = sys.total_memory();
    let available_memory = sys.available_memory();
    let used_percent = percent(total_memory.saturating_sub(available_memory), total_memory);

    let load = System::load_average();
    let cpu_usage = sys.global_cpu_info().cpu_usage();

    SystemSnapshot {
        memory: MemoryInfo {
            total_mb: total_memory / BYTES_PER_MB,
            free_mb: available_memory / BYTES_PER_MB,
            used_percent,
        },
        cpu: CpuInfo {
            cores: sys.cpus().len(),
            load_avg_1m: round2(load.one),
            load_avg_5m: round2(load.five),
            usage_percent: (cpu_usage.max(0.0) as u32).min(100),
        },
        uptime: uptime.as_secs(),
    }
}

fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        return 0;
    }
    (((part as f64 / whole as f64) * 100.0) as u32).min(100)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_values_in_range() {
        let snapshot = gather_system_snapshot(Duration::from_secs(42));

        assert!(snapshot.memory.used_percent <= 100);
        assert!(snapshot.memory.free_mb <= snapshot.memory.total_mb);
        assert!(snapshot.cpu.usage_percent <= 100);
        assert_eq!(snapshot.uptime, 42);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(5, 4), 100);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let snapshot = SystemSnapshot {
            memory: MemoryInfo {
                total_mb: 2048,
                free_mb: 1024,
                used_percent: 50,
            },
            cpu: CpuInfo {
                cores: 4,
                load_avg_1m: 0.5,
                load_avg_5m: 0.25,
                usage_percent: 12,
            },
            uptime: 7,
        };

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["memory"]["totalMb"], 2048);
        assert_eq!(json["memory"]["usedPercent"], 50);
        assert_eq!(json["cpu"]["loadAvg1m"], 0.5);
        assert_eq!(json["cpu"]["loadAvg5m"], 0.25);
        assert_eq!(json["uptime"], 7);
    }
}
