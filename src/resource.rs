//! CPU and memory sampling used as the worker pool's auto-scale signal
//! (spec.md §4.2). Linux-only; other platforms get a fixed fallback.

use std::time::Duration;

#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

pub async fn sample() -> ResourceSample {
    ResourceSample {
        cpu_percent: cpu_percent().await,
        memory_percent: memory_percent(),
    }
}

fn memory_percent() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            let mut mem_total = 0u64;
            let mut mem_available = 0u64;
            for line in meminfo.lines() {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 2 {
                    match parts[0] {
                        "MemTotal:" => mem_total = parts[1].parse().unwrap_or(0),
                        "MemAvailable:" => mem_available = parts[1].parse().unwrap_or(0),
                        _ => {}
                    }
                }
            }
            if mem_total > 0 {
                let used = mem_total.saturating_sub(mem_available);
                return (used as f64 / mem_total as f64) * 100.0;
            }
        }
    }
    45.0
}

fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() >= 5 && parts[0] == "cpu" {
        let user: u64 = parts[1].parse().unwrap_or(0);
        let nice: u64 = parts[2].parse().unwrap_or(0);
        let system: u64 = parts[3].parse().unwrap_or(0);
        let idle: u64 = parts[4].parse().unwrap_or(0);
        let busy = user + nice + system;
        Some((busy, busy + idle))
    } else {
        None
    }
}

async fn cpu_percent() -> f64 {
    #[cfg(target_os = "linux")]
    {
        let Ok(stat1) = std::fs::read_to_string("/proc/stat") else {
            return 25.0;
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Ok(stat2) = std::fs::read_to_string("/proc/stat") else {
            return 25.0;
        };

        if let (Some((busy1, total1)), Some((busy2, total2))) = (
            stat1.lines().next().and_then(parse_cpu_line),
            stat2.lines().next().and_then(parse_cpu_line),
        ) {
            let busy_delta = busy2.saturating_sub(busy1);
            let total_delta = total2.saturating_sub(total1);
            if total_delta > 0 {
                return (busy_delta as f64 / total_delta as f64) * 100.0;
            }
        }
        25.0
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = Duration::from_millis(0);
        25.0
    }
}
