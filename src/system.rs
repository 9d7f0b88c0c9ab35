//! Live system resource sampling for adaptive concurrency.
//!
//! Readings degrade to neutral values when a probe fails; sampling problems
//! must never abort scheduling.

use std::io;

/// A point-in-time view of host resource pressure.
#[derive(Debug, Clone, Copy)]
pub struct SystemSnapshot {
    /// Fraction of physical memory in use (0.0 to 1.0).
    pub memory_used_ratio: f64,
    /// One-minute load average divided by core count.
    pub load_per_core: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemSnapshot {
    /// Sample current memory and CPU pressure. Probe failures yield neutral
    /// readings (no pressure) rather than errors.
    pub fn capture() -> Self {
        let cpu_cores = detect_cpus();
        let memory_used_ratio = detect_memory_used_ratio().unwrap_or_else(|e| {
            tracing::debug!("memory probe unavailable: {}", e);
            0.0
        });
        let load_per_core = detect_load_average()
            .map(|load| load / cpu_cores as f64)
            .unwrap_or_else(|e| {
                tracing::debug!("load probe unavailable: {}", e);
                0.0
            });

        Self {
            memory_used_ratio,
            load_per_core,
            cpu_cores,
        }
    }
}

fn detect_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(target_os = "linux")]
fn detect_memory_used_ratio() -> io::Result<f64> {
    use std::fs;
    let meminfo = fs::read_to_string("/proc/meminfo")?;
    let mut total_kb = None;
    let mut available_kb = None;
    for line in meminfo.lines() {
        let parse = |prefix: &str, slot: &mut Option<u64>| {
            if line.starts_with(prefix) {
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 2 {
                    *slot = parts[1].parse::<u64>().ok();
                }
            }
        };
        parse("MemTotal:", &mut total_kb);
        parse("MemAvailable:", &mut available_kb);
    }
    match (total_kb, available_kb) {
        (Some(total), Some(available)) if total > 0 => {
            Ok(1.0 - available as f64 / total as f64)
        }
        _ => Err(io::Error::other("failed to parse /proc/meminfo")),
    }
}

#[cfg(target_os = "linux")]
fn detect_load_average() -> io::Result<f64> {
    use std::fs;
    let loadavg = fs::read_to_string("/proc/loadavg")?;
    loadavg
        .split_whitespace()
        .next()
        .and_then(|field| field.parse::<f64>().ok())
        .ok_or_else(|| io::Error::other("failed to parse /proc/loadavg"))
}

#[cfg(target_os = "macos")]
fn detect_memory_used_ratio() -> io::Result<f64> {
    use std::process::Command;
    let output = Command::new("sysctl").args(["-n", "hw.memsize"]).output()?;
    let total: u64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|e| io::Error::other(format!("hw.memsize: {e}")))?;
    if total == 0 {
        return Err(io::Error::other("hw.memsize reported zero"));
    }

    let output = Command::new("vm_stat").output()?;
    let stats = String::from_utf8_lossy(&output.stdout);
    // Header reads "Mach Virtual Memory Statistics: (page size of 16384
    // bytes)"; the counters are pages, formatted like "Pages active: 12345."
    let page_size: u64 = stats
        .lines()
        .next()
        .and_then(|header| {
            header
                .split("page size of")
                .nth(1)?
                .split_whitespace()
                .next()?
                .parse()
                .ok()
        })
        .ok_or_else(|| io::Error::other("failed to parse vm_stat page size"))?;

    let pages = |label: &str| -> u64 {
        stats
            .lines()
            .find(|line| line.starts_with(label))
            .and_then(|line| {
                line.rsplit(':')
                    .next()?
                    .trim()
                    .trim_end_matches('.')
                    .parse()
                    .ok()
            })
            .unwrap_or(0)
    };

    let used_pages = pages("Pages active")
        + pages("Pages wired down")
        + pages("Pages occupied by compressor");
    Ok(((used_pages * page_size) as f64 / total as f64).min(1.0))
}

#[cfg(target_os = "macos")]
fn detect_load_average() -> io::Result<f64> {
    use std::process::Command;
    let output = Command::new("sysctl").args(["-n", "vm.loadavg"]).output()?;
    // Formatted as "{ 1.23 4.56 7.89 }".
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .find_map(|field| field.parse::<f64>().ok())
        .ok_or_else(|| io::Error::other("failed to parse vm.loadavg"))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn detect_memory_used_ratio() -> io::Result<f64> {
    Err(io::Error::other(
        "memory sampling not supported on this platform",
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn detect_load_average() -> io::Result<f64> {
    Err(io::Error::other(
        "load sampling not supported on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_is_sane() {
        let snapshot = SystemSnapshot::capture();
        assert!(snapshot.cpu_cores > 0);
        assert!((0.0..=1.0).contains(&snapshot.memory_used_ratio));
        assert!(snapshot.load_per_core >= 0.0);
    }
}
