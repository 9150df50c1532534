//! Per-worker log ring buffer and coarse host resource reporting.
//!
//! Resource figures are read straight out of `/proc`, matching this
//! workspace's existing preference for shelling out / reading Linux
//! interfaces directly over pulling in a cross-platform system-info crate.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceReport {
    pub mem_total_kb: u64,
    pub mem_available_kb: u64,
    pub load_avg_1m: f64,
    pub disk_free_bytes: u64,
    pub disk_total_bytes: u64,
}

pub struct ResourceMonitor {
    logs: HashMap<String, VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ResourceMonitor {
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: HashMap::new(),
            capacity,
        }
    }

    pub fn record_log(&mut self, worker_id: &str, entry: LogEntry) {
        let buf = self.logs.entry(worker_id.to_string()).or_default();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(entry);
    }

    pub fn recent_logs(&self, worker_id: &str, n: usize) -> Vec<LogEntry> {
        match self.logs.get(worker_id) {
            Some(buf) => buf.iter().rev().take(n).rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Read `/proc/meminfo` and `/proc/loadavg`, plus disk usage for `path`
    /// via `statvfs`. Linux-only; returns zeroed fields on other platforms
    /// or if `/proc` is unreadable rather than erroring the whole run.
    pub fn resource_report(&self, path: &Path) -> ResourceReport {
        let mut report = ResourceReport::default();

        if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
            for line in meminfo.lines() {
                if let Some(rest) = line.strip_prefix("MemTotal:") {
                    report.mem_total_kb = parse_kb(rest);
                } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                    report.mem_available_kb = parse_kb(rest);
                }
            }
        }

        if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
            if let Some(first) = loadavg.split_whitespace().next() {
                report.load_avg_1m = first.parse().unwrap_or(0.0);
            }
        }

        #[cfg(unix)]
        {
            if let Some((free, total)) = statvfs_usage(path) {
                report.disk_free_bytes = free;
                report.disk_total_bytes = total;
            }
        }

        report
    }
}

fn parse_kb(rest: &str) -> u64 {
    rest.trim()
        .trim_end_matches(" kB")
        .trim()
        .parse()
        .unwrap_or(0)
}

#[cfg(unix)]
fn statvfs_usage(path: &Path) -> Option<(u64, u64)> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path.to_str()?).ok()?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    let stat = unsafe { stat.assume_init() };
    let block_size = stat.f_frsize as u64;
    Some((stat.f_bavail as u64 * block_size, stat.f_blocks as u64 * block_size))
}
