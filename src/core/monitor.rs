//! Host monitoring - Host process memory alongside isolation leak indicators

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::trace;

use crate::isolation::HostBoundary;

/// One sample of the host's health
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    /// Contexts still reachable, released or not
    pub live_contexts: usize,
    /// Process-wide singleton slots currently holding a value
    pub installed_slots: usize,
    /// Entries across every process-wide registry
    pub registry_entries: usize,
    /// Resident memory of the host process, if it could be read
    pub process_memory_bytes: Option<u64>,
    pub sampled_at: DateTime<Utc>,
}

impl HostSnapshot {
    pub fn memory_string(&self) -> String {
        self.process_memory_bytes
            .map(format_bytes)
            .unwrap_or_else(|| "-".to_string())
    }
}

/// Samples the host process and its isolation boundary
pub struct HostMonitor {
    system: System,
    pid: Option<Pid>,
    host: Arc<HostBoundary>,
}

impl HostMonitor {
    pub fn new(host: Arc<HostBoundary>) -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            host,
        }
    }

    /// Refresh and take a sample
    pub fn sample(&mut self) -> HostSnapshot {
        let process_memory_bytes = self.pid.and_then(|pid| {
            self.system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[pid]),
                true,
                ProcessRefreshKind::new().with_memory(),
            );
            self.system.process(pid).map(|p| p.memory())
        });

        let globals = self.host.globals();
        let snapshot = HostSnapshot {
            live_contexts: self.host.live_contexts(),
            installed_slots: globals.installed_slots(),
            registry_entries: globals.registry_entries(),
            process_memory_bytes,
            sampled_at: Utc::now(),
        };
        trace!(
            "Host sample: {} live context(s), {} registry entrie(s), memory {}",
            snapshot.live_contexts,
            snapshot.registry_entries,
            snapshot.memory_string()
        );
        snapshot
    }
}

/// Thread-safe wrapper for HostMonitor
pub struct SharedHostMonitor {
    inner: Arc<RwLock<HostMonitor>>,
}

impl SharedHostMonitor {
    pub fn new(host: Arc<HostBoundary>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HostMonitor::new(host))),
        }
    }

    pub fn sample(&self) -> Option<HostSnapshot> {
        self.inner.write().ok().map(|mut m| m.sample())
    }
}

impl Clone for SharedHostMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
