use crate::collector::Telemetry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Point-in-time memory, disk, and CPU usage.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceSample {
    /// Resident memory of this process.
    pub process_memory_bytes: u64,
    pub system_memory_used_bytes: u64,
    pub system_memory_total_bytes: u64,
    /// Free space on the disk holding the watched path.
    pub disk_available_bytes: u64,
    pub disk_total_bytes: u64,
    /// Global CPU usage in percent.
    pub cpu_percent: f32,
    pub sampled_at: DateTime<Utc>,
}

/// Reads resource usage through `sysinfo`.
pub struct ResourceSampler {
    system: System,
    pid: Option<Pid>,
    watch_path: PathBuf,
}

impl ResourceSampler {
    /// `watch_path` selects which disk is reported (the one mounted closest to it).
    pub fn new(watch_path: impl Into<PathBuf>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = %e, "Cannot determine own pid; process memory will read 0");
                None
            }
        };
        let watch_path = watch_path.into();
        Self {
            system: System::new(),
            pid,
            watch_path: std::path::absolute(&watch_path).unwrap_or(watch_path),
        }
    }

    pub fn sample(&mut self) -> ResourceSample {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let process_memory_bytes = match self.pid {
            Some(pid) => {
                self.system
                    .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                self.system.process(pid).map_or(0, |p| p.memory())
            }
            None => 0,
        };

        let (disk_available_bytes, disk_total_bytes) = self.disk_usage();

        ResourceSample {
            process_memory_bytes,
            system_memory_used_bytes: self.system.used_memory(),
            system_memory_total_bytes: self.system.total_memory(),
            disk_available_bytes,
            disk_total_bytes,
            cpu_percent: self.system.global_cpu_usage(),
            sampled_at: Utc::now(),
        }
    }

    fn disk_usage(&self) -> (u64, u64) {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| self.watch_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map_or((0, 0), |d| (d.available_space(), d.total_space()))
    }

    /// Refresh `telemetry`'s cached sample every `interval` on a background task.
    ///
    /// The hot path never waits on sampling; it only ever reads the cache.
    pub fn spawn(mut self, telemetry: Arc<Telemetry>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = self.sample();
                debug!(
                    memory = sample.process_memory_bytes,
                    cpu = sample.cpu_percent,
                    "Resource sample"
                );
                telemetry.record_sample(sample);
            }
        })
    }
}
