//! Resource diagnostics: periodic sampling, threshold warnings, preflight
//! checks before workflow start.
//!
//! Sampling reads procfs; on hosts where a file is missing the sampler
//! degrades to zeros rather than failing, so diagnostics never take the
//! orchestrator down.

mod crash;

pub use crash::CrashDumpWriter;

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, BusEventKind, EventBus};
use crate::config::DiagnosticsConfig;
use crate::errors::WorkflowError;

const HISTORY_LIMIT: usize = 120;

/// One point-in-time resource reading.
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub ts: DateTime<Utc>,
    pub rss_mb: u64,
    pub threads: u64,
    pub open_fds: u64,
    pub fd_limit: u64,
}

impl ResourceSample {
    pub fn take() -> Self {
        Self {
            ts: Utc::now(),
            rss_mb: read_rss_mb().unwrap_or(0),
            threads: read_thread_count().unwrap_or(0),
            open_fds: count_open_fds().unwrap_or(0),
            fd_limit: fd_limit(),
        }
    }

    /// Fraction of the fd budget still free.
    pub fn free_fd_fraction(&self) -> f64 {
        if self.fd_limit == 0 {
            return 1.0;
        }
        1.0 - (self.open_fds as f64 / self.fd_limit as f64)
    }
}

fn read_rss_mb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

fn read_thread_count() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Threads:") {
            return rest.trim().parse().ok();
        }
    }
    None
}

fn count_open_fds() -> Option<u64> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.count() as u64)
}

fn fd_limit() -> u64 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let result = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if result == 0 {
        limit.rlim_cur as u64
    } else {
        0
    }
}

fn available_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

/// Abort workflow start when the host is short on file descriptors or
/// memory.
pub fn preflight(config: &DiagnosticsConfig) -> Result<(), WorkflowError> {
    let sample = ResourceSample::take();

    if sample.fd_limit > 0 && sample.free_fd_fraction() < config.min_free_fd_pct {
        return Err(WorkflowError::Infrastructure(anyhow::anyhow!(
            "preflight: only {:.0}% of file descriptors free ({} of {} used), minimum is {:.0}%",
            sample.free_fd_fraction() * 100.0,
            sample.open_fds,
            sample.fd_limit,
            config.min_free_fd_pct * 100.0
        )));
    }

    if let Some(available) = available_memory_mb() {
        if available < config.min_free_mem_mb {
            return Err(WorkflowError::Infrastructure(anyhow::anyhow!(
                "preflight: {}MB memory available, minimum is {}MB",
                available,
                config.min_free_mem_mb
            )));
        }
    }
    Ok(())
}

/// Periodic sampler with a rolling history and threshold warnings.
pub struct ResourceMonitor {
    config: DiagnosticsConfig,
    bus: EventBus,
    history: Mutex<VecDeque<ResourceSample>>,
}

impl ResourceMonitor {
    pub fn new(config: DiagnosticsConfig, bus: EventBus) -> Self {
        Self {
            config,
            bus,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn history(&self) -> Vec<ResourceSample> {
        match self.history.lock() {
            Ok(guard) => guard.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    /// Take one sample, record it, and publish a warning when thresholds are
    /// crossed.
    pub async fn sample_once(&self) -> ResourceSample {
        let sample = ResourceSample::take();
        {
            let mut history = match self.history.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if history.len() >= HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(sample);
        }

        if sample.fd_limit > 0 && sample.free_fd_fraction() < self.config.min_free_fd_pct {
            tracing::warn!(
                open_fds = sample.open_fds,
                fd_limit = sample.fd_limit,
                "File descriptor usage above threshold"
            );
            self.bus
                .publish(BusEvent::engine(
                    "default",
                    BusEventKind::Warning {
                        message: format!(
                            "resource: {} of {} file descriptors in use",
                            sample.open_fds, sample.fd_limit
                        ),
                    },
                ))
                .await;
        }
        sample
    }

    /// Sampling loop until cancelled.
    pub async fn run(&self, cancel: &CancellationToken) {
        let interval = Duration::from_secs(self.config.sample_interval_secs.max(1));
        loop {
            self.sample_once().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
