//! Metrics for the re-encode daemon
//!
//! Task counters plus host resource usage, shared behind an `RwLock` and
//! served as JSON.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::task::{EncodingTask, TaskStatus};

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Task gauges and lifetime counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub system: SystemMetrics,
    /// Tasks waiting for an admission slot
    pub queued: usize,
    /// Tasks with a running attempt
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Sum of retries over all finished tasks
    pub total_retries: u64,
    /// Input minus output size over all completed tasks
    pub total_bytes_saved: u64,
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

impl MetricsSnapshot {
    /// Counts a task that just reached a terminal state.
    pub fn record_terminal(&mut self, task: &EncodingTask) {
        match task.status {
            TaskStatus::Completed => {
                self.completed += 1;
                if let (Some(input), Some(output)) = (task.input_size_bytes, task.output_size_bytes) {
                    self.total_bytes_saved += input.saturating_sub(output);
                }
            }
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
            TaskStatus::Queued | TaskStatus::Processing => return,
        }
        self.total_retries += u64::from(task.retry_count);
    }

    /// Replaces the live gauges from a registry scan.
    pub fn set_live_counts<'a>(&mut self, statuses: impl IntoIterator<Item = &'a TaskStatus>) {
        self.queued = 0;
        self.processing = 0;
        for status in statuses {
            match status {
                TaskStatus::Queued => self.queued += 1,
                TaskStatus::Processing => self.processing += 1,
                _ => {}
            }
        }
    }
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}
