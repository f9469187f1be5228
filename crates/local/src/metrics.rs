use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counters kept by a pooled executor across runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorMetrics {
    /// Runs started.
    pub runs: u64,
    /// Tasks completed successfully, by callable.
    pub tasks_executed: HashMap<String, u64>,
    /// Tasks whose callable returned an error.
    pub tasks_failed: u64,
    /// Tasks resubmitted after a worker died.
    pub retries: u64,
    /// Average task duration by callable.
    pub avg_task_duration: HashMap<String, Duration>,
    pub last_run: Option<DateTime<Utc>>,
}

impl ExecutorMetrics {
    pub fn record_run(&mut self) {
        self.runs += 1;
        self.last_run = Some(Utc::now());
    }

    /// Record a successful task execution.
    pub fn record_execution(&mut self, callable: &str, duration: Duration) {
        let count = {
            let c = self.tasks_executed.entry(callable.to_string()).or_default();
            *c += 1;
            *c
        };
        let prev_avg = self.avg_task_duration.get(callable).copied().unwrap_or_default();

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let new_avg = if count == 1 {
            duration
        } else {
            let prev_nanos = prev_avg.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
        self.avg_task_duration.insert(callable.to_string(), new_avg);
    }

    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn total_executed(&self) -> u64 {
        self.tasks_executed.values().sum()
    }
}
