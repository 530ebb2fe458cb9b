//! Lightweight metrics for the memory write queue.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::Mutex;

/// Default latency above which a job counts as a breach.
pub const LATENCY_WARN_MS: f64 = 400.0;

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub current_queue_size: usize,
    pub max_queue_size: usize,
    pub processed_jobs_total: u64,
    pub job_type_counts: HashMap<String, u64>,
    pub average_latency_ms: f64,
    pub last_job_latency_ms: f64,
    pub latency_breach_count: u64,
}

#[derive(Debug, Default)]
struct Inner {
    current_queue_size: usize,
    max_queue_size: usize,
    processed_jobs_total: u64,
    job_type_counts: HashMap<String, u64>,
    total_latency_ms: f64,
    last_job_latency_ms: f64,
    latency_breach_count: u64,
}

/// Task-safe recorder for write-queue statistics.
pub struct MetricsRecorder {
    inner: Mutex<Inner>,
    latency_warn_ms: f64,
}

impl MetricsRecorder {
    pub fn new(latency_warn_ms: f64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            latency_warn_ms,
        }
    }

    pub async fn record_enqueue(&self, queue_size: usize) {
        let mut m = self.inner.lock().await;
        m.current_queue_size = queue_size;
        m.max_queue_size = m.max_queue_size.max(queue_size);
    }

    pub async fn record_job_complete(&self, job_type: &str, queue_size: usize, latency_ms: f64) {
        let mut m = self.inner.lock().await;
        m.current_queue_size = queue_size;
        m.max_queue_size = m.max_queue_size.max(queue_size);
        m.processed_jobs_total += 1;
        *m.job_type_counts.entry(job_type.to_string()).or_default() += 1;
        m.total_latency_ms += latency_ms;
        m.last_job_latency_ms = latency_ms;
        if latency_ms > self.latency_warn_ms {
            m.latency_breach_count += 1;
        }
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let m = self.inner.lock().await;
        let average = if m.processed_jobs_total > 0 {
            m.total_latency_ms / m.processed_jobs_total as f64
        } else {
            0.0
        };
        MetricsSnapshot {
            current_queue_size: m.current_queue_size,
            max_queue_size: m.max_queue_size,
            processed_jobs_total: m.processed_jobs_total,
            job_type_counts: m.job_type_counts.clone(),
            average_latency_ms: (average * 100.0).round() / 100.0,
            last_job_latency_ms: (m.last_job_latency_ms * 100.0).round() / 100.0,
            latency_breach_count: m.latency_breach_count,
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new(LATENCY_WARN_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn averages_and_breaches() {
        let recorder = MetricsRecorder::new(100.0);
        recorder.record_enqueue(3).await;
        recorder.record_job_complete("message", 2, 50.0).await;
        recorder.record_job_complete("warmup", 1, 250.0).await;

        let snap = recorder.snapshot().await;
        assert_eq!(snap.processed_jobs_total, 2);
        assert_eq!(snap.max_queue_size, 3);
        assert_eq!(snap.average_latency_ms, 150.0);
        assert_eq!(snap.last_job_latency_ms, 250.0);
        assert_eq!(snap.latency_breach_count, 1);
        assert_eq!(snap.job_type_counts.get("message"), Some(&1));
    }
}
