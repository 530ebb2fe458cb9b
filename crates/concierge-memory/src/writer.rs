use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use concierge_core::config::CLINIC_WARM_TTL_SECS;
use concierge_core::flags;

use crate::metrics::MetricsRecorder;

/// Bounded queue capacity — enqueue beyond this drops the job with a warning
/// rather than backing up the request path.
const QUEUE_CAPACITY: usize = 256;

/// A clinic's index is touched at most once per this interval.
const WARMUP_TTL: Duration = Duration::from_secs(CLINIC_WARM_TTL_SECS);

/// Jobs accepted by the background memory writer.
#[derive(Debug, Clone)]
pub enum MemoryJob {
    /// Index a single message.
    Message {
        session_id: String,
        role: String,
        content: String,
    },
    /// Index a full user/assistant turn.
    Turn {
        session_id: String,
        user_content: String,
        assistant_content: String,
    },
    /// Touch the index for a clinic so first queries are warm.
    Warmup { clinic_id: String },
}

impl MemoryJob {
    pub fn kind(&self) -> &'static str {
        match self {
            MemoryJob::Message { .. } => "message",
            MemoryJob::Turn { .. } => "turn",
            MemoryJob::Warmup { .. } => "warmup",
        }
    }
}

/// The external memory index (mem0-like). Failures are the sink's own to
/// report; the writer only logs them.
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn write(&self, job: &MemoryJob) -> Result<(), String>;
}

/// Fire-and-forget writer in front of a [`MemorySink`].
///
/// Jobs are processed by a background task; warmups are deduplicated per
/// clinic with an in-flight set and a last-touched map. Nothing here can
/// fail the request path: a full queue drops the job, a sink error logs.
pub struct MemoryWriter {
    tx: mpsc::Sender<MemoryJob>,
    metrics: Arc<MetricsRecorder>,
    queued: Arc<std::sync::atomic::AtomicUsize>,
    warm_inflight: Arc<DashSet<String>>,
    warm_touched: Arc<DashMap<String, Instant>>,
}

impl MemoryWriter {
    /// Spawn the writer task. The writer stops when the last sender is
    /// dropped.
    pub fn spawn(sink: Arc<dyn MemorySink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<MemoryJob>(QUEUE_CAPACITY);
        let metrics = Arc::new(MetricsRecorder::default());
        let queued = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let warm_inflight: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let warm_touched: Arc<DashMap<String, Instant>> = Arc::new(DashMap::new());

        let task_metrics = Arc::clone(&metrics);
        let task_queued = Arc::clone(&queued);
        let task_inflight = Arc::clone(&warm_inflight);
        let timeout = Duration::from_millis(flags::get().memory_timeout_ms);

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let started = Instant::now();
                let kind = job.kind();

                let result =
                    tokio::time::timeout(timeout, sink.write(&job)).await;
                match result {
                    Ok(Ok(())) => debug!(kind, "memory job complete"),
                    Ok(Err(e)) => warn!(kind, error = %e, "memory job failed"),
                    Err(_) => warn!(kind, timeout_ms = timeout.as_millis() as u64, "memory job timed out"),
                }

                if let MemoryJob::Warmup { ref clinic_id } = job {
                    task_inflight.remove(clinic_id);
                }

                let remaining = task_queued
                    .fetch_sub(1, std::sync::atomic::Ordering::SeqCst)
                    .saturating_sub(1);
                task_metrics
                    .record_job_complete(kind, remaining, started.elapsed().as_secs_f64() * 1000.0)
                    .await;
            }
            info!("memory writer stopped");
        });

        Self {
            tx,
            metrics,
            queued,
            warm_inflight,
            warm_touched,
        }
    }

    /// Enqueue a job. Never blocks; a full queue drops the job.
    pub async fn enqueue(&self, job: MemoryJob) {
        if !flags::get().memory_writes_live() {
            return;
        }

        // Warmups dedupe per clinic: skip when one is in flight or recent.
        if let MemoryJob::Warmup { ref clinic_id } = job {
            if self.warm_inflight.contains(clinic_id) {
                return;
            }
            if let Some(touched) = self.warm_touched.get(clinic_id) {
                if touched.elapsed() < WARMUP_TTL {
                    return;
                }
            }
            self.warm_inflight.insert(clinic_id.clone());
            self.warm_touched.insert(clinic_id.clone(), Instant::now());
        }

        match self.tx.try_send(job) {
            Ok(()) => {
                let size = self
                    .queued
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                    + 1;
                self.metrics.record_enqueue(size).await;
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(kind = job.kind(), "memory queue full, dropping job");
                if let MemoryJob::Warmup { ref clinic_id } = job {
                    self.warm_inflight.remove(clinic_id);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("memory writer stopped, dropping job");
            }
        }
    }

    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl MemorySink for CountingSink {
        async fn write(&self, _job: &MemoryJob) -> Result<(), String> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn enable_writes() {
        std::env::set_var("MEM0_SHADOW_MODE", "1");
        concierge_core::flags::reload();
    }

    #[tokio::test]
    async fn warmups_dedupe_per_clinic() {
        enable_writes();
        let sink = Arc::new(CountingSink {
            writes: AtomicUsize::new(0),
        });
        let writer = MemoryWriter::spawn(sink.clone());

        for _ in 0..5 {
            writer
                .enqueue(MemoryJob::Warmup {
                    clinic_id: "c1".to_string(),
                })
                .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One warmup went through; the rest were deduplicated.
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sink_errors_do_not_stop_the_writer() {
        enable_writes();
        struct FailingSink;
        #[async_trait]
        impl MemorySink for FailingSink {
            async fn write(&self, _job: &MemoryJob) -> Result<(), String> {
                Err("index offline".to_string())
            }
        }

        let writer = MemoryWriter::spawn(Arc::new(FailingSink));
        writer
            .enqueue(MemoryJob::Message {
                session_id: "s1".to_string(),
                role: "user".to_string(),
                content: "hi".to_string(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = writer.metrics().snapshot().await;
        assert_eq!(snap.processed_jobs_total, 1);
    }
}
