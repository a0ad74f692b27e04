//! Bounded pool of concurrent flow emissions.
//!
//! The packet loop runs on a blocking thread and hands completed flows to
//! [`FinalizerPool::submit`], which blocks while all workers are busy. Each
//! flow is then delivered to the [`FlowSink`] on its own tokio task, so slow
//! storage never stalls more than `workers` flows and backs pressure up into
//! packet reading instead of growing an unbounded queue.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::{PipelineError, Result};
use crate::reassembly::FlowEmitter;
use crate::sink::{CompletedFlow, FlowSink};

#[derive(Debug, Default)]
struct PoolMetrics {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub submitted: u64,
    pub succeeded: u64,
    /// Flows the sink rejected; logged, never retried.
    pub failed: u64,
    pub in_flight: u64,
}

#[derive(Clone)]
pub struct FinalizerPool {
    sink: Arc<dyn FlowSink>,
    permits: Arc<Semaphore>,
    workers: u32,
    handle: Handle,
    metrics: Arc<PoolMetrics>,
}

impl FinalizerPool {
    pub fn new(sink: Arc<dyn FlowSink>, workers: usize, handle: Handle) -> Self {
        let workers = workers.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        Self {
            sink,
            permits: Arc::new(Semaphore::new(workers as usize)),
            workers,
            handle,
            metrics: Arc::new(PoolMetrics::default()),
        }
    }

    /// Hand a flow to the sink, waiting for a free worker first.
    ///
    /// Must be called from a blocking thread, not from async code.
    pub fn submit(&self, flow: CompletedFlow) -> Result<()> {
        let permit = self
            .handle
            .block_on(self.permits.clone().acquire_owned())
            .map_err(|_| PipelineError::Invariant("finalizer pool closed".to_string()))?;
        self.metrics.submitted.fetch_add(1, Ordering::Relaxed);

        let sink = self.sink.clone();
        let metrics = self.metrics.clone();
        self.handle.spawn(async move {
            let client = flow.client;
            let server = flow.server;
            match sink.accept(flow).await {
                Ok(()) => {
                    metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    metrics.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(%client, %server, error = %e, "Flow sink rejected flow");
                }
            }
            drop(permit);
        });
        Ok(())
    }

    /// Wait until every submitted flow has been delivered.
    ///
    /// Must be called from a blocking thread, not from async code.
    pub fn drain(&self) -> Result<()> {
        let all = self
            .handle
            .block_on(self.permits.acquire_many(self.workers))
            .map_err(|_| PipelineError::Invariant("finalizer pool closed".to_string()))?;
        drop(all);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.metrics.submitted.load(Ordering::Relaxed),
            succeeded: self.metrics.succeeded.load(Ordering::Relaxed),
            failed: self.metrics.failed.load(Ordering::Relaxed),
            in_flight: (self.workers as usize - self.permits.available_permits()) as u64,
        }
    }
}

impl FlowEmitter for FinalizerPool {
    fn emit(&mut self, flow: CompletedFlow) -> Result<()> {
        self.submit(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CloseReason, Endpoint};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Records the peak number of concurrent `accept` calls.
    #[derive(Default)]
    struct SlowSink {
        active: AtomicUsize,
        peak: AtomicUsize,
        accepted: AtomicUsize,
        fail_every: usize,
    }

    #[async_trait]
    impl FlowSink for SlowSink {
        async fn accept(&self, _flow: CompletedFlow) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            let n = self.accepted.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && n % self.fail_every == 0 {
                anyhow::bail!("storage unavailable");
            }
            Ok(())
        }
    }

    fn flow(port: u16) -> CompletedFlow {
        let ep = Endpoint::new("10.0.0.1".parse().unwrap(), port);
        CompletedFlow {
            source_id: "pool".into(),
            client: ep,
            server: ep,
            start_us: 0,
            end_us: 0,
            packets: 1,
            bytes: 1,
            items: Vec::new(),
            close_reason: CloseReason::Flushed,
            fsm_violations: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_is_bounded() {
        let sink = Arc::new(SlowSink::default());
        let pool = FinalizerPool::new(sink.clone(), 3, Handle::current());
        let stats = tokio::task::spawn_blocking(move || {
            for port in 0..20 {
                pool.submit(flow(port)).unwrap();
            }
            pool.drain().unwrap();
            pool.stats()
        })
        .await
        .unwrap();

        assert_eq!(sink.accepted.load(Ordering::SeqCst), 20);
        assert!(sink.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(stats.submitted, 20);
        assert_eq!(stats.succeeded, 20);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sink_failures_are_counted_not_fatal() {
        let sink = Arc::new(SlowSink {
            fail_every: 2,
            ..Default::default()
        });
        let pool = FinalizerPool::new(sink, 2, Handle::current());
        let stats = tokio::task::spawn_blocking(move || {
            let mut emitter = pool.clone();
            for port in 0..6 {
                emitter.emit(flow(port)).unwrap();
            }
            pool.drain().unwrap();
            pool.stats()
        })
        .await
        .unwrap();

        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 3);
    }
}
