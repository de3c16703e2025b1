//! Per-metric sampling job.
//!
//! A [`SampleScheduler`] owns the sample queue of one metric. Each tick runs
//! the sampling function on the blocking pool, appends the value and flushes
//! the queue once it holds `aggregation_size` samples. Ticks never overlap:
//! a tick that fires while the previous one is still running is skipped.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::entity::{CollectionControl, MetricSpec, RegisteredEntity, Sample, SamplingError};
use crate::pipeline::{Dispatcher, FlushOutcome};

/// Errors raised while starting a sampling job.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job scheduler error.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// The entity cannot be collected.
    #[error("invalid metric: {0}")]
    InvalidMetric(String),

    /// Collection was stopped before the job could be added.
    #[error("collection of '{0}' was stopped")]
    Stopped(String),
}

/// Live collection counters of one metric.
#[derive(Debug, Default)]
pub struct CollectionStats {
    samples: AtomicU64,
    sampling_failures: AtomicU64,
    skipped_ticks: AtomicU64,
    flushes_sent: AtomicU64,
    flushes_dropped: AtomicU64,
    samples_discarded: AtomicU64,
}

impl CollectionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            samples: self.samples.load(Ordering::Relaxed),
            sampling_failures: self.sampling_failures.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            flushes_sent: self.flushes_sent.load(Ordering::Relaxed),
            flushes_dropped: self.flushes_dropped.load(Ordering::Relaxed),
            samples_discarded: self.samples_discarded.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CollectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Samples appended to the queue.
    pub samples: u64,
    /// Sampling function errors and panics.
    pub sampling_failures: u64,
    /// Ticks skipped because the previous tick was still running.
    pub skipped_ticks: u64,
    pub flushes_sent: u64,
    pub flushes_dropped: u64,
    /// Buffered samples thrown away when collection stopped.
    pub samples_discarded: u64,
}

struct SampleQueue {
    samples: VecDeque<Sample>,
    last_timestamp: i64,
    stopped: bool,
}

/// Sampling job of one metric.
pub struct SampleScheduler {
    metric: RegisteredEntity,
    spec: MetricSpec,
    dispatcher: Arc<Dispatcher>,
    queue: Mutex<SampleQueue>,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    stats: CollectionStats,
    job: Mutex<Option<(JobScheduler, Uuid)>>,
}

impl SampleScheduler {
    /// Create a scheduler for `metric`. Nothing runs until
    /// [`start_collecting`](Self::start_collecting).
    pub fn new(
        metric: RegisteredEntity,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<Self>, SchedulerError> {
        let spec = metric.metric_spec().cloned().ok_or_else(|| {
            SchedulerError::InvalidMetric(format!("'{}' is not a metric", metric.name()))
        })?;

        Ok(Arc::new(Self {
            metric,
            spec,
            dispatcher,
            queue: Mutex::new(SampleQueue {
                samples: VecDeque::new(),
                last_timestamp: i64::MIN,
                stopped: false,
            }),
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            stats: CollectionStats::default(),
            job: Mutex::new(None),
        }))
    }

    pub fn metric(&self) -> &RegisteredEntity {
        &self.metric
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// `false` once [`stop_collecting`](Self::stop_collecting) was called.
    pub fn is_collecting(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst)
    }

    /// Number of samples waiting for the next flush.
    pub async fn queued(&self) -> usize {
        self.queue.lock().await.samples.len()
    }

    /// Add the periodic job to `jobs`.
    ///
    /// On-demand metrics (interval 0) get no job and return `Ok(None)`. The
    /// first tick fires one interval after the job is added. A stopped
    /// scheduler cannot be restarted.
    pub async fn start_collecting(
        self: &Arc<Self>,
        jobs: &JobScheduler,
    ) -> Result<Option<Uuid>, SchedulerError> {
        if !self.is_collecting() {
            return Err(SchedulerError::Stopped(self.metric.name().to_string()));
        }
        if !self.spec.is_periodic() {
            tracing::info!(metric = %self.metric.name(), "Metric is sampled on demand only");
            return Ok(None);
        }

        let mut slot = self.job.lock().await;
        if let Some((_, job_id)) = slot.as_ref() {
            return Ok(Some(*job_id));
        }
        // stop_collecting sets the flag before taking the slot.
        if !self.is_collecting() {
            return Err(SchedulerError::Stopped(self.metric.name().to_string()));
        }

        let interval = Duration::from_secs(self.spec.interval_seconds);
        let job = self.create_job(interval)?;
        let job_id = jobs
            .add(job)
            .await
            .map_err(|e| SchedulerError::Scheduler(e.to_string()))?;
        *slot = Some((jobs.clone(), job_id));

        tracing::info!(
            metric = %self.metric.name(),
            job_id = %job_id,
            interval = %humantime::format_duration(interval),
            aggregation_size = self.spec.aggregation_size,
            "Collection started"
        );
        Ok(Some(job_id))
    }

    /// Cancel the job and discard buffered samples.
    ///
    /// Once this returns no further sample is taken or flushed. A tick
    /// already past its cancellation check completes without recording.
    pub async fn stop_collecting(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        if let Some((jobs, job_id)) = self.job.lock().await.take()
            && let Err(e) = jobs.remove(&job_id).await
        {
            tracing::warn!(
                metric = %self.metric.name(),
                job_id = %job_id,
                error = %e,
                "Failed to remove sampling job"
            );
        }

        let mut queue = self.queue.lock().await;
        if queue.stopped {
            return;
        }
        queue.stopped = true;
        let discarded = queue.samples.len();
        queue.samples.clear();
        CollectionStats::incr(&self.stats.samples_discarded, discarded as u64);
        tracing::info!(metric = %self.metric.name(), discarded, "Collection stopped");
    }

    /// Take one sample immediately, outside the periodic schedule.
    ///
    /// # Errors
    /// Returns the sampling error, or an error if collection was stopped.
    pub async fn sample_now(&self) -> Result<(), SamplingError> {
        if !self.is_collecting() {
            return Err(SamplingError::new("collection stopped"));
        }
        let value = self.invoke().await?;
        self.record(value).await;
        Ok(())
    }

    // --- Private helpers ---

    fn create_job(self: &Arc<Self>, interval: Duration) -> Result<Job, SchedulerError> {
        let scheduler = Arc::clone(self);
        Job::new_repeated_async(interval, move |_: Uuid, _: JobScheduler| {
            let scheduler = Arc::clone(&scheduler);
            Box::pin(async move { scheduler.tick().await })
                as Pin<Box<dyn Future<Output = ()> + Send>>
        })
        .map_err(|e| SchedulerError::Scheduler(e.to_string()))
    }

    async fn tick(&self) {
        if !self.is_collecting() {
            return;
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            CollectionStats::incr(&self.stats.skipped_ticks, 1);
            tracing::warn!(metric = %self.metric.name(), "Previous tick still running, skipping");
            return;
        }
        let _guard = InFlight(&self.in_flight);

        // Failures are counted and logged in invoke.
        if let Ok(value) = self.invoke().await {
            self.record(value).await;
        }
    }

    async fn invoke(&self) -> Result<f64, SamplingError> {
        let sampling_fn = self.spec.sampling_function.clone();
        let result = match tokio::task::spawn_blocking(move || sampling_fn.sample()).await {
            Ok(Ok(value)) if value.is_finite() => Ok(value),
            Ok(Ok(value)) => Err(SamplingError::new(format!("non-finite sample {value}"))),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(SamplingError::new(format!("sampling function panicked: {e}"))),
        };

        if let Err(e) = &result {
            CollectionStats::incr(&self.stats.sampling_failures, 1);
            tracing::warn!(metric = %self.metric.name(), error = %e, "Sampling failed");
        }
        result
    }

    async fn record(&self, value: f64) {
        let mut queue = self.queue.lock().await;
        if queue.stopped {
            tracing::debug!(metric = %self.metric.name(), "Collection stopped, sample discarded");
            return;
        }

        let timestamp = Utc::now().timestamp_millis().max(queue.last_timestamp);
        queue.last_timestamp = timestamp;
        queue.samples.push_back(Sample::new(timestamp, value));
        CollectionStats::incr(&self.stats.samples, 1);

        if queue.samples.len() < self.spec.aggregation_size {
            return;
        }

        // Flush under the queue lock so a concurrent stop waits for it.
        let batch: Vec<Sample> = queue.samples.drain(..).collect();
        match self.dispatcher.flush(&self.metric, &batch).await {
            FlushOutcome::Sent { .. } => CollectionStats::incr(&self.stats.flushes_sent, 1),
            FlushOutcome::Dropped(_) => CollectionStats::incr(&self.stats.flushes_dropped, 1),
            FlushOutcome::Empty => {}
        }
    }
}

impl std::fmt::Debug for SampleScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleScheduler")
            .field("metric", &self.metric.name())
            .field("interval_seconds", &self.spec.interval_seconds)
            .field("aggregation_size", &self.spec.aggregation_size)
            .field("collecting", &self.is_collecting())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl CollectionControl for SampleScheduler {
    async fn stop(&self) {
        self.stop_collecting().await;
    }
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityRegistry, SamplingFn};
    use crate::pipeline::PayloadFormatter;
    use crate::transport::{Destination, DispatchPort, MemoryTransport, TransportError};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        registry: Arc<EntityRegistry>,
        transport: Arc<MemoryTransport>,
        dispatcher: Arc<Dispatcher>,
    }

    async fn fixture() -> Fixture {
        let registry = Arc::new(EntityRegistry::new());
        let transport = Arc::new(MemoryTransport::new());
        transport.connect().await.unwrap();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            transport.clone(),
            PayloadFormatter::new(),
            false,
            Destination::new("ex", "key"),
        ));
        Fixture {
            registry,
            transport,
            dispatcher,
        }
    }

    fn counting_sampler() -> SamplingFn {
        let next = Arc::new(AtomicUsize::new(0));
        SamplingFn::infallible(move || next.fetch_add(1, Ordering::SeqCst) as f64)
    }

    async fn on_demand(fx: &Fixture, sampler: SamplingFn, size: usize) -> Arc<SampleScheduler> {
        let metric = fx
            .registry
            .register(Entity::metric(
                "Temp",
                MetricSpec::new(sampler).with_aggregation_size(size),
            ))
            .await
            .unwrap();
        SampleScheduler::new(metric, Arc::clone(&fx.dispatcher)).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_non_metric() {
        let fx = fixture().await;
        let device = fx.registry.register(Entity::device("Sensor")).await.unwrap();
        assert!(matches!(
            SampleScheduler::new(device, Arc::clone(&fx.dispatcher)),
            Err(SchedulerError::InvalidMetric(_))
        ));
    }

    #[tokio::test]
    async fn test_flushes_every_aggregation_size() {
        let fx = fixture().await;
        let scheduler = on_demand(&fx, counting_sampler(), 3).await;

        for _ in 0..7 {
            scheduler.sample_now().await.unwrap();
        }

        let sent = fx.transport.sent().await;
        assert_eq!(sent.len(), 2);
        let values = |i: usize| -> Vec<f64> {
            sent[i].json().unwrap()["metric_data"]
                .as_array()
                .unwrap()
                .iter()
                .map(|d| d["value"].as_f64().unwrap())
                .collect()
        };
        assert_eq!(values(0), vec![0.0, 1.0, 2.0]);
        assert_eq!(values(1), vec![3.0, 4.0, 5.0]);
        assert_eq!(scheduler.queued().await, 1);

        let stats = scheduler.stats();
        assert_eq!(stats.samples, 7);
        assert_eq!(stats.flushes_sent, 2);
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let fx = fixture().await;
        let scheduler = on_demand(&fx, counting_sampler(), 5).await;
        for _ in 0..5 {
            scheduler.sample_now().await.unwrap();
        }

        let body = fx.transport.sent().await[0].json().unwrap();
        let ts: Vec<i64> = body["metric_data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["timestamp"].as_i64().unwrap())
            .collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_sampling_errors_and_panics_are_contained() {
        let fx = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sampler = SamplingFn::new(move || match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Err(SamplingError::new("sensor offline")),
            1 => panic!("driver crashed"),
            2 => Ok(f64::NAN),
            n => Ok(n as f64),
        });
        let scheduler = on_demand(&fx, sampler, 1).await;

        assert!(scheduler.sample_now().await.is_err());
        assert!(scheduler.sample_now().await.is_err());
        assert!(scheduler.sample_now().await.is_err());
        scheduler.sample_now().await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.sampling_failures, 3);
        assert_eq!(stats.samples, 1);
        assert_eq!(fx.transport.sent_len().await, 1);
    }

    #[tokio::test]
    async fn test_stop_discards_partial_queue() {
        let fx = fixture().await;
        let scheduler = on_demand(&fx, counting_sampler(), 3).await;
        scheduler.sample_now().await.unwrap();
        scheduler.sample_now().await.unwrap();

        scheduler.stop_collecting().await;
        assert!(!scheduler.is_collecting());
        assert_eq!(scheduler.queued().await, 0);
        assert_eq!(scheduler.stats().samples_discarded, 2);
        assert!(scheduler.sample_now().await.is_err());
        assert_eq!(fx.transport.sent_len().await, 0);

        // Idempotent.
        scheduler.stop_collecting().await;
        assert_eq!(scheduler.stats().samples_discarded, 2);
    }

    #[tokio::test]
    async fn test_dropped_flush_is_counted() {
        let fx = fixture().await;
        let scheduler = on_demand(&fx, counting_sampler(), 1).await;
        fx.transport
            .fail_next_send(TransportError::Unavailable("down".to_string()))
            .await;

        scheduler.sample_now().await.unwrap();
        scheduler.sample_now().await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.flushes_dropped, 1);
        assert_eq!(stats.flushes_sent, 1);
        assert_eq!(scheduler.queued().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_overlapping_tick_is_skipped() {
        let fx = fixture().await;
        let (release, gate) = std::sync::mpsc::channel::<()>();
        let gate = std::sync::Mutex::new(gate);
        let sampler = SamplingFn::infallible(move || {
            let _ = gate.lock().unwrap().recv();
            1.0
        });
        let scheduler = on_demand(&fx, sampler, 1).await;

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.tick().await }
        });
        while !scheduler.in_flight.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        scheduler.tick().await;
        assert_eq!(scheduler.stats().skipped_ticks, 1);

        release.send(()).unwrap();
        first.await.unwrap();
        let stats = scheduler.stats();
        assert_eq!(stats.samples, 1);
        assert_eq!(stats.flushes_sent, 1);
        assert!(!scheduler.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_on_demand_metric_has_no_job() {
        let fx = fixture().await;
        let scheduler = on_demand(&fx, counting_sampler(), 1).await;
        let jobs = JobScheduler::new().await.unwrap();
        assert_eq!(scheduler.start_collecting(&jobs).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stopped_scheduler_adds_no_job() {
        let fx = fixture().await;
        let metric = fx
            .registry
            .register(Entity::metric(
                "Temp",
                MetricSpec::new(counting_sampler()).with_interval_seconds(1),
            ))
            .await
            .unwrap();
        let scheduler = SampleScheduler::new(metric, Arc::clone(&fx.dispatcher)).unwrap();
        let jobs = JobScheduler::new().await.unwrap();

        scheduler.stop_collecting().await;
        let result = scheduler.start_collecting(&jobs).await;

        assert!(matches!(result, Err(SchedulerError::Stopped(name)) if name == "Temp"));
        assert!(scheduler.job.lock().await.is_none());
        // The only reference left is ours; no job holds a clone.
        assert_eq!(Arc::strong_count(&scheduler), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_periodic_collection() {
        let fx = fixture().await;
        let metric = fx
            .registry
            .register(Entity::metric(
                "Temp",
                MetricSpec::new(counting_sampler())
                    .with_interval_seconds(1)
                    .with_aggregation_size(2),
            ))
            .await
            .unwrap();
        let scheduler = SampleScheduler::new(metric, Arc::clone(&fx.dispatcher)).unwrap();

        let jobs = JobScheduler::new().await.unwrap();
        jobs.start().await.unwrap();
        let job_id = scheduler.start_collecting(&jobs).await.unwrap();
        assert!(job_id.is_some());
        assert_eq!(scheduler.start_collecting(&jobs).await.unwrap(), job_id);

        assert!(
            fx.transport
                .wait_for_sends(1, Duration::from_secs(6))
                .await
        );
        scheduler.stop_collecting().await;
        let sent_at_stop = fx.transport.sent_len().await;
        let samples_at_stop = scheduler.stats().samples;

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(fx.transport.sent_len().await, sent_at_stop);
        assert_eq!(scheduler.stats().samples, samples_at_stop);
    }
}
