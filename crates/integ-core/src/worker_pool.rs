//! Bounded worker pool
//!
//! Runs batch-shaped jobs without exceeding a fixed number of concurrent
//! workers:
//! - Snapshot batches (tests chunked into small groups, one job per group)
//! - Integration batches (tests × targets, or one queue-draining loop per target)
//! - Arbitrary jobs via [`WorkerPool::exec`] (used by the watch loop)
//!
//! A job that panics never aborts its batch; it is recovered into a
//! `SNAPSHOT_ERROR` or `TEST_ERROR` diagnostic and the affected tests are
//! reported as failed.

use crate::diagnostic::{elapsed_secs, DiagnosticEmitter, DiagnosticReason};
use crate::error::PoolError;
use crate::executor::{CaseOptions, IntegrationExecutor};
use crate::metrics::RunMetrics;
use crate::snapshot::SnapshotVerifier;
use crate::types::{JobId, RunnerConfig, Target, TargetDistribution, TestDescriptor, WorkerResult};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs accepted by [`WorkerPool::exec`]
    pub jobs_submitted: usize,
    /// Jobs that ran to completion
    pub jobs_completed: usize,
    /// Jobs that panicked
    pub jobs_panicked: usize,
    /// Unfinished jobs dropped by terminate
    pub jobs_dropped: usize,
    /// Calls to [`WorkerPool::terminate`]
    pub terminate_calls: usize,
}

/// Handle to one submitted job
#[derive(Debug)]
pub struct PoolJob<T> {
    id: JobId,
    handle: JoinHandle<Result<T, PoolError>>,
    in_flight: Arc<DashMap<JobId, (String, AbortHandle)>>,
    stats: Arc<Mutex<PoolStats>>,
}

impl<T> PoolJob<T> {
    /// Wait for the job
    ///
    /// # Errors
    /// - `PoolError::JobFailed` if the job panicked
    /// - `PoolError::Terminated` if the pool was terminated first
    pub async fn join(self) -> Result<T, PoolError> {
        let result = self.handle.await;
        self.in_flight.remove(&self.id);
        match result {
            Ok(Ok(value)) => {
                self.stats.lock().jobs_completed += 1;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(e) if e.is_panic() => {
                self.stats.lock().jobs_panicked += 1;
                let message = panic_message(e);
                tracing::warn!(job = %self.id, "job panicked: {message}");
                Err(PoolError::JobFailed(message))
            }
            Err(_) => Err(PoolError::Terminated),
        }
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".to_string())
}

/// Result of an integration batch
#[derive(Debug, Clone, Default)]
pub struct IntegrationOutcome {
    /// No job reported a failure
    pub success: bool,
    /// One record per target actually exercised
    pub metrics: Vec<RunMetrics>,
    /// Failed tests by target
    pub failures: Vec<(Target, TestDescriptor)>,
}

struct JobRecord {
    target: Target,
    test: TestDescriptor,
    failed: bool,
    started: Instant,
    finished: Instant,
}

/// Bounded worker pool
#[derive(Debug)]
pub struct WorkerPool {
    max_workers: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<DashMap<JobId, (String, AbortHandle)>>,
    stats: Arc<Mutex<PoolStats>>,
    terminated: AtomicBool,
}

impl WorkerPool {
    /// Create a pool of `max_workers` workers, or one worker in watch mode
    ///
    /// # Errors
    /// - `PoolError::InvalidSize` if `max_workers` is zero
    pub fn new(max_workers: usize, watch: bool) -> Result<Self, PoolError> {
        if max_workers < 1 {
            return Err(PoolError::InvalidSize(max_workers));
        }
        let size = if watch { 1 } else { max_workers };
        tracing::debug!(workers = size, watch, "worker pool created");
        Ok(Self {
            max_workers: size,
            permits: Arc::new(Semaphore::new(size)),
            in_flight: Arc::new(DashMap::new()),
            stats: Arc::new(Mutex::new(PoolStats::default())),
            terminated: AtomicBool::new(false),
        })
    }

    /// Number of concurrent workers
    #[inline]
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Jobs submitted but not yet joined
    #[inline]
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Check if the pool was terminated
    #[inline]
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().clone()
    }

    /// Submit one job
    ///
    /// The job waits for a free worker before it starts.
    ///
    /// # Errors
    /// - `PoolError::Terminated` if the pool was terminated
    pub fn exec<F, T>(&self, label: impl Into<String>, job: F) -> Result<PoolJob<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_terminated() {
            return Err(PoolError::Terminated);
        }
        let id = JobId::new();
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| PoolError::Terminated)?;
            Ok(job.await)
        });
        self.in_flight.insert(id, (label.into(), handle.abort_handle()));
        self.stats.lock().jobs_submitted += 1;

        Ok(PoolJob {
            id,
            handle,
            in_flight: Arc::clone(&self.in_flight),
            stats: Arc::clone(&self.stats),
        })
    }

    /// Verify snapshots of `tests` in batches of `batch_size`
    ///
    /// Returns every carried (failed) test once all batches complete.
    /// Diagnostics are emitted as each check finishes.
    ///
    /// # Errors
    /// - `PoolError::Terminated` if the pool was terminated
    pub async fn submit_snapshot_batch(
        &self,
        tests: &[TestDescriptor],
        verifier: &Arc<SnapshotVerifier>,
        batch_size: usize,
        emitter: &DiagnosticEmitter,
    ) -> Result<Vec<WorkerResult>, PoolError> {
        let submitted = Instant::now();
        let mut jobs = Vec::new();
        for batch in tests.chunks(batch_size.max(1)) {
            let batch = batch.to_vec();
            let verifier = Arc::clone(verifier);
            let emitter = emitter.clone();
            let label = format!("snapshot: {}", batch.len());
            let job = self.exec(label, {
                let batch = batch.clone();
                async move {
                    let mut carried = Vec::new();
                    for test in &batch {
                        if let Some(result) = verifier.verify(test, &emitter).await {
                            carried.push(result);
                        }
                    }
                    carried
                }
            })?;
            jobs.push((batch, job));
        }

        let (batches, handles): (Vec<_>, Vec<_>) = jobs.into_iter().unzip();
        let joined = join_all(handles.into_iter().map(PoolJob::join)).await;

        let mut carried = Vec::new();
        for (batch, result) in batches.into_iter().zip(joined) {
            match result {
                Ok(results) => carried.extend(results),
                Err(PoolError::JobFailed(message)) => {
                    tracing::error!(tests = batch.len(), "snapshot job failed: {message}");
                    let duration = elapsed_secs(submitted);
                    for test in batch {
                        emitter.report(DiagnosticReason::SnapshotError, test.display_name(), message.clone(), duration);
                        carried.push(WorkerResult::new(test));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(carried)
    }

    /// Run `tests` against every (profile, region) target
    ///
    /// An empty `profiles` list runs each region once with ambient credentials.
    /// A test that passed on every target it ran against has its snapshot
    /// recorded once, from the first of those targets in matrix order. A
    /// failed recording counts as a `TEST_FAILED` for that target.
    ///
    /// # Errors
    /// - `PoolError::Terminated` if the pool was terminated
    pub async fn submit_integration_batch(
        &self,
        tests: &[TestDescriptor],
        regions: &[String],
        profiles: &[String],
        executor: &Arc<IntegrationExecutor>,
        config: &RunnerConfig,
        emitter: &DiagnosticEmitter,
    ) -> Result<IntegrationOutcome, PoolError> {
        let targets = Target::matrix(regions, profiles);
        tracing::info!(
            tests = tests.len(),
            targets = targets.len(),
            distribution = ?config.distribution,
            "running integration batch"
        );
        let records = match config.distribution {
            TargetDistribution::CrossProduct => {
                self.cross_product(tests, &targets, executor, config, emitter).await?
            }
            TargetDistribution::SharedQueue => {
                self.shared_queue(tests, &targets, executor, config, emitter).await?
            }
        };
        let updates = snapshot_updates(tests, &targets, &records);
        let mut outcome = aggregate(&targets, records);

        for (test, target) in updates {
            let started = Instant::now();
            if let Err(e) = executor.update_snapshot(&test, &target).await {
                tracing::error!(test = %test, target = %target, error = %e, "snapshot update failed");
                emitter.report(
                    DiagnosticReason::TestFailed,
                    format!("{test} ({target})"),
                    format!("Integration test failed: {e}"),
                    elapsed_secs(started),
                );
                outcome.failures.push((target, test));
                outcome.success = false;
            }
        }
        Ok(outcome)
    }

    async fn cross_product(
        &self,
        tests: &[TestDescriptor],
        targets: &[Target],
        executor: &Arc<IntegrationExecutor>,
        config: &RunnerConfig,
        emitter: &DiagnosticEmitter,
    ) -> Result<Vec<JobRecord>, PoolError> {
        let submitted = Instant::now();
        let mut jobs = Vec::new();
        for target in targets {
            for test in tests {
                let options = CaseOptions::from_config(config, target.clone());
                let executor = Arc::clone(executor);
                let emitter = emitter.clone();
                let owned = test.clone();
                let job = self.exec(format!("integ: {test} ({target})"), async move {
                    let started = Instant::now();
                    let failed = executor.run_test(&owned, &options, &emitter).await;
                    (failed, started, Instant::now())
                })?;
                jobs.push(((target.clone(), test.clone()), job));
            }
        }

        let (keys, handles): (Vec<_>, Vec<_>) = jobs.into_iter().unzip();
        let joined = join_all(handles.into_iter().map(PoolJob::join)).await;

        let mut records = Vec::with_capacity(keys.len());
        for ((target, test), result) in keys.into_iter().zip(joined) {
            let (failed, started, finished) = match result {
                Ok(timing) => timing,
                Err(PoolError::JobFailed(message)) => {
                    report_integration_panic(emitter, &test, &target, &message, submitted);
                    (true, submitted, Instant::now())
                }
                Err(e) => return Err(e),
            };
            records.push(JobRecord {
                target,
                test,
                failed,
                started,
                finished,
            });
        }
        Ok(records)
    }

    async fn shared_queue(
        &self,
        tests: &[TestDescriptor],
        targets: &[Target],
        executor: &Arc<IntegrationExecutor>,
        config: &RunnerConfig,
        emitter: &DiagnosticEmitter,
    ) -> Result<Vec<JobRecord>, PoolError> {
        let queue = Arc::new(Mutex::new(tests.iter().cloned().collect::<VecDeque<_>>()));
        let mut jobs = Vec::with_capacity(targets.len());
        for target in targets {
            let options = CaseOptions::from_config(config, target.clone());
            let queue = Arc::clone(&queue);
            let executor = Arc::clone(executor);
            let emitter = emitter.clone();
            let job = self.exec(format!("integ queue ({target})"), async move {
                let mut records = Vec::new();
                loop {
                    let Some(test) = queue.lock().pop_front() else {
                        break;
                    };
                    let started = Instant::now();
                    let run = AssertUnwindSafe(executor.run_test(&test, &options, &emitter)).catch_unwind();
                    let failed = match run.await {
                        Ok(failed) => failed,
                        Err(_) => {
                            report_integration_panic(&emitter, &test, &options.target, "worker panicked", started);
                            true
                        }
                    };
                    records.push(JobRecord {
                        target: options.target.clone(),
                        test,
                        failed,
                        started,
                        finished: Instant::now(),
                    });
                }
                records
            })?;
            jobs.push(job);
        }

        let mut records = Vec::new();
        for result in join_all(jobs.into_iter().map(PoolJob::join)).await {
            records.extend(result?);
        }
        Ok(records)
    }

    /// Release the pool
    ///
    /// Unfinished jobs are aborted and later submissions are rejected. Safe to
    /// call more than once; only the first call has an effect.
    pub fn terminate(&self) {
        self.stats.lock().terminate_calls += 1;
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();

        let mut dropped = 0;
        for entry in self.in_flight.iter() {
            let (label, handle) = entry.value();
            if !handle.is_finished() {
                tracing::debug!(job = %entry.key(), label = %label, "dropping unfinished job");
                handle.abort();
                dropped += 1;
            }
        }
        self.in_flight.clear();
        self.stats.lock().jobs_dropped += dropped;
        tracing::debug!(dropped, "worker pool terminated");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.is_terminated() {
            self.terminate();
        }
    }
}

fn report_integration_panic(
    emitter: &DiagnosticEmitter,
    test: &TestDescriptor,
    target: &Target,
    message: &str,
    started: Instant,
) {
    emitter.report(
        DiagnosticReason::TestError,
        format!("{} ({target})", test.file_name().display()),
        format!("Error during integration test: {message}"),
        elapsed_secs(started),
    );
}

/// Tests to record, each paired with the target whose output becomes the snapshot
fn snapshot_updates(tests: &[TestDescriptor], targets: &[Target], records: &[JobRecord]) -> Vec<(TestDescriptor, Target)> {
    tests
        .iter()
        .filter(|test| !test.is_watch())
        .filter_map(|test| {
            let mine: Vec<&JobRecord> = records.iter().filter(|r| &r.test == test).collect();
            if mine.iter().any(|r| r.failed) {
                return None;
            }
            targets
                .iter()
                .find(|target| mine.iter().any(|r| &r.target == *target))
                .map(|target| (test.clone(), target.clone()))
        })
        .collect()
}

fn aggregate(targets: &[Target], records: Vec<JobRecord>) -> IntegrationOutcome {
    let mut outcome = IntegrationOutcome::default();
    for target in targets {
        let mine: Vec<&JobRecord> = records.iter().filter(|r| &r.target == target).collect();
        let (Some(first), Some(last)) = (
            mine.iter().map(|r| r.started).min(),
            mine.iter().map(|r| r.finished).max(),
        ) else {
            continue;
        };
        let mut metrics = RunMetrics::for_target(target);
        metrics.duration = last.duration_since(first).as_secs_f64();
        for record in &mine {
            metrics.record(
                record.test.display_name(),
                record.finished.duration_since(record.started).as_secs_f64(),
            );
        }
        outcome.metrics.push(metrics);
    }

    outcome.failures = records
        .into_iter()
        .filter(|r| r.failed)
        .map(|r| (r.target, r.test))
        .collect();
    outcome.success = outcome.failures.is_empty();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn zero_workers_rejected() {
        assert_eq!(WorkerPool::new(0, false).unwrap_err(), PoolError::InvalidSize(0));
    }

    #[tokio::test]
    async fn watch_mode_forces_single_worker() {
        let pool = WorkerPool::new(8, true).unwrap();
        assert_eq!(pool.max_workers(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let pool = WorkerPool::new(3, false).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs: Vec<_> = (0..12)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.exec(format!("job {i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                })
                .unwrap()
            })
            .collect();

        let results: Vec<_> = join_all(jobs.into_iter().map(PoolJob::join)).await;
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(Result::is_ok));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().jobs_completed, 12);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn panicking_job_is_recovered() {
        let pool = WorkerPool::new(2, false).unwrap();
        let job = pool
            .exec::<_, ()>("boom", async { panic!("synth exploded") })
            .unwrap();
        let err = job.join().await.unwrap_err();

        assert_eq!(err, PoolError::JobFailed("synth exploded".into()));
        assert_eq!(pool.stats().jobs_panicked, 1);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_and_drops_work() {
        let pool = WorkerPool::new(1, false).unwrap();
        let job = pool
            .exec("slow", tokio::time::sleep(Duration::from_secs(3600)))
            .unwrap();
        tokio::task::yield_now().await;

        pool.terminate();
        pool.terminate();

        assert!(pool.is_terminated());
        assert_eq!(job.join().await.unwrap_err(), PoolError::Terminated);
        assert_eq!(pool.exec("late", async {}).unwrap_err(), PoolError::Terminated);

        let stats = pool.stats();
        assert_eq!(stats.terminate_calls, 2);
        assert_eq!(stats.jobs_dropped, 1);
    }

    fn record(test: &TestDescriptor, region: &str, failed: bool) -> JobRecord {
        let now = Instant::now();
        JobRecord {
            target: Target::new(region, None),
            test: test.clone(),
            failed,
            started: now,
            finished: now,
        }
    }

    #[test]
    fn snapshot_recorded_once_per_passing_test() {
        let passing = TestDescriptor::new("test/integ.a.js", "test");
        let partial = TestDescriptor::new("test/integ.b.js", "test");
        let targets = Target::matrix(&["us-east-1".to_string(), "eu-west-1".to_string()], &[]);
        let records = vec![
            record(&passing, "eu-west-1", false),
            record(&partial, "us-east-1", false),
            record(&passing, "us-east-1", false),
            record(&partial, "eu-west-1", true),
        ];

        let updates = snapshot_updates(&[passing.clone(), partial], &targets, &records);

        assert_eq!(updates, vec![(passing, Target::new("us-east-1", None))]);
    }

    #[tokio::test]
    async fn drop_terminates_outstanding_jobs() {
        let pool = WorkerPool::new(1, false).unwrap();
        let job = pool
            .exec("slow", tokio::time::sleep(Duration::from_secs(3600)))
            .unwrap();
        drop(pool);
        assert_eq!(job.join().await.unwrap_err(), PoolError::Terminated);
    }
}
