//! Run coordinator
//!
//! Top-level control flow for one invocation:
//! 1. Validate arguments (watch mode takes exactly one test and target)
//! 2. Verify every snapshot (skipped in watch mode)
//! 3. Pick the full-run set (carried tests, or everything with `force`)
//! 4. Run the integration batch when escalation was requested, or the watch
//!    loop in watch mode
//! 5. Release the pool, then compute the verdict
//!
//! The coordinator owns the pool for the duration of the run and terminates it
//! on every path.

use crate::diagnostic::{self, Diagnostic, DiagnosticEmitter, Reporter};
use crate::error::{RunError, ValidationError, VerdictError};
use crate::executor::IntegrationExecutor;
use crate::metrics::{sorted_summary, RunMetrics};
use crate::snapshot::SnapshotVerifier;
use crate::types::{DestructiveChange, RunnerConfig, TestDescriptor, WorkerResult};
use crate::watch::{validate_watch, ChangeSource, WatchLoop, WatchSummary};
use crate::worker_pool::{IntegrationOutcome, PoolStats, WorkerPool};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Merge the full test list with carried tests
///
/// Carried entries come first and win: an entry of `all` whose file name
/// matches a carried test is dropped so the carried annotations survive.
#[must_use]
pub fn merge_tests(all: &[TestDescriptor], carried: &[WorkerResult]) -> Vec<WorkerResult> {
    let seen: HashSet<&Path> = carried.iter().map(|r| r.test.file_name()).collect();
    carried
        .iter()
        .cloned()
        .chain(
            all.iter()
                .filter(|t| !seen.contains(t.file_name()))
                .cloned()
                .map(WorkerResult::new),
        )
        .collect()
}

/// Compute the final verdict
///
/// Destructive changes always fail the run. Otherwise carried tests fail it
/// unless an integration run succeeded; with nothing carried the run passes.
///
/// # Errors
/// Returns the [`VerdictError`] describing the failure category.
pub fn verdict(carried: &[WorkerResult], integration: Option<&IntegrationOutcome>) -> Result<(), VerdictError> {
    let changes: Vec<DestructiveChange> = carried
        .iter()
        .flat_map(|r| r.destructive_changes.iter().cloned())
        .collect();
    if !changes.is_empty() {
        return Err(VerdictError::DestructiveChanges { changes });
    }
    if carried.is_empty() {
        return Ok(());
    }
    match integration {
        Some(outcome) if !outcome.success => Err(VerdictError::IntegrationFailed {
            failed: outcome.failures.len(),
        }),
        Some(_) => Ok(()),
        None => Err(VerdictError::TestsFailed { failed: carried.len() }),
    }
}

/// Everything one run produced
#[derive(Debug)]
pub struct RunReport {
    /// Final verdict
    pub verdict: Result<(), VerdictError>,
    /// Tests carried out of the snapshot phase
    pub carried: Vec<WorkerResult>,
    /// Integration batch result, if one ran
    pub integration: Option<IntegrationOutcome>,
    /// Watch session summary, if one ran
    pub watch: Option<WatchSummary>,
    /// Every diagnostic emitted during the run
    pub diagnostics: Vec<Diagnostic>,
    /// Pool statistics after termination
    pub pool_stats: PoolStats,
}

impl RunReport {
    /// Per-target metrics of the integration batch
    #[must_use]
    pub fn metrics(&self) -> &[RunMetrics] {
        self.integration.as_ref().map_or(&[], |o| o.metrics.as_slice())
    }

    /// Process exit code
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.verdict.as_ref().map_or_else(VerdictError::exit_code, |_| 0)
    }
}

struct Phases {
    carried: Vec<WorkerResult>,
    integration: Option<IntegrationOutcome>,
    watch: Option<WatchSummary>,
}

struct SinglePass;

#[async_trait]
impl ChangeSource for SinglePass {
    async fn next_change(&mut self) -> bool {
        false
    }
}

/// Run coordinator
pub struct RunCoordinator {
    config: RunnerConfig,
    verifier: Arc<SnapshotVerifier>,
    executor: Arc<IntegrationExecutor>,
    reporter: Arc<dyn Reporter>,
    changes: Mutex<Option<Box<dyn ChangeSource>>>,
}

impl RunCoordinator {
    /// Create new coordinator
    #[must_use]
    pub fn new(
        config: RunnerConfig,
        verifier: SnapshotVerifier,
        executor: IntegrationExecutor,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            config,
            verifier: Arc::new(verifier),
            executor: Arc::new(executor),
            reporter,
            changes: Mutex::new(None),
        }
    }

    /// With the change source driving watch mode
    ///
    /// Without one, watch mode runs a single pass.
    #[must_use]
    pub fn with_change_source(self, changes: Box<dyn ChangeSource>) -> Self {
        *self.changes.lock() = Some(changes);
        self
    }

    /// Run configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Validate arguments before any work is scheduled
    ///
    /// # Errors
    /// Returns a [`ValidationError`] for invalid watch combinations or a
    /// missing region when integration tests may run.
    pub fn validate(&self, tests: &[TestDescriptor]) -> Result<(), ValidationError> {
        let config = &self.config;
        if config.watch {
            validate_watch(tests, &config.regions, &config.profiles)?;
            let ignored = config.ignored_in_watch();
            if !ignored.is_empty() {
                self.reporter.warning(&format!(
                    "the following flags are ignored in watch mode: {}",
                    ignored.join(", ")
                ));
            }
        } else if config.escalates() && config.regions.is_empty() {
            return Err(ValidationError::NoRegions);
        }
        Ok(())
    }

    /// Run the whole workflow on a fresh pool
    ///
    /// # Errors
    /// Only configuration errors surface here; test failures are reported
    /// through [`RunReport::verdict`].
    pub async fn run(&self, tests: Vec<TestDescriptor>) -> Result<RunReport, RunError> {
        self.validate(&tests)?;
        let pool = WorkerPool::new(self.config.max_workers, self.config.watch)?;
        let result = self.execute(&pool, tests).await;
        pool.terminate();
        result.map(|mut report| {
            report.pool_stats = pool.stats();
            report
        })
    }

    /// Run the workflow on a caller-owned pool
    ///
    /// The caller must terminate `pool` afterwards.
    ///
    /// # Errors
    /// Returns a [`RunError`] for configuration errors and pool failures.
    pub async fn run_with_pool(&self, pool: &WorkerPool, tests: Vec<TestDescriptor>) -> Result<RunReport, RunError> {
        self.validate(&tests)?;
        self.execute(pool, tests).await
    }

    async fn execute(&self, pool: &WorkerPool, tests: Vec<TestDescriptor>) -> Result<RunReport, RunError> {
        let (emitter, collector) = diagnostic::channel(Arc::clone(&self.reporter));
        let result = self.phases(pool, tests, &emitter).await;
        drop(emitter);
        let diagnostics = collector.finish().await;
        let phases = result?;

        let verdict = verdict(&phases.carried, phases.integration.as_ref());
        if let Err(e) = &verdict {
            tracing::error!("{e}");
        }
        Ok(RunReport {
            verdict,
            carried: phases.carried,
            integration: phases.integration,
            watch: phases.watch,
            diagnostics,
            pool_stats: pool.stats(),
        })
    }

    async fn phases(
        &self,
        pool: &WorkerPool,
        tests: Vec<TestDescriptor>,
        emitter: &DiagnosticEmitter,
    ) -> Result<Phases, RunError> {
        let config = &self.config;

        if config.watch {
            let watch = self.watch(pool, &tests, emitter).await?;
            return Ok(Phases {
                carried: Vec::new(),
                integration: None,
                watch: Some(watch),
            });
        }

        self.reporter.highlight("Verifying integration test snapshots...");
        let carried = pool
            .submit_snapshot_batch(&tests, &self.verifier, config.snapshot_batch_size, emitter)
            .await?;
        for result in carried.iter().filter(|r| r.has_destructive_changes()) {
            self.reporter.destructive_changes(&result.destructive_changes);
        }
        self.reporter.summary(tests.len(), carried.len());

        let integration = if config.escalates() {
            let run_set = if config.force {
                merge_tests(&tests, &carried)
            } else {
                carried.clone()
            };
            Some(self.integrate(pool, &run_set, emitter).await?)
        } else {
            None
        };

        Ok(Phases {
            carried,
            integration,
            watch: None,
        })
    }

    async fn integrate(
        &self,
        pool: &WorkerPool,
        run_set: &[WorkerResult],
        emitter: &DiagnosticEmitter,
    ) -> Result<IntegrationOutcome, RunError> {
        let config = &self.config;
        self.reporter.highlight("Running integration tests for failed tests...");
        if !config.clean {
            self.reporter.warning("Not cleaning up stacks since clean is disabled");
        }

        let tests: Vec<TestDescriptor> = run_set.iter().map(|r| r.test.clone()).collect();
        let outcome = pool
            .submit_integration_batch(&tests, &config.regions, &config.profiles, &self.executor, config, emitter)
            .await?;

        let failed: HashSet<&Path> = outcome.failures.iter().map(|(_, t)| t.file_name()).collect();
        self.reporter.summary(tests.len(), failed.len());
        if config.verbose {
            for line in sorted_summary(&outcome.metrics) {
                self.reporter.print(&line);
            }
        }
        Ok(outcome)
    }

    async fn watch(
        &self,
        pool: &WorkerPool,
        tests: &[TestDescriptor],
        emitter: &DiagnosticEmitter,
    ) -> Result<WatchSummary, RunError> {
        let watch = WatchLoop::new(tests, &self.config, Arc::clone(&self.executor))?;
        let changes = self
            .changes
            .lock()
            .take()
            .unwrap_or_else(|| Box::new(SinglePass) as Box<dyn ChangeSource>);
        let cases = self.executor.test_cases(watch.test()).await?;
        self.reporter.highlight(&format!("Watching {}...", watch.test()));
        let label = format!("watch: {}", watch.test());
        let job = pool.exec(label, watch.run(cases, changes, emitter.clone()))?;
        Ok(job.join().await?)
    }
}

impl std::fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("config", &self.config)
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}
