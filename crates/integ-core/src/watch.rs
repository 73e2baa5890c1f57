//! Single-test watch loop
//!
//! Runs one test's lifecycle against one target, then blocks on a
//! [`ChangeSource`] and repeats until the source reports it is done.

use crate::diagnostic::DiagnosticEmitter;
use crate::error::ValidationError;
use crate::executor::{CaseOptions, IntegrationExecutor};
use crate::types::{RunnerConfig, Target, TestDescriptor};
use async_trait::async_trait;
use std::sync::Arc;

/// External change notification
#[async_trait]
pub trait ChangeSource: Send + 'static {
    /// Wait for the next change
    ///
    /// Returns `false` when watching should stop.
    async fn next_change(&mut self) -> bool;
}

/// Reject watch runs over more than one test, region or profile
///
/// # Errors
/// - `ValidationError::WatchWithoutTest` for zero tests
/// - `ValidationError::WatchRequiresSingleTarget` for more than one test,
///   region or profile
/// - `ValidationError::NoRegions` for zero regions
pub fn validate_watch(
    tests: &[TestDescriptor],
    regions: &[String],
    profiles: &[String],
) -> Result<(), ValidationError> {
    if tests.len() > 1 || regions.len() > 1 || profiles.len() > 1 {
        return Err(ValidationError::WatchRequiresSingleTarget {
            tests: tests.len(),
            regions: regions.len(),
            profiles: profiles.len(),
        });
    }
    if tests.is_empty() {
        return Err(ValidationError::WatchWithoutTest);
    }
    if regions.is_empty() {
        return Err(ValidationError::NoRegions);
    }
    Ok(())
}

/// Summary of a finished watch session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Lifecycle passes run
    pub iterations: usize,
    /// Whether the last pass had a failing case
    pub last_failed: bool,
}

/// Watch loop over exactly one test and target
#[derive(Debug)]
pub struct WatchLoop {
    test: TestDescriptor,
    options: CaseOptions,
    executor: Arc<IntegrationExecutor>,
}

impl WatchLoop {
    /// Create a watch loop
    ///
    /// # Errors
    /// Returns a [`ValidationError`] unless exactly one test, one region and
    /// at most one profile are given.
    pub fn new(
        tests: &[TestDescriptor],
        config: &RunnerConfig,
        executor: Arc<IntegrationExecutor>,
    ) -> Result<Self, ValidationError> {
        validate_watch(tests, &config.regions, &config.profiles)?;
        let test = tests[0].clone().with_watch(true);
        let target = Target::new(config.regions[0].clone(), config.profiles.first().cloned());
        Ok(Self {
            test,
            options: CaseOptions::from_config(config, target),
            executor,
        })
    }

    /// The watched test
    #[inline]
    #[must_use]
    pub fn test(&self) -> &TestDescriptor {
        &self.test
    }

    /// Run `cases` until `changes` stops
    ///
    /// `cases` comes from [`IntegrationExecutor::test_cases`], listed before
    /// the loop is handed to a worker.
    pub async fn run(
        self,
        cases: Vec<String>,
        mut changes: Box<dyn ChangeSource>,
        emitter: DiagnosticEmitter,
    ) -> WatchSummary {
        let mut summary = WatchSummary::default();
        loop {
            summary.iterations += 1;
            tracing::info!(test = %self.test, iteration = summary.iterations, "watch pass");

            let mut failed = false;
            for case in &cases {
                let reason = self.executor.run_case(&self.test, case, &self.options, &emitter).await;
                if reason.is_integration_failure() {
                    failed = true;
                }
            }
            summary.last_failed = failed;

            if !changes.next_change().await {
                break;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tests(n: usize) -> Vec<TestDescriptor> {
        (0..n)
            .map(|i| TestDescriptor::new(format!("test/integ.t{i}.js"), "test"))
            .collect()
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn single_everything_accepted() {
        assert_eq!(validate_watch(&tests(1), &names(&["us-east-1"]), &[]), Ok(()));
        assert_eq!(validate_watch(&tests(1), &names(&["us-east-1"]), &names(&["dev"])), Ok(()));
    }

    #[test]
    fn multiples_rejected() {
        for (t, r, p) in [(2, 1, 0), (1, 2, 0), (1, 1, 2)] {
            let regions: Vec<String> = (0..r).map(|i| format!("region-{i}")).collect();
            let profiles: Vec<String> = (0..p).map(|i| format!("profile-{i}")).collect();
            let err = validate_watch(&tests(t), &regions, &profiles).unwrap_err();
            assert!(matches!(err, ValidationError::WatchRequiresSingleTarget { .. }));
        }
    }

    #[test]
    fn empty_inputs_rejected() {
        assert_eq!(
            validate_watch(&[], &names(&["us-east-1"]), &[]),
            Err(ValidationError::WatchWithoutTest)
        );
        assert_eq!(validate_watch(&tests(1), &[], &[]), Err(ValidationError::NoRegions));
    }
}
