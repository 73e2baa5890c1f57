//! Integration execution
//!
//! Runs the deploy / assert / destroy lifecycle for one test against one
//! target. Each named test case inside the test is classified on its own;
//! the test as a whole fails if any case fails.

use crate::diagnostic::{
    elapsed_secs, format_assertion_results, has_failed_assertions, AssertionResults, DiagnosticEmitter,
    DiagnosticReason,
};
use crate::error::{CollaboratorError, RunError};
use crate::types::{RunnerConfig, Target, TestDescriptor};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Options for running one test case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOptions {
    /// Where to deploy
    pub target: Target,
    /// Destroy stacks after the case
    pub clean: bool,
    /// Synthesize only
    pub dry_run: bool,
    /// Deploy the recorded snapshot before the new output
    pub update_workflow: bool,
    /// Collaborator log verbosity
    pub verbosity: u8,
}

impl CaseOptions {
    /// Derive case options for `target` from the run configuration
    #[must_use]
    pub fn from_config(config: &RunnerConfig, target: Target) -> Self {
        Self {
            target,
            clean: config.clean,
            dry_run: config.dry_run,
            update_workflow: !config.disable_update_workflow,
            verbosity: config.verbosity,
        }
    }
}

/// Deploy / assert / destroy collaborator
#[async_trait]
pub trait TestCaseRunner: Send + Sync {
    /// Names of the test cases the program defines, in declaration order
    async fn list_test_cases(&self, test: &TestDescriptor) -> Result<Vec<String>, CollaboratorError>;

    /// Run one test case
    ///
    /// `Ok(None)` means the case defines no assertions.
    async fn run_test_case(
        &self,
        test: &TestDescriptor,
        test_case: &str,
        options: &CaseOptions,
    ) -> Result<Option<AssertionResults>, CollaboratorError>;

    /// Replace the recorded snapshot with the output last deployed to `target`
    async fn update_snapshot(&self, test: &TestDescriptor, target: &Target) -> Result<(), CollaboratorError>;
}

/// Integration executor
#[derive(Clone)]
pub struct IntegrationExecutor {
    runner: Arc<dyn TestCaseRunner>,
}

impl IntegrationExecutor {
    /// Create new executor
    #[must_use]
    pub fn new(runner: Arc<dyn TestCaseRunner>) -> Self {
        Self { runner }
    }

    /// Test case names, rejecting programs that define none
    ///
    /// # Errors
    /// Returns [`RunError::NoTestCases`] for an empty program and
    /// [`RunError::Collaborator`] when listing fails.
    pub async fn test_cases(&self, test: &TestDescriptor) -> Result<Vec<String>, RunError> {
        let cases = self.runner.list_test_cases(test).await?;
        if cases.is_empty() {
            return Err(RunError::NoTestCases {
                test: test.display_name().to_string(),
            });
        }
        Ok(cases)
    }

    /// Run one test case without reporting
    ///
    /// # Errors
    /// Returns the collaborator error when setup, deploy or destroy fails.
    pub async fn run_test_case(
        &self,
        test: &TestDescriptor,
        test_case: &str,
        options: &CaseOptions,
    ) -> Result<Option<AssertionResults>, CollaboratorError> {
        self.runner.run_test_case(test, test_case, options).await
    }

    /// Record the output deployed to `target` as the test's snapshot
    ///
    /// # Errors
    /// Returns the collaborator error when the output cannot be recorded.
    pub async fn update_snapshot(&self, test: &TestDescriptor, target: &Target) -> Result<(), CollaboratorError> {
        self.runner.update_snapshot(test, target).await
    }

    /// Run every case of `test` against `options.target`
    ///
    /// Returns `true` if any case failed. The snapshot is left alone; the
    /// dispatcher records it once every target of the test has passed.
    pub async fn run_test(&self, test: &TestDescriptor, options: &CaseOptions, emitter: &DiagnosticEmitter) -> bool {
        let start = Instant::now();
        let cases = match self.test_cases(test).await {
            Ok(cases) => cases,
            Err(e) => {
                emitter.report(
                    DiagnosticReason::TestError,
                    format!("{} ({})", test.file_name().display(), options.target),
                    format!("Error during integration test: {e}"),
                    elapsed_secs(start),
                );
                return true;
            }
        };

        let mut failed = false;
        for case in &cases {
            if self.run_case(test, case, options, emitter).await.is_integration_failure() {
                failed = true;
            }
        }
        failed
    }

    /// Run and report one case, returning the reported reason
    pub async fn run_case(
        &self,
        test: &TestDescriptor,
        test_case: &str,
        options: &CaseOptions,
        emitter: &DiagnosticEmitter,
    ) -> DiagnosticReason {
        let start = Instant::now();
        let case_name = format!("{}-{test_case}", test.display_name());
        let failed_name = format!("{case_name} ({})", options.target);

        match self.run_test_case(test, test_case, options).await {
            Ok(Some(results)) if has_failed_assertions(&results) => {
                emitter.report(
                    DiagnosticReason::AssertionFailed,
                    failed_name,
                    format_assertion_results(&results),
                    elapsed_secs(start),
                );
                DiagnosticReason::AssertionFailed
            }
            Ok(results) => {
                let message = results
                    .as_ref()
                    .map_or_else(|| "NO ASSERTIONS".to_string(), format_assertion_results);
                emitter.report(DiagnosticReason::TestSuccess, case_name, message, elapsed_secs(start));
                DiagnosticReason::TestSuccess
            }
            Err(e) => {
                emitter.report(
                    DiagnosticReason::TestFailed,
                    failed_name,
                    format!("Integration test failed: {e}"),
                    elapsed_secs(start),
                );
                DiagnosticReason::TestFailed
            }
        }
    }
}

impl std::fmt::Debug for IntegrationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationExecutor").finish_non_exhaustive()
    }
}
