//! Error types for integ-core
//!
//! Provides error handling for:
//! - Run configuration failures (watch-mode argument combinations)
//! - Worker pool sizing and lifecycle
//! - Collaborator failures (synthesis, deployment, diffing, snapshot storage)
//! - The final run verdict

use crate::types::DestructiveChange;

/// Main run error type
///
/// Only configuration-class failures surface here. Individual job failures are
/// recovered into diagnostics by the worker pool and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Invalid argument combination
    #[error("invalid run configuration: {0}")]
    Validation(#[from] ValidationError),

    /// Worker pool error
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    /// A test program defines no test cases
    #[error("no test cases defined for {test}")]
    NoTestCases {
        /// Display name of the offending test
        test: String,
    },

    /// Collaborator failed outside of a worker job
    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),
}

/// Argument validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Watch mode given more than one test, region or profile
    #[error(
        "running with watch only supports a single test, region and profile \
         (got {tests} tests, {regions} regions, {profiles} profiles)"
    )]
    WatchRequiresSingleTarget {
        /// Number of tests supplied
        tests: usize,
        /// Number of regions supplied
        regions: usize,
        /// Number of profiles supplied
        profiles: usize,
    },

    /// Watch mode with no test at all
    #[error("running with watch requires exactly one test")]
    WatchWithoutTest,

    /// At least one region is required for integration runs
    #[error("at least one region is required")]
    NoRegions,
}

/// Worker pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// Requested pool size below one
    #[error("invalid pool size: {0} (must be at least 1)")]
    InvalidSize(usize),

    /// Submission after terminate
    #[error("pool has been terminated")]
    Terminated,

    /// Worker job panicked or was cancelled
    #[error("worker job failed: {0}")]
    JobFailed(String),
}

/// Collaborator errors (synthesis, deployment, diffing, snapshot storage)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// Synthesizing the test program failed
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    /// Deploying the test case failed
    #[error("deployment failed: {0}")]
    Deployment(String),

    /// Destroying the test case failed
    #[error("destroy failed: {0}")]
    Destroy(String),

    /// Snapshot could not be read or written
    #[error("snapshot store error: {0}")]
    Snapshot(String),

    /// Template diff failed
    #[error("diff failed: {0}")]
    Diff(String),

    /// Underlying I/O failure
    #[error("i/o error: {0}")]
    Io(String),

    /// Operation timed out
    #[error("operation timed out after {duration_secs}s")]
    Timeout {
        /// Elapsed time before giving up
        duration_secs: u64,
    },
}

impl From<std::io::Error> for CollaboratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Final verdict failures
///
/// Each variant maps to one operator action.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerdictError {
    /// At least one snapshot revealed destructive changes
    #[error("Some changes were destructive!")]
    DestructiveChanges {
        /// Every flagged change seen during the run
        changes: Vec<DestructiveChange>,
    },

    /// Snapshots failed and no integration run was requested
    #[error("Some tests failed!\nTo re-run failed tests run: integ-runner --update-on-failed")]
    TestsFailed {
        /// Number of tests whose snapshot check failed
        failed: usize,
    },

    /// The integration run itself reported failures
    #[error("Some integration tests failed!")]
    IntegrationFailed {
        /// Number of failed (test, target) jobs
        failed: usize,
    },
}

impl VerdictError {
    /// Process exit code for this verdict
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        1
    }
}
