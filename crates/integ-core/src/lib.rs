//! integ-core - integration test orchestration
//!
//! Takes discovered test programs and:
//! - Verifies each one's recorded snapshot against fresh synthesis output
//! - Flags destructive changes found while comparing
//! - Escalates failed (or all, with `force`) tests into deploy / assert /
//!   destroy runs over a region × profile matrix on a bounded worker pool
//! - Aggregates diagnostics, metrics and a final verdict
//!
//! Synthesis, deployment, snapshot storage and change notification are
//! collaborators behind traits; the binary crate provides the process and
//! filesystem implementations.
//!
//! # Example
//!
//! ```rust,ignore
//! use integ_core::prelude::*;
//!
//! # async fn example(
//! #     verifier: SnapshotVerifier,
//! #     executor: IntegrationExecutor,
//! #     tests: Vec<TestDescriptor>,
//! # ) -> Result<(), RunError> {
//! let config = RunnerConfig::new().with_max_workers(4).with_update_on_failed(true);
//! let coordinator = RunCoordinator::new(config, verifier, executor, Arc::new(TracingReporter));
//!
//! let report = coordinator.run(tests).await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod coordinator;
pub mod diagnostic;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod snapshot;
pub mod template_diff;
pub mod types;
pub mod watch;
pub mod worker_pool;

pub use coordinator::{merge_tests, verdict, RunCoordinator, RunReport};
pub use diagnostic::{
    AssertionResult, AssertionResults, AssertionStatus, Diagnostic, DiagnosticCollector, DiagnosticEmitter,
    DiagnosticReason, Reporter, TracingReporter,
};
pub use error::{CollaboratorError, PoolError, RunError, ValidationError, VerdictError};
pub use executor::{CaseOptions, IntegrationExecutor, TestCaseRunner};
pub use metrics::RunMetrics;
pub use snapshot::{Assembly, SnapshotReport, SnapshotStore, SnapshotVerifier, Synthesizer};
pub use template_diff::{JsonTemplateDiffer, ResourceDifference, TemplateDiff, TemplateDiffer};
pub use types::{
    DestructiveChange, JobId, ResourceImpact, RunnerConfig, Target, TargetDistribution, TestDescriptor, TestInfo,
    WorkerResult,
};
pub use watch::{ChangeSource, WatchLoop, WatchSummary};
pub use worker_pool::{IntegrationOutcome, PoolJob, PoolStats, WorkerPool};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a run
    pub use crate::{
        ChangeSource, IntegrationExecutor, Reporter, RunCoordinator, RunError, RunReport, RunnerConfig,
        SnapshotVerifier, TestDescriptor, TracingReporter,
    };
    pub use std::sync::Arc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RunnerConfig::new()
            .with_regions(["us-east-1", "eu-west-1"])
            .with_distribution(TargetDistribution::SharedQueue);
        let json = serde_json::to_string(&config).unwrap();
        let back: RunnerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
