//! Diagnostics and reporting
//!
//! Every unit of work (one snapshot check, one test case run) ends in exactly
//! one [`Diagnostic`] drawn from a closed set of [`DiagnosticReason`]s.
//!
//! Workers never touch the reporter directly. Each job gets a
//! [`DiagnosticEmitter`] (the sending half of a channel); a single
//! [`DiagnosticCollector`] task drains the channel, forwards each diagnostic to
//! the [`Reporter`] as it arrives and keeps the run-level record.

use crate::types::DestructiveChange;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Closed set of diagnostic reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticReason {
    /// No snapshot recorded for the test
    NoSnapshot,
    /// Snapshot matches current output
    SnapshotSuccess,
    /// Snapshot differs from current output
    SnapshotMismatch,
    /// Snapshot check failed unexpectedly
    SnapshotError,
    /// Test case ran and every assertion passed
    TestSuccess,
    /// Test case ran but an assertion failed
    AssertionFailed,
    /// Test case setup, deploy or destroy failed
    TestFailed,
    /// Test could not be run at all
    TestError,
}

impl DiagnosticReason {
    /// Check if the reason marks an integration failure
    #[inline]
    #[must_use]
    pub fn is_integration_failure(&self) -> bool {
        matches!(self, Self::AssertionFailed | Self::TestFailed | Self::TestError)
    }

    /// Check if the reason is a success
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::SnapshotSuccess | Self::TestSuccess)
    }

    /// Upper-case label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSnapshot => "NO_SNAPSHOT",
            Self::SnapshotSuccess => "SNAPSHOT_SUCCESS",
            Self::SnapshotMismatch => "SNAPSHOT_MISMATCH",
            Self::SnapshotError => "SNAPSHOT_ERROR",
            Self::TestSuccess => "TEST_SUCCESS",
            Self::AssertionFailed => "ASSERTION_FAILED",
            Self::TestFailed => "TEST_FAILED",
            Self::TestError => "TEST_ERROR",
        }
    }
}

impl fmt::Display for DiagnosticReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome record for one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    /// Why the unit ended the way it did
    pub reason: DiagnosticReason,
    /// Test (or test case) the record is about
    pub test_name: String,
    /// Human readable detail
    pub message: String,
    /// Wall-clock seconds spent on the unit
    pub duration: f64,
}

impl Diagnostic {
    /// Create new diagnostic
    #[inline]
    #[must_use]
    pub fn new(
        reason: DiagnosticReason,
        test_name: impl Into<String>,
        message: impl Into<String>,
        duration: f64,
    ) -> Self {
        Self {
            reason,
            test_name: test_name.into(),
            message: message.into(),
            duration,
        }
    }
}

/// Seconds elapsed since `start`
#[inline]
#[must_use]
pub fn elapsed_secs(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Status of a single assertion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionStatus {
    /// Assertion held
    Success,
    /// Assertion did not hold
    Fail,
}

/// Result of a single assertion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// Pass or fail
    pub status: AssertionStatus,
    /// Detail, usually the failure explanation
    #[serde(default)]
    pub message: String,
}

impl AssertionResult {
    /// Passing assertion
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: AssertionStatus::Success,
            message: String::new(),
        }
    }

    /// Failing assertion
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            status: AssertionStatus::Fail,
            message: message.into(),
        }
    }
}

/// Assertion results keyed by assertion ID
pub type AssertionResults = BTreeMap<String, AssertionResult>;

/// Check if any assertion failed
#[must_use]
pub fn has_failed_assertions(results: &AssertionResults) -> bool {
    results.values().any(|r| r.status == AssertionStatus::Fail)
}

/// Render assertion results for a diagnostic message
#[must_use]
pub fn format_assertion_results(results: &AssertionResults) -> String {
    results
        .iter()
        .map(|(id, result)| match result.status {
            AssertionStatus::Success => format!("{id} - success"),
            AssertionStatus::Fail => format!("{id}\n{}", result.message),
        })
        .collect::<Vec<_>>()
        .join("\n      ")
}

/// Reporting sink
///
/// Receives every diagnostic plus free-form text. Implementations must be
/// cheap; they are called from the collector task as diagnostics arrive.
pub trait Reporter: Send + Sync {
    /// A diagnostic arrived
    fn diagnostic(&self, diagnostic: &Diagnostic);

    /// Section header
    fn highlight(&self, message: &str) {
        tracing::info!("{message}");
    }

    /// Plain informational line
    fn print(&self, message: &str) {
        tracing::info!("{message}");
    }

    /// Non-fatal warning
    fn warning(&self, message: &str) {
        tracing::warn!("{message}");
    }

    /// Error line
    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }

    /// Summary after a phase
    fn summary(&self, total: usize, failed: usize) {
        self.print(&summary_line(total, failed));
    }

    /// Destructive change report for one test
    fn destructive_changes(&self, changes: &[DestructiveChange]) {
        if changes.is_empty() {
            return;
        }
        self.warning("!!! This test contains destructive changes !!!");
        for change in changes {
            self.warning(&format!("    {change}"));
        }
        self.warning("!!! If these destructive changes are necessary, please indicate this on the PR !!!");
    }
}

/// Text of the per-phase summary line
#[must_use]
pub fn summary_line(total: usize, failed: usize) -> String {
    if failed > 0 {
        format!("Tests: {failed} failed, {total} total")
    } else {
        format!("Tests: {total} passed, {total} total")
    }
}

/// Reporter that turns diagnostics into structured tracing events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn diagnostic(&self, d: &Diagnostic) {
        if d.reason.is_success() {
            tracing::info!(
                reason = %d.reason,
                test = %d.test_name,
                duration_secs = d.duration,
                "{}",
                d.message
            );
        } else if d.reason == DiagnosticReason::NoSnapshot {
            tracing::warn!(
                reason = %d.reason,
                test = %d.test_name,
                duration_secs = d.duration,
                "{}",
                d.message
            );
        } else {
            tracing::error!(
                reason = %d.reason,
                test = %d.test_name,
                duration_secs = d.duration,
                "{}",
                d.message
            );
        }
    }
}

/// Sending half handed to worker jobs
#[derive(Debug, Clone)]
pub struct DiagnosticEmitter {
    sender: mpsc::UnboundedSender<Diagnostic>,
}

impl DiagnosticEmitter {
    /// Emit a diagnostic
    ///
    /// Emission after the collector is gone is dropped silently; the run is
    /// already past the point where it could be reported.
    pub fn emit(&self, diagnostic: Diagnostic) {
        if self.sender.send(diagnostic).is_err() {
            tracing::debug!("diagnostic dropped: collector closed");
        }
    }

    /// Build and emit a diagnostic
    pub fn report(
        &self,
        reason: DiagnosticReason,
        test_name: impl Into<String>,
        message: impl Into<String>,
        duration: f64,
    ) {
        self.emit(Diagnostic::new(reason, test_name, message, duration));
    }
}

/// Receiving half: forwards to the reporter and records everything
#[derive(Debug)]
pub struct DiagnosticCollector {
    handle: JoinHandle<Vec<Diagnostic>>,
}

impl DiagnosticCollector {
    /// Wait for every emitter to drop and return all collected diagnostics
    ///
    /// Callers must drop their own emitter first or this never resolves.
    pub async fn finish(self) -> Vec<Diagnostic> {
        match self.handle.await {
            Ok(diagnostics) => diagnostics,
            Err(e) => {
                tracing::error!("diagnostic collector failed: {e}");
                Vec::new()
            }
        }
    }
}

/// Create an emitter/collector pair feeding `reporter`
#[must_use]
pub fn channel(reporter: Arc<dyn Reporter>) -> (DiagnosticEmitter, DiagnosticCollector) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Diagnostic>();
    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(diagnostic) = receiver.recv().await {
            reporter.diagnostic(&diagnostic);
            seen.push(diagnostic);
        }
        seen
    });
    (DiagnosticEmitter { sender }, DiagnosticCollector { handle })
}
