//! Snapshot verification
//!
//! Decides per test whether a recorded snapshot exists and still matches what
//! the test program currently synthesizes:
//!
//! ```text
//! START ── no snapshot ──────────────▶ NO_SNAPSHOT       (carried)
//!   │
//!   └── snapshot ── diff empty ──────▶ SNAPSHOT_SUCCESS  (done)
//!                └─ diff non-empty ──▶ SNAPSHOT_MISMATCH (carried, maybe destructive)
//! any failure ───────────────────────▶ SNAPSHOT_ERROR    (carried)
//! ```
//!
//! The stored snapshot is never written here.

use crate::diagnostic::{elapsed_secs, Diagnostic, DiagnosticEmitter, DiagnosticReason};
use crate::error::CollaboratorError;
use crate::template_diff::TemplateDiffer;
use crate::types::{DestructiveChange, TestDescriptor, WorkerResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Synthesized output of one test program: stack name to template
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assembly {
    /// Templates by stack name
    pub templates: BTreeMap<String, Value>,
}

impl Assembly {
    /// Create empty assembly
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With one stack template
    #[must_use]
    pub fn with_template(mut self, stack_name: impl Into<String>, template: Value) -> Self {
        self.templates.insert(stack_name.into(), template);
        self
    }
}

/// Synthesis collaborator
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Run the test program and collect its output into the temporary output
    /// directory
    async fn synthesize(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError>;
}

/// Recorded snapshot storage
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Check if a snapshot was recorded for `test`
    async fn exists(&self, test: &TestDescriptor) -> bool;

    /// Load the recorded snapshot
    async fn load(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError>;

    /// Remove fresh synthesis output left behind by a check
    async fn discard_output(&self, test: &TestDescriptor) -> Result<(), CollaboratorError>;
}

/// Result of one snapshot comparison
///
/// `diagnostics` is empty when the snapshot matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotReport {
    /// Failure diagnostics (at most one per test)
    pub diagnostics: Vec<Diagnostic>,
    /// Flagged changes found while comparing
    pub destructive_changes: Vec<DestructiveChange>,
}

impl SnapshotReport {
    /// Check if the snapshot matched
    #[inline]
    #[must_use]
    pub fn matched(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Snapshot verifier
pub struct SnapshotVerifier {
    synthesizer: Arc<dyn Synthesizer>,
    store: Arc<dyn SnapshotStore>,
    differ: Arc<dyn TemplateDiffer>,
    watchdog: Duration,
    include_security: bool,
    retain_failed_output: bool,
}

impl SnapshotVerifier {
    /// Default watchdog interval
    pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(60);

    /// Create new verifier
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        store: Arc<dyn SnapshotStore>,
        differ: Arc<dyn TemplateDiffer>,
    ) -> Self {
        Self {
            synthesizer,
            store,
            differ,
            watchdog: Self::DEFAULT_WATCHDOG,
            include_security: false,
            retain_failed_output: false,
        }
    }

    /// With watchdog interval
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Duration) -> Self {
        self.watchdog = watchdog;
        self
    }

    /// Treat security-relevant updates as destructive
    #[must_use]
    pub fn with_security_changes(mut self, enabled: bool) -> Self {
        self.include_security = enabled;
        self
    }

    /// Keep synthesis output of failed checks for inspection
    #[must_use]
    pub fn with_retained_output(mut self, retain: bool) -> Self {
        self.retain_failed_output = retain;
        self
    }

    /// Watchdog interval
    #[inline]
    #[must_use]
    pub fn watchdog(&self) -> Duration {
        self.watchdog
    }

    /// Compare the recorded snapshot of `test` against fresh output
    ///
    /// # Errors
    /// Returns the collaborator error when synthesis, loading or diffing fails.
    pub async fn test_snapshot(&self, test: &TestDescriptor) -> Result<SnapshotReport, CollaboratorError> {
        let start = Instant::now();
        let name = test.display_name();

        if !self.store.exists(test).await {
            return Ok(SnapshotReport {
                diagnostics: vec![Diagnostic::new(
                    DiagnosticReason::NoSnapshot,
                    name,
                    "No Snapshot",
                    elapsed_secs(start),
                )],
                destructive_changes: Vec::new(),
            });
        }

        let result = self.compare(test, start).await;

        let failed = !matches!(&result, Ok(report) if report.matched());
        if !(failed && self.retain_failed_output) {
            if let Err(e) = self.store.discard_output(test).await {
                tracing::warn!(test = %name, "failed to remove synthesis output: {e}");
            }
        }
        result
    }

    async fn compare(&self, test: &TestDescriptor, start: Instant) -> Result<SnapshotReport, CollaboratorError> {
        let actual = self.synthesizer.synthesize(test).await?;
        let expected = self.store.load(test).await?;

        let empty = Value::Object(serde_json::Map::new());
        let stacks: BTreeSet<&String> = expected.templates.keys().chain(actual.templates.keys()).collect();

        let mut report = SnapshotReport::default();
        let mut sections = Vec::new();
        for stack in stacks {
            let old = expected.templates.get(stack).unwrap_or(&empty);
            let new = actual.templates.get(stack).unwrap_or(&empty);
            let diff = self.differ.diff(stack, old, new)?;
            if diff.is_empty() {
                continue;
            }
            report
                .destructive_changes
                .extend(diff.destructive_changes(self.include_security));
            sections.push(format!("Stack {stack}\n{}", diff.render()));
        }

        if !sections.is_empty() {
            report.diagnostics.push(Diagnostic::new(
                DiagnosticReason::SnapshotMismatch,
                test.display_name(),
                sections.join("\n"),
                elapsed_secs(start),
            ));
        }
        Ok(report)
    }

    /// Check one test, emitting its diagnostics
    ///
    /// Returns the carried result when the test needs a full run. A check
    /// running past the watchdog interval emits an advisory diagnostic once and
    /// keeps going.
    pub async fn verify(&self, test: &TestDescriptor, emitter: &DiagnosticEmitter) -> Option<WorkerResult> {
        let start = Instant::now();
        let name = test.display_name();

        let check = self.test_snapshot(test);
        tokio::pin!(check);
        let outcome = match tokio::time::timeout(self.watchdog, &mut check).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(test = %name, watchdog_secs = self.watchdog.as_secs(), "snapshot check still running");
                emitter.report(
                    DiagnosticReason::SnapshotError,
                    name,
                    "Test is taking a very long time",
                    elapsed_secs(start),
                );
                check.await
            }
        };

        match outcome {
            Ok(report) if report.matched() => {
                emitter.report(DiagnosticReason::SnapshotSuccess, name, "Success", elapsed_secs(start));
                None
            }
            Ok(report) => {
                for diagnostic in report.diagnostics {
                    emitter.emit(diagnostic);
                }
                Some(WorkerResult::new(test.clone()).with_destructive_changes(report.destructive_changes))
            }
            Err(e) => {
                emitter.report(DiagnosticReason::SnapshotError, name, e.to_string(), elapsed_secs(start));
                Some(WorkerResult::new(test.clone()))
            }
        }
    }
}

impl std::fmt::Debug for SnapshotVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotVerifier")
            .field("watchdog", &self.watchdog)
            .field("include_security", &self.include_security)
            .field("retain_failed_output", &self.retain_failed_output)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostic::{channel, Reporter};
    use crate::template_diff::JsonTemplateDiffer;
    use crate::types::ResourceImpact;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::HashMap;

    struct Null;
    impl Reporter for Null {
        fn diagnostic(&self, _: &Diagnostic) {}
    }

    #[derive(Default)]
    struct Fixture {
        actual: HashMap<String, Assembly>,
        recorded: HashMap<String, Assembly>,
        delay: Duration,
        discarded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Synthesizer for Fixture {
        async fn synthesize(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError> {
            tokio::time::sleep(self.delay).await;
            self.actual
                .get(test.display_name())
                .cloned()
                .ok_or_else(|| CollaboratorError::Synthesis("app crashed".into()))
        }
    }

    #[async_trait]
    impl SnapshotStore for Fixture {
        async fn exists(&self, test: &TestDescriptor) -> bool {
            self.recorded.contains_key(test.display_name())
        }

        async fn load(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError> {
            self.recorded
                .get(test.display_name())
                .cloned()
                .ok_or_else(|| CollaboratorError::Snapshot("missing".into()))
        }

        async fn discard_output(&self, test: &TestDescriptor) -> Result<(), CollaboratorError> {
            self.discarded.lock().push(test.display_name().to_string());
            Ok(())
        }
    }

    fn bucket(name: &str) -> Assembly {
        Assembly::new().with_template(
            "Stack",
            json!({ "Resources": { "Bucket": { "Type": "AWS::S3::Bucket", "Properties": { "BucketName": name } } } }),
        )
    }

    fn verifier(fixture: Fixture) -> (SnapshotVerifier, Arc<Fixture>) {
        let fixture = Arc::new(fixture);
        let verifier = SnapshotVerifier::new(fixture.clone(), fixture.clone(), Arc::new(JsonTemplateDiffer::new()));
        (verifier, fixture)
    }

    fn test(name: &str) -> TestDescriptor {
        TestDescriptor::new(format!("test/{name}.js"), "test")
    }

    #[tokio::test]
    async fn missing_snapshot_is_carried() {
        let (verifier, _) = verifier(Fixture::default());
        let (emitter, collector) = channel(Arc::new(Null));

        let carried = verifier.verify(&test("integ.a"), &emitter).await;
        drop(emitter);

        assert!(carried.is_some());
        let seen = collector.finish().await;
        assert_eq!(seen[0].reason, DiagnosticReason::NoSnapshot);
    }

    #[tokio::test]
    async fn matching_snapshot_succeeds_and_discards_output() {
        let mut fixture = Fixture::default();
        fixture.actual.insert("integ.b".into(), bucket("x"));
        fixture.recorded.insert("integ.b".into(), bucket("x"));
        let (verifier, fixture) = verifier(fixture);

        let report = verifier.test_snapshot(&test("integ.b")).await.unwrap();
        assert!(report.matched());
        assert_eq!(*fixture.discarded.lock(), vec!["integ.b".to_string()]);
    }

    #[tokio::test]
    async fn destructive_mismatch_is_annotated() {
        let mut fixture = Fixture::default();
        fixture.actual.insert("integ.c".into(), bucket("new"));
        fixture.recorded.insert("integ.c".into(), bucket("old"));
        let (verifier, _) = verifier(fixture);
        let (emitter, collector) = channel(Arc::new(Null));

        let carried = verifier.verify(&test("integ.c"), &emitter).await.unwrap();
        drop(emitter);

        assert_eq!(carried.destructive_changes.len(), 1);
        assert_eq!(carried.destructive_changes[0].impact, ResourceImpact::WillReplace);
        let seen = collector.finish().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].reason, DiagnosticReason::SnapshotMismatch);
        assert!(seen[0].message.contains("Stack Stack"));
    }

    #[tokio::test]
    async fn removed_stack_destroys_its_resources() {
        let mut fixture = Fixture::default();
        fixture.actual.insert("integ.d".into(), Assembly::new());
        fixture.recorded.insert("integ.d".into(), bucket("x"));
        let (verifier, _) = verifier(fixture);

        let report = verifier.test_snapshot(&test("integ.d")).await.unwrap();
        assert_eq!(report.destructive_changes[0].impact, ResourceImpact::WillDestroy);
    }

    #[tokio::test]
    async fn synthesis_failure_is_snapshot_error() {
        let mut fixture = Fixture::default();
        fixture.recorded.insert("integ.e".into(), bucket("x"));
        let (verifier, fixture) = verifier(fixture);
        let verifier = verifier.with_retained_output(true);
        let (emitter, collector) = channel(Arc::new(Null));

        let carried = verifier.verify(&test("integ.e"), &emitter).await.unwrap();
        drop(emitter);

        assert!(!carried.has_destructive_changes());
        assert!(fixture.discarded.lock().is_empty());
        let seen = collector.finish().await;
        assert_eq!(seen[0].reason, DiagnosticReason::SnapshotError);
        assert!(seen[0].message.contains("app crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_is_advisory() {
        let mut fixture = Fixture::default();
        fixture.actual.insert("integ.f".into(), bucket("x"));
        fixture.recorded.insert("integ.f".into(), bucket("x"));
        fixture.delay = Duration::from_secs(90);
        let (verifier, _) = verifier(fixture);
        let (emitter, collector) = channel(Arc::new(Null));

        let carried = verifier.verify(&test("integ.f"), &emitter).await;
        drop(emitter);

        assert!(carried.is_none());
        let reasons: Vec<_> = collector.finish().await.into_iter().map(|d| d.reason).collect();
        assert_eq!(reasons, vec![DiagnosticReason::SnapshotError, DiagnosticReason::SnapshotSuccess]);
    }
}
