//! Testing utilities for the integ-runner workspace
//!
//! In-memory collaborators, a recording reporter and scenario builders.

#![allow(missing_docs)]

use async_trait::async_trait;
use integ_core::{
    Assembly, AssertionResult, AssertionResults, CaseOptions, ChangeSource, CollaboratorError, Diagnostic,
    DiagnosticReason, IntegrationExecutor, JsonTemplateDiffer, Reporter, RunCoordinator, RunnerConfig,
    SnapshotStore, SnapshotVerifier, Synthesizer, Target, TestCaseRunner, TestDescriptor,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub fn descriptor(name: &str) -> TestDescriptor {
    TestDescriptor::new(format!("test/{name}.js"), "test")
}

pub fn descriptors(n: usize) -> Vec<TestDescriptor> {
    (0..n).map(|i| descriptor(&format!("integ.t{i}"))).collect()
}

pub fn bucket_assembly(bucket_name: &str) -> Assembly {
    Assembly::new().with_template(
        "TestStack",
        json!({
            "Resources": {
                "Bucket": { "Type": "AWS::S3::Bucket", "Properties": { "BucketName": bucket_name } }
            }
        }),
    )
}

pub fn queue_assembly(timeout: u64) -> Assembly {
    Assembly::new().with_template(
        "TestStack",
        json!({
            "Resources": {
                "Queue": { "Type": "AWS::SQS::Queue", "Properties": { "VisibilityTimeout": timeout } }
            }
        }),
    )
}

#[derive(Default)]
pub struct FakeSynthesizer {
    outputs: Mutex<HashMap<String, Assembly>>,
    panics: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    calls: Mutex<usize>,
}

impl FakeSynthesizer {
    pub fn set(&self, test: &TestDescriptor, assembly: Assembly) {
        self.outputs.lock().insert(test.display_name().to_string(), assembly);
    }

    pub fn panic_on(&self, test: &TestDescriptor) {
        self.panics.lock().push(test.display_name().to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError> {
        *self.calls.lock() += 1;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        assert!(
            !self.panics.lock().iter().any(|n| n == test.display_name()),
            "synthesizer crashed on {test}"
        );
        self.outputs
            .lock()
            .get(test.display_name())
            .cloned()
            .ok_or_else(|| CollaboratorError::Synthesis(format!("no output for {test}")))
    }
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Assembly>>,
    discarded: Mutex<Vec<String>>,
}

impl MemorySnapshotStore {
    pub fn record(&self, test: &TestDescriptor, assembly: Assembly) {
        self.snapshots.lock().insert(test.display_name().to_string(), assembly);
    }

    pub fn snapshot(&self, test: &TestDescriptor) -> Option<Assembly> {
        self.snapshots.lock().get(test.display_name()).cloned()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn exists(&self, test: &TestDescriptor) -> bool {
        self.snapshots.lock().contains_key(test.display_name())
    }

    async fn load(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError> {
        self.snapshot(test)
            .ok_or_else(|| CollaboratorError::Snapshot(format!("no snapshot for {test}")))
    }

    async fn discard_output(&self, test: &TestDescriptor) -> Result<(), CollaboratorError> {
        self.discarded.lock().push(test.display_name().to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseCall {
    pub test: String,
    pub case: String,
    pub target: Target,
}

#[derive(Default)]
pub struct FakeTestCaseRunner {
    cases: Mutex<HashMap<String, Vec<String>>>,
    outcomes: Mutex<HashMap<(String, String), Result<Option<AssertionResults>, CollaboratorError>>>,
    regional: Mutex<HashMap<(String, String, String), CollaboratorError>>,
    calls: Mutex<Vec<CaseCall>>,
    updates: Mutex<Vec<(String, Target)>>,
    update_failures: Mutex<HashMap<String, CollaboratorError>>,
    panics: Mutex<Vec<String>>,
}

impl FakeTestCaseRunner {
    pub fn set_cases(&self, test: &TestDescriptor, cases: &[&str]) {
        self.cases.lock().insert(
            test.display_name().to_string(),
            cases.iter().map(|c| (*c).to_string()).collect(),
        );
    }

    pub fn fail_case(&self, test: &TestDescriptor, case: &str, error: CollaboratorError) {
        self.outcomes
            .lock()
            .insert((test.display_name().to_string(), case.to_string()), Err(error));
    }

    pub fn fail_case_in(&self, test: &TestDescriptor, case: &str, region: &str, error: CollaboratorError) {
        self.regional.lock().insert(
            (test.display_name().to_string(), case.to_string(), region.to_string()),
            error,
        );
    }

    pub fn fail_update(&self, test: &TestDescriptor, error: CollaboratorError) {
        self.update_failures.lock().insert(test.display_name().to_string(), error);
    }

    pub fn fail_assertion(&self, test: &TestDescriptor, case: &str, message: &str) {
        let mut results = AssertionResults::new();
        results.insert("Assertion".to_string(), AssertionResult::fail(message));
        self.outcomes
            .lock()
            .insert((test.display_name().to_string(), case.to_string()), Ok(Some(results)));
    }

    pub fn panic_on(&self, test: &TestDescriptor) {
        self.panics.lock().push(test.display_name().to_string());
    }

    pub fn calls(&self) -> Vec<CaseCall> {
        self.calls.lock().clone()
    }

    pub fn updates(&self) -> Vec<String> {
        self.updates.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn update_targets(&self) -> Vec<(String, Target)> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl TestCaseRunner for FakeTestCaseRunner {
    async fn list_test_cases(&self, test: &TestDescriptor) -> Result<Vec<String>, CollaboratorError> {
        Ok(self.cases.lock().get(test.display_name()).cloned().unwrap_or_default())
    }

    async fn run_test_case(
        &self,
        test: &TestDescriptor,
        test_case: &str,
        options: &CaseOptions,
    ) -> Result<Option<AssertionResults>, CollaboratorError> {
        self.calls.lock().push(CaseCall {
            test: test.display_name().to_string(),
            case: test_case.to_string(),
            target: options.target.clone(),
        });
        tokio::task::yield_now().await;
        assert!(
            !self.panics.lock().iter().any(|n| n == test.display_name()),
            "deployment crashed on {test}"
        );
        let regional = (
            test.display_name().to_string(),
            test_case.to_string(),
            options.target.region.clone(),
        );
        if let Some(error) = self.regional.lock().get(&regional) {
            return Err(error.clone());
        }
        self.outcomes
            .lock()
            .get(&(test.display_name().to_string(), test_case.to_string()))
            .cloned()
            .unwrap_or(Ok(None))
    }

    async fn update_snapshot(&self, test: &TestDescriptor, target: &Target) -> Result<(), CollaboratorError> {
        if let Some(error) = self.update_failures.lock().get(test.display_name()) {
            return Err(error.clone());
        }
        self.updates
            .lock()
            .push((test.display_name().to_string(), target.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    diagnostics: Mutex<Vec<Diagnostic>>,
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    lines: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn reasons_for(&self, test_name: &str) -> Vec<DiagnosticReason> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.test_name == test_name)
            .map(|d| d.reason)
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl Reporter for RecordingReporter {
    fn diagnostic(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }

    fn highlight(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }

    fn print(&self, message: &str) {
        self.lines.lock().push(message.to_string());
    }

    fn warning(&self, message: &str) {
        self.warnings.lock().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

/// Reports `changes` changes, then stops
pub struct ScriptedChangeSource {
    remaining: usize,
}

impl ScriptedChangeSource {
    pub fn new(changes: usize) -> Self {
        Self { remaining: changes }
    }
}

#[async_trait]
impl ChangeSource for ScriptedChangeSource {
    async fn next_change(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// All fakes wired together
#[derive(Clone, Default)]
pub struct Harness {
    pub synthesizer: Arc<FakeSynthesizer>,
    pub store: Arc<MemorySnapshotStore>,
    pub runner: Arc<FakeTestCaseRunner>,
    pub reporter: Arc<RecordingReporter>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verifier(&self) -> SnapshotVerifier {
        SnapshotVerifier::new(
            self.synthesizer.clone(),
            self.store.clone(),
            Arc::new(JsonTemplateDiffer::new()),
        )
    }

    pub fn executor(&self) -> IntegrationExecutor {
        IntegrationExecutor::new(self.runner.clone())
    }

    pub fn coordinator(&self, config: RunnerConfig) -> RunCoordinator {
        RunCoordinator::new(config, self.verifier(), self.executor(), self.reporter.clone())
    }

    /// Test whose recorded snapshot matches its output
    pub fn matching(&self, name: &str) -> TestDescriptor {
        let test = descriptor(name);
        self.synthesizer.set(&test, queue_assembly(30));
        self.store.record(&test, queue_assembly(30));
        self.runner.set_cases(&test, &["default"]);
        test
    }

    /// Test without a recorded snapshot
    pub fn unrecorded(&self, name: &str) -> TestDescriptor {
        let test = descriptor(name);
        self.synthesizer.set(&test, queue_assembly(30));
        self.runner.set_cases(&test, &["default"]);
        test
    }

    /// Test whose output changed benignly
    pub fn drifted(&self, name: &str) -> TestDescriptor {
        let test = descriptor(name);
        self.synthesizer.set(&test, queue_assembly(60));
        self.store.record(&test, queue_assembly(30));
        self.runner.set_cases(&test, &["default"]);
        test
    }

    /// Test whose output replaces a resource
    pub fn destructive(&self, name: &str) -> TestDescriptor {
        let test = descriptor(name);
        self.synthesizer.set(&test, bucket_assembly("renamed"));
        self.store.record(&test, bucket_assembly("original"));
        self.runner.set_cases(&test, &["default"]);
        test
    }

    /// A: no snapshot, B: matching, C: destructive mismatch
    pub fn scenario_abc(&self) -> Vec<TestDescriptor> {
        vec![
            self.unrecorded("integ.a"),
            self.matching("integ.b"),
            self.destructive("integ.c"),
        ]
    }
}
