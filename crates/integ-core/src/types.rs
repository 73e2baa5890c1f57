//! Core types for integ-core
//!
//! Defines the fundamental types for the runner:
//! - Test descriptors and their derived names
//! - Deployment targets (region, profile)
//! - Destructive changes and worker-carried results
//! - Run configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use ulid::Ulid;

/// Placeholder substituted with the test file path in invocation templates
pub const FILE_PATH_PLACEHOLDER: &str = "{filePath}";

/// Prefix of the temporary output directory written during synthesis
pub const OUTDIR_PREFIX: &str = "integ.out";

/// Unique worker job identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub Ulid);

impl JobId {
    /// Generate new job ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wire form of a test descriptor
///
/// Only the identifying fields travel; derived names are recomputed on the
/// receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestInfo {
    /// Test program path relative to the working directory
    pub file_name: PathBuf,
    /// Root the test was discovered under
    pub discovery_root: PathBuf,
    /// Command template containing `{filePath}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_command: Option<String>,
    /// Running under watch mode
    #[serde(default)]
    pub watch: bool,
}

/// Immutable description of one discoverable test program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TestInfo", into = "TestInfo")]
pub struct TestDescriptor {
    file_name: PathBuf,
    discovery_root: PathBuf,
    invocation_template: String,
    custom_invocation: bool,
    watch: bool,
    display_name: String,
    normalized_name: String,
    discovery_relative: String,
    snapshot_dir: PathBuf,
    temporary_output_dir: PathBuf,
}

impl TestDescriptor {
    /// Create a descriptor using the default invocation for the file's extension
    #[must_use]
    pub fn new(file_name: impl Into<PathBuf>, discovery_root: impl Into<PathBuf>) -> Self {
        Self::from(TestInfo {
            file_name: file_name.into(),
            discovery_root: discovery_root.into(),
            app_command: None,
            watch: false,
        })
    }

    /// With an explicit invocation template
    #[must_use]
    pub fn with_invocation(self, template: impl Into<String>) -> Self {
        let mut info = self.info();
        info.app_command = Some(template.into());
        Self::from(info)
    }

    /// Mark as running under watch mode
    #[must_use]
    pub fn with_watch(self, watch: bool) -> Self {
        let mut info = self.info();
        info.watch = watch;
        Self::from(info)
    }

    /// Test program path relative to the working directory
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    /// Root the test was discovered under
    #[inline]
    #[must_use]
    pub fn discovery_root(&self) -> &Path {
        &self.discovery_root
    }

    /// Command template with the `{filePath}` placeholder
    #[inline]
    #[must_use]
    pub fn invocation_template(&self) -> &str {
        &self.invocation_template
    }

    /// Running under watch mode
    #[inline]
    #[must_use]
    pub fn is_watch(&self) -> bool {
        self.watch
    }

    /// Human readable test name
    ///
    /// Looks either like `integ.mytest` or `package/test/integ.mytest`.
    #[inline]
    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// File stem without directories
    #[inline]
    #[must_use]
    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    /// Directory holding the recorded snapshot
    #[inline]
    #[must_use]
    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    /// Directory synthesis writes fresh output into
    #[inline]
    #[must_use]
    pub fn temporary_output_dir(&self) -> &Path {
        &self.temporary_output_dir
    }

    /// Directory a deployment against `target` synthesizes into
    ///
    /// Sits beside [`Self::temporary_output_dir`] so jobs for different
    /// targets of the same test never share output.
    #[must_use]
    pub fn target_output_dir(&self, target: &Target) -> PathBuf {
        let base = self
            .file_name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target: String = target
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.temporary_output_dir
            .with_file_name(format!("{OUTDIR_PREFIX}.{base}.{target}.snapshot"))
    }

    /// Invocation command split into program and arguments
    #[must_use]
    pub fn command_line(&self) -> Vec<String> {
        let file = self.file_name.to_string_lossy();
        self.invocation_template
            .replace(FILE_PATH_PLACEHOLDER, &file)
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// Check whether `key` names this test
    ///
    /// The file name, the discovery-relative path, the display name and the
    /// absolute path (resolved against `cwd`) are all accepted.
    #[must_use]
    pub fn matches(&self, key: &str, cwd: &Path) -> bool {
        let key_path = normalize(Path::new(key));
        key == self.display_name
            || key == self.discovery_relative
            || key_path == normalize(&self.file_name)
            || key_path == normalize(&cwd.join(&self.file_name))
    }

    /// Wire form of this descriptor
    #[must_use]
    pub fn info(&self) -> TestInfo {
        TestInfo {
            file_name: self.file_name.clone(),
            discovery_root: self.discovery_root.clone(),
            app_command: self.custom_invocation.then(|| self.invocation_template.clone()),
            watch: self.watch,
        }
    }
}

impl From<TestInfo> for TestDescriptor {
    fn from(info: TestInfo) -> Self {
        let file_name = normalize(&info.file_name);
        let discovery_root = normalize(&info.discovery_root);

        let dir = file_name.parent().map(Path::to_path_buf).unwrap_or_default();
        let base = file_name
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = file_name
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let display_name = if dir == discovery_root || dir == discovery_root.join("test") {
            stem.clone()
        } else {
            let rel = dir.strip_prefix(&discovery_root).unwrap_or(dir.as_path());
            slash_path(&rel.join(&stem))
        };

        let discovery_relative = slash_path(
            file_name
                .strip_prefix(&discovery_root)
                .unwrap_or(file_name.as_path()),
        );

        let custom_invocation = info.app_command.is_some();
        let invocation_template = info
            .app_command
            .unwrap_or_else(|| default_invocation(&file_name).to_string());

        Self {
            snapshot_dir: dir.join(format!("{base}.snapshot")),
            temporary_output_dir: dir.join(format!("{OUTDIR_PREFIX}.{base}.snapshot")),
            file_name,
            discovery_root,
            invocation_template,
            custom_invocation,
            watch: info.watch,
            display_name,
            normalized_name: stem,
            discovery_relative,
        }
    }
}

impl From<TestDescriptor> for TestInfo {
    fn from(descriptor: TestDescriptor) -> Self {
        descriptor.info()
    }
}

impl fmt::Display for TestDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

/// Default invocation template for a test file, by extension
#[must_use]
pub fn default_invocation(file_name: &Path) -> &'static str {
    match file_name.extension().and_then(|e| e.to_str()) {
        Some("js" | "mjs" | "cjs") => "node {filePath}",
        Some("ts") => "node -r ts-node/register {filePath}",
        Some("py") => "python {filePath}",
        Some("go") => "go run {filePath}",
        _ => FILE_PATH_PLACEHOLDER,
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// One (region, profile) deployment target
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Cloud region
    pub region: String,
    /// Credential profile, `None` for the ambient credentials
    pub profile: Option<String>,
}

impl Target {
    /// Create new target
    #[inline]
    #[must_use]
    pub fn new(region: impl Into<String>, profile: Option<String>) -> Self {
        Self {
            region: region.into(),
            profile,
        }
    }

    /// Build the target matrix
    ///
    /// Every profile is paired with every region. With no profiles each region
    /// gets a single "no profile" target.
    #[must_use]
    pub fn matrix(regions: &[String], profiles: &[String]) -> Vec<Target> {
        if profiles.is_empty() {
            return regions.iter().map(|r| Target::new(r.clone(), None)).collect();
        }
        profiles
            .iter()
            .flat_map(|p| regions.iter().map(move |r| Target::new(r.clone(), Some(p.clone()))))
            .collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.profile {
            Some(profile) => write!(f, "{}/{}", profile, self.region),
            None => write!(f, "{}", self.region),
        }
    }
}

/// Resource-level impact of a template change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceImpact {
    /// Resource is new
    WillCreate,
    /// Resource updated in place
    WillUpdate,
    /// Resource replaced (old one deleted)
    WillReplace,
    /// Resource deleted
    WillDestroy,
    /// Resource removed from the stack but retained
    WillOrphan,
    /// Nothing changes
    NoChange,
}

impl ResourceImpact {
    /// Check if the impact can delete, replace or detach a live resource
    #[inline]
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::WillReplace | Self::WillDestroy | Self::WillOrphan)
    }

    /// Upper-case label
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WillCreate => "WILL_CREATE",
            Self::WillUpdate => "WILL_UPDATE",
            Self::WillReplace => "WILL_REPLACE",
            Self::WillDestroy => "WILL_DESTROY",
            Self::WillOrphan => "WILL_ORPHAN",
            Self::NoChange => "NO_CHANGE",
        }
    }
}

impl fmt::Display for ResourceImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flagged resource change found during snapshot comparison
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestructiveChange {
    /// Stack (template) the resource belongs to
    pub stack_name: String,
    /// Logical ID of the resource
    pub logical_id: String,
    /// Impact of the change
    pub impact: ResourceImpact,
}

impl fmt::Display for DestructiveChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Stack: {} - Resource: {} - Impact: {}",
            self.stack_name, self.logical_id, self.impact
        )
    }
}

/// A test carried from the snapshot phase into the full-run phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    /// The test
    pub test: TestDescriptor,
    /// Flagged changes found for it, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destructive_changes: Vec<DestructiveChange>,
}

impl WorkerResult {
    /// Carry a test without annotations
    #[inline]
    #[must_use]
    pub fn new(test: TestDescriptor) -> Self {
        Self {
            test,
            destructive_changes: Vec::new(),
        }
    }

    /// With destructive change annotations
    #[inline]
    #[must_use]
    pub fn with_destructive_changes(mut self, changes: Vec<DestructiveChange>) -> Self {
        self.destructive_changes = changes;
        self
    }

    /// Check if any destructive change was attached
    #[inline]
    #[must_use]
    pub fn has_destructive_changes(&self) -> bool {
        !self.destructive_changes.is_empty()
    }
}

/// How integration jobs are spread over targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetDistribution {
    /// Every test runs against every target
    #[default]
    CrossProduct,
    /// One worker loop per target drains a shared queue; each test runs once
    SharedQueue,
}

/// Run configuration
///
/// Produced by the CLI layer; every recognized option is enumerated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Single-test interactive mode; forces a pool of one worker
    pub watch: bool,
    /// Run integration tests for every test, not only failed snapshots
    pub force: bool,
    /// Synthesize only; never deploy
    pub dry_run: bool,
    /// Skip deploying the previous snapshot before the new output
    pub disable_update_workflow: bool,
    /// Run integration tests for tests whose snapshot check failed
    pub run_update_on_failed: bool,
    /// Maximum concurrent worker jobs
    pub max_workers: usize,
    /// Destroy stacks after each test case
    pub clean: bool,
    /// Output verbosity passed to collaborators (0-4)
    pub verbosity: u8,
    /// Print run metrics after the integration run
    pub verbose: bool,
    /// Regions to run integration tests in
    pub regions: Vec<String>,
    /// Credential profiles to run integration tests with
    pub profiles: Vec<String>,
    /// Tests per snapshot job
    pub snapshot_batch_size: usize,
    /// Seconds before a snapshot check reports that it is still running
    pub watchdog_secs: u64,
    /// How integration jobs are spread over targets
    pub distribution: TargetDistribution,
    /// Keep the synthesized output of failed snapshot checks
    pub retain_failed_output: bool,
}

impl RunnerConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With max workers
    #[inline]
    #[must_use]
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// With regions
    #[inline]
    #[must_use]
    pub fn with_regions<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regions = regions.into_iter().map(Into::into).collect();
        self
    }

    /// With profiles
    #[inline]
    #[must_use]
    pub fn with_profiles<I, S>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profiles = profiles.into_iter().map(Into::into).collect();
        self
    }

    /// With force escalation
    #[inline]
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// With update-on-failed escalation
    #[inline]
    #[must_use]
    pub fn with_update_on_failed(mut self, enabled: bool) -> Self {
        self.run_update_on_failed = enabled;
        self
    }

    /// With watch mode
    #[inline]
    #[must_use]
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// With dry run
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With verbose metrics
    #[inline]
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// With snapshot batch size
    #[inline]
    #[must_use]
    pub fn with_snapshot_batch_size(mut self, size: usize) -> Self {
        self.snapshot_batch_size = size;
        self
    }

    /// With target distribution
    #[inline]
    #[must_use]
    pub fn with_distribution(mut self, distribution: TargetDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Check if the run escalates into integration tests
    #[inline]
    #[must_use]
    pub fn escalates(&self) -> bool {
        self.run_update_on_failed || self.force
    }

    /// Options that have no effect in watch mode but were set
    #[must_use]
    pub fn ignored_in_watch(&self) -> Vec<&'static str> {
        [
            (self.run_update_on_failed, "--update-on-failed"),
            (self.disable_update_workflow, "--disable-update-workflow"),
            (self.force, "--force"),
            (self.dry_run, "--dry-run"),
        ]
        .into_iter()
        .filter_map(|(set, flag)| set.then_some(flag))
        .collect()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            watch: false,
            force: false,
            dry_run: false,
            disable_update_workflow: false,
            run_update_on_failed: false,
            max_workers: 16,
            clean: true,
            verbosity: 0,
            verbose: false,
            regions: vec!["us-east-1".to_string()],
            profiles: Vec::new(),
            snapshot_batch_size: 3,
            watchdog_secs: 60,
            distribution: TargetDistribution::CrossProduct,
            retain_failed_output: false,
        }
    }
}
