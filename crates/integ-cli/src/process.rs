//! Process-backed collaborators
//!
//! [`CommandSynthesizer`] runs a test program to produce its stack templates;
//! [`ShellTestCaseRunner`] deploys, asserts and destroys them with the
//! configured command templates. Each target deploys from its own output
//! directory, so one test can run against several targets at once.

use crate::snapshot_store::{
    read_assembly, read_assertion_results, read_test_cases, remove_dir, DirectorySnapshotStore,
};
use async_trait::async_trait;
use dashmap::DashMap;
use integ_core::{
    Assembly, AssertionResults, CaseOptions, CollaboratorError, SnapshotStore, Synthesizer, Target, TestCaseRunner,
    TestDescriptor,
};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Environment variable telling the test program where to write its output
pub const OUTDIR_ENV: &str = "INTEG_OUTDIR";

/// Default deploy command template
pub const DEFAULT_DEPLOY_COMMAND: &str = "cdk deploy --app {outdir} {stack} --require-approval never";

/// Default destroy command template
pub const DEFAULT_DESTROY_COMMAND: &str = "cdk destroy --app {outdir} {stack} --force";

async fn run_command(mut command: Command, timeout: Duration) -> Result<Output, CollaboratorError> {
    command.kill_on_drop(true);
    tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| CollaboratorError::Timeout {
            duration_secs: timeout.as_secs(),
        })?
        .map_err(CollaboratorError::from)
}

fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        format!("exited with {}: {stderr}", output.status)
    }
}

/// Runs test programs to synthesize their templates
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    timeout: Duration,
}

impl CommandSynthesizer {
    /// Default synthesis timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    /// Create new synthesizer
    #[must_use]
    pub fn new() -> Self {
        Self {
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// With timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the test program with its output directed into `output_dir`
    ///
    /// The directory is recreated empty first.
    ///
    /// # Errors
    /// Returns [`CollaboratorError::Synthesis`] when the program fails, or a
    /// snapshot error when its output cannot be read.
    pub async fn synthesize_into(&self, test: &TestDescriptor, output_dir: &Path) -> Result<Assembly, CollaboratorError> {
        remove_dir(output_dir).await?;
        tokio::fs::create_dir_all(output_dir).await?;

        let argv = test.command_line();
        let Some((program, args)) = argv.split_first() else {
            return Err(CollaboratorError::Synthesis(format!("{test}: empty invocation")));
        };
        tracing::debug!(test = %test, command = %argv.join(" "), outdir = %output_dir.display(), "synthesizing");

        let mut command = Command::new(program);
        command.args(args).env(OUTDIR_ENV, output_dir);
        let output = run_command(command, self.timeout).await?;
        if !output.status.success() {
            return Err(CollaboratorError::Synthesis(format!("{test} {}", failure_text(&output))));
        }
        read_assembly(output_dir).await
    }
}

impl Default for CommandSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError> {
        self.synthesize_into(test, test.temporary_output_dir()).await
    }
}

/// Deploy and destroy command templates
///
/// Placeholders: `{stack}`, `{region}`, `{profile}`, `{testCase}`, `{outdir}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplates {
    /// Run once per stack to deploy it
    pub deploy: String,
    /// Run once per stack, in reverse order, to tear it down
    pub destroy: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            deploy: DEFAULT_DEPLOY_COMMAND.to_string(),
            destroy: DEFAULT_DESTROY_COMMAND.to_string(),
        }
    }
}

/// Expand a command template into argv
fn expand(template: &str, stack: &str, case: &str, outdir: &Path, target: &Target) -> Vec<String> {
    let outdir = outdir.display().to_string();
    template
        .split_whitespace()
        .map(|word| {
            word.replace("{stack}", stack)
                .replace("{region}", &target.region)
                .replace("{profile}", target.profile.as_deref().unwrap_or(""))
                .replace("{testCase}", case)
                .replace("{outdir}", &outdir)
        })
        .filter(|word| !word.is_empty())
        .collect()
}

/// Deploys test cases with shell commands
#[derive(Debug, Clone)]
pub struct ShellTestCaseRunner {
    synthesizer: Arc<CommandSynthesizer>,
    store: Arc<DirectorySnapshotStore>,
    commands: CommandTemplates,
    timeout: Duration,
    // Jobs of one test list its cases through the shared temporary output dir
    listing: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ShellTestCaseRunner {
    /// Default timeout per deploy or destroy command
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);

    /// Create new runner
    #[must_use]
    pub fn new(synthesizer: Arc<CommandSynthesizer>, store: Arc<DirectorySnapshotStore>) -> Self {
        Self {
            synthesizer,
            store,
            commands: CommandTemplates::default(),
            timeout: Self::DEFAULT_TIMEOUT,
            listing: Arc::new(DashMap::new()),
        }
    }

    /// With command templates
    #[must_use]
    pub fn with_commands(mut self, commands: CommandTemplates) -> Self {
        self.commands = commands;
        self
    }

    /// With per-command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_template(
        &self,
        template: &str,
        stack: &str,
        case: &str,
        outdir: &Path,
        options: &CaseOptions,
    ) -> Result<Output, CollaboratorError> {
        let argv = expand(template, stack, case, outdir, &options.target);
        let Some((program, args)) = argv.split_first() else {
            return Err(CollaboratorError::Deployment(format!("empty command template {template:?}")));
        };
        tracing::debug!(stack, case, target = %options.target, command = %argv.join(" "), "running");

        let mut command = Command::new(program);
        command
            .args(args)
            .env("AWS_REGION", &options.target.region)
            .env("AWS_DEFAULT_REGION", &options.target.region);
        if let Some(profile) = &options.target.profile {
            command.env("AWS_PROFILE", profile);
        }
        let output = run_command(command, self.timeout).await?;
        if options.verbosity > 0 {
            tracing::debug!(stack, "{}", String::from_utf8_lossy(&output.stdout).trim_end());
        }
        Ok(output)
    }

    async fn deploy(&self, stacks: &[String], case: &str, outdir: &Path, options: &CaseOptions) -> Result<(), CollaboratorError> {
        for stack in stacks {
            let output = self
                .run_template(&self.commands.deploy, stack, case, outdir, options)
                .await?;
            if !output.status.success() {
                return Err(CollaboratorError::Deployment(format!("{stack} {}", failure_text(&output))));
            }
        }
        Ok(())
    }

    async fn destroy(&self, stacks: &[String], case: &str, outdir: &Path, options: &CaseOptions) -> Result<(), CollaboratorError> {
        for stack in stacks.iter().rev() {
            let output = self
                .run_template(&self.commands.destroy, stack, case, outdir, options)
                .await?;
            if !output.status.success() {
                return Err(CollaboratorError::Destroy(format!("{stack} {}", failure_text(&output))));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TestCaseRunner for ShellTestCaseRunner {
    async fn list_test_cases(&self, test: &TestDescriptor) -> Result<Vec<String>, CollaboratorError> {
        let output_dir = test.temporary_output_dir();
        let lock = Arc::clone(self.listing.entry(output_dir.to_path_buf()).or_default().value());
        let _guard = lock.lock().await;

        let listed = match self.synthesizer.synthesize_into(test, output_dir).await {
            Ok(_) => read_test_cases(output_dir).await,
            Err(e) => Err(e),
        };
        remove_dir(output_dir).await?;
        Ok(listed?.unwrap_or_else(|| vec![test.normalized_name().to_string()]))
    }

    async fn run_test_case(
        &self,
        test: &TestDescriptor,
        test_case: &str,
        options: &CaseOptions,
    ) -> Result<Option<AssertionResults>, CollaboratorError> {
        let output_dir = test.target_output_dir(&options.target);
        let outdir = output_dir.as_path();
        let assembly = self.synthesizer.synthesize_into(test, outdir).await?;
        if options.dry_run {
            return Ok(None);
        }
        let stacks: Vec<String> = assembly.templates.into_keys().collect();

        if options.update_workflow && self.store.exists(test).await {
            let previous: Vec<String> = self.store.load(test).await?.templates.into_keys().collect();
            tracing::info!(test = %test, case = test_case, "deploying recorded snapshot first");
            self.deploy(&previous, test_case, test.snapshot_dir(), options).await?;
        }

        let results = match self.deploy(&stacks, test_case, outdir, options).await {
            Ok(()) => read_assertion_results(outdir).await,
            Err(e) => Err(e),
        };

        if options.clean {
            match (self.destroy(&stacks, test_case, outdir, options).await, &results) {
                (Err(e), Ok(_)) => return Err(e),
                (Err(e), Err(_)) => tracing::warn!(test = %test, error = %e, "cleanup failed after failed deploy"),
                (Ok(()), _) => {}
            }
        }
        results
    }

    async fn update_snapshot(&self, test: &TestDescriptor, target: &Target) -> Result<(), CollaboratorError> {
        self.store.update(test, &test.target_output_dir(target)).await
    }
}
