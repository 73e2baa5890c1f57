//! integ-cli - the `integ-runner` binary's building blocks
//!
//! Discovery, the process and filesystem collaborators, console reporting and
//! the wiring that hands everything to [`integ_core::RunCoordinator`].

pub mod cli;
pub mod console;
pub mod discovery;
pub mod process;
pub mod snapshot_store;
pub mod watch;

pub use cli::{command, from_matches, parse_from, CliArgs};
pub use console::ConsoleReporter;
pub use discovery::{discover, DiscoveryError, DiscoveryOptions, Language};
pub use process::{CommandSynthesizer, CommandTemplates, ShellTestCaseRunner};
pub use snapshot_store::DirectorySnapshotStore;
pub use watch::FsChangeSource;

use integ_core::{IntegrationExecutor, JsonTemplateDiffer, Reporter, RunCoordinator, SnapshotVerifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Build a coordinator backed by the process and filesystem collaborators
#[must_use]
pub fn build_coordinator(args: &CliArgs, reporter: Arc<dyn Reporter>) -> RunCoordinator {
    let synthesizer = Arc::new(CommandSynthesizer::new().with_timeout(args.synth_timeout));
    let store = Arc::new(DirectorySnapshotStore::new());
    let differ = Arc::new(JsonTemplateDiffer::new().with_security_flagging(true));

    let verifier = SnapshotVerifier::new(synthesizer.clone(), store.clone(), differ)
        .with_watchdog(Duration::from_secs(args.config.watchdog_secs))
        .with_security_changes(args.security_changes)
        .with_retained_output(args.config.retain_failed_output);
    let runner = ShellTestCaseRunner::new(synthesizer, store).with_commands(args.commands.clone());
    let executor = IntegrationExecutor::new(Arc::new(runner));

    RunCoordinator::new(args.config.clone(), verifier, executor, reporter)
}

/// Discover tests under `cwd` and run them
///
/// Returns the process exit code.
///
/// # Errors
/// Fails on discovery errors, invalid run configuration or a watcher that
/// cannot be started.
pub async fn run(args: CliArgs, cwd: &Path, reporter: Arc<dyn Reporter>) -> anyhow::Result<i32> {
    let tests = discover(&args.discovery, cwd)?;

    if args.list {
        for test in &tests {
            reporter.print(test.display_name());
        }
        return Ok(0);
    }
    if tests.is_empty() {
        reporter.warning(&format!("No tests found in {}", args.discovery.directory.display()));
    }

    let mut coordinator = build_coordinator(&args, Arc::clone(&reporter));
    if let [test] = tests.as_slice() {
        if args.config.watch {
            coordinator = coordinator.with_change_source(Box::new(FsChangeSource::new(test)?));
        }
    }

    let report = coordinator.run(tests).await?;
    if let Err(verdict) = &report.verdict {
        reporter.error(&verdict.to_string());
    }
    tracing::debug!(
        jobs = report.pool_stats.jobs_submitted,
        panicked = report.pool_stats.jobs_panicked,
        "run finished"
    );
    Ok(report.exit_code())
}
