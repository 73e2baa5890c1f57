//! Command line parsing
//!
//! A `--config` JSON file supplies a base [`RunnerConfig`]; flags given on the
//! command line override it.

use crate::discovery::{DiscoveryOptions, Language};
use crate::process::{CommandTemplates, DEFAULT_DEPLOY_COMMAND, DEFAULT_DESTROY_COMMAND};
use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use integ_core::{RunnerConfig, TargetDistribution};
use std::path::PathBuf;
use std::time::Duration;

/// Everything the binary needs to run
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    /// Run configuration handed to the coordinator
    pub config: RunnerConfig,
    /// Test discovery options
    pub discovery: DiscoveryOptions,
    /// Print discovered tests and exit
    pub list: bool,
    /// Deploy / destroy command templates
    pub commands: CommandTemplates,
    /// Timeout for synthesizing one test program
    pub synth_timeout: Duration,
    /// Flag security-relevant updates as destructive
    pub security_changes: bool,
    /// Emit logs as JSON
    pub log_json: bool,
}

/// Build the command definition
#[must_use]
pub fn command() -> Command {
    Command::new("integ-runner")
        .version(integ_core::VERSION)
        .about("Verify integration test snapshots and run integration tests")
        .arg(
            Arg::new("tests")
                .num_args(0..)
                .help("Tests to include (or exclude with --exclude); name, path or display name"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("JSON file with run options; flags override its values"),
        )
        .arg(
            Arg::new("directory")
                .long("directory")
                .default_value("test")
                .value_parser(value_parser!(PathBuf))
                .help("Directory to search for tests"),
        )
        .arg(
            Arg::new("language")
                .long("language")
                .action(ArgAction::Append)
                .help("Language presets to discover (javascript, typescript, python, go)"),
        )
        .arg(
            Arg::new("test-regex")
                .long("test-regex")
                .action(ArgAction::Append)
                .help("File name pattern for test programs; replaces the language presets"),
        )
        .arg(
            Arg::new("app")
                .long("app")
                .help("Command used to run a test program; {filePath} is replaced with its path"),
        )
        .arg(
            Arg::new("exclude")
                .long("exclude")
                .action(ArgAction::SetTrue)
                .help("Run every test except those named"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .help("Fail when a named test does not exist"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .help("List discovered tests and exit"),
        )
        .arg(
            Arg::new("max-workers")
                .long("max-workers")
                .value_parser(value_parser!(usize))
                .help("Maximum number of concurrent workers [default: 16]"),
        )
        .arg(
            Arg::new("parallel-regions")
                .long("parallel-regions")
                .action(ArgAction::Append)
                .value_delimiter(',')
                .help("Regions to run integration tests in [default: us-east-1]"),
        )
        .arg(
            Arg::new("profiles")
                .long("profiles")
                .action(ArgAction::Append)
                .value_delimiter(',')
                .help("Credential profiles to run integration tests with"),
        )
        .arg(
            Arg::new("distribution")
                .long("distribution")
                .value_parser(["cross-product", "shared-queue"])
                .help("How integration jobs are spread over regions and profiles"),
        )
        .arg(flag("watch", "Watch a single test and re-run it on every change"))
        .arg(flag("force", "Run integration tests for every test, not only failed snapshots"))
        .arg(flag("dry-run", "Synthesize only; never deploy"))
        .arg(flag("update-on-failed", "Run integration tests for failed snapshots and update them"))
        .arg(flag(
            "disable-update-workflow",
            "Skip deploying the recorded snapshot before the new output",
        ))
        .arg(flag("no-clean", "Keep deployed stacks after each test case"))
        .arg(flag("inspect-failures", "Keep the synthesized output of failed snapshot checks"))
        .arg(flag("strict-security", "Treat security-relevant updates as destructive"))
        .arg(flag("log-json", "Emit logs as JSON"))
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Print metrics; repeat for more collaborator output"),
        )
        .arg(
            Arg::new("snapshot-batch-size")
                .long("snapshot-batch-size")
                .value_parser(value_parser!(usize))
                .help("Tests per snapshot job [default: 3]"),
        )
        .arg(
            Arg::new("watchdog-secs")
                .long("watchdog-secs")
                .value_parser(value_parser!(u64))
                .help("Seconds before a slow snapshot check is reported [default: 60]"),
        )
        .arg(
            Arg::new("synth-timeout-secs")
                .long("synth-timeout-secs")
                .default_value("600")
                .value_parser(value_parser!(u64))
                .help("Seconds before synthesizing a test program is abandoned"),
        )
        .arg(
            Arg::new("deploy-command")
                .long("deploy-command")
                .default_value(DEFAULT_DEPLOY_COMMAND)
                .help("Deploy command template ({stack} {region} {profile} {testCase} {outdir})"),
        )
        .arg(
            Arg::new("destroy-command")
                .long("destroy-command")
                .default_value(DEFAULT_DESTROY_COMMAND)
                .help("Destroy command template ({stack} {region} {profile} {testCase} {outdir})"),
        )
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
}

fn strings(matches: &ArgMatches, id: &str) -> Option<Vec<String>> {
    matches.get_many::<String>(id).map(|v| v.cloned().collect())
}

/// Load a run configuration file
///
/// # Errors
/// Fails when the file cannot be read or is not a valid configuration.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<RunnerConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid configuration in {}", path.display()))
}

/// Resolve parsed arguments into [`CliArgs`]
///
/// # Errors
/// Fails on an unreadable `--config` file or an unknown `--language`.
pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<CliArgs> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => load_config(path)?,
        None => RunnerConfig::new(),
    };

    if let Some(max) = matches.get_one::<usize>("max-workers") {
        config = config.with_max_workers(*max);
    }
    if let Some(regions) = strings(matches, "parallel-regions") {
        config = config.with_regions(regions);
    }
    if let Some(profiles) = strings(matches, "profiles") {
        config = config.with_profiles(profiles);
    }
    if let Some(distribution) = matches.get_one::<String>("distribution") {
        config = config.with_distribution(match distribution.as_str() {
            "shared-queue" => TargetDistribution::SharedQueue,
            _ => TargetDistribution::CrossProduct,
        });
    }
    if let Some(size) = matches.get_one::<usize>("snapshot-batch-size") {
        config = config.with_snapshot_batch_size(*size);
    }
    if let Some(secs) = matches.get_one::<u64>("watchdog-secs") {
        config.watchdog_secs = *secs;
    }

    config.watch |= matches.get_flag("watch");
    config.force |= matches.get_flag("force");
    config.dry_run |= matches.get_flag("dry-run");
    config.run_update_on_failed |= matches.get_flag("update-on-failed");
    config.disable_update_workflow |= matches.get_flag("disable-update-workflow");
    config.retain_failed_output |= matches.get_flag("inspect-failures");
    if matches.get_flag("no-clean") {
        config.clean = false;
    }
    let verbosity = matches.get_count("verbose");
    if verbosity > 0 {
        config.verbose = true;
        config.verbosity = verbosity.min(4);
    }

    let languages = match strings(matches, "language") {
        Some(names) => names
            .iter()
            .map(|n| n.parse::<Language>())
            .collect::<Result<Vec<_>, _>>()?,
        None => Language::ALL.to_vec(),
    };
    let discovery = DiscoveryOptions {
        directory: matches
            .get_one::<PathBuf>("directory")
            .cloned()
            .unwrap_or_else(|| PathBuf::from("test")),
        languages,
        test_regex: strings(matches, "test-regex").unwrap_or_default(),
        app: matches.get_one::<String>("app").cloned(),
        names: strings(matches, "tests").unwrap_or_default(),
        exclude: matches.get_flag("exclude"),
        strict: matches.get_flag("strict"),
    };

    let commands = CommandTemplates {
        deploy: matches
            .get_one::<String>("deploy-command")
            .cloned()
            .unwrap_or_else(|| DEFAULT_DEPLOY_COMMAND.to_string()),
        destroy: matches
            .get_one::<String>("destroy-command")
            .cloned()
            .unwrap_or_else(|| DEFAULT_DESTROY_COMMAND.to_string()),
    };

    Ok(CliArgs {
        config,
        discovery,
        list: matches.get_flag("list"),
        commands,
        synth_timeout: Duration::from_secs(matches.get_one::<u64>("synth-timeout-secs").copied().unwrap_or(600)),
        security_changes: matches.get_flag("strict-security"),
        log_json: matches.get_flag("log-json"),
    })
}

/// Parse `argv` into [`CliArgs`]
///
/// # Errors
/// Fails on invalid arguments or configuration.
pub fn parse_from<I, T>(argv: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = command().try_get_matches_from(argv)?;
    from_matches(&matches)
}
