use integ_core::{
    CollaboratorError, DiagnosticReason, PoolError, ResourceImpact, RunError, RunnerConfig, Target,
    TargetDistribution, ValidationError, VerdictError, WorkerPool,
};
use integ_test_utils::{descriptor, Harness, ScriptedChangeSource};
use pretty_assertions::assert_eq;

fn names(results: &[integ_core::WorkerResult]) -> Vec<&str> {
    results.iter().map(|r| r.test.display_name()).collect()
}

#[tokio::test]
async fn test_snapshot_only_run_fails_on_destructive_change() {
    let harness = Harness::new();
    let tests = harness.scenario_abc();

    let report = harness.coordinator(RunnerConfig::new()).run(tests).await.unwrap();

    assert_eq!(names(&report.carried), vec!["integ.a", "integ.c"]);
    assert!(matches!(report.verdict, Err(VerdictError::DestructiveChanges { .. })));
    assert_eq!(report.exit_code(), 1);
    assert!(report.integration.is_none());
    assert!(harness.runner.calls().is_empty());

    assert_eq!(harness.reporter.reasons_for("integ.a"), vec![DiagnosticReason::NoSnapshot]);
    assert_eq!(harness.reporter.reasons_for("integ.b"), vec![DiagnosticReason::SnapshotSuccess]);
    assert_eq!(harness.reporter.reasons_for("integ.c"), vec![DiagnosticReason::SnapshotMismatch]);
    assert!(harness
        .reporter
        .warnings()
        .contains(&"!!! This test contains destructive changes !!!".to_string()));
    assert!(harness.reporter.lines().contains(&"Tests: 2 failed, 3 total".to_string()));
}

#[tokio::test]
async fn test_force_runs_everything_but_destructive_still_fails() {
    let harness = Harness::new();
    let tests = harness.scenario_abc();

    let report = harness
        .coordinator(RunnerConfig::new().with_force(true))
        .run(tests)
        .await
        .unwrap();

    let ran: Vec<String> = harness.runner.calls().into_iter().map(|c| c.test).collect();
    assert_eq!(ran.len(), 3);
    for name in ["integ.a", "integ.b", "integ.c"] {
        assert!(ran.iter().any(|r| r == name), "{name} did not run");
    }
    assert!(report.integration.as_ref().unwrap().success);

    match report.verdict {
        Err(VerdictError::DestructiveChanges { changes }) => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].logical_id, "Bucket");
            assert_eq!(changes[0].impact, ResourceImpact::WillReplace);
        }
        other => panic!("unexpected verdict {other:?}"),
    }
}

#[tokio::test]
async fn test_drift_without_escalation_points_at_update_on_failed() {
    let harness = Harness::new();
    let tests = vec![harness.matching("integ.ok"), harness.drifted("integ.drift")];

    let report = harness.coordinator(RunnerConfig::new()).run(tests).await.unwrap();

    let err = report.verdict.unwrap_err();
    assert_eq!(err, VerdictError::TestsFailed { failed: 1 });
    assert!(err.to_string().contains("--update-on-failed"));
}

#[tokio::test]
async fn test_update_on_failed_remediates_drift() {
    let harness = Harness::new();
    let tests = vec![harness.matching("integ.ok"), harness.drifted("integ.drift")];

    let report = harness
        .coordinator(RunnerConfig::new().with_update_on_failed(true))
        .run(tests)
        .await
        .unwrap();

    assert_eq!(report.verdict, Ok(()));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(harness.runner.updates(), vec!["integ.drift".to_string()]);
    assert_eq!(
        harness.reporter.reasons_for("integ.drift-default"),
        vec![DiagnosticReason::TestSuccess]
    );
}

#[tokio::test]
async fn test_failed_integration_run_fails_verdict() {
    let harness = Harness::new();
    let drift = harness.drifted("integ.drift");
    harness
        .runner
        .fail_case(&drift, "default", CollaboratorError::Deployment("rollback".into()));

    let report = harness
        .coordinator(RunnerConfig::new().with_update_on_failed(true))
        .run(vec![drift])
        .await
        .unwrap();

    assert_eq!(report.verdict, Err(VerdictError::IntegrationFailed { failed: 1 }));
    assert!(harness.runner.updates().is_empty());
    assert_eq!(
        harness.reporter.reasons_for("integ.drift-default (us-east-1)"),
        vec![DiagnosticReason::TestFailed]
    );
}

#[tokio::test]
async fn test_integration_covers_region_profile_matrix() {
    let harness = Harness::new();
    let tests = vec![harness.unrecorded("integ.x"), harness.unrecorded("integ.y")];
    let config = RunnerConfig::new()
        .with_update_on_failed(true)
        .with_regions(["us-east-1", "eu-west-1"])
        .with_profiles(["dev", "prod"])
        .with_verbose(true);

    let report = harness.coordinator(config).run(tests).await.unwrap();

    assert_eq!(harness.runner.calls().len(), 8);
    let mut updates = harness.runner.update_targets();
    updates.sort();
    let first = Target::new("us-east-1", Some("dev".to_string()));
    assert_eq!(
        updates,
        vec![("integ.x".to_string(), first.clone()), ("integ.y".to_string(), first)]
    );
    assert_eq!(report.metrics().len(), 4);
    for metrics in report.metrics() {
        assert_eq!(metrics.tests.len(), 2);
    }
    assert!(harness
        .reporter
        .lines()
        .contains(&"--- Integration test metrics ---".to_string()));
}

#[tokio::test]
async fn test_failure_in_one_region_keeps_old_snapshot() {
    let harness = Harness::new();
    let drift = harness.drifted("integ.drift");
    harness.runner.fail_case_in(
        &drift,
        "default",
        "eu-west-1",
        CollaboratorError::Deployment("rollback".into()),
    );
    let config = RunnerConfig::new()
        .with_update_on_failed(true)
        .with_regions(["us-east-1", "eu-west-1", "ap-south-1"]);

    let report = harness.coordinator(config).run(vec![drift]).await.unwrap();

    assert_eq!(report.verdict, Err(VerdictError::IntegrationFailed { failed: 1 }));
    assert!(harness.runner.updates().is_empty());
    assert_eq!(
        harness.reporter.reasons_for("integ.drift-default"),
        vec![DiagnosticReason::TestSuccess, DiagnosticReason::TestSuccess]
    );
    assert_eq!(
        harness.reporter.reasons_for("integ.drift-default (eu-west-1)"),
        vec![DiagnosticReason::TestFailed]
    );
}

#[tokio::test]
async fn test_failed_snapshot_recording_fails_the_test() {
    let harness = Harness::new();
    let drift = harness.drifted("integ.drift");
    harness
        .runner
        .fail_update(&drift, CollaboratorError::Snapshot("disk full".into()));

    let report = harness
        .coordinator(RunnerConfig::new().with_update_on_failed(true))
        .run(vec![drift])
        .await
        .unwrap();

    assert_eq!(report.verdict, Err(VerdictError::IntegrationFailed { failed: 1 }));
    assert_eq!(
        harness.reporter.reasons_for("integ.drift (us-east-1)"),
        vec![DiagnosticReason::TestFailed]
    );
}

#[tokio::test]
async fn test_forced_run_with_passing_snapshots_ignores_integration_failure() {
    let harness = Harness::new();
    let ok = harness.matching("integ.ok");
    harness
        .runner
        .fail_case(&ok, "default", CollaboratorError::Deployment("rollback".into()));

    let report = harness
        .coordinator(RunnerConfig::new().with_force(true))
        .run(vec![ok])
        .await
        .unwrap();

    assert!(report.carried.is_empty());
    assert!(!report.integration.as_ref().unwrap().success);
    assert_eq!(report.verdict, Ok(()));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn test_shared_queue_runs_each_test_once() {
    let harness = Harness::new();
    let tests = vec![
        harness.unrecorded("integ.x"),
        harness.unrecorded("integ.y"),
        harness.unrecorded("integ.z"),
    ];
    let config = RunnerConfig::new()
        .with_update_on_failed(true)
        .with_regions(["us-east-1", "eu-west-1"])
        .with_distribution(TargetDistribution::SharedQueue);

    let report = harness.coordinator(config).run(tests).await.unwrap();

    let mut ran: Vec<String> = harness.runner.calls().into_iter().map(|c| c.test).collect();
    ran.sort();
    assert_eq!(ran, vec!["integ.x", "integ.y", "integ.z"]);
    assert_eq!(report.verdict, Ok(()));
}

#[tokio::test]
async fn test_panicking_deploy_becomes_test_error() {
    let harness = Harness::new();
    let boom = harness.unrecorded("integ.boom");
    harness.runner.panic_on(&boom);

    let report = harness
        .coordinator(RunnerConfig::new().with_update_on_failed(true))
        .run(vec![boom, harness.unrecorded("integ.fine")])
        .await
        .unwrap();

    assert!(matches!(report.verdict, Err(VerdictError::IntegrationFailed { failed: 1 })));
    assert_eq!(
        harness.reporter.reasons_for("test/integ.boom.js (us-east-1)"),
        vec![DiagnosticReason::TestError]
    );
    assert_eq!(report.pool_stats.jobs_panicked, 1);
}

#[tokio::test]
async fn test_clean_disabled_warns() {
    let harness = Harness::new();
    let mut config = RunnerConfig::new().with_update_on_failed(true);
    config.clean = false;

    harness
        .coordinator(config)
        .run(vec![harness.unrecorded("integ.x")])
        .await
        .unwrap();

    assert!(harness
        .reporter
        .warnings()
        .contains(&"Not cleaning up stacks since clean is disabled".to_string()));
}

#[tokio::test]
async fn test_watch_rejects_multiple_regions_before_any_work() {
    let harness = Harness::new();
    let config = RunnerConfig::new()
        .with_watch(true)
        .with_regions(["us-east-1", "eu-west-1"]);

    let err = harness
        .coordinator(config)
        .run(vec![harness.matching("integ.w")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RunError::Validation(ValidationError::WatchRequiresSingleTarget { regions: 2, .. })
    ));
    assert_eq!(harness.synthesizer.calls(), 0);
    assert!(harness.runner.calls().is_empty());
}

#[tokio::test]
async fn test_watch_rejects_multiple_tests() {
    let harness = Harness::new();
    let err = harness
        .coordinator(RunnerConfig::new().with_watch(true))
        .run(vec![harness.matching("integ.a"), harness.matching("integ.b")])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Validation(ValidationError::WatchRequiresSingleTarget { tests: 2, .. })
    ));
}

#[tokio::test]
async fn test_watch_loops_until_changes_stop() {
    let harness = Harness::new();
    let test = harness.matching("integ.w");
    let config = RunnerConfig::new().with_watch(true).with_force(true).with_max_workers(8);

    let report = harness
        .coordinator(config)
        .with_change_source(Box::new(ScriptedChangeSource::new(2)))
        .run(vec![test])
        .await
        .unwrap();

    let watch = report.watch.unwrap();
    assert_eq!(watch.iterations, 3);
    assert!(!watch.last_failed);
    assert_eq!(harness.runner.calls().len(), 3);
    assert!(harness.runner.updates().is_empty());
    assert_eq!(harness.synthesizer.calls(), 0);
    assert!(report.integration.is_none());
    assert_eq!(report.verdict, Ok(()));
    assert!(harness
        .reporter
        .warnings()
        .iter()
        .any(|w| w.contains("ignored in watch mode") && w.contains("--force")));
}

#[tokio::test]
async fn test_watch_without_test_cases_is_an_error() {
    let harness = Harness::new();
    let pool = WorkerPool::new(1, true).unwrap();
    let err = harness
        .coordinator(RunnerConfig::new().with_watch(true))
        .run_with_pool(&pool, vec![descriptor("integ.empty")])
        .await
        .unwrap_err();
    pool.terminate();

    assert!(matches!(err, RunError::NoTestCases { .. }));
    assert_eq!(pool.stats().jobs_submitted, 0);
}

#[tokio::test]
async fn test_pool_terminated_exactly_once() {
    let harness = Harness::new();
    let report = harness
        .coordinator(RunnerConfig::new().with_update_on_failed(true))
        .run(harness.scenario_abc())
        .await
        .unwrap();

    assert_eq!(report.pool_stats.terminate_calls, 1);
    assert_eq!(report.pool_stats.jobs_dropped, 0);
    assert_eq!(report.pool_stats.jobs_submitted, report.pool_stats.jobs_completed);
}

#[tokio::test]
async fn test_caller_pool_left_clean_after_error() {
    let harness = Harness::new();
    let pool = WorkerPool::new(4, true).unwrap();
    let coordinator = harness.coordinator(RunnerConfig::new().with_watch(true));

    let result = coordinator.run_with_pool(&pool, vec![descriptor("integ.empty")]).await;
    pool.terminate();

    assert!(result.is_err());
    assert_eq!(pool.in_flight(), 0);
    assert_eq!(pool.stats().terminate_calls, 1);
    assert_eq!(pool.exec("late", async {}).unwrap_err(), PoolError::Terminated);
}
