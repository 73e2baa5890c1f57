use integ_cli::{parse_from, run};
use integ_core::{DiagnosticReason, Reporter};
use integ_test_utils::RecordingReporter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_tree(root: &Path) -> PathBuf {
    let test = root.join("test");
    fs::create_dir_all(test.join("nested")).unwrap();
    fs::write(test.join("integ.a.js"), "").unwrap();
    fs::write(test.join("nested/integ.b.js"), "").unwrap();
    fs::write(test.join("helper.js"), "").unwrap();
    test
}

fn argv(extra: &[&str]) -> Vec<String> {
    std::iter::once("integ-runner")
        .chain(extra.iter().copied())
        .map(String::from)
        .collect()
}

#[tokio::test]
async fn test_list_prints_display_names() {
    let dir = tempfile::tempdir().unwrap();
    let test_dir = write_tree(dir.path());
    let reporter = Arc::new(RecordingReporter::default());

    let args = parse_from(argv(&["--list", "--directory", test_dir.to_str().unwrap()])).unwrap();
    let code = run(args, dir.path(), reporter.clone()).await.unwrap();

    assert_eq!(code, 0);
    assert_eq!(reporter.lines(), vec!["integ.a", "nested/integ.b"]);
    assert!(reporter.diagnostics().is_empty());
}

#[tokio::test]
async fn test_strict_unknown_name_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let test_dir = write_tree(dir.path());
    let reporter: Arc<dyn Reporter> = Arc::new(RecordingReporter::default());

    let args = parse_from(argv(&[
        "integ.missing",
        "--strict",
        "--directory",
        test_dir.to_str().unwrap(),
    ]))
    .unwrap();
    let err = run(args, dir.path(), reporter).await.unwrap_err();
    assert!(err.to_string().contains("integ.missing"));
}

#[tokio::test]
async fn test_watch_with_two_tests_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let test_dir = write_tree(dir.path());
    let reporter: Arc<dyn Reporter> = Arc::new(RecordingReporter::default());

    let args = parse_from(argv(&["--watch", "--directory", test_dir.to_str().unwrap()])).unwrap();
    let err = run(args, dir.path(), reporter).await.unwrap_err();
    assert!(err.to_string().contains("single test"));
}

#[cfg(unix)]
mod end_to_end {
    use super::*;

    const QUEUE_30: &str = r#"{"Resources":{"Queue":{"Type":"AWS::SQS::Queue","Properties":{"VisibilityTimeout":30}}}}"#;
    const QUEUE_60: &str = r#"{"Resources":{"Queue":{"Type":"AWS::SQS::Queue","Properties":{"VisibilityTimeout":60}}}}"#;
    const BUCKET: &str = r#"{"Resources":{"Queue":{"Type":"AWS::S3::Bucket"}}}"#;

    fn write_program(test_dir: &Path, template: &str) {
        fs::write(
            test_dir.join("integ.queue.sh"),
            format!("printf '%s' '{template}' > \"$INTEG_OUTDIR/Stack.template.json\"\n"),
        )
        .unwrap();
    }

    async fn invoke(test_dir: &Path, deploy: &str, extra: &[&str]) -> (i32, Arc<RecordingReporter>) {
        let directory = test_dir.to_str().unwrap();
        let mut flags = vec![
            "--directory",
            directory,
            "--test-regex",
            r"^integ\..*\.sh$",
            "--app",
            "sh {filePath}",
            "--deploy-command",
            deploy,
            "--destroy-command",
            "true {stack}",
        ];
        flags.extend_from_slice(extra);

        let reporter = Arc::new(RecordingReporter::default());
        let args = parse_from(argv(&flags)).unwrap();
        // An unrelated working directory keeps every path absolute.
        let cwd = tempfile::tempdir().unwrap();
        let code = run(args, cwd.path(), reporter.clone()).await.unwrap();
        (code, reporter)
    }

    #[tokio::test]
    async fn test_record_verify_and_detect_changes() {
        let dir = tempfile::tempdir().unwrap();
        let test_dir = dir.path().join("test");
        fs::create_dir_all(&test_dir).unwrap();
        write_program(&test_dir, QUEUE_30);

        let (code, reporter) = invoke(&test_dir, "true {stack}", &[]).await;
        assert_eq!(code, 1);
        assert_eq!(reporter.reasons_for("integ.queue"), vec![DiagnosticReason::NoSnapshot]);
        assert!(reporter.errors().iter().any(|e| e.contains("--update-on-failed")));

        let (code, reporter) = invoke(&test_dir, "true {stack}", &["--update-on-failed"]).await;
        assert_eq!(code, 0);
        assert_eq!(
            reporter.reasons_for("integ.queue-integ.queue"),
            vec![DiagnosticReason::TestSuccess]
        );
        assert!(test_dir.join("integ.queue.sh.snapshot/Stack.template.json").is_file());
        assert!(!test_dir.join("integ.out.integ.queue.sh.snapshot").exists());

        let (code, reporter) = invoke(&test_dir, "true {stack}", &[]).await;
        assert_eq!(code, 0);
        assert_eq!(reporter.reasons_for("integ.queue"), vec![DiagnosticReason::SnapshotSuccess]);

        write_program(&test_dir, QUEUE_60);
        let (code, reporter) = invoke(&test_dir, "true {stack}", &[]).await;
        assert_eq!(code, 1);
        assert_eq!(reporter.reasons_for("integ.queue"), vec![DiagnosticReason::SnapshotMismatch]);
        assert!(reporter.warnings().is_empty());

        write_program(&test_dir, BUCKET);
        let (code, reporter) = invoke(&test_dir, "true {stack}", &[]).await;
        assert_eq!(code, 1);
        assert!(reporter
            .warnings()
            .contains(&"!!! This test contains destructive changes !!!".to_string()));
        assert!(reporter.errors().iter().any(|e| e.contains("destructive")));
    }

    #[tokio::test]
    async fn test_update_across_regions_records_one_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let test_dir = dir.path().join("test");
        fs::create_dir_all(&test_dir).unwrap();
        write_program(&test_dir, QUEUE_30);
        let script = dir.path().join("deploy.sh");
        fs::write(&script, "sleep 0.1\n").unwrap();
        let deploy = format!("sh {} {{stack}}", script.display());

        let (code, reporter) = invoke(
            &test_dir,
            &deploy,
            &["--update-on-failed", "--parallel-regions", "us-east-1,eu-west-1,ap-south-1"],
        )
        .await;

        assert_eq!(code, 0, "errors: {:?}", reporter.errors());
        assert_eq!(
            reporter.reasons_for("integ.queue-integ.queue"),
            vec![DiagnosticReason::TestSuccess; 3]
        );
        assert!(!reporter
            .diagnostics()
            .iter()
            .any(|d| d.reason == DiagnosticReason::TestFailed));
        assert!(test_dir.join("integ.queue.sh.snapshot/Stack.template.json").is_file());

        let leftovers: Vec<String> = fs::read_dir(&test_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("integ.out."))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_failing_deploy_is_reported_per_case() {
        let dir = tempfile::tempdir().unwrap();
        let test_dir = dir.path().join("test");
        fs::create_dir_all(&test_dir).unwrap();
        write_program(&test_dir, QUEUE_30);

        let (code, reporter) = invoke(&test_dir, "false {stack}", &["--update-on-failed"]).await;

        assert_eq!(code, 1);
        assert_eq!(
            reporter.reasons_for("integ.queue-integ.queue (us-east-1)"),
            vec![DiagnosticReason::TestFailed]
        );
        assert!(!test_dir.join("integ.queue.sh.snapshot").exists());
    }
}
