//! On-disk snapshots
//!
//! A snapshot is a directory next to the test program
//! (`integ.foo.js.snapshot/`) holding one `<Stack>.template.json` per stack and
//! an optional `integ.json` manifest listing the test cases. Fresh synthesis
//! output uses the same layout under `integ.out.integ.foo.js.snapshot/`, and
//! deployments write theirs under one `integ.out.integ.foo.js.<target>.snapshot/`
//! per target.

use async_trait::async_trait;
use integ_core::{Assembly, AssertionResults, CollaboratorError, SnapshotStore, TestDescriptor};
use std::io::ErrorKind;
use std::path::Path;

/// Suffix of stack template files
pub const TEMPLATE_SUFFIX: &str = ".template.json";
/// Test case manifest file name
pub const MANIFEST_FILE: &str = "integ.json";
/// Assertion results file name
pub const ASSERTION_RESULTS_FILE: &str = "assertion-results.json";

/// Read every stack template in `dir`
///
/// # Errors
/// Returns [`CollaboratorError::Snapshot`] when the directory or a template
/// cannot be read or parsed.
pub async fn read_assembly(dir: &Path) -> Result<Assembly, CollaboratorError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CollaboratorError::Snapshot(format!("{}: {e}", dir.display())))?;

    let mut assembly = Assembly::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stack) = name.strip_suffix(TEMPLATE_SUFFIX) else {
            continue;
        };
        let path = entry.path();
        let bytes = tokio::fs::read(&path).await?;
        let template = serde_json::from_slice(&bytes)
            .map_err(|e| CollaboratorError::Snapshot(format!("{}: {e}", path.display())))?;
        assembly.templates.insert(stack.to_string(), template);
    }
    Ok(assembly)
}

/// Test case names declared by the manifest in `dir`, in declaration order
///
/// Returns `None` when there is no manifest.
///
/// # Errors
/// Returns [`CollaboratorError::Snapshot`] for an unreadable manifest.
pub async fn read_test_cases(dir: &Path) -> Result<Option<Vec<String>>, CollaboratorError> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let manifest: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| CollaboratorError::Snapshot(format!("{}: {e}", path.display())))?;
    let cases = manifest
        .get("testCases")
        .and_then(serde_json::Value::as_object)
        .map(|cases| cases.keys().cloned().collect())
        .unwrap_or_default();
    Ok(Some(cases))
}

/// Assertion results written by the last deployment in `dir`
///
/// # Errors
/// Returns [`CollaboratorError::Deployment`] for a malformed results file.
pub async fn read_assertion_results(dir: &Path) -> Result<Option<AssertionResults>, CollaboratorError> {
    let path = dir.join(ASSERTION_RESULTS_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CollaboratorError::Deployment(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove `dir` recursively; a missing directory is not an error
///
/// # Errors
/// Returns [`CollaboratorError::Io`] for any other failure.
pub async fn remove_dir(dir: &Path) -> Result<(), CollaboratorError> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Snapshots stored next to each test program
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectorySnapshotStore;

impl DirectorySnapshotStore {
    /// Create new store
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Replace the recorded snapshot with the synthesis output in `output`
    ///
    /// Output directories left behind by the test's other targets are
    /// removed as well.
    ///
    /// # Errors
    /// Returns [`CollaboratorError::Snapshot`] when there is no output to
    /// record, or the directories cannot be moved.
    pub async fn update(&self, test: &TestDescriptor, output: &Path) -> Result<(), CollaboratorError> {
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(CollaboratorError::Snapshot(format!(
                "no synthesis output to record for {test}"
            )));
        }
        let snapshot = test.snapshot_dir();
        remove_dir(snapshot).await?;
        tokio::fs::rename(output, snapshot)
            .await
            .map_err(|e| CollaboratorError::Snapshot(format!("{}: {e}", snapshot.display())))?;
        tracing::info!(test = %test, snapshot = %snapshot.display(), "snapshot updated");
        remove_output_dirs(test).await
    }
}

/// Remove the temporary and per-target output directories of `test`
async fn remove_output_dirs(test: &TestDescriptor) -> Result<(), CollaboratorError> {
    let output = test.temporary_output_dir();
    let Some(parent) = output.parent() else {
        return Ok(());
    };
    let Some(stem) = output
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_suffix(".snapshot"))
    else {
        return Ok(());
    };
    let dir = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(target) = name
            .strip_prefix(stem)
            .and_then(|rest| rest.strip_suffix(".snapshot"))
        else {
            continue;
        };
        if target.is_empty() || target.strip_prefix('.').is_some_and(|t| !t.contains('.')) {
            remove_dir(&entry.path()).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl SnapshotStore for DirectorySnapshotStore {
    async fn exists(&self, test: &TestDescriptor) -> bool {
        tokio::fs::metadata(test.snapshot_dir())
            .await
            .is_ok_and(|m| m.is_dir())
    }

    async fn load(&self, test: &TestDescriptor) -> Result<Assembly, CollaboratorError> {
        read_assembly(test.snapshot_dir()).await
    }

    async fn discard_output(&self, test: &TestDescriptor) -> Result<(), CollaboratorError> {
        remove_dir(test.temporary_output_dir()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use integ_core::{AssertionStatus, Target};
    use serde_json::json;
    use std::fs;

    #[tokio::test]
    async fn reads_templates_and_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Stack.template.json"), r#"{"Resources":{}}"#).unwrap();
        fs::write(dir.path().join("manifest.json"), "{}").unwrap();

        let assembly = read_assembly(dir.path()).await.unwrap();
        assert_eq!(assembly.templates.len(), 1);
        assert_eq!(assembly.templates["Stack"], json!({ "Resources": {} }));
    }

    #[tokio::test]
    async fn malformed_template_is_snapshot_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Stack.template.json"), "{").unwrap();
        assert!(matches!(
            read_assembly(dir.path()).await,
            Err(CollaboratorError::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn manifest_cases_keep_declaration_order() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_test_cases(dir.path()).await.unwrap(), None);

        fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"version":"1","testCases":{"zeta":{},"alpha":{}}}"#,
        )
        .unwrap();
        assert_eq!(
            read_test_cases(dir.path()).await.unwrap(),
            Some(vec!["zeta".to_string(), "alpha".to_string()])
        );
    }

    #[tokio::test]
    async fn assertion_results_parse() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_assertion_results(dir.path()).await.unwrap(), None);

        fs::write(
            dir.path().join(ASSERTION_RESULTS_FILE),
            r#"{"AssertA":{"status":"success"},"AssertB":{"status":"fail","message":"boom"}}"#,
        )
        .unwrap();
        let results = read_assertion_results(dir.path()).await.unwrap().unwrap();
        assert_eq!(results["AssertA"].status, AssertionStatus::Success);
        assert_eq!(results["AssertB"].message, "boom");
    }

    #[tokio::test]
    async fn update_moves_output_into_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let test = TestDescriptor::new(dir.path().join("integ.app.js"), dir.path());
        let store = DirectorySnapshotStore::new();

        assert!(!store.exists(&test).await);
        assert!(store.update(&test, test.temporary_output_dir()).await.is_err());

        fs::create_dir_all(test.temporary_output_dir()).unwrap();
        fs::write(test.temporary_output_dir().join("S.template.json"), "{}").unwrap();
        store.update(&test, test.temporary_output_dir()).await.unwrap();

        assert!(store.exists(&test).await);
        assert!(!test.temporary_output_dir().exists());
        assert_eq!(store.load(&test).await.unwrap().templates.len(), 1);

        store.discard_output(&test).await.unwrap();
    }

    #[tokio::test]
    async fn update_from_target_output_clears_sibling_targets() {
        let dir = tempfile::tempdir().unwrap();
        let test = TestDescriptor::new(dir.path().join("integ.app.js"), dir.path());
        let other = TestDescriptor::new(dir.path().join("integ.other.js"), dir.path());
        let east = test.target_output_dir(&Target::new("us-east-1", None));
        let west = test.target_output_dir(&Target::new("eu-west-1", None));
        let unrelated = other.target_output_dir(&Target::new("us-east-1", None));
        for out in [&east, &west, &unrelated] {
            fs::create_dir_all(out).unwrap();
        }
        fs::write(east.join("East.template.json"), "{}").unwrap();
        fs::create_dir_all(test.temporary_output_dir()).unwrap();

        let store = DirectorySnapshotStore::new();
        store.update(&test, &east).await.unwrap();

        let recorded = store.load(&test).await.unwrap();
        assert!(recorded.templates.contains_key("East"));
        assert!(!east.exists());
        assert!(!west.exists());
        assert!(!test.temporary_output_dir().exists());
        assert!(unrelated.exists());
    }
}
