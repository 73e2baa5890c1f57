//! Test discovery
//!
//! Walks the test directory and picks up files matching the language presets
//! (or explicit `--test-regex` patterns), then filters them by the names given
//! on the command line.

use integ_core::types::OUTDIR_PREFIX;
use integ_core::TestDescriptor;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Discovery errors
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A `--test-regex` did not compile
    #[error("invalid test pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// Compile error
        source: regex::Error,
    },

    /// Unknown `--language`
    #[error("unknown language {0:?} (expected javascript, typescript, python or go)")]
    UnknownLanguage(String),

    /// Walking the directory failed
    #[error("failed to read {}: {}", .path.display(), .message)]
    Walk {
        /// Directory being walked
        path: PathBuf,
        /// Underlying error
        message: String,
    },

    /// `--strict` with names that matched nothing
    #[error("no tests found matching: {}", .0.join(", "))]
    UnmatchedNames(Vec<String>),
}

/// Language preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    /// `integ.*.js`
    Javascript,
    /// `integ.*.ts`, declaration files excluded
    Typescript,
    /// `integ_*.py`
    Python,
    /// `integ_*.go`
    Go,
}

impl Language {
    /// All presets
    pub const ALL: [Language; 4] = [Self::Javascript, Self::Typescript, Self::Python, Self::Go];

    /// File name pattern for the preset
    #[must_use]
    pub fn pattern(self) -> &'static str {
        match self {
            Self::Javascript => r"^integ\..*\.js$",
            Self::Typescript => r"^integ\..*\.ts$",
            Self::Python => r"^integ_.*\.py$",
            Self::Go => r"^integ_.*\.go$",
        }
    }
}

impl FromStr for Language {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "javascript" | "js" => Ok(Self::Javascript),
            "typescript" | "ts" => Ok(Self::Typescript),
            "python" | "py" => Ok(Self::Python),
            "go" => Ok(Self::Go),
            other => Err(DiscoveryError::UnknownLanguage(other.to_string())),
        }
    }
}

/// Discovery options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Root directory to search
    pub directory: PathBuf,
    /// Language presets used when no explicit patterns are given
    pub languages: Vec<Language>,
    /// Explicit file name patterns
    pub test_regex: Vec<String>,
    /// Invocation template overriding the per-extension default
    pub app: Option<String>,
    /// Test names to include (or exclude with `exclude`)
    pub names: Vec<String>,
    /// Treat `names` as an exclusion list
    pub exclude: bool,
    /// Fail when an included name matches nothing
    pub strict: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("test"),
            languages: Language::ALL.to_vec(),
            test_regex: Vec::new(),
            app: None,
            names: Vec::new(),
            exclude: false,
            strict: false,
        }
    }
}

impl DiscoveryOptions {
    fn patterns(&self) -> Result<Vec<Regex>, DiscoveryError> {
        let sources: Vec<String> = if self.test_regex.is_empty() {
            self.languages.iter().map(|l| l.pattern().to_string()).collect()
        } else {
            self.test_regex.clone()
        };
        sources
            .into_iter()
            .map(|pattern| {
                Regex::new(&pattern).map_err(|source| DiscoveryError::InvalidPattern { pattern, source })
            })
            .collect()
    }
}

pub(crate) fn is_output_dir(name: &str) -> bool {
    name == "node_modules"
        || name == "cdk.out"
        || name.ends_with(".snapshot")
        || name.starts_with(OUTDIR_PREFIX)
}

/// Find test programs under `options.directory`
///
/// Paths are reported relative to `cwd` when the directory is below it.
///
/// # Errors
/// Returns a [`DiscoveryError`] for bad patterns, unreadable directories or
/// (with `strict`) unmatched names.
pub fn discover(options: &DiscoveryOptions, cwd: &Path) -> Result<Vec<TestDescriptor>, DiscoveryError> {
    let patterns = options.patterns()?;
    let root = options
        .directory
        .strip_prefix(cwd)
        .unwrap_or(options.directory.as_path())
        .to_path_buf();
    let walk_root = cwd.join(&root);

    let mut files = Vec::new();
    let walker = WalkDir::new(&walk_root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !(e.file_type().is_dir() && is_output_dir(&e.file_name().to_string_lossy()))
        });
    for entry in walker {
        let entry = entry.map_err(|e| DiscoveryError::Walk {
            path: walk_root.clone(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.ends_with(".d.ts") || !patterns.iter().any(|p| p.is_match(&name)) {
            continue;
        }
        let relative = entry.path().strip_prefix(cwd).unwrap_or(entry.path()).to_path_buf();
        files.push(relative);
    }
    files.sort();

    let mut tests: Vec<TestDescriptor> = files
        .into_iter()
        .map(|file| {
            let test = TestDescriptor::new(file, root.clone());
            match &options.app {
                Some(app) => test.with_invocation(app.clone()),
                None => test,
            }
        })
        .collect();

    if !options.names.is_empty() {
        if options.exclude {
            tests.retain(|t| !options.names.iter().any(|n| t.matches(n, cwd)));
        } else {
            let unmatched: Vec<String> = options
                .names
                .iter()
                .filter(|n| !tests.iter().any(|t| t.matches(n, cwd)))
                .cloned()
                .collect();
            if !unmatched.is_empty() {
                if options.strict {
                    return Err(DiscoveryError::UnmatchedNames(unmatched));
                }
                tracing::warn!("no tests found matching: {}", unmatched.join(", "));
            }
            tests.retain(|t| options.names.iter().any(|n| t.matches(n, cwd)));
        }
    }

    tracing::debug!(count = tests.len(), root = %root.display(), "discovered tests");
    Ok(tests)
}
