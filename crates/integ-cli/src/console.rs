//! Console reporting sink
//!
//! Renders diagnostics as one aligned status line per test, with the
//! diagnostic message indented underneath for anything that went wrong.

use colored::{ColoredString, Colorize};
use integ_core::{Diagnostic, DiagnosticReason, Reporter};
use parking_lot::Mutex;
use std::io::Write;

/// Human readable reporter writing to a terminal (or any writer)
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
    color: bool,
}

impl ConsoleReporter {
    /// Reporter writing to `out`
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            color: true,
        }
    }

    /// Reporter writing to stdout
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    /// With colored output
    #[must_use]
    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }

    fn paint(&self, text: &str, style: fn(&str) -> ColoredString) -> String {
        if self.color {
            style(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{line}") {
            tracing::debug!(error = %e, "console write failed");
        }
    }
}

impl std::fmt::Debug for ConsoleReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleReporter")
            .field("color", &self.color)
            .finish_non_exhaustive()
    }
}

/// Status label and its color
fn label(reason: DiagnosticReason) -> (&'static str, fn(&str) -> ColoredString) {
    match reason {
        DiagnosticReason::SnapshotSuccess => ("UNCHANGED", |s| s.green()),
        DiagnosticReason::NoSnapshot => ("NEW", |s| s.yellow()),
        DiagnosticReason::SnapshotMismatch => ("CHANGED", |s| s.yellow()),
        DiagnosticReason::SnapshotError | DiagnosticReason::TestError => ("ERROR", |s| s.red()),
        DiagnosticReason::TestSuccess => ("SUCCESS", |s| s.green()),
        DiagnosticReason::TestFailed => ("FAILED", |s| s.red()),
        DiagnosticReason::AssertionFailed => ("ASSERT", |s| s.red()),
    }
}

impl Reporter for ConsoleReporter {
    fn diagnostic(&self, d: &Diagnostic) {
        let (text, style) = label(d.reason);
        let status = self.paint(&format!("{text:<10}"), style);
        let duration = self.paint(&format!("{:.3}s", d.duration), |s| s.dimmed());
        self.write_line(&format!("  {status} {} {duration}", d.test_name));

        let show_message = match d.reason {
            DiagnosticReason::SnapshotSuccess | DiagnosticReason::NoSnapshot => false,
            DiagnosticReason::TestSuccess => d.message != "NO ASSERTIONS",
            _ => true,
        };
        if show_message && !d.message.is_empty() {
            for line in d.message.lines() {
                self.write_line(&format!("      {line}"));
            }
        }
    }

    fn highlight(&self, message: &str) {
        self.write_line(&self.paint(message, |s| s.bold()));
    }

    fn print(&self, message: &str) {
        self.write_line(message);
    }

    fn warning(&self, message: &str) {
        self.write_line(&self.paint(message, |s| s.yellow()));
    }

    fn error(&self, message: &str) {
        self.write_line(&self.paint(message, |s| s.red().bold()));
    }
}
