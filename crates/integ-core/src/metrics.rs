//! Per-target run metrics

use crate::types::Target;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timing for one (profile, region) pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    /// Cloud region
    pub region: String,
    /// Credential profile, if any
    pub profile: Option<String>,
    /// Wall-clock seconds from first job start to last job end
    pub duration: f64,
    /// Seconds per test display name
    pub tests: BTreeMap<String, f64>,
}

impl RunMetrics {
    /// Empty metrics for `target`
    #[must_use]
    pub fn for_target(target: &Target) -> Self {
        Self {
            region: target.region.clone(),
            profile: target.profile.clone(),
            duration: 0.0,
            tests: BTreeMap::new(),
        }
    }

    /// Record one test's duration
    pub fn record(&mut self, test: impl Into<String>, duration: f64) {
        self.tests.insert(test.into(), duration);
    }
}

/// Render metrics sorted by ascending total duration, tests ascending within
#[must_use]
pub fn sorted_summary(metrics: &[RunMetrics]) -> Vec<String> {
    let mut sorted: Vec<&RunMetrics> = metrics.iter().collect();
    sorted.sort_by(|a, b| a.duration.total_cmp(&b.duration));

    let mut lines = vec!["--- Integration test metrics ---".to_string()];
    for m in sorted {
        lines.push(format!(
            "Profile {} + Region {} total time: {:.3}",
            m.profile.as_deref().unwrap_or("default"),
            m.region,
            m.duration
        ));
        let mut tests: Vec<(&String, &f64)> = m.tests.iter().collect();
        tests.sort_by(|a, b| a.1.total_cmp(b.1));
        for (name, secs) in tests {
            lines.push(format!("  {name}: {secs:.3}"));
        }
    }
    lines
}
