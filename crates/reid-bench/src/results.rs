//! Result types for experiment sessions.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// How an experiment run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    TimedOut,
    /// The config file did not exist.
    MissingConfig,
}

/// Result for a single experiment of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentOutcome {
    /// Registry key.
    pub key: String,
    /// Run name (log directory prefix).
    pub name: String,
    /// Config file path.
    pub config: String,
    /// Directory the run wrote to.
    pub save_dir: String,
    pub status: OutcomeStatus,
    /// Wall-clock time in seconds.
    pub elapsed_secs: f64,
    /// Error message for failed runs.
    #[serde(default)]
    pub error: Option<String>,
    /// Rank-1 accuracy of the last evaluation.
    #[serde(default)]
    pub rank1: Option<f64>,
    /// mAP of the last evaluation.
    #[serde(default)]
    pub map: Option<f64>,
    /// Average loss of the last trained epoch.
    #[serde(default)]
    pub final_loss: Option<f64>,
}

impl ExperimentOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }
}

/// Summary of a multi-experiment session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    /// Unix seconds at session start.
    pub started_unix_secs: u64,
    pub total_secs: f64,
    pub completed: usize,
    pub failed: usize,
    /// Percentage of experiments that completed.
    pub success_rate: f64,
    pub experiments: Vec<ExperimentOutcome>,
}

impl SessionSummary {
    pub fn from_outcomes(
        session_id: String,
        started_unix_secs: u64,
        total_secs: f64,
        experiments: Vec<ExperimentOutcome>,
    ) -> Self {
        let completed = experiments.iter().filter(|o| o.succeeded()).count();
        let failed = experiments.len() - completed;
        Self {
            session_id,
            started_unix_secs,
            total_secs,
            completed,
            failed,
            success_rate: success_rate(completed, experiments.len()),
            experiments,
        }
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Percentage of `completed` out of `total`.
///
/// Returns 0.0 for an empty session.
pub fn success_rate(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    completed as f64 / total as f64 * 100.0
}
