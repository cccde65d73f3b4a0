use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;

use crate::models::diff::DiffSummary;

/// Final classification of a pipeline run. Maps onto the process exit
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Nothing to do, nothing failed (dry-run always lands here or in
    /// `PartialFailure`/`Failed`).
    Ok,
    /// At least one mutation was applied successfully.
    Changed,
    /// The plan could not be built: import cycles, invalid config,
    /// discovery expansion failure.
    PlanFailure,
    /// Some targets failed; others synced.
    PartialFailure,
    /// The merge phase failed, or every target failed.
    Failed,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Ok | Self::Changed => 0,
            Self::PlanFailure => 2,
            Self::PartialFailure => 3,
            Self::Failed => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryFailure {
    pub path: String,
    pub kind: String,
    pub error: String,
}

/// Outcome of syncing one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub name: String,
    pub summary: DiffSummary,
    /// Mutations applied successfully (0 in dry-run).
    pub applied: usize,
    pub entry_failures: Vec<EntryFailure>,
    /// A failure before entries could be applied: import resolution,
    /// filters, store listing.
    pub error: Option<String>,
    /// Never started because the run was cancelled.
    pub skipped: bool,
    /// Rendered diff, when diff output was requested.
    #[serde(skip)]
    pub diff_output: Option<String>,
}

impl TargetReport {
    pub fn skipped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: DiffSummary::default(),
            applied: 0,
            entry_failures: Vec::new(),
            error: None,
            skipped: true,
            diff_output: None,
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some() || !self.entry_failures.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub request_id: String,
    pub dry_run: bool,
    pub cancelled: bool,
    /// Paths in the merge-phase output.
    pub merged_paths: usize,
    pub targets: Vec<TargetReport>,
    /// Set when the plan could not be built (exit 2).
    pub plan_error: Option<String>,
    /// Set when the merge phase failed (exit 4).
    pub fatal_error: Option<String>,
    pub ou_listing_failures: u64,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub(crate) fn classify(&mut self) {
        self.status = if self.plan_error.is_some() {
            RunStatus::PlanFailure
        } else if self.fatal_error.is_some() {
            RunStatus::Failed
        } else {
            let ran = self.targets.iter().filter(|t| !t.skipped).count();
            // a hard failure aborted the target before it made progress;
            // entry-level failures leave the target partially synced
            let hard_failed = self
                .targets
                .iter()
                .filter(|t| !t.skipped && t.error.is_some())
                .count();
            if ran > 0 && hard_failed == ran {
                RunStatus::Failed
            } else if self.targets.iter().any(|t| t.failed()) || self.cancelled {
                RunStatus::PartialFailure
            } else if !self.dry_run && self.targets.iter().any(|t| t.applied > 0) {
                RunStatus::Changed
            } else {
                RunStatus::Ok
            }
        };
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }

    /// Human-readable end-of-run summary.
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        if let Some(error) = &self.plan_error {
            let _ = writeln!(out, "plan failed: {error}");
            return out;
        }
        if let Some(error) = &self.fatal_error {
            let _ = writeln!(out, "run failed: {error}");
            return out;
        }
        for target in &self.targets {
            if target.skipped {
                let _ = writeln!(out, "  {}: skipped (cancelled)", target.name);
                continue;
            }
            if let Some(error) = &target.error {
                let _ = writeln!(out, "  {}: failed: {error}", target.name);
                continue;
            }
            let _ = writeln!(
                out,
                "  {}: +{} ~{} -{}{}{}",
                target.name,
                target.summary.added,
                target.summary.modified,
                target.summary.deleted,
                if self.dry_run { " (dry-run)" } else { "" },
                if target.entry_failures.is_empty() {
                    String::new()
                } else {
                    format!(", {} entry failures", target.entry_failures.len())
                },
            );
            for failure in &target.entry_failures {
                let _ = writeln!(out, "    {} {}: {}", failure.kind, failure.path, failure.error);
            }
        }
        if self.ou_listing_failures > 0 {
            let _ = writeln!(
                out,
                "warning: {} organizational unit listings failed and were treated as empty",
                self.ou_listing_failures
            );
        }
        let _ = writeln!(
            out,
            "{} target(s), {} merged path(s), {:?} in {}ms{}",
            self.targets.len(),
            self.merged_paths,
            self.status,
            self.elapsed_ms,
            if self.cancelled { " (cancelled)" } else { "" },
        );
        out
    }
}
