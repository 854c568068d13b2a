//! Text summary builder for CLI output.
//!
//! Formats human-readable lines for the flow outcomes in text mode.

use crate::model::{RunDecision, VariableAction, VersionBump, WorkflowOutcome};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn decision_text(decision: RunDecision) -> &'static str {
    match decision {
        RunDecision::Wait => "still running",
        RunDecision::ReviewPlan => "plan ready for review",
        RunDecision::Apply => "applied",
        RunDecision::NoChanges => "no changes",
        RunDecision::Errored => "plan errored",
        RunDecision::Halted => "halted",
    }
}

/// Build a text summary of a Terraform flow.
pub(crate) fn build_workflow_summary(outcome: &WorkflowOutcome) -> TextSummary {
    let mut lines = Vec::new();

    let created = if outcome.workspace_created {
        " (created)"
    } else {
        ""
    };
    lines.push(format!(
        "Workspace: {}/{} {}{created}",
        outcome.organization,
        outcome.workspace,
        outcome.workspace_id.as_deref().unwrap_or("-")
    ));
    if let Some(cv) = outcome.config_version_id.as_deref() {
        lines.push(format!("Configuration version: {cv}"));
    }

    if !outcome.variables.is_empty() {
        let count = |action: VariableAction| {
            outcome
                .variables
                .iter()
                .filter(|v| v.action == action)
                .count()
        };
        lines.push(format!(
            "Variables: {} created, {} updated, {} replaced, {} unchanged",
            count(VariableAction::Create),
            count(VariableAction::Update),
            count(VariableAction::Replace),
            count(VariableAction::Unchanged)
        ));
    }

    if let Some(run_id) = outcome.run_id.as_deref() {
        let decision = outcome.decision.map(decision_text).unwrap_or("not confirmable");
        lines.push(format!(
            "Run: {run_id} [{}] {decision}",
            outcome.run_status.as_deref().unwrap_or("-")
        ));
    }
    if let Some(apply_id) = outcome.apply_id.as_deref() {
        lines.push(format!(
            "Apply: {apply_id} [{}]",
            outcome.apply_status.as_deref().unwrap_or("-")
        ));
    }
    for (label, path) in [
        ("Plan log", outcome.plan_log_path.as_deref()),
        ("Apply log", outcome.apply_log_path.as_deref()),
    ] {
        if let Some(p) = path {
            lines.push(format!("{label}: {}", p.display()));
        }
    }

    TextSummary { lines }
}

/// Build a text summary of the variable-group version bump.
pub(crate) fn build_bump_summary(bumps: &[VersionBump]) -> TextSummary {
    let lines = bumps
        .iter()
        .map(|b| {
            format!(
                "Variable group {} ({}): version {} -> {}",
                b.group_id, b.group_name, b.previous, b.version
            )
        })
        .collect();
    TextSummary { lines }
}
